use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use owo_colors::OwoColorize;
use serde::Serialize;
use tracing::{Span, instrument};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::app::MicrobotClient;
use crate::cli::command::{Command, OutputFormat, RunSettings};
use crate::cli::ui::{Painter, ResultView};
use crate::connection::ConnectionManager;
use crate::handlers::{CalibrationMode, CommandParameters, MAX_DEPTH, SwitchState};
use crate::hw::{DeviceAddress, HardwareClient};

/// JSON result emitted by a command.
#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub(crate) enum ControlResult {
    Pair {
        address: DeviceAddress,
        name: Option<String>,
        rssi: Option<i16>,
        token_store: PathBuf,
    },
    Push {
        address: DeviceAddress,
        state: SwitchState,
        is_on: Option<bool>,
    },
    Calibrate {
        address: DeviceAddress,
        parameters: CommandParameters,
    },
    Token {
        address: DeviceAddress,
        stored: bool,
        token_store: PathBuf,
    },
}

/// Arguments naming one device.
#[derive(Debug, Args)]
pub struct DeviceArgs {
    /// Device address, e.g. `AA:BB:CC:DD:EE:FF`.
    address: DeviceAddress,
}

impl DeviceArgs {
    #[must_use]
    pub fn new(address: DeviceAddress) -> Self {
        Self { address }
    }

    #[must_use]
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }
}

/// Arguments for `push`.
#[derive(Debug, Args)]
pub struct PushArgs {
    /// Device address, e.g. `AA:BB:CC:DD:EE:FF`.
    address: DeviceAddress,
    /// Switch position to report after the push.
    #[arg(value_enum)]
    state: SwitchState,
}

impl PushArgs {
    /// Creates push arguments.
    ///
    /// ```
    /// use microbot::{PushArgs, SwitchState};
    ///
    /// let args = PushArgs::new("aabbccddeeff".parse()?, SwitchState::On);
    /// assert_eq!(SwitchState::On, args.state());
    /// # Ok::<(), microbot::DeviceAddressError>(())
    /// ```
    #[must_use]
    pub fn new(address: DeviceAddress, state: SwitchState) -> Self {
        Self { address, state }
    }

    #[must_use]
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    #[must_use]
    pub fn state(&self) -> SwitchState {
        self.state
    }
}

/// Arguments for `calibrate`.
#[derive(Debug, Args)]
pub struct CalibrateArgs {
    /// Device address, e.g. `AA:BB:CC:DD:EE:FF`.
    address: DeviceAddress,
    /// Stroke depth in percent.
    #[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u8).range(0..=i64::from(MAX_DEPTH)))]
    depth: u8,
    /// Hold duration in device units.
    #[arg(long, default_value_t = 0)]
    duration: u32,
    /// Arm travel mode.
    #[arg(long, value_enum, default_value_t = CalibrationMode::Normal)]
    mode: CalibrationMode,
}

impl CalibrateArgs {
    /// Creates calibrate arguments.
    ///
    /// ```
    /// use microbot::{CalibrateArgs, CalibrationMode, CommandParameters};
    ///
    /// let args = CalibrateArgs::new(
    ///     "aabbccddeeff".parse()?,
    ///     CommandParameters::new(75, 500, CalibrationMode::Invert),
    /// );
    /// assert_eq!(75, args.parameters().depth());
    /// # Ok::<(), microbot::DeviceAddressError>(())
    /// ```
    #[must_use]
    pub fn new(address: DeviceAddress, parameters: CommandParameters) -> Self {
        Self {
            address,
            depth: parameters.depth(),
            duration: parameters.duration(),
            mode: parameters.mode(),
        }
    }

    #[must_use]
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    #[must_use]
    pub fn parameters(&self) -> CommandParameters {
        CommandParameters::new(self.depth, self.duration, self.mode)
    }
}

/// Executes one CLI command.
#[instrument(skip(hardware, command, settings, out), level = "info", fields(command = command.name(), ?output_format))]
pub(crate) async fn run<W>(
    hardware: Arc<dyn HardwareClient>,
    command: &Command,
    settings: &RunSettings,
    out: &mut W,
    output_format: OutputFormat,
    use_colour: bool,
) -> Result<()>
where
    W: io::Write,
{
    let result = match command {
        Command::Token(args) => {
            let store = settings.token_store();
            let stored = store
                .contains(args.address())
                .with_context(|| format!("failed to read `{}`", store.path().display()))?;
            ControlResult::Token {
                address: args.address().clone(),
                stored,
                token_store: store.path().to_path_buf(),
            }
        }
        Command::Pair(args) => {
            let mut client = resolve_client(hardware, args.address(), settings).await?;
            open_session(&mut client, true).await?;
            client.disconnect().await;
            let device = client.manager().device();
            ControlResult::Pair {
                address: device.address().clone(),
                name: device.local_name().map(str::to_string),
                rssi: device.rssi(),
                token_store: settings.token_store().path().to_path_buf(),
            }
        }
        Command::Push(args) => {
            let mut client = resolve_client(hardware, args.address(), settings).await?;
            open_session(&mut client, false).await?;
            let outcome = match args.state() {
                SwitchState::On => client.push_on().await,
                SwitchState::Off => client.push_off().await,
            };
            client.disconnect().await;
            outcome.context("push failed")?;
            ControlResult::Push {
                address: args.address().clone(),
                state: args.state(),
                is_on: client.is_on(),
            }
        }
        Command::Calibrate(args) => {
            let mut client = resolve_client(hardware, args.address(), settings).await?;
            open_session(&mut client, false).await?;
            let parameters = args.parameters();
            let outcome = client
                .calibrate(parameters.depth(), parameters.duration(), parameters.mode())
                .await;
            client.disconnect().await;
            outcome.context("calibration failed")?;
            ControlResult::Calibrate {
                address: args.address().clone(),
                parameters: client.parameters(),
            }
        }
    };

    write_result(out, &result, output_format, use_colour)
}

/// Scans for `address` and wraps it in a client.
#[instrument(skip(hardware, settings), level = "info", fields(%address, progress = true))]
async fn resolve_client(
    hardware: Arc<dyn HardwareClient>,
    address: &DeviceAddress,
    settings: &RunSettings,
) -> Result<MicrobotClient> {
    let span = Span::current();
    span.pb_set_message(&format!("Scanning for MicroBot {address}"));
    span.pb_set_finish_message(&format!("{} Found {address}", "✓".green()));

    let device = match hardware.discover(address, settings.scan_timeout()).await {
        Ok(device) => device,
        Err(error) => {
            span.pb_set_finish_message(&format!("{} Device not found", "✗".red()));
            return Err(error.into());
        }
    };

    let manager = ConnectionManager::new(
        hardware,
        device,
        settings.token_store().clone(),
        settings.connection().clone(),
    );
    Ok(MicrobotClient::new(manager))
}

#[instrument(skip(client), level = "info", fields(progress = true))]
async fn open_session(client: &mut MicrobotClient, fresh_pair: bool) -> Result<()> {
    let span = Span::current();
    span.pb_set_message(if fresh_pair {
        "Pairing; press the button on the MicroBot when its LED blinks"
    } else {
        "Connecting"
    });
    span.pb_set_finish_message(&format!("{} Connected", "✓".green()));

    if let Err(error) = client.connect(fresh_pair).await {
        span.pb_set_finish_message(&format!("{} Connection failed", "✗".red()));
        return Err(error.into());
    }
    Ok(())
}

fn write_result(
    out: &mut impl io::Write,
    result: &ControlResult,
    output_format: OutputFormat,
    use_colour: bool,
) -> Result<()> {
    match output_format {
        OutputFormat::Pretty => {
            writeln!(out, "{}", ResultView::new(result, Painter::new(use_colour)))?;
        }
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, result)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn json_results_are_tagged_by_command() {
        let result = ControlResult::Push {
            address: "AA:BB:CC:DD:EE:FF".parse().expect("address should parse"),
            state: SwitchState::On,
            is_on: Some(true),
        };
        let mut out = Vec::new();
        write_result(&mut out, &result, OutputFormat::Json, false)
            .expect("writing to a buffer should succeed");

        let value: serde_json::Value =
            serde_json::from_slice(&out).expect("output should be valid JSON");
        assert_eq!(
            json!({
                "command": "push",
                "address": "aabbccddeeff",
                "state": "on",
                "is_on": true,
            }),
            value
        );
    }

    #[test]
    fn calibrate_json_nests_parameters() {
        let result = ControlResult::Calibrate {
            address: "aabbccddeeff".parse().expect("address should parse"),
            parameters: CommandParameters::new(75, 500, CalibrationMode::Invert),
        };
        let value = serde_json::to_value(&result).expect("result should serialise");
        assert_eq!(
            json!({
                "command": "calibrate",
                "address": "aabbccddeeff",
                "parameters": { "depth": 75, "duration": 500, "mode": "invert" },
            }),
            value
        );
    }
}
