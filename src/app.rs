use std::io;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::cli::{Command, FakeArgs, LogLevel, OutputFormat, RunSettings};
use crate::connection::{ConnectionManager, ConnectionSession};
use crate::error::{CommandError, ConnectionError, InteractionError};
use crate::handlers::{
    CalibrateHandler, CalibrationMode, CommandParameters, PushHandler, SwitchState,
};
use crate::hw::{HardwareBackend, HardwareClient, hardware_client_from_backend};
use crate::telemetry;
use crate::terminal::{SystemTerminalClient, TerminalClient};
use crate::token_store::TokenStoreError;

/// Creates a hardware client backed by the real BLE transport.
///
/// # Errors
///
/// Returns an error when the platform BLE manager cannot be created.
pub async fn real_hardware_client() -> Result<Arc<dyn HardwareClient>, InteractionError> {
    hardware_client_from_backend(HardwareBackend::Real).await
}

/// Creates a hardware client backed by scripted fake fixtures.
///
/// # Errors
///
/// Returns an error when the fake backend cannot be constructed.
pub async fn fake_hardware_client(
    fake_args: FakeArgs,
) -> Result<Arc<dyn HardwareClient>, InteractionError> {
    hardware_client_from_backend(HardwareBackend::Fake(fake_args.into_backend_config())).await
}

/// One command frame sequence sent to an authenticated device.
#[derive(Debug, Clone, Copy)]
enum Action {
    Push(SwitchState),
    Calibrate(CommandParameters),
}

impl Action {
    fn name(self) -> &'static str {
        match self {
            Self::Push(_) => "push",
            Self::Calibrate(_) => "calibrate",
        }
    }
}

/// Operations surface for one MicroBot.
///
/// Holds at most one authenticated session, the calibration values applied
/// by [`MicrobotClient::apply_calibration`], and the last switch position a
/// push confirmed.
///
/// ```no_run
/// # async fn demo() -> anyhow::Result<()> {
/// use std::time::Duration;
///
/// use microbot::{ConnectionConfig, ConnectionManager, MicrobotClient, TokenStore};
///
/// let hardware = microbot::real_hardware_client().await?;
/// let address = "AA:BB:CC:DD:EE:FF".parse()?;
/// let device = hardware.discover(&address, Duration::from_secs(30)).await?;
/// let manager = ConnectionManager::new(
///     hardware,
///     device,
///     TokenStore::at_default_path(),
///     ConnectionConfig::default(),
/// );
///
/// let mut client = MicrobotClient::new(manager);
/// client.connect(false).await?;
/// client.push_on().await?;
/// client.disconnect().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MicrobotClient {
    manager: ConnectionManager,
    session: Option<ConnectionSession>,
    params: CommandParameters,
    is_on: Option<bool>,
}

impl MicrobotClient {
    #[must_use]
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            session: None,
            params: CommandParameters::default(),
            is_on: None,
        }
    }

    #[must_use]
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Returns the open session, if any.
    #[must_use]
    pub fn session(&self) -> Option<&ConnectionSession> {
        self.session.as_ref()
    }

    /// Returns whether a token is stored for the device.
    ///
    /// # Errors
    ///
    /// Returns an error when the token store cannot be read.
    pub fn has_token(&self) -> Result<bool, TokenStoreError> {
        self.manager.has_token()
    }

    /// Last switch position confirmed by a successful push. `None` until the
    /// first push succeeds.
    #[must_use]
    pub fn is_on(&self) -> Option<bool> {
        self.is_on
    }

    #[must_use]
    pub fn parameters(&self) -> CommandParameters {
        self.params
    }

    /// Sets the held stroke depth, clamped to `0..=100`.
    pub fn set_depth(&mut self, depth: u8) {
        self.params.set_depth(depth);
    }

    pub fn set_duration(&mut self, duration: u32) {
        self.params.set_duration(duration);
    }

    pub fn set_mode(&mut self, mode: CalibrationMode) {
        self.params.set_mode(mode);
    }

    /// Returns whether a session is open and its link is up.
    pub async fn is_connected(&self) -> bool {
        match &self.session {
            Some(session) => session.is_connected().await,
            None => false,
        }
    }

    /// Opens a session, replacing any open one.
    ///
    /// # Errors
    ///
    /// Returns the connection manager's error when no session could be
    /// established.
    pub async fn connect(&mut self, fresh_pair: bool) -> Result<(), ConnectionError> {
        self.disconnect().await;
        let session = self.manager.connect(fresh_pair).await?;
        self.session = Some(session);
        Ok(())
    }

    /// Closes the open session, if any.
    pub async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            self.manager.disconnect(session).await;
        }
    }

    /// Pushes the arm to switch the target on.
    ///
    /// # Errors
    ///
    /// Returns an error when no authenticated session is open or the frames
    /// could not be written after one reconnect.
    pub async fn push_on(&mut self) -> Result<(), CommandError> {
        self.push(SwitchState::On).await
    }

    /// Pushes the arm to switch the target off.
    ///
    /// # Errors
    ///
    /// Returns an error when no authenticated session is open or the frames
    /// could not be written after one reconnect.
    pub async fn push_off(&mut self) -> Result<(), CommandError> {
        self.push(SwitchState::Off).await
    }

    async fn push(&mut self, state: SwitchState) -> Result<(), CommandError> {
        self.execute(Action::Push(state)).await?;
        self.is_on = Some(state.is_on());
        Ok(())
    }

    /// Stores new calibration values and sends them.
    ///
    /// # Errors
    ///
    /// See [`MicrobotClient::apply_calibration`].
    pub async fn calibrate(
        &mut self,
        depth: u8,
        duration: u32,
        mode: CalibrationMode,
    ) -> Result<(), CommandError> {
        self.params = CommandParameters::new(depth, duration, mode);
        self.apply_calibration().await
    }

    /// Sends the held calibration values.
    ///
    /// A failure partway through leaves the device partially calibrated;
    /// call again to send the full sequence.
    ///
    /// # Errors
    ///
    /// Returns an error when no authenticated session is open or the frames
    /// could not be written after one reconnect.
    pub async fn apply_calibration(&mut self) -> Result<(), CommandError> {
        self.execute(Action::Calibrate(self.params)).await
    }

    #[instrument(skip(self), level = "info", fields(address = %self.manager.address(), command = action.name()))]
    async fn execute(&mut self, action: Action) -> Result<(), CommandError> {
        let command = action.name();
        self.ensure_live(command).await?;

        match self.write(action).await {
            Err(CommandError::TransportWrite { source, .. }) => {
                warn!(error = %source, "command write failed; reconnecting once");
                self.reconnect(command).await?;
                self.write(action).await
            }
            other => other,
        }
    }

    async fn ensure_live(&mut self, command: &'static str) -> Result<(), CommandError> {
        let Some(session) = &self.session else {
            return Err(CommandError::NotConnected);
        };
        if session.is_connected().await {
            return Ok(());
        }

        info!("link dropped; reconnecting");
        self.reconnect(command).await
    }

    async fn reconnect(&mut self, command: &'static str) -> Result<(), CommandError> {
        self.disconnect().await;
        let session = self
            .manager
            .connect(false)
            .await
            .map_err(|source| CommandError::Reconnect { command, source })?;
        self.session = Some(session);
        Ok(())
    }

    async fn write(&self, action: Action) -> Result<(), CommandError> {
        let session = self.session.as_ref().ok_or(CommandError::NotConnected)?;
        if !session.is_authenticated() {
            return Err(CommandError::NotAuthenticated);
        }

        let link = session.link();
        let codec = self.manager.codec();
        let write_timeout = self.manager.config().write_timeout();
        let result = match action {
            Action::Push(state) => PushHandler::push(link, codec, state, write_timeout).await,
            Action::Calibrate(params) => {
                CalibrateHandler::calibrate(link, codec, &params, write_timeout).await
            }
        };
        result.map_err(|source| CommandError::TransportWrite {
            command: action.name(),
            source,
        })
    }
}

/// Runs a CLI command against the given hardware client.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let dir = tempfile::tempdir()?;
/// let store = dir.path().join("tokens.conf");
/// let args = microbot::Args::try_parse_from([
///     "microbot",
///     "--token-store",
///     store.to_str().unwrap_or_default(),
///     "--fake",
///     "token",
///     "AA:BB:CC:DD:EE:FF",
/// ])?;
/// let settings = args.run_settings();
/// let (command, maybe_fake_args) = args.into_command_and_fake_args();
/// let hardware_client = match maybe_fake_args {
///     Some(fake_args) => microbot::fake_hardware_client(fake_args).await?,
///     None => microbot::real_hardware_client().await?,
/// };
/// let mut out = Vec::new();
/// microbot::run(command, &mut out, hardware_client, settings).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the device cannot be
/// reached, the command fails, or output writing fails.
pub async fn run<W>(
    command: Command,
    out: &mut W,
    hardware_client: Arc<dyn HardwareClient>,
    settings: RunSettings,
) -> Result<()>
where
    W: io::Write,
{
    run_with_log_level(command, out, hardware_client, settings, None).await
}

/// Runs a CLI command with an explicit telemetry log-level override.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the device cannot be
/// reached, the command fails, or output writing fails.
pub async fn run_with_log_level<W>(
    command: Command,
    out: &mut W,
    hardware_client: Arc<dyn HardwareClient>,
    settings: RunSettings,
    log_level: Option<LogLevel>,
) -> Result<()>
where
    W: io::Write,
{
    run_with_clients_and_log_level(
        command,
        out,
        &SystemTerminalClient,
        hardware_client,
        settings,
        log_level,
    )
    .await
}

/// Runs a CLI command with injected clients and explicit telemetry settings.
///
/// When `settings` carries no output format, JSON is used unless stdout is
/// a terminal.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the device cannot be
/// reached, the command fails, or output writing fails.
#[instrument(
    skip(out, terminal_client, hardware_client, settings),
    level = "info",
    fields(command = %command.name(), ?log_level)
)]
pub async fn run_with_clients_and_log_level<W>(
    command: Command,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    hardware_client: Arc<dyn HardwareClient>,
    settings: RunSettings,
    log_level: Option<LogLevel>,
) -> Result<()>
where
    W: io::Write,
{
    telemetry::initialise_tracing(
        "microbot",
        terminal_client.stderr_is_terminal(),
        log_level.map(LogLevel::as_level_filter),
    )?;

    let output_format = settings.output_format().unwrap_or_else(|| {
        if terminal_client.stdout_is_terminal() {
            OutputFormat::Pretty
        } else {
            OutputFormat::Json
        }
    });

    crate::cli::control::run(
        hardware_client,
        &command,
        &settings,
        out,
        output_format,
        terminal_client.stdout_is_terminal(),
    )
    .await
}
