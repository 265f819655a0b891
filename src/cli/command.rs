use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use bon::Builder;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::filter::LevelFilter;

use crate::cli::control::{CalibrateArgs, DeviceArgs, PushArgs};
use crate::connection::{
    ConnectionConfig, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_IO_TIMEOUT, DEFAULT_RETRY_COUNT,
    DEFAULT_RETRY_DELAY,
};
use crate::error::FixtureError;
use crate::hw::{FakeBackendConfig, NotificationPayloads};
use crate::protocol::ProtocolVariant;
use crate::token_store::TokenStore;

/// How long the CLI scans for a device before giving up.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(30);

/// Command-line options for the MicroBot Push tool.
#[derive(Debug, Parser)]
#[command(name = "microbot", about = "Pair with and drive MicroBot Push BLE actuators.")]
pub struct Args {
    /// Token store file. Defaults to the per-user config directory.
    #[arg(long, global = true, value_name = "PATH")]
    token_store: Option<PathBuf>,
    /// Connect retries after the first attempt.
    #[arg(long, global = true, default_value_t = DEFAULT_RETRY_COUNT)]
    retry_count: usize,
    /// Pause between connect attempts (e.g. `500ms`, `1s`).
    #[arg(long, global = true, value_parser = parse_duration, default_value = "500ms")]
    retry_delay: Duration,
    /// Bound on link establishment.
    #[arg(long, global = true, value_parser = parse_duration, default_value = "20s")]
    connect_timeout: Duration,
    /// Bound on each characteristic write.
    #[arg(long, global = true, value_parser = parse_duration, default_value = "20s")]
    write_timeout: Duration,
    /// How long to wait for the device to issue a token while pairing.
    #[arg(long, global = true, value_parser = parse_duration, default_value = "55s")]
    handshake_timeout: Duration,
    /// Abort pairing after this many unrecognized notifications.
    #[arg(long, global = true)]
    unrecognized_limit: Option<usize>,
    /// Firmware protocol dialect.
    #[arg(long, global = true, value_enum, default_value_t = ProtocolVariant::New)]
    protocol: ProtocolVariant,
    /// How long to scan for the device.
    #[arg(long, global = true, value_parser = parse_duration, default_value = "30s")]
    scan_timeout: Duration,
    /// Overrides `RUST_LOG` for this run.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Output format. Defaults to `pretty` on a terminal and `json` otherwise.
    #[arg(long, global = true, value_enum)]
    output_format: Option<OutputFormat>,
    /// Uses the fake BLE backend with scripted device behaviour.
    #[arg(long, global = true)]
    fake: bool,
    /// Fake notification payloads as comma-separated hexadecimal payloads.
    #[arg(long, global = true, requires = "fake")]
    fake_notifications: Option<NotificationPayloads>,
    /// Number of leading fake connect attempts that fail.
    #[arg(long, global = true, requires = "fake")]
    fake_connect_failures: Option<usize>,
    /// Zero-based record write indices that fail on the fake link.
    #[arg(long, global = true, requires = "fake", value_delimiter = ',')]
    fake_write_failures: Vec<usize>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Creates argument values directly without CLI parsing.
    ///
    /// ```
    /// use microbot::{Args, Command, DeviceArgs};
    ///
    /// let address = "AA:BB:CC:DD:EE:FF".parse()?;
    /// let args = Args::new(Command::Token(DeviceArgs::new(address)));
    /// assert_eq!(None, args.log_level());
    /// # Ok::<(), microbot::DeviceAddressError>(())
    /// ```
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            token_store: None,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
            connect_timeout: DEFAULT_IO_TIMEOUT,
            write_timeout: DEFAULT_IO_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            unrecognized_limit: None,
            protocol: ProtocolVariant::default(),
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            log_level: None,
            output_format: None,
            fake: false,
            fake_notifications: None,
            fake_connect_failures: None,
            fake_write_failures: Vec::new(),
            command,
        }
    }

    /// Uses `path` as the token store.
    #[must_use]
    pub fn with_token_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_store = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_output_format(mut self, output_format: OutputFormat) -> Self {
        self.output_format = Some(output_format);
        self
    }

    /// Enables fake backend mode with pre-parsed fake configuration.
    #[must_use]
    pub fn with_fake(mut self, fake: FakeArgs) -> Self {
        let FakeArgs {
            notifications,
            connect_failures,
            write_failures,
        } = fake;

        self.fake = true;
        self.fake_notifications = notifications;
        self.fake_connect_failures = Some(connect_failures);
        self.fake_write_failures = write_failures.into_iter().collect();
        self
    }

    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    #[must_use]
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.output_format
    }

    /// Collects the connection, storage and output options.
    ///
    /// ```
    /// use clap::Parser;
    /// use std::time::Duration;
    ///
    /// let args = microbot::Args::try_parse_from([
    ///     "microbot",
    ///     "--retry-count",
    ///     "2",
    ///     "--retry-delay",
    ///     "1s",
    ///     "token",
    ///     "aabbccddeeff",
    /// ])?;
    /// let settings = args.run_settings();
    /// assert_eq!(3, settings.connection().max_attempts());
    /// assert_eq!(Duration::from_secs(1), settings.connection().retry_delay());
    /// # Ok::<(), clap::Error>(())
    /// ```
    #[must_use]
    pub fn run_settings(&self) -> RunSettings {
        let connection = ConnectionConfig::builder()
            .retry_count(self.retry_count)
            .retry_delay(self.retry_delay)
            .connect_timeout(self.connect_timeout)
            .write_timeout(self.write_timeout)
            .handshake_timeout(self.handshake_timeout)
            .protocol_variant(self.protocol)
            .maybe_unrecognized_notification_limit(self.unrecognized_limit)
            .build();
        let token_store = self
            .token_store
            .as_ref()
            .map_or_else(TokenStore::at_default_path, |path| TokenStore::new(path.clone()));

        RunSettings::builder()
            .connection(connection)
            .token_store(token_store)
            .scan_timeout(self.scan_timeout)
            .maybe_output_format(self.output_format)
            .build()
    }

    /// Splits parsed CLI arguments into command and optional fake-client settings.
    #[must_use]
    pub fn into_command_and_fake_args(self) -> (Command, Option<FakeArgs>) {
        let Args {
            fake,
            fake_notifications,
            fake_connect_failures,
            fake_write_failures,
            command,
            ..
        } = self;

        let fake_args = fake.then(|| FakeArgs {
            notifications: fake_notifications,
            connect_failures: fake_connect_failures.unwrap_or_default(),
            write_failures: fake_write_failures.into_iter().collect(),
        });

        (command, fake_args)
    }
}

/// Fake backend arguments for programmatic runs.
///
/// ```
/// let fake = microbot::FakeArgs::builder()
///     .notifications("00000f0101aabbccddeeff0000000000000000000000")?
///     .connect_failures(1)
///     .build();
/// let _ = fake;
/// # Ok::<(), microbot::FixtureError>(())
/// ```
#[derive(Debug, Builder)]
pub struct FakeArgs {
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    notifications: Option<NotificationPayloads>,
    #[builder(default)]
    connect_failures: usize,
    #[builder(default, into)]
    write_failures: BTreeSet<usize>,
}

impl FakeArgs {
    pub(crate) fn into_backend_config(self) -> FakeBackendConfig {
        let Self {
            notifications,
            connect_failures,
            write_failures,
        } = self;

        FakeBackendConfig::builder()
            .notifications(notifications.unwrap_or_default())
            .connect_failures(connect_failures)
            .failing_writes(write_failures)
            .build()
    }
}

/// Options shared by every command run.
#[derive(Debug, Clone, Builder)]
pub struct RunSettings {
    #[builder(default)]
    connection: ConnectionConfig,
    #[builder(default = TokenStore::at_default_path())]
    token_store: TokenStore,
    #[builder(default = DEFAULT_SCAN_TIMEOUT)]
    scan_timeout: Duration,
    output_format: Option<OutputFormat>,
}

impl RunSettings {
    #[must_use]
    pub fn connection(&self) -> &ConnectionConfig {
        &self.connection
    }

    #[must_use]
    pub fn token_store(&self) -> &TokenStore {
        &self.token_store
    }

    #[must_use]
    pub fn scan_timeout(&self) -> Duration {
        self.scan_timeout
    }

    /// Explicitly requested output format, if any.
    #[must_use]
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.output_format
    }
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ask the device for a new token and store it. Press the device button when it blinks.
    Pair(DeviceArgs),
    /// Push the arm once, reporting the resulting switch position.
    Push(PushArgs),
    /// Send stroke depth, hold duration and mode.
    Calibrate(CalibrateArgs),
    /// Report whether a token is stored for a device.
    Token(DeviceArgs),
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Pair(_args) => "pair",
            Self::Push(_args) => "push",
            Self::Calibrate(_args) => "calibrate",
            Self::Token(_args) => "token",
        }
    }
}

/// Log verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub(crate) fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

/// Rendering of command results on stdout.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable, coloured on a terminal.
    Pretty,
    /// One JSON document per result.
    Json,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}
