mod app;
mod cli;
mod connection;
mod error;
mod handlers;
mod hw;
mod notification;
mod protocol;
mod telemetry;
mod terminal;
mod token_store;
mod utils;

pub use app::{
    MicrobotClient, fake_hardware_client, real_hardware_client, run,
    run_with_clients_and_log_level, run_with_log_level,
};
pub use cli::{
    Args, CalibrateArgs, Command, DEFAULT_SCAN_TIMEOUT, DeviceArgs, FakeArgs, LogLevel,
    OutputFormat, PushArgs, RunSettings,
};
pub use connection::{
    ConnectionConfig, ConnectionManager, ConnectionSession, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_IO_TIMEOUT, DEFAULT_RETRY_COUNT, DEFAULT_RETRY_DELAY,
};
pub use error::{CommandError, ConnectionError, DiscoveryError, FixtureError, InteractionError};
pub use handlers::{
    CalibrateHandler, CalibrationMode, CommandParameters, CorrelationId, FrameCodec, FramePair,
    HandshakeError, HandshakeHandler, HandshakeMachine, HandshakeState, MAX_DEPTH, PushHandler,
    RECORD_LEN, SwitchState, Transition,
};
pub use hw::{
    DeviceAddress, DeviceAddressError, DeviceSession, FakeBackendConfig, FakeEvent,
    FakeHardwareClient, FakeOperation, FoundDevice, HardwareClient, LinkRegistry,
    NotificationPayloads, NotificationStream,
};
pub use notification::{NotificationHandler, NotifyEvent};
pub use protocol::{EndpointId, ProtocolVariant};
pub use terminal::{SystemTerminalClient, TerminalClient};
pub use token_store::{AuthToken, AuthTokenError, TokenStore, TokenStoreError, default_path};
