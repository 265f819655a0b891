use thiserror::Error;

use crate::handlers::HandshakeError;
use crate::hw::DeviceAddress;
use crate::protocol::{EndpointId, endpoint_metadata};

/// Errors returned by BLE transport operations.
#[derive(Debug, Error)]
pub enum InteractionError {
    #[error("BLE operation failed")]
    Ble(#[from] btleplug::Error),
    #[error("no BLE adapters were found")]
    NoAdapters,
    #[error("peripheral `{device_id}` is no longer known to any adapter")]
    UnknownPeripheral { device_id: String },
    #[error(
        "required {kind} `{name}` ({uuid}) was not found on the connected device",
        kind = endpoint_metadata(*endpoint).kind(),
        name = endpoint_metadata(*endpoint).name(),
        uuid = endpoint_metadata(*endpoint).uuid()
    )]
    MissingEndpoint { endpoint: EndpointId },
    #[error("the link to the device is closed")]
    LinkClosed,
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },
    #[error("the fake link rejected the {operation}")]
    FakeFailure { operation: &'static str },
}

/// Errors returned when a device handle cannot be resolved.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no MicroBot with address `{address}` was found within {timeout_ms}ms")]
    NotFound {
        address: DeviceAddress,
        timeout_ms: u64,
    },
    #[error(transparent)]
    Interaction(#[from] InteractionError),
}

/// Errors returned while establishing an authenticated session.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to `{address}` after {attempts} attempt(s)")]
    RetriesExhausted {
        address: DeviceAddress,
        attempts: usize,
        #[source]
        last_error: Box<ConnectionError>,
    },
    #[error("link establishment failed")]
    Link(#[source] InteractionError),
    #[error("token handshake failed")]
    Handshake(#[from] HandshakeError),
    #[error("no token is stored for `{address}`; pair the device first")]
    MissingToken { address: DeviceAddress },
    #[error("a session for `{address}` is already open")]
    SessionActive { address: DeviceAddress },
}

impl ConnectionError {
    /// Returns whether the whole connection attempt is worth repeating.
    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            Self::Link(_) => true,
            Self::Handshake(error) => error.is_transport_fault(),
            Self::RetriesExhausted { .. } | Self::MissingToken { .. } | Self::SessionActive { .. } => {
                false
            }
        }
    }
}

/// Errors returned by push and calibrate commands.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("the session has not completed authentication")]
    NotAuthenticated,
    #[error("writing the {command} frames failed")]
    TransportWrite {
        command: &'static str,
        #[source]
        source: InteractionError,
    },
    #[error("reconnecting after a failed {command} failed")]
    Reconnect {
        command: &'static str,
        #[source]
        source: ConnectionError,
    },
    #[error("no session is open; connect first")]
    NotConnected,
}

/// Errors returned when parsing fake backend fixtures.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum FixtureError {
    #[error("hex payload length must be even")]
    InvalidHexLength,
    #[error("hex payload contains invalid byte `{value}`")]
    InvalidHexByte { value: String },
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}
