use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::error::ConnectionError;
use crate::handlers::{
    FrameCodec, HandshakeHandler, HandshakeMachine, HandshakeOptions, HandshakeState, bounded,
};
use crate::hw::{DeviceAddress, DeviceSession, FoundDevice, HardwareClient, LinkRegistry, SessionLease};
use crate::protocol::{EndpointId, ProtocolVariant};
use crate::token_store::{AuthToken, TokenStore, TokenStoreError};

/// Default number of retries after the first connect attempt.
pub const DEFAULT_RETRY_COUNT: usize = 5;
/// Default pause between connect attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Default bound on link establishment, teardown, link-state queries and
/// each characteristic write.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(20);
/// Default window for the device to answer a fresh-pair handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(55);

/// Connection behaviour fixed at manager construction.
///
/// ```
/// use std::time::Duration;
///
/// use microbot::{ConnectionConfig, ProtocolVariant};
///
/// let config = ConnectionConfig::builder()
///     .retry_count(2)
///     .retry_delay(Duration::from_secs(1))
///     .protocol_variant(ProtocolVariant::Legacy)
///     .build();
/// assert_eq!(3, config.max_attempts());
/// ```
#[derive(Debug, Clone, Builder)]
pub struct ConnectionConfig {
    #[builder(default = DEFAULT_RETRY_COUNT)]
    retry_count: usize,
    #[builder(default = DEFAULT_RETRY_DELAY)]
    retry_delay: Duration,
    #[builder(default = DEFAULT_IO_TIMEOUT)]
    connect_timeout: Duration,
    #[builder(default = DEFAULT_IO_TIMEOUT)]
    write_timeout: Duration,
    #[builder(default = DEFAULT_HANDSHAKE_TIMEOUT)]
    handshake_timeout: Duration,
    #[builder(default)]
    protocol_variant: ProtocolVariant,
    /// Abort a fresh-pair handshake after this many unrecognized
    /// notifications. Unset means they are ignored until the handshake
    /// timeout.
    unrecognized_notification_limit: Option<usize>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ConnectionConfig {
    #[must_use]
    pub fn retry_count(&self) -> usize {
        self.retry_count
    }

    /// Initial attempt plus retries.
    #[must_use]
    pub fn max_attempts(&self) -> usize {
        self.retry_count.saturating_add(1)
    }

    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    #[must_use]
    pub fn protocol_variant(&self) -> ProtocolVariant {
        self.protocol_variant
    }

    #[must_use]
    pub fn unrecognized_notification_limit(&self) -> Option<usize> {
        self.unrecognized_notification_limit
    }

    fn handshake_options(&self) -> HandshakeOptions {
        HandshakeOptions {
            handshake_timeout: self.handshake_timeout,
            write_timeout: self.write_timeout,
            unrecognized_limit: self.unrecognized_notification_limit,
        }
    }
}

/// An authenticated link to one device.
///
/// Only [`ConnectionManager::connect`] creates sessions, and only after the
/// handshake completed, so holding one means commands may be sent.
#[derive(Debug)]
pub struct ConnectionSession {
    link: DeviceSession,
    handshake_state: HandshakeState,
    notifications_active: bool,
    link_timeout: Duration,
    _lease: SessionLease,
}

impl ConnectionSession {
    /// Returns details for the connected device.
    #[must_use]
    pub fn device(&self) -> &FoundDevice {
        self.link.device()
    }

    #[must_use]
    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake_state
    }

    /// Returns whether the handshake for this session completed.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.handshake_state == HandshakeState::Complete
    }

    /// Returns whether the link is still up. Backend errors and a backend
    /// that does not answer within the connect timeout count as down.
    pub async fn is_connected(&self) -> bool {
        let query = bounded("link state", self.link_timeout, self.link.is_connected());
        match query.await {
            Ok(connected) => connected,
            Err(error) => {
                debug!(?error, "link state unavailable; treating as disconnected");
                false
            }
        }
    }

    pub(crate) fn link(&self) -> &DeviceSession {
        &self.link
    }
}

/// Owns link establishment and authentication for one device.
#[derive(Debug)]
pub struct ConnectionManager {
    hardware: Arc<dyn HardwareClient>,
    device: FoundDevice,
    store: TokenStore,
    config: ConnectionConfig,
    registry: Arc<LinkRegistry>,
}

impl ConnectionManager {
    /// Creates a manager for an already-resolved device, sharing the
    /// process-wide [`LinkRegistry`].
    #[must_use]
    pub fn new(
        hardware: Arc<dyn HardwareClient>,
        device: FoundDevice,
        store: TokenStore,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            hardware,
            device,
            store,
            config,
            registry: LinkRegistry::global(),
        }
    }

    /// Replaces the link registry, isolating this manager from others.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<LinkRegistry>) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn address(&self) -> &DeviceAddress {
        self.device.address()
    }

    #[must_use]
    pub fn device(&self) -> &FoundDevice {
        &self.device
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    #[must_use]
    pub fn token_store(&self) -> &TokenStore {
        &self.store
    }

    /// Returns the codec for the configured protocol variant.
    #[must_use]
    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.config.protocol_variant)
    }

    /// Returns whether a token is stored for this device.
    ///
    /// # Errors
    ///
    /// Returns an error when the token store cannot be read.
    pub fn has_token(&self) -> Result<bool, TokenStoreError> {
        self.store.contains(self.address())
    }

    /// Opens an authenticated session.
    ///
    /// With `fresh_pair` the device is asked to issue a new token, which is
    /// persisted; otherwise the stored token is sent. Link failures and
    /// transport faults during the handshake are retried as a whole, up to
    /// [`ConnectionConfig::max_attempts`] attempts in total.
    ///
    /// # Errors
    ///
    /// Returns an error when a session for the device is already open, no
    /// token is stored for a non-pairing connect, the handshake times out,
    /// or every attempt fails.
    #[instrument(
        skip(self),
        level = "info",
        fields(
            address = %self.address(),
            variant = %self.config.protocol_variant,
            max_attempts = self.config.max_attempts()
        )
    )]
    pub async fn connect(&self, fresh_pair: bool) -> Result<ConnectionSession, ConnectionError> {
        let address = self.address();
        let _connect_guard = self.registry.lock_connect(address).await;
        let lease = self
            .registry
            .claim_session(address)
            .ok_or_else(|| ConnectionError::SessionActive {
                address: address.clone(),
            })?;

        let token = if fresh_pair {
            None
        } else {
            Some(self.stored_token()?)
        };

        let max_attempts = self.config.max_attempts();
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let error = match self.attempt(token.as_ref()).await {
                Ok((link, handshake_state, notifications_active)) => {
                    info!(attempt, "session established");
                    return Ok(ConnectionSession {
                        link,
                        handshake_state,
                        notifications_active,
                        link_timeout: self.config.connect_timeout,
                        _lease: lease,
                    });
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                return Err(error);
            }
            if attempt >= max_attempts {
                return Err(ConnectionError::RetriesExhausted {
                    address: address.clone(),
                    attempts: attempt,
                    last_error: Box::new(error),
                });
            }

            warn!(attempt, %error, "connection attempt failed; retrying");
            sleep(self.config.retry_delay).await;
        }
    }

    fn stored_token(&self) -> Result<AuthToken, ConnectionError> {
        let missing = || ConnectionError::MissingToken {
            address: self.address().clone(),
        };
        match self.store.load(self.address()) {
            Ok(Some(token)) => Ok(token),
            Ok(None) => Err(missing()),
            Err(error) => {
                warn!(?error, "token store unreadable");
                Err(missing())
            }
        }
    }

    /// One link-plus-handshake attempt. `token` selects stored-token
    /// authentication; `None` runs a fresh pair.
    #[instrument(skip_all, level = "debug", fields(fresh_pair = token.is_none()))]
    async fn attempt(
        &self,
        token: Option<&AuthToken>,
    ) -> Result<(DeviceSession, HandshakeState, bool), ConnectionError> {
        let link = self.establish_link().await?;

        if let Err(error) = bounded("pair", self.config.connect_timeout, link.pair()).await {
            self.close_quietly(link).await;
            return Err(ConnectionError::Link(error));
        }

        let codec = self.codec();
        let mut machine = HandshakeMachine::new();
        let result = match token {
            Some(token) => {
                HandshakeHandler::authenticate(
                    &link,
                    &mut machine,
                    codec,
                    token,
                    self.config.write_timeout,
                )
                .await
                .map(|()| false)
            }
            None => HandshakeHandler::pair(
                &link,
                &mut machine,
                codec,
                &self.store,
                self.address(),
                self.config.handshake_options(),
            )
            .await
            .map(|outcome| outcome.still_subscribed),
        };

        match result {
            Ok(notifications_active) => Ok((link, machine.state(), notifications_active)),
            Err(error) => {
                self.close_quietly(link).await;
                Err(ConnectionError::Handshake(error))
            }
        }
    }

    async fn establish_link(&self) -> Result<DeviceSession, ConnectionError> {
        let connect = self.hardware.connect(&self.device);
        bounded("connect", self.config.connect_timeout, connect)
            .await
            .map_err(ConnectionError::Link)
    }

    /// Closes a session. Links that are already gone are not an error, and
    /// each teardown step is bounded so a silent backend cannot stall it.
    #[instrument(skip_all, level = "info", fields(address = %self.address()))]
    pub async fn disconnect(&self, session: ConnectionSession) {
        let ConnectionSession {
            link,
            notifications_active,
            _lease,
            ..
        } = session;

        if notifications_active {
            let unsubscribe = bounded(
                "unsubscribe",
                self.config.write_timeout,
                link.unsubscribe_endpoint(EndpointId::NotifyCharacteristic),
            );
            if let Err(error) = unsubscribe.await {
                debug!(?error, "failed to unsubscribe before disconnect");
            }
        }
        self.close_quietly(link).await;
        info!("disconnected");
    }

    async fn close_quietly(&self, link: DeviceSession) {
        if let Err(error) = bounded("close", self.config.connect_timeout, link.close()).await {
            debug!(?error, "link close failed; treating as already closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn default_config_matches_documented_values() {
        let config = ConnectionConfig::default();
        assert_eq!(5, config.retry_count());
        assert_eq!(6, config.max_attempts());
        assert_eq!(Duration::from_millis(500), config.retry_delay());
        assert_eq!(Duration::from_secs(20), config.connect_timeout());
        assert_eq!(Duration::from_secs(20), config.write_timeout());
        assert_eq!(Duration::from_secs(55), config.handshake_timeout());
        assert_eq!(ProtocolVariant::New, config.protocol_variant());
        assert_eq!(None, config.unrecognized_notification_limit());
    }

    #[test]
    fn max_attempts_saturates() {
        let config = ConnectionConfig::builder().retry_count(usize::MAX).build();
        assert_eq!(usize::MAX, config.max_attempts());
    }
}
