use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::Stream;
use tracing::{info, instrument};

use super::btleplug_backend::BtleplugBackend;
use super::fake_backend::{FakeBackendConfig, FakeHardwareClient};
use super::model::{DeviceAddress, FoundDevice};
use crate::error::{DiscoveryError, InteractionError};
use crate::protocol::EndpointId;

/// Raw notification payloads from one subscribed characteristic.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Runtime BLE backend selection.
#[derive(Debug)]
pub(crate) enum HardwareBackend {
    Real,
    Fake(FakeBackendConfig),
}

/// Builds the hardware client for the selected runtime backend.
pub(crate) async fn hardware_client_from_backend(
    backend: HardwareBackend,
) -> Result<Arc<dyn HardwareClient>, InteractionError> {
    let client: Arc<dyn HardwareClient> = match backend {
        HardwareBackend::Real => Arc::new(BtleplugBackend::new().await?),
        HardwareBackend::Fake(config) => {
            info!("using fake BLE backend");
            Arc::new(FakeHardwareClient::new(config))
        }
    };

    Ok(client)
}

/// Resolves and opens links to MicroBot peripherals.
#[async_trait]
pub trait HardwareClient: Send + Sync + std::fmt::Debug {
    /// Scans for the peripheral with `address`, giving up after `scan_timeout`.
    async fn discover(
        &self,
        address: &DeviceAddress,
        scan_timeout: Duration,
    ) -> Result<FoundDevice, DiscoveryError>;

    /// Opens a link to an already-resolved peripheral and resolves its endpoints.
    async fn connect(&self, device: &FoundDevice) -> Result<DeviceSession, InteractionError>;
}

/// Backend-specific operations on one open link.
#[async_trait]
pub(crate) trait ConnectedBleSession: Send + Sync + std::fmt::Debug {
    fn device(&self) -> &FoundDevice;

    /// Writes with response; the device drops unacknowledged writes.
    async fn write_endpoint(&self, endpoint: EndpointId, payload: &[u8]) -> Result<(), InteractionError>;

    async fn subscribe_endpoint(&self, endpoint: EndpointId) -> Result<(), InteractionError>;

    async fn unsubscribe_endpoint(&self, endpoint: EndpointId) -> Result<(), InteractionError>;

    async fn notifications(
        &self,
        endpoint: EndpointId,
    ) -> Result<NotificationStream, InteractionError>;

    async fn is_connected(&self) -> Result<bool, InteractionError>;

    /// Requests OS-level bonding. Backends without an explicit pairing step
    /// treat this as a no-op.
    async fn pair(&self) -> Result<(), InteractionError> {
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), InteractionError>;
}

/// An open link to one MicroBot.
#[derive(Debug)]
pub struct DeviceSession {
    inner: Box<dyn ConnectedBleSession>,
}

impl DeviceSession {
    pub(crate) fn new(inner: Box<dyn ConnectedBleSession>) -> Self {
        Self { inner }
    }

    /// Returns details for the connected device.
    #[must_use]
    pub fn device(&self) -> &FoundDevice {
        self.inner.device()
    }

    /// Writes one payload to an endpoint and waits for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is missing or the BLE write fails.
    #[instrument(skip(self, payload), level = "trace", fields(%endpoint, payload_len = payload.len()))]
    pub async fn write_endpoint(
        &self,
        endpoint: EndpointId,
        payload: &[u8],
    ) -> Result<(), InteractionError> {
        self.inner.write_endpoint(endpoint, payload).await
    }

    /// Enables notifications on an endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is missing or subscription fails.
    pub async fn subscribe_endpoint(&self, endpoint: EndpointId) -> Result<(), InteractionError> {
        self.inner.subscribe_endpoint(endpoint).await
    }

    /// Disables notifications on an endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is missing or unsubscription fails.
    pub async fn unsubscribe_endpoint(&self, endpoint: EndpointId) -> Result<(), InteractionError> {
        self.inner.unsubscribe_endpoint(endpoint).await
    }

    /// Opens a stream of raw notifications for an endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot provide a notification stream.
    pub async fn notifications(
        &self,
        endpoint: EndpointId,
    ) -> Result<NotificationStream, InteractionError> {
        self.inner.notifications(endpoint).await
    }

    /// Returns whether the link is still up.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report link state.
    pub async fn is_connected(&self) -> Result<bool, InteractionError> {
        self.inner.is_connected().await
    }

    pub(crate) async fn pair(&self) -> Result<(), InteractionError> {
        self.inner.pair().await
    }

    /// Closes the link.
    ///
    /// # Errors
    ///
    /// Returns an error if backend teardown fails.
    pub async fn close(self) -> Result<(), InteractionError> {
        self.inner.close().await
    }
}
