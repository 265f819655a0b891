use std::collections::BTreeSet;
use std::future::pending;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tracing::{debug, instrument};

use super::hardware::{ConnectedBleSession, DeviceSession, HardwareClient, NotificationStream};
use super::model::{DeviceAddress, FoundDevice};
use super::session::{microbot_services, resolve_endpoints};
use crate::error::{DiscoveryError, FixtureError, InteractionError};
use crate::protocol::EndpointId;

const FAKE_ADAPTER: &str = "fake0";
const FAKE_LOCAL_NAME: &str = "mibp";

/// Parsed fake notification payload fixtures.
#[derive(Debug, Clone, Default, derive_more::Into)]
pub struct NotificationPayloads {
    payloads: Vec<Vec<u8>>,
}

impl FromStr for NotificationPayloads {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let payloads = parse_notifications(value)?;
        Ok(Self { payloads })
    }
}

impl From<Vec<Vec<u8>>> for NotificationPayloads {
    fn from(payloads: Vec<Vec<u8>>) -> Self {
        Self { payloads }
    }
}

/// Link operations the fake backend can be told to never complete.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum FakeOperation {
    Pair,
    Subscribe,
    Unsubscribe,
    LinkState,
    Close,
}

/// Scripted behaviour for the fake hardware backend.
///
/// Write indices count every record written through any session opened by
/// the same client, starting at zero.
#[derive(Debug, Clone, Builder)]
pub struct FakeBackendConfig {
    /// Payloads replayed on every notification subscription.
    #[builder(default, into)]
    notifications: NotificationPayloads,
    /// Number of leading connect attempts that fail.
    #[builder(default)]
    connect_failures: usize,
    /// Record indices whose write fails.
    #[builder(default, into)]
    failing_writes: BTreeSet<usize>,
    /// Drops the link once this many records have been written.
    drop_link_after_writes: Option<usize>,
    /// Simulated link establishment latency.
    #[builder(default)]
    connect_delay: Duration,
    /// Whether discovery finds the requested address.
    #[builder(default = true)]
    discoverable: bool,
    /// Operations that hang instead of answering.
    #[builder(default, into)]
    stalled_operations: BTreeSet<FakeOperation>,
}

impl Default for FakeBackendConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// One observable action performed against the fake backend.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FakeEvent {
    Connect,
    Write { endpoint: EndpointId, payload: Vec<u8> },
    Subscribe,
    Unsubscribe,
    Close,
}

#[derive(Debug, Default)]
struct FakeLedger {
    events: Vec<FakeEvent>,
    connect_attempts: usize,
    write_attempts: usize,
    successful_writes: usize,
}

/// Fake hardware client used in tests and non-hardware environments.
#[derive(Debug, Clone)]
pub struct FakeHardwareClient {
    config: Arc<FakeBackendConfig>,
    ledger: Arc<Mutex<FakeLedger>>,
}

impl FakeHardwareClient {
    /// Creates a fake client from scripted settings.
    #[must_use]
    pub fn new(config: FakeBackendConfig) -> Self {
        Self {
            config: Arc::new(config),
            ledger: Arc::default(),
        }
    }

    /// Returns every recorded action in order.
    pub async fn events(&self) -> Vec<FakeEvent> {
        self.ledger.lock().await.events.clone()
    }

    /// Returns the payloads written to the control characteristic, in order.
    pub async fn written_records(&self) -> Vec<Vec<u8>> {
        self.ledger
            .lock()
            .await
            .events
            .iter()
            .filter_map(|event| match event {
                FakeEvent::Write { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns how many connects were attempted, including failed ones.
    pub async fn connect_attempts(&self) -> usize {
        self.ledger.lock().await.connect_attempts
    }
}

#[async_trait]
impl HardwareClient for FakeHardwareClient {
    #[instrument(skip(self), level = "debug", fields(%address))]
    async fn discover(
        &self,
        address: &DeviceAddress,
        scan_timeout: Duration,
    ) -> Result<FoundDevice, DiscoveryError> {
        if !self.config.discoverable {
            sleep(scan_timeout).await;
            return Err(DiscoveryError::NotFound {
                address: address.clone(),
                timeout_ms: crate::handlers::duration_ms(scan_timeout),
            });
        }

        Ok(FoundDevice::new(
            FAKE_ADAPTER,
            format!("{FAKE_ADAPTER}/{address}"),
            address.clone(),
            Some(FAKE_LOCAL_NAME.to_string()),
            Some(-50),
        ))
    }

    #[instrument(skip(self, device), level = "debug", fields(address = %device.address()))]
    async fn connect(&self, device: &FoundDevice) -> Result<DeviceSession, InteractionError> {
        let attempt = {
            let mut ledger = self.ledger.lock().await;
            ledger.connect_attempts += 1;
            ledger.connect_attempts
        };
        if !self.config.connect_delay.is_zero() {
            sleep(self.config.connect_delay).await;
        }
        if attempt <= self.config.connect_failures {
            debug!(attempt, "scripted connect failure");
            return Err(InteractionError::FakeFailure {
                operation: "connect",
            });
        }

        resolve_endpoints(&microbot_services())?;
        self.ledger.lock().await.events.push(FakeEvent::Connect);
        Ok(DeviceSession::new(Box::new(FakeDeviceSession {
            device: device.clone(),
            config: Arc::clone(&self.config),
            ledger: Arc::clone(&self.ledger),
            connected: AtomicBool::new(true),
        })))
    }
}

/// A fake open link.
#[derive(Debug)]
struct FakeDeviceSession {
    device: FoundDevice,
    config: Arc<FakeBackendConfig>,
    ledger: Arc<Mutex<FakeLedger>>,
    connected: AtomicBool,
}

impl FakeDeviceSession {
    async fn stall_if_scripted(&self, operation: FakeOperation) {
        if self.config.stalled_operations.contains(&operation) {
            debug!(?operation, "scripted stall");
            pending::<()>().await;
        }
    }

    fn ensure_connected(&self) -> Result<(), InteractionError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(InteractionError::LinkClosed)
        }
    }
}

#[async_trait]
impl ConnectedBleSession for FakeDeviceSession {
    fn device(&self) -> &FoundDevice {
        &self.device
    }

    async fn write_endpoint(&self, endpoint: EndpointId, payload: &[u8]) -> Result<(), InteractionError> {
        self.ensure_connected()?;
        let mut ledger = self.ledger.lock().await;
        let index = ledger.write_attempts;
        ledger.write_attempts += 1;
        if self.config.failing_writes.contains(&index) {
            debug!(index, "scripted write failure");
            return Err(InteractionError::FakeFailure { operation: "write" });
        }

        ledger.events.push(FakeEvent::Write {
            endpoint,
            payload: payload.to_vec(),
        });
        ledger.successful_writes += 1;
        if self
            .config
            .drop_link_after_writes
            .is_some_and(|limit| ledger.successful_writes == limit)
        {
            debug!("scripted link drop");
            self.connected.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn subscribe_endpoint(&self, _endpoint: EndpointId) -> Result<(), InteractionError> {
        self.stall_if_scripted(FakeOperation::Subscribe).await;
        self.ensure_connected()?;
        self.ledger.lock().await.events.push(FakeEvent::Subscribe);
        Ok(())
    }

    async fn unsubscribe_endpoint(&self, _endpoint: EndpointId) -> Result<(), InteractionError> {
        self.stall_if_scripted(FakeOperation::Unsubscribe).await;
        self.ensure_connected()?;
        self.ledger.lock().await.events.push(FakeEvent::Unsubscribe);
        Ok(())
    }

    async fn notifications(
        &self,
        _endpoint: EndpointId,
    ) -> Result<NotificationStream, InteractionError> {
        self.ensure_connected()?;
        let replay = tokio_stream::iter(self.config.notifications.payloads.clone());
        // Keep the stream open after the script runs out, like a quiet device.
        Ok(Box::pin(replay.chain(tokio_stream::pending())))
    }

    async fn is_connected(&self) -> Result<bool, InteractionError> {
        self.stall_if_scripted(FakeOperation::LinkState).await;
        Ok(self.connected.load(Ordering::SeqCst))
    }

    async fn pair(&self) -> Result<(), InteractionError> {
        self.stall_if_scripted(FakeOperation::Pair).await;
        self.ensure_connected()
    }

    async fn close(self: Box<Self>) -> Result<(), InteractionError> {
        self.stall_if_scripted(FakeOperation::Close).await;
        self.connected.store(false, Ordering::SeqCst);
        self.ledger.lock().await.events.push(FakeEvent::Close);
        Ok(())
    }
}

fn parse_notifications(raw_value: &str) -> Result<Vec<Vec<u8>>, FixtureError> {
    if raw_value.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw_value.split(',').map(parse_hex).collect()
}

fn parse_hex(raw_value: &str) -> Result<Vec<u8>, FixtureError> {
    let cleaned: String = raw_value.chars().filter(|c| !c.is_whitespace()).collect();
    if !cleaned.len().is_multiple_of(2) {
        return Err(FixtureError::InvalidHexLength);
    }
    hex::decode(&cleaned).map_err(|_error| FixtureError::InvalidHexByte { value: cleaned })
}
