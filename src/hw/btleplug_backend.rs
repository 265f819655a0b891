use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::bleuuid::uuid_from_u16;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::time::{sleep, timeout};
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument};

use super::hardware::{ConnectedBleSession, DeviceSession, HardwareClient, NotificationStream};
use super::model::{DeviceAddress, FoundDevice};
use super::session::{CharacteristicInfo, ServiceInfo, resolve_endpoints};
use crate::error::{DiscoveryError, InteractionError};
use crate::handlers::duration_ms;
use crate::protocol::EndpointId;

const MICROBOT_SERVICE_SHORT_UUID: u16 = 0x1831;
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Hardware backend backed by `btleplug`.
#[derive(Debug)]
pub(crate) struct BtleplugBackend {
    manager: Manager,
}

impl BtleplugBackend {
    /// Creates the real BLE backend.
    pub(crate) async fn new() -> Result<Self, InteractionError> {
        let manager = Manager::new().await?;
        Ok(Self { manager })
    }

    #[instrument(skip(self), level = "trace")]
    async fn adapters(&self) -> Result<Vec<AdapterHandle>, InteractionError> {
        let adapters = self.manager.adapters().await?;
        if adapters.is_empty() {
            return Err(InteractionError::NoAdapters);
        }

        let mut handles = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            let name = adapter.adapter_info().await?;
            handles.push(AdapterHandle { adapter, name });
        }
        Ok(handles)
    }

    /// Polls every adapter until a peripheral with `address` shows up.
    async fn poll_for_address(
        adapters: &[AdapterHandle],
        address: &DeviceAddress,
    ) -> Result<FoundDevice, InteractionError> {
        loop {
            for handle in adapters {
                for peripheral in handle.adapter.peripherals().await? {
                    let Some(properties) = peripheral.properties().await? else {
                        continue;
                    };
                    // macOS hides MAC addresses, so fall back to the platform id.
                    let device_id = peripheral.id().to_string();
                    if !address.matches(&properties.address.to_string())
                        && !address.matches(&device_id)
                    {
                        continue;
                    }

                    return Ok(FoundDevice::new(
                        handle.name.clone(),
                        device_id,
                        address.clone(),
                        properties.local_name,
                        properties.rssi,
                    ));
                }
            }

            sleep(SCAN_POLL_INTERVAL).await;
        }
    }

    async fn find_peripheral(&self, device: &FoundDevice) -> Result<Peripheral, InteractionError> {
        for handle in self.adapters().await? {
            if handle.name != device.adapter_name() {
                continue;
            }
            for peripheral in handle.adapter.peripherals().await? {
                if peripheral.id().to_string() == device.device_id() {
                    return Ok(peripheral);
                }
            }
        }

        Err(InteractionError::UnknownPeripheral {
            device_id: device.device_id().to_string(),
        })
    }
}

#[async_trait]
impl HardwareClient for BtleplugBackend {
    #[instrument(skip(self), level = "debug", fields(%address, scan_timeout_ms = duration_ms(scan_timeout)))]
    async fn discover(
        &self,
        address: &DeviceAddress,
        scan_timeout: Duration,
    ) -> Result<FoundDevice, DiscoveryError> {
        let adapters = self.adapters().await?;
        let filter = ScanFilter {
            services: vec![uuid_from_u16(MICROBOT_SERVICE_SHORT_UUID)],
        };
        for handle in &adapters {
            handle.adapter.start_scan(filter.clone()).await.map_err(InteractionError::from)?;
        }
        info!(adapter_count = adapters.len(), "scanning for MicroBot");

        let outcome = timeout(scan_timeout, Self::poll_for_address(&adapters, address)).await;

        for handle in &adapters {
            if let Err(error) = handle.adapter.stop_scan().await {
                debug!(?error, "failed to stop adapter scan cleanly");
            }
        }

        match outcome {
            Ok(found) => Ok(found?),
            Err(_elapsed) => Err(DiscoveryError::NotFound {
                address: address.clone(),
                timeout_ms: duration_ms(scan_timeout),
            }),
        }
    }

    #[instrument(skip(self, device), level = "debug", fields(address = %device.address()))]
    async fn connect(&self, device: &FoundDevice) -> Result<DeviceSession, InteractionError> {
        let peripheral = self.find_peripheral(device).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        peripheral.discover_services().await?;

        let (services, characteristics_by_uuid) = collect_services_and_characteristics(&peripheral);
        let characteristics_by_endpoint = match resolve_endpoints(&services) {
            Ok(endpoint_uuids) => characteristics_by_endpoint(&endpoint_uuids, &characteristics_by_uuid),
            Err(error) => {
                if let Err(disconnect_error) = peripheral.disconnect().await {
                    debug!(
                        ?disconnect_error,
                        "failed to disconnect after endpoint validation error"
                    );
                }
                return Err(error);
            }
        };

        info!(device = %device.display_name(), "connected to MicroBot");
        Ok(DeviceSession::new(Box::new(RealDeviceSession {
            device: device.clone(),
            characteristics_by_endpoint,
            peripheral,
        })))
    }
}

/// Active session bound to a real peripheral.
#[derive(Debug)]
struct RealDeviceSession {
    device: FoundDevice,
    characteristics_by_endpoint: HashMap<EndpointId, Characteristic>,
    peripheral: Peripheral,
}

impl RealDeviceSession {
    fn characteristic_for(&self, endpoint: EndpointId) -> Result<&Characteristic, InteractionError> {
        self.characteristics_by_endpoint
            .get(&endpoint)
            .ok_or(InteractionError::MissingEndpoint { endpoint })
    }
}

#[async_trait]
impl ConnectedBleSession for RealDeviceSession {
    fn device(&self) -> &FoundDevice {
        &self.device
    }

    #[instrument(skip(self, payload), level = "trace", fields(%endpoint, payload_len = payload.len()))]
    async fn write_endpoint(&self, endpoint: EndpointId, payload: &[u8]) -> Result<(), InteractionError> {
        let characteristic = self.characteristic_for(endpoint)?;
        self.peripheral
            .write(characteristic, payload, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "trace", fields(%endpoint))]
    async fn subscribe_endpoint(&self, endpoint: EndpointId) -> Result<(), InteractionError> {
        let characteristic = self.characteristic_for(endpoint)?;
        self.peripheral.subscribe(characteristic).await?;
        Ok(())
    }

    #[instrument(skip(self), level = "trace", fields(%endpoint))]
    async fn unsubscribe_endpoint(&self, endpoint: EndpointId) -> Result<(), InteractionError> {
        let characteristic = self.characteristic_for(endpoint)?;
        self.peripheral.unsubscribe(characteristic).await?;
        Ok(())
    }

    async fn notifications(
        &self,
        endpoint: EndpointId,
    ) -> Result<NotificationStream, InteractionError> {
        let expected_uuid = self.characteristic_for(endpoint)?.uuid;
        let notifications = self.peripheral.notifications().await?;
        let filtered = notifications.filter_map(move |notification| {
            (notification.uuid == expected_uuid).then_some(notification.value)
        });
        Ok(Box::pin(filtered))
    }

    async fn is_connected(&self) -> Result<bool, InteractionError> {
        Ok(self.peripheral.is_connected().await?)
    }

    #[instrument(skip(self), level = "debug")]
    async fn close(self: Box<Self>) -> Result<(), InteractionError> {
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct AdapterHandle {
    adapter: Adapter,
    name: String,
}

fn collect_services_and_characteristics(
    peripheral: &Peripheral,
) -> (Vec<ServiceInfo>, HashMap<String, Characteristic>) {
    let mut services = Vec::new();
    let mut characteristics_by_uuid = HashMap::new();

    for service in peripheral.services() {
        let mut characteristics = Vec::new();
        for characteristic in &service.characteristics {
            let characteristic_uuid = characteristic.uuid.to_string().to_lowercase();
            characteristics_by_uuid
                .entry(characteristic_uuid.clone())
                .or_insert_with(|| characteristic.clone());
            characteristics.push(CharacteristicInfo::new(
                characteristic_uuid,
                property_labels(characteristic.properties),
            ));
        }
        services.push(ServiceInfo::new(
            service.uuid.to_string().to_lowercase(),
            characteristics,
        ));
    }

    (services, characteristics_by_uuid)
}

fn property_labels(flags: CharPropFlags) -> Vec<String> {
    flags
        .iter_names()
        .map(|(name, _)| name.to_lowercase())
        .collect()
}

fn characteristics_by_endpoint(
    endpoint_uuids: &HashMap<EndpointId, String>,
    characteristics_by_uuid: &HashMap<String, Characteristic>,
) -> HashMap<EndpointId, Characteristic> {
    endpoint_uuids
        .iter()
        .filter_map(|(endpoint, uuid)| {
            characteristics_by_uuid
                .get(uuid)
                .map(|characteristic| (*endpoint, characteristic.clone()))
        })
        .collect()
}
