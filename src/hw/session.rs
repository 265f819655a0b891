use std::collections::HashMap;

use tracing::instrument;

use crate::error::InteractionError;
use crate::protocol::{EndpointId, endpoint_metadata};

/// One discovered GATT characteristic.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct CharacteristicInfo {
    uuid: String,
    properties: Vec<String>,
}

impl CharacteristicInfo {
    pub(crate) fn new(uuid: impl Into<String>, properties: Vec<String>) -> Self {
        Self {
            uuid: uuid.into(),
            properties,
        }
    }

    pub(crate) fn uuid(&self) -> &str {
        &self.uuid
    }

    fn has_property(&self, property: &str) -> bool {
        self.properties
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(property))
    }

    fn supports_write(&self) -> bool {
        self.has_property("write") || self.has_property("write_without_response")
    }

    fn supports_notify(&self) -> bool {
        self.has_property("notify") || self.has_property("indicate")
    }
}

/// One discovered GATT service.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct ServiceInfo {
    uuid: String,
    characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    pub(crate) fn new(uuid: impl Into<String>, characteristics: Vec<CharacteristicInfo>) -> Self {
        Self {
            uuid: uuid.into(),
            characteristics,
        }
    }

    fn characteristic(&self, uuid: &str) -> Option<&CharacteristicInfo> {
        self.characteristics
            .iter()
            .find(|characteristic| characteristic.uuid.eq_ignore_ascii_case(uuid))
    }
}

/// Resolves the control service and its write/notify characteristic.
///
/// Returns the lowercase characteristic UUID for each characteristic endpoint.
#[instrument(skip(services), level = "debug", fields(service_count = services.len()))]
pub(crate) fn resolve_endpoints(
    services: &[ServiceInfo],
) -> Result<HashMap<EndpointId, String>, InteractionError> {
    let service_uuid = endpoint_metadata(EndpointId::ControlService).uuid();
    let service = services
        .iter()
        .find(|service| service.uuid.eq_ignore_ascii_case(service_uuid))
        .ok_or(InteractionError::MissingEndpoint {
            endpoint: EndpointId::ControlService,
        })?;

    let control = service
        .characteristic(endpoint_metadata(EndpointId::ControlCharacteristic).uuid())
        .filter(|characteristic| characteristic.supports_write())
        .ok_or(InteractionError::MissingEndpoint {
            endpoint: EndpointId::ControlCharacteristic,
        })?;
    let notify = service
        .characteristic(endpoint_metadata(EndpointId::NotifyCharacteristic).uuid())
        .filter(|characteristic| characteristic.supports_notify())
        .ok_or(InteractionError::MissingEndpoint {
            endpoint: EndpointId::NotifyCharacteristic,
        })?;

    Ok(HashMap::from([
        (
            EndpointId::ControlCharacteristic,
            control.uuid.to_ascii_lowercase(),
        ),
        (
            EndpointId::NotifyCharacteristic,
            notify.uuid.to_ascii_lowercase(),
        ),
    ]))
}

/// Service layout advertised by a healthy MicroBot.
pub(crate) fn microbot_services() -> Vec<ServiceInfo> {
    let characteristic = endpoint_metadata(EndpointId::ControlCharacteristic);
    vec![ServiceInfo::new(
        endpoint_metadata(EndpointId::ControlService).uuid(),
        vec![CharacteristicInfo::new(
            characteristic.uuid(),
            vec!["write".to_string(), "notify".to_string()],
        )],
    )]
}
