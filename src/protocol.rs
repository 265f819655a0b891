use std::collections::HashMap;
use std::sync::LazyLock;

use clap::ValueEnum;
use serde_with::SerializeDisplay;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

/// Known MicroBot Push protocol endpoints.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, EnumIter, Display)]
pub enum EndpointId {
    /// MicroBot control service.
    #[strum(to_string = "control_service")]
    ControlService,
    /// Characteristic used for command frame writes.
    #[strum(to_string = "control_characteristic")]
    ControlCharacteristic,
    /// Characteristic used for device notifications.
    #[strum(to_string = "notify_characteristic")]
    NotifyCharacteristic,
}

/// Endpoint category in GATT.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
pub(crate) enum EndpointKind {
    #[strum(to_string = "service")]
    Service,
    #[strum(to_string = "characteristic")]
    Characteristic,
}

/// Descriptive metadata for one protocol endpoint.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct EndpointMetadata {
    name: &'static str,
    uuid: &'static str,
    kind: EndpointKind,
}

impl EndpointMetadata {
    /// Human-readable endpoint name.
    pub(crate) fn name(self) -> &'static str {
        self.name
    }

    /// Endpoint UUID.
    pub(crate) fn uuid(self) -> &'static str {
        self.uuid
    }

    pub(crate) fn kind(self) -> EndpointKind {
        self.kind
    }
}

static ENDPOINTS_BY_ID: LazyLock<HashMap<EndpointId, EndpointMetadata>> = LazyLock::new(|| {
    EndpointId::iter()
        .map(|endpoint| (endpoint, metadata_for(endpoint)))
        .collect()
});

/// Returns metadata for one endpoint.
pub(crate) fn endpoint_metadata(endpoint: EndpointId) -> EndpointMetadata {
    *ENDPOINTS_BY_ID
        .get(&endpoint)
        .unwrap_or(&metadata_for(endpoint))
}

fn metadata_for(endpoint: EndpointId) -> EndpointMetadata {
    match endpoint {
        EndpointId::ControlService => EndpointMetadata {
            name: "MicroBot control service",
            uuid: "00001831-0000-1000-8000-00805f9b34fb",
            kind: EndpointKind::Service,
        },
        EndpointId::ControlCharacteristic => EndpointMetadata {
            name: "MicroBot control data",
            uuid: "00002a89-0000-1000-8000-00805f9b34fb",
            kind: EndpointKind::Characteristic,
        },
        // The device multiplexes writes and notifications over one characteristic.
        EndpointId::NotifyCharacteristic => EndpointMetadata {
            name: "MicroBot notify data",
            uuid: "00002a89-0000-1000-8000-00805f9b34fb",
            kind: EndpointKind::Characteristic,
        },
    }
}

/// On-wire firmware dialect spoken by a device.
///
/// Both dialects share the frame layout and the token handshake. The bytes
/// below were reverse-engineered from current firmware only; `Legacy` reuses
/// them until its differences are captured from a device, so the split is a
/// selection point rather than verified behaviour.
#[derive(
    Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Display, EnumString, ValueEnum, SerializeDisplay,
)]
#[strum(serialize_all = "snake_case")]
pub enum ProtocolVariant {
    /// Early firmware.
    Legacy,
    /// Current firmware.
    #[default]
    New,
}

impl ProtocolVariant {
    /// Opcode byte carried by the push frame header.
    pub(crate) const fn push_opcode(self) -> u8 {
        match self {
            Self::Legacy | Self::New => 0x02,
        }
    }

    /// Three-byte markers that open an address acknowledgement.
    pub(crate) const fn address_ack_markers(self) -> &'static [[u8; 3]] {
        match self {
            Self::Legacy | Self::New => &[[0x0f, 0x01, 0x01], [0x0f, 0x01, 0x02]],
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn endpoint_metadata_shares_control_characteristic_for_notify() {
        let control = endpoint_metadata(EndpointId::ControlCharacteristic);
        let notify = endpoint_metadata(EndpointId::NotifyCharacteristic);
        assert_eq!(control.uuid(), notify.uuid());
        assert_eq!(EndpointKind::Characteristic, notify.kind());
        assert_eq!(
            EndpointKind::Service,
            endpoint_metadata(EndpointId::ControlService).kind()
        );
    }

    #[rstest]
    #[case("legacy", ProtocolVariant::Legacy)]
    #[case("new", ProtocolVariant::New)]
    fn variant_parses_from_snake_case(#[case] raw: &str, #[case] expected: ProtocolVariant) {
        let parsed: ProtocolVariant = raw.parse().expect("variant name should parse");
        assert_eq!(expected, parsed);
        assert_eq!(raw, parsed.to_string());
    }

    #[rstest]
    #[case(ProtocolVariant::Legacy)]
    #[case(ProtocolVariant::New)]
    fn variants_share_observed_wire_bytes(#[case] variant: ProtocolVariant) {
        assert_eq!(0x02, variant.push_opcode());
        assert_eq!(
            &[[0x0f, 0x01, 0x01], [0x0f, 0x01, 0x02]],
            variant.address_ack_markers()
        );
    }
}
