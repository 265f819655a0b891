use tokio_stream::StreamExt;
use tracing::{debug, instrument, trace};

use crate::hw::NotificationStream;
use crate::protocol::ProtocolVariant;
use crate::token_store::AuthToken;
use crate::utils::format_hex;

/// Bytes before the classified region of a raw notification.
const NOTIFICATION_PREAMBLE_LEN: usize = 2;
/// Length of the classified region.
const NOTIFICATION_BODY_LEN: usize = 18;

const ADDRESS_MARKER_LEN: usize = 3;
const ADDRESS_LEN: usize = 6;

const TOKEN_MARKER: [u8; 2] = [0x1f, 0xff];
const TOKEN_FIELD: std::ops::Range<usize> = 2..18;
const TOKEN_PRESENCE_REGION: std::ops::Range<usize> = 3..14;
const TOKEN_TRAILER_REGION: std::ops::Range<usize> = 14..18;

/// Typed notification events emitted by MicroBot devices.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NotifyEvent {
    /// The device echoed its own address; the pairing cycle has started.
    AddressAck {
        /// Echoed address as lowercase hex.
        address: String,
    },
    /// The device issued an authentication token.
    TokenAck {
        /// Issued token.
        token: AuthToken,
    },
    /// Payload that matched no known marker, preserved as raw bytes.
    Unrecognized(Vec<u8>),
}

impl NotifyEvent {
    /// Short label used in structured logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddressAck { .. } => "address_ack",
            Self::TokenAck { .. } => "token_ack",
            Self::Unrecognized(_) => "unrecognized",
        }
    }
}

/// Classifies raw notification payloads into typed events.
///
/// The markers were recovered from observed traffic rather than a published
/// protocol description. Anything that does not cleanly match a known marker
/// is reported as [`NotifyEvent::Unrecognized`] and never as an error, so new
/// firmware quirks surface as log noise rather than failures. Corrections for
/// new firmware belong here and in [`ProtocolVariant`].
pub struct NotificationHandler;

impl NotificationHandler {
    /// Decodes one notification payload.
    ///
    /// ```
    /// use microbot::{NotificationHandler, NotifyEvent, ProtocolVariant};
    ///
    /// let event = NotificationHandler::decode(ProtocolVariant::New, &[0xaa, 0x55]);
    /// assert_eq!(NotifyEvent::Unrecognized(vec![0xaa, 0x55]), event);
    /// ```
    #[instrument(skip_all, level = "trace", fields(%variant, payload_len = payload.len()))]
    #[must_use]
    pub fn decode(variant: ProtocolVariant, payload: &[u8]) -> NotifyEvent {
        let body = classified_region(payload);

        if let Some(address) = address_ack(variant, body) {
            return NotifyEvent::AddressAck { address };
        }

        if let Some(token) = token_ack(body) {
            return NotifyEvent::TokenAck { token };
        }

        NotifyEvent::Unrecognized(payload.to_vec())
    }
}

fn classified_region(payload: &[u8]) -> &[u8] {
    let start = NOTIFICATION_PREAMBLE_LEN.min(payload.len());
    let end = (NOTIFICATION_PREAMBLE_LEN + NOTIFICATION_BODY_LEN).min(payload.len());
    &payload[start..end]
}

fn address_ack(variant: ProtocolVariant, body: &[u8]) -> Option<String> {
    let marker = body.get(..ADDRESS_MARKER_LEN)?;
    if !variant
        .address_ack_markers()
        .iter()
        .any(|known| known.as_slice() == marker)
    {
        return None;
    }

    let address_end = (ADDRESS_MARKER_LEN + ADDRESS_LEN).min(body.len());
    Some(hex::encode(&body[ADDRESS_MARKER_LEN..address_end]))
}

fn token_ack(body: &[u8]) -> Option<AuthToken> {
    if body.len() < NOTIFICATION_BODY_LEN || body[..TOKEN_MARKER.len()] != TOKEN_MARKER {
        return None;
    }
    if body[TOKEN_PRESENCE_REGION].iter().all(|byte| *byte == 0) {
        return None;
    }
    if body[TOKEN_TRAILER_REGION].iter().any(|byte| *byte != 0) {
        return None;
    }

    AuthToken::from_slice(&body[TOKEN_FIELD]).ok()
}

/// Routes decoded notifications from a live subscription to the current consumer.
pub struct NotificationDispatcher {
    variant: ProtocolVariant,
    stream: NotificationStream,
    received: usize,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("variant", &self.variant)
            .field("received", &self.received)
            .finish_non_exhaustive()
    }
}

impl NotificationDispatcher {
    pub(crate) fn new(variant: ProtocolVariant, stream: NotificationStream) -> Self {
        Self {
            variant,
            stream,
            received: 0,
        }
    }

    /// Waits for the next notification and decodes it.
    ///
    /// Returns `None` once the subscription stream has closed.
    pub(crate) async fn next_event(&mut self) -> Option<NotifyEvent> {
        let payload = self.stream.next().await?;
        self.received += 1;
        let event = NotificationHandler::decode(self.variant, &payload);
        trace!(
            index = self.received,
            kind = event.kind(),
            "decoded notification"
        );
        if let NotifyEvent::Unrecognized(raw) = &event {
            debug!(index = self.received, payload = %format_hex(raw), "ignoring unrecognized notification");
        }
        Some(event)
    }

    /// Notes an event that no consumer is waiting for.
    pub(crate) fn discard(&self, event: &NotifyEvent) {
        debug!(kind = event.kind(), "discarding notification with no waiting consumer");
    }

    /// Returns the number of notifications received so far.
    #[must_use]
    pub fn received(&self) -> usize {
        self.received
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn decode_hex(value: &str) -> Vec<u8> {
        hex::decode(value).expect("test hex should be valid")
    }

    #[rstest]
    #[case("00000f0101aabbccddeeff000000000000000000", "aabbccddeeff")]
    #[case("12340f0102112233445566000000000000000000", "112233445566")]
    fn decode_maps_address_ack(#[case] payload: &str, #[case] address: &str) {
        let event = NotificationHandler::decode(ProtocolVariant::New, &decode_hex(payload));
        assert_eq!(
            NotifyEvent::AddressAck {
                address: address.to_string()
            },
            event
        );
    }

    #[test]
    fn legacy_variant_accepts_second_address_marker() {
        let payload = decode_hex("12340f0102112233445566000000000000000000");
        let event = NotificationHandler::decode(ProtocolVariant::Legacy, &payload);
        assert_eq!(
            NotifyEvent::AddressAck {
                address: "112233445566".to_string()
            },
            event
        );
    }

    #[test]
    fn decode_maps_token_ack() {
        let payload = decode_hex("00001fffab12ab12ab12ab12ab12ab1200000000");
        let event = NotificationHandler::decode(ProtocolVariant::New, &payload);
        let expected: AuthToken = "ab12ab12ab12ab12ab12ab1200000000"
            .parse()
            .expect("token should parse");
        assert_eq!(NotifyEvent::TokenAck { token: expected }, event);
    }

    #[rstest]
    #[case::zero_presence_region("00001fffab000000000000000000000000000000")]
    #[case::non_zero_trailer("00001fffab12ab12ab12ab12ab12ab1200000001")]
    #[case::truncated("00001fffab12ab12ab12ab12ab12")]
    #[case::wrong_marker("00002fffab12ab12ab12ab12ab12ab1200000000")]
    fn decode_rejects_near_miss_token_payloads(#[case] payload: &str) {
        let event = NotificationHandler::decode(ProtocolVariant::New, &decode_hex(payload));
        assert_matches!(event, NotifyEvent::Unrecognized(_));
    }

    #[rstest]
    #[case(&[])]
    #[case(&[0x0f])]
    #[case(&[0x00, 0x00, 0x0f, 0x01])]
    fn decode_never_fails_on_short_payloads(#[case] payload: &[u8]) {
        let event = NotificationHandler::decode(ProtocolVariant::New, payload);
        assert_eq!(NotifyEvent::Unrecognized(payload.to_vec()), event);
    }

    #[test]
    fn decode_is_deterministic() {
        let payload = decode_hex("00001fffab12ab12ab12ab12ab12ab1200000000");
        let first = NotificationHandler::decode(ProtocolVariant::New, &payload);
        let second = NotificationHandler::decode(ProtocolVariant::New, &payload);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn dispatcher_decodes_stream_in_order() {
        let stream: NotificationStream = Box::pin(tokio_stream::iter(vec![
            decode_hex("00000f0101aabbccddeeff000000000000000000"),
            vec![0x01],
        ]));
        let mut dispatcher = NotificationDispatcher::new(ProtocolVariant::New, stream);

        assert_matches!(
            dispatcher.next_event().await,
            Some(NotifyEvent::AddressAck { .. })
        );
        assert_matches!(
            dispatcher.next_event().await,
            Some(NotifyEvent::Unrecognized(_))
        );
        assert_eq!(None, dispatcher.next_event().await);
        assert_eq!(2, dispatcher.received());
    }
}
