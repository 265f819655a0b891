use tracing::instrument;

use super::calibrate::CommandParameters;
use crate::notification::{NotificationHandler, NotifyEvent};
use crate::protocol::ProtocolVariant;
use crate::token_store::AuthToken;

/// Length of every record written to the control characteristic.
pub const RECORD_LEN: usize = 20;
const CORRELATION_LEN: usize = 2;
const BODY_LEN: usize = RECORD_LEN - CORRELATION_LEN;
const NONCE_LEN: usize = 4;

const PAYLOAD_PREFIX: [u8; 2] = [0x0f, 0xff];

const INIT_HEADER: [u8; BODY_LEN] = [
    0x00, 0x01, 0x00, 0x40, 0xe2, 0x01, 0x00, 0xfa, 0x01, 0x00, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00,
];
const GET_TOKEN_HEADER: [u8; BODY_LEN] = [
    0x00, 0x01, 0x00, 0x40, 0xe2, 0x01, 0x01, 0xfa, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00,
];
const SET_TOKEN_HEADER: [u8; BODY_LEN] = [
    0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0xfa, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xde, 0xcd,
];

const COMMAND_OPCODE_OFFSET: usize = 6;
const COMMAND_ARGUMENT_OFFSET: usize = 8;

/// Opcode for each calibration parameter write.
const CALIBRATE_MODE_OPCODE: u8 = 0x03;
const CALIBRATE_DEPTH_OPCODE: u8 = 0x04;
const CALIBRATE_DURATION_OPCODE: u8 = 0x05;

/// Random per-operation tag embedded in both records of a frame-pair.
///
/// The device does not check it on replies, but rejects writes without one.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, derive_more::Display)]
#[display("{_0:04x}")]
pub struct CorrelationId(u16);

impl CorrelationId {
    /// Draws a fresh random correlation id.
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Creates a correlation id from a raw value.
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Returns the on-wire bytes.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; CORRELATION_LEN] {
        self.0.to_be_bytes()
    }
}

/// The two fixed-size records that together make one command on the wire.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FramePair {
    correlation_id: CorrelationId,
    header: [u8; RECORD_LEN],
    payload: [u8; RECORD_LEN],
}

impl FramePair {
    fn assemble(
        correlation_id: CorrelationId,
        header_body: [u8; BODY_LEN],
        payload_body: [u8; BODY_LEN],
    ) -> Self {
        Self {
            correlation_id,
            header: record(correlation_id, header_body),
            payload: record(correlation_id, payload_body),
        }
    }

    /// Returns the correlation id shared by both records.
    #[must_use]
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Returns the opcode/length header record.
    #[must_use]
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Returns the `0x0fff`-prefixed payload record.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the records in transmission order.
    #[must_use]
    pub fn records(&self) -> [&[u8]; 2] {
        [&self.header, &self.payload]
    }
}

fn record(correlation_id: CorrelationId, body: [u8; BODY_LEN]) -> [u8; RECORD_LEN] {
    let mut record = [0_u8; RECORD_LEN];
    record[..CORRELATION_LEN].copy_from_slice(&correlation_id.to_bytes());
    record[CORRELATION_LEN..].copy_from_slice(&body);
    record
}

/// Header shared by push and calibrate frames: `00 01 00 00 00 08 <op> 00 <arg> 00 0a … de cd`.
fn command_header(opcode: u8, argument: u8) -> [u8; BODY_LEN] {
    let mut header = [
        0x00, 0x01, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x0a, 0x00, 0x00, 0x00, 0x00,
        0x00, 0xde, 0xcd,
    ];
    header[COMMAND_OPCODE_OFFSET] = opcode;
    header[COMMAND_ARGUMENT_OFFSET] = argument;
    header
}

/// Payload record starting with `0x0fff` followed by command data and zero fill.
fn prefixed_payload(data: &[u8]) -> [u8; BODY_LEN] {
    let mut payload = [0_u8; BODY_LEN];
    payload[..PAYLOAD_PREFIX.len()].copy_from_slice(&PAYLOAD_PREFIX);
    payload[PAYLOAD_PREFIX.len()..PAYLOAD_PREFIX.len() + data.len()].copy_from_slice(data);
    payload
}

/// Encodes and decodes MicroBot frames for one protocol variant.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FrameCodec {
    variant: ProtocolVariant,
}

impl FrameCodec {
    /// Creates a codec for a firmware variant.
    #[must_use]
    pub const fn new(variant: ProtocolVariant) -> Self {
        Self { variant }
    }

    /// Returns the protocol variant this codec speaks.
    #[must_use]
    pub const fn variant(self) -> ProtocolVariant {
        self.variant
    }

    /// Encodes the request that starts a fresh pairing cycle.
    ///
    /// The payload record carries four random nonce bytes after the filler.
    #[must_use]
    pub fn encode_init(self, correlation_id: CorrelationId) -> FramePair {
        self.encode_init_with_nonce(correlation_id, rand::random())
    }

    pub(crate) fn encode_init_with_nonce(
        self,
        correlation_id: CorrelationId,
        nonce: [u8; NONCE_LEN],
    ) -> FramePair {
        let mut payload = [0xff_u8; BODY_LEN];
        payload[0] = 0x0f;
        payload[BODY_LEN - NONCE_LEN..].copy_from_slice(&nonce);
        FramePair::assemble(correlation_id, INIT_HEADER, payload)
    }

    /// Encodes the request asking an already-paired device to issue a token.
    ///
    /// ```
    /// use microbot::{CorrelationId, FrameCodec, ProtocolVariant};
    ///
    /// let pair = FrameCodec::new(ProtocolVariant::New).encode_get_token(CorrelationId::new(0xbeef));
    /// assert_eq!(&[0xbe, 0xef, 0x00, 0x01, 0x00, 0x40, 0xe2, 0x01, 0x01], &pair.header()[..9]);
    /// ```
    #[must_use]
    pub fn encode_get_token(self, correlation_id: CorrelationId) -> FramePair {
        let mut payload = [0_u8; BODY_LEN];
        payload[0] = 0x0f;
        payload[1..10].fill(0xff);
        FramePair::assemble(correlation_id, GET_TOKEN_HEADER, payload)
    }

    /// Encodes the steady-state authentication write carrying a stored token.
    #[must_use]
    pub fn encode_set_token(self, correlation_id: CorrelationId, token: &AuthToken) -> FramePair {
        FramePair::assemble(
            correlation_id,
            SET_TOKEN_HEADER,
            prefixed_payload(token.as_bytes()),
        )
    }

    /// Encodes one actuator push.
    #[must_use]
    pub fn encode_push(self, correlation_id: CorrelationId) -> FramePair {
        let mut payload = [0_u8; BODY_LEN];
        payload[0] = 0x0f;
        payload[1..6].fill(0xff);
        FramePair::assemble(
            correlation_id,
            command_header(self.variant.push_opcode(), 0x00),
            payload,
        )
    }

    /// Encodes the calibration writes in device order: mode, depth, duration.
    ///
    /// Each pair carries its own fresh correlation id.
    #[must_use]
    pub fn encode_calibrate(self, params: &CommandParameters) -> [FramePair; 3] {
        self.encode_calibrate_with_ids(
            [
                CorrelationId::random(),
                CorrelationId::random(),
                CorrelationId::random(),
            ],
            params,
        )
    }

    /// Encodes the calibration writes using caller-chosen correlation ids.
    ///
    /// ```
    /// use microbot::{CalibrationMode, CommandParameters, CorrelationId, FrameCodec, ProtocolVariant};
    ///
    /// let params = CommandParameters::new(75, 500, CalibrationMode::Invert);
    /// let [mode, depth, duration] = FrameCodec::new(ProtocolVariant::New).encode_calibrate_with_ids(
    ///     [CorrelationId::new(1), CorrelationId::new(2), CorrelationId::new(3)],
    ///     &params,
    /// );
    /// assert_eq!(0x01, mode.payload()[4]);
    /// assert_eq!(0x4b, depth.payload()[4]);
    /// assert_eq!(&[0xf4, 0x01, 0x00, 0x00], &duration.payload()[4..8]);
    /// ```
    #[must_use]
    pub fn encode_calibrate_with_ids(
        self,
        correlation_ids: [CorrelationId; 3],
        params: &CommandParameters,
    ) -> [FramePair; 3] {
        let [mode_id, depth_id, duration_id] = correlation_ids;
        [
            FramePair::assemble(
                mode_id,
                command_header(CALIBRATE_MODE_OPCODE, 0x01),
                prefixed_payload(&[params.mode().as_wire_byte()]),
            ),
            FramePair::assemble(
                depth_id,
                command_header(CALIBRATE_DEPTH_OPCODE, 0x01),
                prefixed_payload(&[params.depth()]),
            ),
            FramePair::assemble(
                duration_id,
                command_header(CALIBRATE_DURATION_OPCODE, 0x01),
                prefixed_payload(&params.duration().to_le_bytes()),
            ),
        ]
    }

    /// Classifies one raw notification for this codec's variant.
    #[instrument(skip_all, level = "trace", fields(variant = %self.variant, payload_len = payload.len()))]
    pub fn decode_notification(self, payload: &[u8]) -> NotifyEvent {
        NotificationHandler::decode(self.variant, payload)
    }
}
