mod calibrate;
mod frame_codec;
mod frame_io;
mod handshake;
mod push;

pub use self::calibrate::{CalibrateHandler, CalibrationMode, CommandParameters, MAX_DEPTH};
pub use self::frame_codec::{CorrelationId, FrameCodec, FramePair, RECORD_LEN};
pub(crate) use self::frame_io::{bounded, duration_ms};
pub(crate) use self::handshake::HandshakeOptions;
pub use self::handshake::{
    HandshakeError, HandshakeHandler, HandshakeMachine, HandshakeState, Transition,
};
pub use self::push::{PushHandler, SwitchState};
