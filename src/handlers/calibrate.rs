use std::time::Duration;

use clap::ValueEnum;
use serde::Serialize;
use strum_macros::{Display, EnumString};
use tracing::{info, instrument};

use super::FrameCodec;
use super::frame_io::write_pair;
use crate::error::InteractionError;
use crate::hw::DeviceSession;

/// Largest stroke depth accepted by the device, in percent.
pub const MAX_DEPTH: u8 = 100;

/// Direction the arm travels when pushed.
#[derive(
    Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Display, EnumString, ValueEnum, Serialize,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationMode {
    /// Extend, then retract.
    #[default]
    Normal,
    /// Retract, then extend.
    Invert,
    /// Alternate between extended and retracted on each push.
    Toggle,
}

impl CalibrationMode {
    pub(crate) const fn as_wire_byte(self) -> u8 {
        match self {
            Self::Normal => 0x00,
            Self::Invert => 0x01,
            Self::Toggle => 0x02,
        }
    }
}

/// Calibration values applied by [`CalibrateHandler`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct CommandParameters {
    depth: u8,
    duration: u32,
    mode: CalibrationMode,
}

impl Default for CommandParameters {
    fn default() -> Self {
        Self::new(50, 0, CalibrationMode::Normal)
    }
}

impl CommandParameters {
    /// Creates calibration values, clamping `depth` to `0..=100`.
    ///
    /// ```
    /// use microbot::{CalibrationMode, CommandParameters};
    ///
    /// let params = CommandParameters::new(250, 500, CalibrationMode::Toggle);
    /// assert_eq!(100, params.depth());
    /// ```
    #[must_use]
    pub fn new(depth: u8, duration: u32, mode: CalibrationMode) -> Self {
        Self {
            depth: depth.min(MAX_DEPTH),
            duration,
            mode,
        }
    }

    /// Stroke depth in percent.
    #[must_use]
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Hold duration in device units.
    #[must_use]
    pub fn duration(&self) -> u32 {
        self.duration
    }

    #[must_use]
    pub fn mode(&self) -> CalibrationMode {
        self.mode
    }

    /// Sets the stroke depth, clamping it to `0..=100`.
    pub fn set_depth(&mut self, depth: u8) {
        self.depth = depth.min(MAX_DEPTH);
    }

    pub fn set_duration(&mut self, duration: u32) {
        self.duration = duration;
    }

    pub fn set_mode(&mut self, mode: CalibrationMode) {
        self.mode = mode;
    }
}

/// Handler for calibration commands.
pub struct CalibrateHandler;

impl CalibrateHandler {
    /// Writes the mode, depth and duration frame-pairs in that order.
    ///
    /// Each pair waits for its write acknowledgement before the next is sent.
    /// A failure partway through leaves earlier writes applied on the device.
    #[instrument(
        skip(session, codec),
        level = "debug",
        fields(depth = params.depth(), duration = params.duration(), mode = %params.mode())
    )]
    pub(crate) async fn calibrate(
        session: &DeviceSession,
        codec: FrameCodec,
        params: &CommandParameters,
        write_timeout: Duration,
    ) -> Result<(), InteractionError> {
        for pair in codec.encode_calibrate(params) {
            write_pair(session, &pair, write_timeout).await?;
        }
        info!("calibration written");
        Ok(())
    }
}
