use std::time::Duration;

use clap::ValueEnum;
use serde::Serialize;
use strum_macros::Display;
use tracing::{info, instrument};

use super::frame_io::write_pair;
use super::{CorrelationId, FrameCodec};
use crate::error::InteractionError;
use crate::hw::DeviceSession;

/// Switch position requested from the actuator.
///
/// The device toggles its own arm on every push, so both positions produce
/// the same frame; the value only drives state reporting.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, ValueEnum, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SwitchState {
    On,
    Off,
}

impl SwitchState {
    /// Returns whether this is the on position.
    #[must_use]
    pub fn is_on(self) -> bool {
        matches!(self, Self::On)
    }
}

/// Handler for actuator push commands.
pub struct PushHandler;

impl PushHandler {
    /// Sends one push frame-pair.
    #[instrument(skip(session, codec), level = "debug", fields(variant = %codec.variant()))]
    pub(crate) async fn push(
        session: &DeviceSession,
        codec: FrameCodec,
        state: SwitchState,
        write_timeout: Duration,
    ) -> Result<(), InteractionError> {
        let pair = codec.encode_push(CorrelationId::random());
        write_pair(session, &pair, write_timeout).await?;
        info!(%state, "push written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(SwitchState::On, true, "on")]
    #[case(SwitchState::Off, false, "off")]
    fn switch_state_reports_position(
        #[case] state: SwitchState,
        #[case] on: bool,
        #[case] label: &str,
    ) {
        assert_eq!(on, state.is_on());
        assert_eq!(label, state.to_string());
    }
}
