use std::time::Duration;

use tokio::time::timeout;
use tracing::{instrument, trace};

use super::FramePair;
use crate::error::InteractionError;
use crate::hw::DeviceSession;
use crate::protocol::EndpointId;

/// Writes both records of a frame-pair to the control characteristic.
///
/// Records go out strictly in order and each waits for the write
/// acknowledgement, bounded by `write_timeout`.
#[instrument(
    skip(session, pair),
    level = "trace",
    fields(correlation_id = %pair.correlation_id(), timeout_ms = write_timeout.as_millis())
)]
pub(crate) async fn write_pair(
    session: &DeviceSession,
    pair: &FramePair,
    write_timeout: Duration,
) -> Result<(), InteractionError> {
    for record in pair.records() {
        bounded(
            "characteristic write",
            write_timeout,
            session.write_endpoint(EndpointId::ControlCharacteristic, record),
        )
        .await?;
    }
    trace!("frame-pair written");
    Ok(())
}

/// Runs one link operation, reporting an elapsed `limit` as a timeout.
pub(crate) async fn bounded<T>(
    operation: &'static str,
    limit: Duration,
    future: impl Future<Output = Result<T, InteractionError>>,
) -> Result<T, InteractionError> {
    match timeout(limit, future).await {
        Ok(result) => result,
        Err(_elapsed) => Err(InteractionError::Timeout {
            operation,
            timeout_ms: duration_ms(limit),
        }),
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
