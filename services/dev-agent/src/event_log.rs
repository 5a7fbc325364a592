//! Forwards session events to the log.

use devsync_events::EventEnvelope;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

/// Log every event until the session's channel closes.
///
/// Falling behind skips the overwritten events and keeps going. Returns the
/// number of events logged.
pub async fn log_events(mut events: broadcast::Receiver<EventEnvelope>) -> u64 {
    let mut logged = 0;
    loop {
        match events.recv().await {
            Ok(envelope) => {
                let json = envelope.to_json().unwrap_or_default();
                if envelope.event.is_failure() {
                    warn!(event = %envelope, payload = %json, "Dev event");
                } else {
                    info!(event = %envelope, payload = %json, "Dev event");
                }
                logged += 1;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event log fell behind, events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
    logged
}
