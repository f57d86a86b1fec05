//! Deterministic ordering of fetched event batches.

use crate::ledger::{EventPosition, RawEvent};
use crate::sync::types::SyncError;

use itertools::Itertools;
use tracing::debug;

/// Order a raw batch for application.
///
/// Events at or before `after` (the checkpoint's last processed position) are dropped, the
/// rest are sorted by `(block, transaction index, log index)` and identical events from
/// overlapping fetches are collapsed to one. Two different events at the same position are a
/// protocol violation.
pub fn sequence_events(
    events: Vec<RawEvent>,
    after: Option<EventPosition>,
) -> Result<Vec<RawEvent>, SyncError> {
    let fetched = events.len();
    let mut ordered: Vec<RawEvent> = Vec::with_capacity(fetched);
    for event in events
        .into_iter()
        .filter(|event| after.is_none_or(|cursor| event.position() > cursor))
        .sorted_by_key(RawEvent::position)
    {
        match ordered.last() {
            Some(last) if last.position() == event.position() => {
                if *last != event {
                    return Err(SyncError::ProtocolViolation(format!(
                        "conflicting events reported at {}",
                        event.position()
                    )));
                }
            }
            _ => ordered.push(event),
        }
    }

    if ordered.len() < fetched {
        debug!(
            "Sequenced {} of {} fetched events (cursor {:?})",
            ordered.len(),
            fetched,
            after.map(|p| p.to_string())
        );
    }
    Ok(ordered)
}
