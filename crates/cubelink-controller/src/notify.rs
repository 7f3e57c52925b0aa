//! Outward notification channel for the presentation layer.
//!
//! Backed by a [`tokio::sync::broadcast`] channel: sending never blocks, and
//! a presentation consumer that falls behind loses the oldest notices
//! rather than stalling the core.

use cubelink_types::{FleetEvent, FleetNotice};
use tokio::sync::broadcast;
use tracing::trace;

/// Default number of buffered notices per subscriber.
pub const DEFAULT_NOTIFY_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct FleetNotifier {
    tx: broadcast::Sender<FleetNotice>,
}

impl FleetNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetNotice> {
        self.tx.subscribe()
    }

    /// Stamp and send `event`.  Returns the number of subscribers reached;
    /// nobody listening is a normal condition.
    pub fn notify(&self, event: FleetEvent) -> usize {
        match self.tx.send(FleetNotice::now(event)) {
            Ok(n) => n,
            Err(broadcast::error::SendError(notice)) => {
                trace!(event = ?notice.event, "no presentation subscribers");
                0
            }
        }
    }
}

impl Default for FleetNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFY_CAPACITY)
    }
}
