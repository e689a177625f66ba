use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use crate::status::UpsState;

/// Name used for per-cycle snapshot messages.
pub const SNAPSHOT_EVENT: &str = "state";

/// Default name for the transition event registered with the host.
pub const STATUS_CHANGE_EVENT: &str = "ups_status_change";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Sent every poll cycle.
    Snapshot(UpsState),
    /// Sent only on an online/on-battery flip.
    Transition { event: String, state: UpsState },
}

impl Message {
    pub fn event(&self) -> &str {
        match self {
            Message::Snapshot(_) => SNAPSHOT_EVENT,
            Message::Transition { event, .. } => event,
        }
    }

    pub fn state(&self) -> &UpsState {
        match self {
            Message::Snapshot(state) => state,
            Message::Transition { state, .. } => state,
        }
    }
}

/// Sink the poller pushes snapshots and transitions into.
///
/// Called from the poller thread; implementations must not fail the cycle,
/// so delivery problems are theirs to log.
pub trait Broadcaster: Send + Sync {
    fn publish(&self, message: &Message);
}

impl<T: Broadcaster + ?Sized> Broadcaster for Arc<T> {
    fn publish(&self, message: &Message) {
        (**self).publish(message)
    }
}

/// Forwards every message to each inner broadcaster in order.
#[derive(Default)]
pub struct Fanout {
    sinks: Vec<Arc<dyn Broadcaster>>,
}

impl Fanout {
    pub fn new() -> Fanout {
        Fanout::default()
    }

    pub fn with(mut self, sink: Arc<dyn Broadcaster>) -> Fanout {
        self.sinks.push(sink);
        self
    }
}

impl Broadcaster for Fanout {
    fn publish(&self, message: &Message) {
        for sink in &self.sinks {
            sink.publish(message);
        }
    }
}

/// In-process hub the HTTP push surface subscribes to.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<Message>,
}

impl EventHub {
    /// `capacity` messages are buffered per lagging subscriber.
    pub fn new(capacity: usize) -> EventHub {
        let (tx, _) = broadcast::channel(capacity.max(1));
        EventHub { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }

    pub fn listeners(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Broadcaster for EventHub {
    fn publish(&self, message: &Message) {
        // Sending only fails when nobody is listening, which is fine.
        if self.tx.send(message.clone()).is_err() {
            trace!(event = message.event(), "no listeners");
        }
    }
}
