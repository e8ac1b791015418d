//! Cache notifications.
//!
//! Components publish [`ScatterEvent`]s on a broadcast channel; listeners
//! subscribe and consume at their own pace. A lagging subscriber loses the
//! oldest events, never blocks a publisher.

use crate::segment_state::SegmentState;
use crate::types::{EntryVersion, Key, SegmentId, TopologyId};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum ScatterEvent {
    EntryCreated {
        key: Key,
        version: EntryVersion,
        at: DateTime<Utc>,
    },
    EntryModified {
        key: Key,
        version: EntryVersion,
        at: DateTime<Utc>,
    },
    EntryRemoved {
        key: Key,
        version: EntryVersion,
        at: DateTime<Utc>,
    },
    EntryInvalidated {
        key: Key,
        version: EntryVersion,
        at: DateTime<Utc>,
    },
    SegmentStateChanged {
        segment: SegmentId,
        from: SegmentState,
        to: SegmentState,
        topology_id: TopologyId,
        at: DateTime<Utc>,
    },
    TopologyInstalled {
        topology_id: TopologyId,
        at: DateTime<Utc>,
    },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ScatterEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScatterEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: ScatterEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn segment_changed(
        &self,
        segment: SegmentId,
        from: SegmentState,
        to: SegmentState,
        topology_id: TopologyId,
    ) {
        self.publish(ScatterEvent::SegmentStateChanged {
            segment,
            from,
            to,
            topology_id,
            at: Utc::now(),
        });
    }
}
