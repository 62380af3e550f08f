//! Fire-and-forget lifecycle events, published over an unbounded channel so
//! a slow subscriber never blocks the scheduler.

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::scheduler::TaskState;

#[derive(Debug, Clone)]
pub enum Event {
    TaskStateChange {
        task_id: String,
        from: TaskState,
        to: TaskState,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    WorkspaceCreated {
        task_id: String,
        path: String,
    },
    WorkspaceReleased {
        task_id: String,
    },
    BranchCreated {
        task_id: String,
        branch: String,
        parent: String,
    },
    StackBuilt {
        branches: Vec<String>,
        parent_ref: String,
    },
    RunProgress {
        layer: usize,
        total: usize,
        running: usize,
        completed: usize,
        failed: usize,
    },
}

/// A cloneable publish handle. Sends never block: the channel is unbounded
/// and the scheduler must never wait on a subscriber.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<Event>,
}

impl EventBus {
    /// Create a bus and its single receiver. Further subscribers can be
    /// added by cloning the `Sender` before constructing, if ever needed;
    /// today one receiver per run is sufficient.
    pub fn new() -> (Self, Receiver<Event>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }

    pub fn publish(&self, event: Event) {
        // An event bus with no remaining receiver (run already torn down)
        // is not an error; there's nothing left to observe it.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_is_received_in_order() {
        let (bus, rx) = EventBus::new();
        bus.publish(Event::WorkspaceCreated {
            task_id: "a".to_string(),
            path: "/tmp/a".to_string(),
        });
        bus.publish(Event::WorkspaceReleased {
            task_id: "a".to_string(),
        });

        assert!(matches!(rx.recv().unwrap(), Event::WorkspaceCreated { .. }));
        assert!(matches!(rx.recv().unwrap(), Event::WorkspaceReleased { .. }));
    }

    #[test]
    fn publish_after_receiver_dropped_does_not_panic() {
        let (bus, rx) = EventBus::new();
        drop(rx);
        bus.publish(Event::RunProgress {
            layer: 0,
            total: 1,
            running: 0,
            completed: 1,
            failed: 0,
        });
    }
}
