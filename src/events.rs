//! Process-local publish/subscribe for store and replication events
//!
//! Each store owns one bus; events are posted after the transaction that
//! produced them commits, so subscribers observe commit order.

use crate::store::revision::DocumentRevision;
use tokio::sync::broadcast;

const EVENT_BUFFER_SIZE: usize = 256;

/// Everything a document store can announce
#[derive(Debug, Clone)]
pub enum Event {
    DocumentCreated {
        doc: DocumentRevision,
    },
    DocumentUpdated {
        prev: Option<DocumentRevision>,
        doc: DocumentRevision,
    },
    DocumentDeleted {
        prev: DocumentRevision,
        tombstone: DocumentRevision,
    },
    StoreOpened,
    StoreCreated,
    StoreDeleted,
    StoreClosed,
}

/// Terminal events posted by a replication strategy on its own bus
#[derive(Debug, Clone)]
pub enum ReplicationEvent {
    Completed {
        canceled: bool,
        documents: usize,
        batches: usize,
    },
    Errored {
        error: String,
    },
}

/// A broadcast bus for one event type.
///
/// Posting never blocks; when no subscriber is listening the event is
/// dropped, matching fire-and-forget notification semantics.
#[derive(Debug, Clone)]
pub struct EventBus<T: Clone> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    pub fn post(&self, event: T) {
        // send only fails when there are no receivers
        let _ = self.sender.send(event);
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_post_and_receive_in_order() {
        let bus: EventBus<Event> = EventBus::new();
        let mut rx = bus.subscribe();

        bus.post(Event::StoreCreated);
        bus.post(Event::StoreOpened);

        assert!(matches!(rx.recv().await.unwrap(), Event::StoreCreated));
        assert!(matches!(rx.recv().await.unwrap(), Event::StoreOpened));
    }

    #[test]
    fn test_post_without_subscribers_is_a_noop() {
        let bus: EventBus<Event> = EventBus::new();
        bus.post(Event::StoreClosed);
    }
}
