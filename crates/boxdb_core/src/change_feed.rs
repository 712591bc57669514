//! Commit notifications.
//!
//! After a write transaction commits, every subscriber receives one
//! [`ChangeEvent`] naming the entity types the commit touched. Aborted
//! transactions emit nothing.
//!
//! ```rust,ignore
//! let changes = store.subscribe_entity(person_id);
//! std::thread::spawn(move || {
//!     while let Ok(event) = changes.recv() {
//!         println!("persons changed in commit {}", event.sequence);
//!     }
//! });
//! ```

use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};

use crate::model::SchemaId;

/// Entity types changed by one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Sequence number of the commit.
    pub sequence: u64,
    /// Changed entity IDs, ascending.
    pub entity_ids: Vec<SchemaId>,
}

struct Subscriber {
    filter: Option<SchemaId>,
    sender: Sender<ChangeEvent>,
}

/// Fans commit events out to subscribers.
///
/// Subscribers whose receiver was dropped are removed on the next emit.
#[derive(Default)]
pub struct ChangeFeed {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl ChangeFeed {
    /// Creates a feed without subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receives an event for every commit.
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        self.add(None)
    }

    /// Receives an event for every commit that changed `entity`.
    pub fn subscribe_entity(&self, entity: SchemaId) -> Receiver<ChangeEvent> {
        self.add(Some(entity))
    }

    fn add(&self, filter: Option<SchemaId>) -> Receiver<ChangeEvent> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers.write().push(Subscriber { filter, sender });
        receiver
    }

    /// Delivers a commit to the interested subscribers.
    pub fn emit(&self, event: &ChangeEvent) {
        if event.entity_ids.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|sub| match sub.filter {
            Some(entity) if !event.entity_ids.contains(&entity) => true,
            Some(entity) => sub
                .sender
                .send(ChangeEvent {
                    sequence: event.sequence,
                    entity_ids: vec![entity],
                })
                .is_ok(),
            None => sub.sender.send(event.clone()).is_ok(),
        });
    }

    /// Number of connected subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn event(sequence: u64, entity_ids: Vec<SchemaId>) -> ChangeEvent {
        ChangeEvent {
            sequence,
            entity_ids,
        }
    }

    #[test]
    fn emit_and_receive() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        feed.emit(&event(1, vec![1, 2]));
        assert_eq!(rx.recv_timeout(Duration::from_millis(100)).unwrap(), event(1, vec![1, 2]));
    }

    #[test]
    fn entity_filter() {
        let feed = ChangeFeed::new();
        let persons = feed.subscribe_entity(1);
        let orders = feed.subscribe_entity(2);
        feed.emit(&event(1, vec![1]));
        feed.emit(&event(2, vec![1, 2]));

        assert_eq!(persons.try_iter().count(), 2);
        let got: Vec<_> = orders.try_iter().collect();
        assert_eq!(got, vec![event(2, vec![2])]);
    }

    #[test]
    fn empty_commits_are_not_delivered() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        feed.emit(&event(1, vec![]));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_receivers_are_removed() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);
        drop(rx);
        feed.emit(&event(1, vec![1]));
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn threaded_subscribe() {
        let feed = Arc::new(ChangeFeed::new());
        let rx = feed.subscribe();
        let emitter = Arc::clone(&feed);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            emitter.emit(&event(7, vec![3]));
        });
        assert_eq!(rx.recv_timeout(Duration::from_millis(500)).unwrap().sequence, 7);
        handle.join().unwrap();
    }
}
