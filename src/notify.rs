//! Property-change notifications.
//!
//! Components, channels and the robot publish [`PropertyChanged`] events to
//! every attached subscriber. Subscribers are plain crossbeam receivers, so a
//! UI or logger can drain them on its own thread.

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::sync::Arc;

/// A single property change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChanged {
    /// Name of the publishing object (component or robot name)
    pub source: String,
    /// Property that changed, e.g. `"State"`
    pub property: String,
    /// New value rendered as text
    pub value: String,
}

/// Cloneable fan-out handle. Clones share the same subscriber list.
#[derive(Clone, Default)]
pub struct Notifier {
    subscribers: Arc<Mutex<Vec<Sender<PropertyChanged>>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new receiver that sees every event published after this call.
    pub fn subscribe(&self) -> Receiver<PropertyChanged> {
        let (tx, rx) = unbounded();
        self.attach(tx);
        rx
    }

    /// Attach an existing sender, so several notifiers can feed one receiver.
    pub fn attach(&self, sender: Sender<PropertyChanged>) {
        self.subscribers.lock().push(sender);
    }

    /// Publish an event. Subscribers whose receiver was dropped are pruned.
    pub fn publish(&self, source: &str, property: &str, value: impl ToString) {
        let event = PropertyChanged {
            source: source.to_string(),
            property: property.to_string(),
            value: value.to_string(),
        };
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let notifier = Notifier::new();
        let a = notifier.subscribe();
        let b = notifier.clone().subscribe();

        notifier.publish("I2C", "State", "Connected");

        let expected = PropertyChanged {
            source: "I2C".into(),
            property: "State".into(),
            value: "Connected".into(),
        };
        assert_eq!(a.try_recv().unwrap(), expected);
        assert_eq!(b.try_recv().unwrap(), expected);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let notifier = Notifier::new();
        let keep = notifier.subscribe();
        drop(notifier.subscribe());
        assert_eq!(notifier.subscriber_count(), 2);

        notifier.publish("robot", "State", "Disconnected");

        assert_eq!(notifier.subscriber_count(), 1);
        assert!(keep.try_recv().is_ok());
    }

    #[test]
    fn test_attach_merges_sources() {
        let first = Notifier::new();
        let second = Notifier::new();
        let (tx, rx) = unbounded();
        first.attach(tx.clone());
        second.attach(tx);

        first.publish("a", "State", 1);
        second.publish("b", "State", 2);

        let sources: Vec<String> = rx.try_iter().map(|e| e.source).collect();
        assert_eq!(sources, vec!["a", "b"]);
    }
}
