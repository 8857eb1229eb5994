use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Listing,
    Conversation,
    Message,
    Offer,
    Transaction,
    Wallet,
    Payout,
}

/// "Row X changed" event published after a successful commit. Delivery is
/// best-effort; consumers must tolerate duplicates and re-read the row.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub topic: Topic,
    pub id: Uuid,
    pub at: DateTime<Utc>,
}

/// Fire-and-forget fan-out to push subscribers. Lagging or absent
/// subscribers never block or fail a commit.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<ChangeEvent>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, topic: Topic, id: Uuid) {
        let event = ChangeEvent {
            topic,
            id,
            at: Utc::now(),
        };
        // send only errors when there are no subscribers
        let _ = self.tx.send(event);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_published_events() {
        let notifier = Notifier::default();
        let mut rx = notifier.subscribe();

        let id = Uuid::new_v4();
        notifier.publish(Topic::Listing, id);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic, Topic::Listing);
        assert_eq!(event.id, id);
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let notifier = Notifier::default();
        notifier.publish(Topic::Wallet, Uuid::new_v4());
    }
}
