use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// In-process fan-out of applied ledger events, keyed by bucket.
///
/// Events are published after they are durable and applied. Slow subscribers
/// lag and lose the oldest events rather than holding back writers.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn subscribe(&self, bucket_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(bucket_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish to a bucket's subscribers. A channel whose subscribers are all
    /// gone is dropped.
    pub fn send(&self, bucket_id: Ulid, event: &Event) {
        let orphaned = match self.channels.get(&bucket_id) {
            Some(sender) => sender.send(event.clone()).is_err(),
            None => return,
        };
        if orphaned {
            self.channels
                .remove_if(&bucket_id, |_, sender| sender.receiver_count() == 0);
        }
    }

    /// Buckets with at least one live channel.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
