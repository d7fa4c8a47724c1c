// Fan-out of ingested samples to live push subscribers.
// Membership is copy-on-write so publishing never waits on a subscriber.

pub mod protocol;
pub mod server;

pub use protocol::PushMessage;
pub use server::{PushServer, PushServerStatus, DEFAULT_PUSH_PORT};

use crate::sample::Sample;
use arc_swap::ArcSwap;
use log::{debug, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Default number of undelivered messages a subscriber may hold.
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 256;

pub type SubscriberId = Uuid;

struct Subscriber {
    id: SubscriberId,
    peer: Option<SocketAddr>,
    sender: mpsc::Sender<Arc<str>>,
}

/// Receiving side handed to whoever serves a subscriber.
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Arc<str>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next pushed message; `None` once the subscriber has been removed.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        self.receiver.try_recv().ok()
    }
}

/// Currently connected subscribers.
pub struct SubscriberSet {
    members: ArcSwap<Vec<Arc<Subscriber>>>,
    queue_depth: usize,
}

impl SubscriberSet {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            members: ArcSwap::from_pointee(Vec::new()),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Add a member and return its receiving side.
    pub fn join(&self, peer: Option<SocketAddr>) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.queue_depth);
        let subscriber = Arc::new(Subscriber {
            id: Uuid::new_v4(),
            peer,
            sender,
        });
        let id = subscriber.id;

        self.members.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&subscriber));
            next
        });

        Subscription { id, receiver }
    }

    /// Remove a member. Returns false if it was already gone.
    pub fn leave(&self, id: SubscriberId) -> bool {
        let previous = self.members.rcu(|current| {
            current
                .iter()
                .filter(|member| member.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
        previous.iter().any(|member| member.id == id)
    }

    pub fn len(&self) -> usize {
        self.members.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.members
            .load()
            .iter()
            .filter_map(|member| member.peer)
            .collect()
    }
}

impl Default for SubscriberSet {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_QUEUE)
    }
}

/// Publishes samples to every member of a [`SubscriberSet`].
pub struct Broadcaster {
    subscribers: Arc<SubscriberSet>,
    include_intensity: bool,
    published: AtomicU64,
    dropped_subscribers: AtomicU64,
}

impl Broadcaster {
    pub fn new(subscribers: Arc<SubscriberSet>, include_intensity: bool) -> Self {
        Self {
            subscribers,
            include_intensity,
            published: AtomicU64::new(0),
            dropped_subscribers: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribers.join(None)
    }

    pub fn subscribe_peer(&self, peer: SocketAddr) -> Subscription {
        self.subscribers.join(Some(peer))
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.subscribers.leave(id) {
            debug!("[PUSH] Subscriber {} removed", id);
        }
    }

    /// Deliver `sample` to the members present when this call starts.
    ///
    /// Never blocks: a member whose queue is closed or full is removed and
    /// the remaining members still receive the sample. Returns the number of
    /// members the message was queued for.
    pub fn publish(&self, sample: &Sample) -> usize {
        let members = self.subscribers.members.load_full();
        if members.is_empty() {
            return 0;
        }

        let text: Arc<str> =
            match PushMessage::from_sample(sample, self.include_intensity).to_text() {
                Ok(text) => text.into(),
                Err(e) => {
                    warn!("[PUSH] Failed to serialize sample: {}", e);
                    return 0;
                }
            };

        let mut delivered = 0;
        for member in members.iter() {
            match member.sender.try_send(Arc::clone(&text)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "[PUSH] Subscriber {} is not keeping up, disconnecting it",
                        member.id
                    );
                    self.drop_member(member.id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("[PUSH] Subscriber {} already closed", member.id);
                    self.drop_member(member.id);
                }
            }
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    fn drop_member(&self, id: SubscriberId) {
        if self.subscribers.leave(id) {
            self.dropped_subscribers.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn stats(&self) -> PushStats {
        PushStats {
            subscribers: self.subscribers.len(),
            peers: self.subscribers.peers(),
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped_subscribers.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the push side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushStats {
    pub subscribers: usize,
    /// Remote addresses of WebSocket subscribers.
    pub peers: Vec<SocketAddr>,
    /// Samples published while at least one member was present.
    pub published: u64,
    /// Members removed because delivery to them failed.
    pub dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broadcaster(queue_depth: usize) -> Broadcaster {
        Broadcaster::new(Arc::new(SubscriberSet::new(queue_depth)), false)
    }

    #[test]
    fn test_publish_without_subscribers() {
        let broadcaster = broadcaster(4);
        assert_eq!(broadcaster.publish(&Sample::new(1.0, 2.0, 3.0, 1.0)), 0);
    }

    #[test]
    fn test_subscriber_receives_published_sample() {
        let broadcaster = broadcaster(4);
        let mut first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();

        let delivered = broadcaster.publish(&Sample::new(1.0, 2.0, 3.0, 0.5));
        assert_eq!(delivered, 2);

        for subscription in [&mut first, &mut second] {
            let text = subscription.try_recv().expect("message expected");
            let message = PushMessage::from_text(&text).unwrap();
            assert_eq!((message.x, message.y, message.z), (1.0, 2.0, 3.0));
            assert_eq!(message.intensity, None);
        }
    }

    #[test]
    fn test_late_subscriber_misses_earlier_sample() {
        let broadcaster = broadcaster(4);
        broadcaster.publish(&Sample::new(1.0, 1.0, 1.0, 1.0));

        let mut late = broadcaster.subscribe();
        assert!(late.try_recv().is_none());

        broadcaster.publish(&Sample::new(2.0, 2.0, 2.0, 1.0));
        let message = PushMessage::from_text(&late.try_recv().unwrap()).unwrap();
        assert_eq!(message.x, 2.0);
    }

    #[test]
    fn test_unsubscribed_member_receives_nothing() {
        let broadcaster = broadcaster(4);
        let mut gone = broadcaster.subscribe();
        let mut stays = broadcaster.subscribe();

        broadcaster.unsubscribe(gone.id());
        assert_eq!(broadcaster.subscriber_count(), 1);

        assert_eq!(broadcaster.publish(&Sample::new(1.0, 1.0, 1.0, 1.0)), 1);
        assert!(gone.try_recv().is_none());
        assert!(stays.try_recv().is_some());
    }

    #[test]
    fn test_closed_subscriber_is_isolated() {
        let broadcaster = broadcaster(4);
        let dead = broadcaster.subscribe();
        let mut alive = broadcaster.subscribe();
        drop(dead);

        assert_eq!(broadcaster.publish(&Sample::new(1.0, 1.0, 1.0, 1.0)), 1);
        assert!(alive.try_recv().is_some());
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert_eq!(broadcaster.stats().dropped, 1);
    }

    #[test]
    fn test_slow_subscriber_is_disconnected() {
        let broadcaster = broadcaster(2);
        let mut slow = broadcaster.subscribe();
        let mut fast = broadcaster.subscribe();

        for i in 0..3 {
            broadcaster.publish(&Sample::new(i as f64, 0.0, 0.0, 1.0));
            assert!(fast.try_recv().is_some());
        }

        assert_eq!(broadcaster.subscriber_count(), 1);
        // Messages queued before the overflow are still readable.
        assert!(slow.try_recv().is_some());
        assert!(slow.try_recv().is_some());
        assert!(slow.try_recv().is_none());
    }

    #[test]
    fn test_stats() {
        let broadcaster = broadcaster(1);
        broadcaster.publish(&Sample::new(1.0, 1.0, 1.0, 1.0));
        assert_eq!(broadcaster.stats(), PushStats::default());

        let _remote = broadcaster.subscribe_peer("127.0.0.1:4100".parse().unwrap());
        let _local = broadcaster.subscribe();
        let joined = broadcaster.stats();
        assert_eq!(joined.subscribers, 2);
        assert_eq!(joined.peers, vec!["127.0.0.1:4100".parse().unwrap()]);

        broadcaster.publish(&Sample::new(1.0, 1.0, 1.0, 1.0));
        broadcaster.publish(&Sample::new(2.0, 2.0, 2.0, 1.0));

        let stats = broadcaster.stats();
        assert_eq!(stats.published, 2);
        // Both queues hold one message, so the second publish overflowed them.
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.subscribers, 0);
        assert!(stats.peers.is_empty());
    }

    #[test]
    fn test_intensity_forwarding_option() {
        let broadcaster = Broadcaster::new(Arc::new(SubscriberSet::new(4)), true);
        let mut subscription = broadcaster.subscribe();
        broadcaster.publish(&Sample::new(0.0, 0.0, 0.0, 0.25));

        let message = PushMessage::from_text(&subscription.try_recv().unwrap()).unwrap();
        assert_eq!(message.intensity, Some(0.25));
    }

    #[test]
    fn test_leave_twice() {
        let set = SubscriberSet::new(1);
        let subscription = set.join(Some("127.0.0.1:4000".parse().unwrap()));
        assert_eq!(set.peers(), vec!["127.0.0.1:4000".parse().unwrap()]);
        assert!(set.leave(subscription.id()));
        assert!(!set.leave(subscription.id()));
        assert!(set.is_empty());
    }
}
