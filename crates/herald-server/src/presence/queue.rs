//! Per-user FIFO of payloads waiting for their recipient to come online.

use herald_core::{ServerEvent, UserId};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct OfflineQueue {
    queues: HashMap<UserId, VecDeque<ServerEvent>>,
    /// Per-user cap; `None` keeps everything.
    max_per_user: Option<usize>,
}

impl OfflineQueue {
    pub fn new(max_per_user: Option<usize>) -> Self {
        Self {
            queues: HashMap::new(),
            max_per_user: max_per_user.filter(|cap| *cap > 0),
        }
    }

    /// Append a payload to the tail of the user's queue. Returns the new length.
    ///
    /// When a cap is configured and exceeded, the oldest payload is dropped.
    pub fn enqueue(&mut self, user_id: UserId, payload: ServerEvent) -> usize {
        let queue = self.queues.entry(user_id).or_default();
        queue.push_back(payload);
        if let Some(cap) = self.max_per_user {
            while queue.len() > cap {
                queue.pop_front();
                warn!(user_id = %user_id, cap, "offline queue full, dropped oldest payload");
            }
        }
        debug!(user_id = %user_id, queued = queue.len(), "payload queued");
        queue.len()
    }

    /// Take every queued payload for the user, in enqueue order, and clear the queue.
    pub fn drain(&mut self, user_id: UserId) -> Vec<ServerEvent> {
        match self.queues.remove(&user_id) {
            Some(queue) => queue.into(),
            None => Vec::new(),
        }
    }

    /// Put undelivered payloads back at the head, ahead of anything queued since.
    pub fn requeue_front(&mut self, user_id: UserId, payloads: Vec<ServerEvent>) {
        if payloads.is_empty() {
            return;
        }
        let queue = self.queues.entry(user_id).or_default();
        for payload in payloads.into_iter().rev() {
            queue.push_front(payload);
        }
    }

    pub fn len(&self, user_id: UserId) -> usize {
        self.queues.get(&user_id).map_or(0, VecDeque::len)
    }

    /// Payloads queued across all users.
    pub fn total(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typing(n: u64) -> ServerEvent {
        ServerEvent::Typing {
            user_id: UserId(n),
            receiver_id: UserId(100),
        }
    }

    #[test]
    fn drain_preserves_enqueue_order() {
        let mut q = OfflineQueue::new(None);
        for n in 0..5 {
            q.enqueue(UserId(1), typing(n));
        }
        assert_eq!(q.drain(UserId(1)), (0..5).map(typing).collect::<Vec<_>>());
        assert_eq!(q.len(UserId(1)), 0);
        assert!(q.drain(UserId(1)).is_empty());
    }

    #[test]
    fn drain_unknown_user_is_empty() {
        let mut q = OfflineQueue::new(None);
        assert!(q.drain(UserId(42)).is_empty());
    }

    #[test]
    fn queues_are_per_user() {
        let mut q = OfflineQueue::new(None);
        q.enqueue(UserId(1), typing(1));
        q.enqueue(UserId(2), typing(2));
        q.enqueue(UserId(1), typing(3));
        assert_eq!(q.len(UserId(1)), 2);
        assert_eq!(q.total(), 3);
        assert_eq!(q.drain(UserId(2)), vec![typing(2)]);
        assert_eq!(q.total(), 2);
    }

    #[test]
    fn duplicates_are_kept() {
        let mut q = OfflineQueue::new(None);
        q.enqueue(UserId(1), typing(7));
        q.enqueue(UserId(1), typing(7));
        assert_eq!(q.drain(UserId(1)).len(), 2);
    }

    #[test]
    fn cap_drops_oldest() {
        let mut q = OfflineQueue::new(Some(2));
        q.enqueue(UserId(1), typing(1));
        q.enqueue(UserId(1), typing(2));
        assert_eq!(q.enqueue(UserId(1), typing(3)), 2);
        assert_eq!(q.drain(UserId(1)), vec![typing(2), typing(3)]);
    }

    #[test]
    fn zero_cap_means_unbounded() {
        let mut q = OfflineQueue::new(Some(0));
        for n in 0..10 {
            q.enqueue(UserId(1), typing(n));
        }
        assert_eq!(q.len(UserId(1)), 10);
    }

    #[test]
    fn requeue_goes_ahead_of_newer_payloads() {
        let mut q = OfflineQueue::new(None);
        q.enqueue(UserId(1), typing(3));
        q.requeue_front(UserId(1), vec![typing(1), typing(2)]);
        assert_eq!(q.drain(UserId(1)), vec![typing(1), typing(2), typing(3)]);
    }
}
