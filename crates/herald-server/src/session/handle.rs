//! The send/close capability for one live connection.
//!
//! A `ConnectionHandle` is the relay-side end of a session's outbound path;
//! the matching `Outbox` is drained by whatever transport task owns the socket.
//! Sends never block: a session over its outbound limit or a vanished
//! transport is reported as a transport failure and the caller decides what
//! to evict. Offline backlog flushed at login is not counted against the limit.

use herald_core::{CloseReason, HeraldError, HeraldResult, ServerEvent, SessionId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Create a connected handle/outbox pair allowing `limit` unread events.
pub fn channel(session_id: SessionId, limit: usize) -> (ConnectionHandle, Outbox) {
    let (events_tx, events_rx) = mpsc::unbounded_channel::<Queued>();
    let (close_tx, close_rx) = watch::channel(None);
    let pending = Arc::new(AtomicUsize::new(0));
    let handle = ConnectionHandle {
        session_id,
        events: events_tx,
        close: Arc::new(close_tx),
        pending: pending.clone(),
        limit: limit.max(1),
    };
    let outbox = Outbox {
        events: events_rx,
        close: close_rx,
        pending,
    };
    (handle, outbox)
}

/// An event in flight; `counted` items hold a slot of the outbound limit.
#[derive(Debug)]
struct Queued {
    event: ServerEvent,
    counted: bool,
}

/// Relay-side handle to one session's transport.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    session_id: SessionId,
    events: mpsc::UnboundedSender<Queued>,
    close: Arc<watch::Sender<Option<CloseReason>>>,
    /// Limited events sent but not yet taken by the transport.
    pending: Arc<AtomicUsize>,
    limit: usize,
}

impl ConnectionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Queue an event for the transport.
    pub fn send(&self, event: ServerEvent) -> HeraldResult<()> {
        self.check_open()?;
        // Reserve the slot before the transport can take the event.
        let limit = self.limit;
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .map_err(|_| HeraldError::Transport("outbound buffer full".into()))?;
        let pushed = self.push(Queued {
            event,
            counted: true,
        });
        if pushed.is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        pushed
    }

    /// Queue an event outside the outbound limit. Used for the login backlog.
    pub fn send_backlog(&self, event: ServerEvent) -> HeraldResult<()> {
        self.check_open()?;
        self.push(Queued {
            event,
            counted: false,
        })
    }

    fn check_open(&self) -> HeraldResult<()> {
        match self.close_reason() {
            Some(reason) => Err(HeraldError::Transport(format!("session closed ({reason})"))),
            None => Ok(()),
        }
    }

    fn push(&self, item: Queued) -> HeraldResult<()> {
        self.events
            .send(item)
            .map_err(|_| HeraldError::Transport("transport gone".into()))
    }

    /// Limited events the transport has not taken yet.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Ask the transport to close. Only the first reason sticks; returns
    /// `true` if this call was the one that closed the handle.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.close.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason().is_some() || self.events.is_closed()
    }
}

/// Item produced by an [`Outbox`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Event(ServerEvent),
    Close(CloseReason),
}

/// Transport-side end of a session: events to write, then a close request.
#[derive(Debug)]
pub struct Outbox {
    events: mpsc::UnboundedReceiver<Queued>,
    close: watch::Receiver<Option<CloseReason>>,
    pending: Arc<AtomicUsize>,
}

impl Outbox {
    /// Wait for the next item. Events queued before a close are yielded first.
    ///
    /// Returns `None` once every handle is gone without a close request.
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<Outgoing> {
        loop {
            if let Some(item) = self.try_next() {
                return Some(item);
            }
            tokio::select! {
                event = self.events.recv() => {
                    return match event {
                        Some(event) => Some(self.taken(event)),
                        None => (*self.close.borrow()).map(Outgoing::Close),
                    };
                }
                changed = self.close.changed() => {
                    if changed.is_err() {
                        // Every handle dropped; flush what is left.
                        return match self.events.recv().await {
                            Some(event) => Some(self.taken(event)),
                            None => (*self.close.borrow()).map(Outgoing::Close),
                        };
                    }
                }
            }
        }
    }

    /// Non-blocking variant of [`Outbox::recv`].
    pub fn try_next(&mut self) -> Option<Outgoing> {
        if let Ok(event) = self.events.try_recv() {
            return Some(self.taken(event));
        }
        (*self.close.borrow()).map(Outgoing::Close)
    }

    /// Drain every buffered event without waiting.
    pub fn drain_events(&mut self) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(item) = self.events.try_recv() {
            out.push(self.release(item));
        }
        out
    }

    fn taken(&self, item: Queued) -> Outgoing {
        Outgoing::Event(self.release(item))
    }

    fn release(&self, item: Queued) -> ServerEvent {
        if item.counted {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        item.event
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::UserId;

    fn disconnected(id: u64) -> ServerEvent {
        ServerEvent::UserDisconnected { user_id: UserId(id) }
    }

    #[tokio::test]
    async fn events_then_close() {
        let (handle, mut outbox) = channel(SessionId::generate(), 8);
        handle.send(disconnected(1)).unwrap();
        assert!(handle.close(CloseReason::Superseded));
        assert_eq!(outbox.recv().await, Some(Outgoing::Event(disconnected(1))));
        assert_eq!(outbox.recv().await, Some(Outgoing::Close(CloseReason::Superseded)));
    }

    #[test]
    fn first_close_reason_wins() {
        let (handle, outbox) = channel(SessionId::generate(), 8);
        assert!(handle.close(CloseReason::AuthTimeout));
        assert!(!handle.close(CloseReason::ClientClosed));
        assert_eq!(outbox.close_reason(), Some(CloseReason::AuthTimeout));
    }

    #[test]
    fn send_after_close_fails() {
        let (handle, _outbox) = channel(SessionId::generate(), 8);
        handle.close(CloseReason::ClientClosed);
        let err = handle.send(disconnected(1)).unwrap_err();
        assert_eq!(err.code(), "transport_failure");
    }

    #[test]
    fn dropped_outbox_is_transport_failure() {
        let (handle, outbox) = channel(SessionId::generate(), 8);
        drop(outbox);
        assert!(handle.is_closed());
        assert!(handle.send(disconnected(1)).is_err());
    }

    #[test]
    fn full_buffer_is_transport_failure() {
        let (handle, mut outbox) = channel(SessionId::generate(), 1);
        handle.send(disconnected(1)).unwrap();
        assert!(handle.send(disconnected(2)).is_err());
        assert_eq!(outbox.drain_events(), vec![disconnected(1)]);
        // Reading frees room again.
        handle.send(disconnected(3)).unwrap();
    }

    #[test]
    fn backlog_does_not_consume_the_limit() {
        let (handle, mut outbox) = channel(SessionId::generate(), 2);
        for n in 0..5 {
            handle.send_backlog(disconnected(n)).unwrap();
        }
        assert_eq!(handle.pending(), 0);
        handle.send(disconnected(9)).unwrap();
        handle.send(disconnected(10)).unwrap();
        assert!(handle.send(disconnected(11)).is_err());

        let events = outbox.drain_events();
        assert_eq!(events.len(), 7);
        assert_eq!(events[5], disconnected(9));
        assert_eq!(handle.pending(), 0);
    }

    #[test]
    fn failed_send_releases_its_slot() {
        let (handle, outbox) = channel(SessionId::generate(), 1);
        drop(outbox);
        assert!(handle.send(disconnected(1)).is_err());
        assert_eq!(handle.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn counter_stays_consistent_with_concurrent_reader() {
        let (handle, mut outbox) = channel(SessionId::generate(), 1_000_000);
        let reader = tokio::spawn(async move {
            let mut seen = 0;
            while let Some(Outgoing::Event(_)) = outbox.recv().await {
                seen += 1;
                if seen == 10_000 {
                    break;
                }
            }
            seen
        });
        for n in 0..10_000 {
            handle.send(disconnected(n)).unwrap();
            assert!(handle.pending() <= 10_000);
        }
        assert_eq!(reader.await.unwrap(), 10_000);
        assert_eq!(handle.pending(), 0);
    }

    #[tokio::test]
    async fn recv_wakes_on_close() {
        let (handle, mut outbox) = channel(SessionId::generate(), 8);
        let waiter = tokio::spawn(async move { outbox.recv().await });
        tokio::task::yield_now().await;
        handle.close(CloseReason::ServerShutdown);
        assert_eq!(
            waiter.await.unwrap(),
            Some(Outgoing::Close(CloseReason::ServerShutdown))
        );
    }
}
