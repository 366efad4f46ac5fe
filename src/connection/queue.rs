//! Authenticated Request Queue
//!
//! Outbound requests that may not go out yet: either the socket is not open
//! or the session is not authenticated. The queue is FIFO; the only
//! reordering happens when a login succeeds and the priority class is
//! replayed first.

use std::collections::VecDeque;
use std::time::Instant;

use serde_json::Value;
use tracing::warn;

use crate::protocol::Command;

/// A request held back by the gate.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    /// Command to send.
    pub command: Command,
    /// Opaque payload.
    pub payload: Value,
}

impl PendingRequest {
    /// Create a pending request.
    pub fn new(command: Command, payload: Value) -> Self {
        Self { command, payload }
    }
}

/// Gate verdict for an outbound request on an open socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Send now.
    Pass,
    /// Hold until login succeeds.
    Hold,
}

/// Decide whether a request may go out on an open socket.
pub fn gate(command: Command, bypass: bool, authenticated: bool) -> Gate {
    if command == Command::LOGIN || bypass || command.is_allow_listed() || authenticated {
        Gate::Pass
    } else {
        Gate::Hold
    }
}

/// Requests split at login success.
#[derive(Debug, Default, PartialEq)]
pub struct LoginDrain {
    /// Priority-class requests, replayed first with the gate bypassed.
    pub priority: Vec<PendingRequest>,
    /// Everything else, replayed through the normal send path.
    pub rest: Vec<PendingRequest>,
}

/// Requests released when the socket reopens before login is reconfirmed.
#[derive(Debug, Default, PartialEq)]
pub struct ReconnectDrain {
    /// Queued login requests.
    pub logins: Vec<PendingRequest>,
    /// Allow-listed requests.
    pub anonymous: Vec<PendingRequest>,
}

/// FIFO of gated requests with a drop-oldest cap.
#[derive(Debug)]
pub struct RequestQueue {
    pending: VecDeque<PendingRequest>,
    capacity: usize,
    dropped: u64,
}

impl RequestQueue {
    /// Create a queue holding at most `capacity` requests.
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Append a request, evicting the oldest one when full.
    pub fn push(&mut self, request: PendingRequest) -> Option<PendingRequest> {
        let evicted = if self.pending.len() >= self.capacity {
            self.dropped += 1;
            let old = self.pending.pop_front();
            if let Some(ref old) = old {
                warn!(command = %old.command, capacity = self.capacity, "pending queue full, dropping oldest request");
            }
            old
        } else {
            None
        };
        self.pending.push_back(request);
        evicted
    }

    /// Queued request count.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Requests evicted by the cap so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Queued requests in order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingRequest> {
        self.pending.iter()
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Empty the queue, splitting it into the priority class and the rest.
    /// Each part keeps its original relative order.
    pub fn drain_for_login(&mut self) -> LoginDrain {
        let (priority, rest) = self
            .pending
            .drain(..)
            .partition(|req| req.command.is_priority());
        LoginDrain { priority, rest }
    }

    /// Release login and allow-listed requests; gated requests stay queued
    /// in their original order.
    pub fn drain_for_reconnect(&mut self) -> ReconnectDrain {
        let mut drain = ReconnectDrain::default();
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for req in self.pending.drain(..) {
            if req.command == Command::LOGIN {
                drain.logins.push(req);
            } else if req.command.is_allow_listed() {
                drain.anonymous.push(req);
            } else {
                kept.push_back(req);
            }
        }
        self.pending = kept;
        drain
    }
}

/// A send issued while the socket was not open, waiting for it to open.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitingSend {
    /// The request.
    pub request: PendingRequest,
    /// Gate bypass flag it was issued with.
    pub bypass: bool,
    /// When to give up and queue it.
    pub deadline: Instant,
}

/// Sends parked until the socket opens.
#[derive(Debug, Default)]
pub struct ConnectWaiters {
    waiting: Vec<WaitingSend>,
}

impl ConnectWaiters {
    /// Park a send.
    pub fn park(&mut self, request: PendingRequest, bypass: bool, deadline: Instant) {
        self.waiting.push(WaitingSend {
            request,
            bypass,
            deadline,
        });
    }

    /// Whether anything is parked.
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Parked send count.
    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    /// Remove sends whose deadline has passed, in issue order.
    pub fn expire(&mut self, now: Instant) -> Vec<WaitingSend> {
        let (expired, waiting) = self
            .waiting
            .drain(..)
            .partition(|w| w.deadline <= now);
        self.waiting = waiting;
        expired
    }

    /// Remove every parked send, in issue order.
    pub fn release(&mut self) -> Vec<WaitingSend> {
        std::mem::take(&mut self.waiting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn req(command: Command, n: i64) -> PendingRequest {
        PendingRequest::new(command, json!({ "n": n }))
    }

    #[test]
    fn test_gate() {
        assert_eq!(gate(Command::LOGIN, false, false), Gate::Pass);
        assert_eq!(gate(Command::HEARTBEAT, false, false), Gate::Pass);
        assert_eq!(gate(Command::GET_SCENE_FEED, false, false), Gate::Pass);
        assert_eq!(gate(Command::VOTE_THREAD, false, false), Gate::Hold);
        assert_eq!(gate(Command::VOTE_THREAD, true, false), Gate::Pass);
        assert_eq!(gate(Command::VOTE_THREAD, false, true), Gate::Pass);
        assert_eq!(gate(Command(777), false, false), Gate::Hold);
    }

    #[test]
    fn test_login_drain_partitions_in_order() {
        let mut queue = RequestQueue::new(16);
        queue.push(req(Command::GET_EP_LIST, 1));
        queue.push(req(Command::VOTE_THREAD, 2));
        queue.push(req(Command::GET_USER_POINTS, 3));
        queue.push(req(Command::GET_CHARACTER_HISTORY, 4));
        queue.push(req(Command::VOTE_THREAD, 5));

        let drain = queue.drain_for_login();
        assert!(queue.is_empty());
        assert_eq!(
            drain.priority,
            vec![
                req(Command::VOTE_THREAD, 2),
                req(Command::GET_CHARACTER_HISTORY, 4),
                req(Command::VOTE_THREAD, 5),
            ]
        );
        assert_eq!(
            drain.rest,
            vec![req(Command::GET_EP_LIST, 1), req(Command::GET_USER_POINTS, 3)]
        );
    }

    #[test]
    fn test_reconnect_drain_keeps_gated() {
        let mut queue = RequestQueue::new(16);
        queue.push(req(Command::VOTE_THREAD, 1));
        queue.push(req(Command::GET_SCENE_FEED, 2));
        queue.push(req(Command::LOGIN, 3));
        queue.push(req(Command::GET_EP_LIST, 4));

        let drain = queue.drain_for_reconnect();
        assert_eq!(drain.logins, vec![req(Command::LOGIN, 3)]);
        assert_eq!(drain.anonymous, vec![req(Command::GET_SCENE_FEED, 2)]);
        let kept: Vec<_> = queue.iter().cloned().collect();
        assert_eq!(kept, vec![req(Command::VOTE_THREAD, 1), req(Command::GET_EP_LIST, 4)]);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut queue = RequestQueue::new(2);
        assert!(queue.push(req(Command::GET_EP_LIST, 1)).is_none());
        assert!(queue.push(req(Command::GET_EP_LIST, 2)).is_none());
        let evicted = queue.push(req(Command::GET_EP_LIST, 3));
        assert_eq!(evicted, Some(req(Command::GET_EP_LIST, 1)));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn test_waiters_expire_by_deadline() {
        let now = Instant::now();
        let mut waiters = ConnectWaiters::default();
        waiters.park(req(Command::GET_EP_LIST, 1), false, now + Duration::from_secs(1));
        waiters.park(req(Command::GET_EP_LIST, 2), true, now + Duration::from_secs(5));

        let expired = waiters.expire(now + Duration::from_secs(2));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].request, req(Command::GET_EP_LIST, 1));
        assert_eq!(waiters.len(), 1);

        let released = waiters.release();
        assert!(released[0].bypass);
        assert!(waiters.is_empty());
    }
}
