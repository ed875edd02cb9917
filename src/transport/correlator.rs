// MIT License - Copyright (c) 2026 Peter Wright
// Matching of replies to outstanding requests

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::addr::LcnAddr;
use crate::error::{PckError, Result};
use crate::frame::{HostNotice, StatusPayload};
use crate::protocol::ResponseKind;

/// Connection-scoped exchanges that have no bus address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostExchange {
    /// `!CHD` answered by `(dec-mode)`
    DecMode,
}

/// Correlation key. Replies carry no transaction id, so everything waiting
/// on the same key is answered strictly in issue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKey {
    /// `addr` is the canonical physical address
    Address { addr: LcnAddr, kind: ResponseKind },
    Host(HostExchange),
}

/// Value delivered to a resolved request.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Written to the socket, no reply expected
    Sent,
    Ack,
    Status(StatusPayload),
    Host(HostNotice),
}

/// Retry and timeout policy of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPolicy {
    /// Retransmissions after the first transmission
    pub retries: u32,
    /// Deadline of each transmission
    pub timeout: Duration,
}

type ResponseSlot = oneshot::Sender<Result<Response>>;

struct PendingRequest {
    id: u64,
    line: String,
    policy: RequestPolicy,
    retries_remaining: u32,
    /// Set once the request reaches the head of its queue and is transmitted
    deadline: Option<Instant>,
    slot: ResponseSlot,
}

/// Awaitable result of a registered request.
#[derive(Debug)]
pub struct RequestHandle {
    id: u64,
    rx: oneshot::Receiver<Result<Response>>,
}

impl RequestHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the request to resolve. A correlator that goes away without
    /// answering counts as a lost connection.
    pub async fn response(self) -> Result<Response> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(PckError::ConnectionLost),
        }
    }
}

/// Outcome of `resolve` / `fail`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Settled {
    /// A waiting request received the value
    pub delivered: bool,
    /// Line of the newly promoted head, to be transmitted now
    pub next: Option<String>,
}

/// Per-key FIFO queues of pending requests, at most one in flight per key.
///
/// Pure bookkeeping: the caller performs every transmission the correlator
/// asks for and drives `sweep` on a fixed cadence.
#[derive(Default)]
pub struct Correlator {
    queues: HashMap<RequestKey, VecDeque<PendingRequest>>,
    next_id: u64,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request. Returns its handle and, if the key was idle, the line
    /// to transmit immediately.
    pub fn register(
        &mut self,
        key: RequestKey,
        line: String,
        policy: RequestPolicy,
        now: Instant,
    ) -> (RequestHandle, Option<String>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id;
        self.next_id += 1;

        let queue = self.queues.entry(key).or_default();
        queue.push_back(PendingRequest {
            id,
            line,
            policy,
            retries_remaining: policy.retries,
            deadline: None,
            slot: tx,
        });

        let transmit = if queue.len() == 1 {
            promote(queue, now)
        } else {
            trace!(?key, id, queued = queue.len(), "Request queued behind in-flight request");
            None
        };
        (RequestHandle { id, rx }, transmit)
    }

    /// Complete the oldest request for `key` with a value.
    pub fn resolve(&mut self, key: &RequestKey, value: Response, now: Instant) -> Settled {
        self.complete(key, Ok(value), now)
    }

    /// Complete the oldest request for `key` with an error.
    pub fn fail(&mut self, key: &RequestKey, error: PckError, now: Instant) -> Settled {
        self.complete(key, Err(error), now)
    }

    fn complete(&mut self, key: &RequestKey, result: Result<Response>, now: Instant) -> Settled {
        let Some(queue) = self.queues.get_mut(key) else {
            return Settled::default();
        };
        let mut settled = Settled::default();
        // Only a transmitted head can be answered.
        if queue.front().is_some_and(|head| head.deadline.is_some()) {
            if let Some(head) = queue.pop_front() {
                trace!(?key, id = head.id, "Request completed");
                settled.delivered = head.slot.send(result).is_ok();
                settled.next = promote(queue, now);
            }
        }
        if queue.is_empty() {
            self.queues.remove(key);
        }
        settled
    }

    /// Expire overdue heads. Returns the lines to (re)transmit, in order.
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        let mut transmit = Vec::new();

        self.queues.retain(|key, queue| {
            loop {
                let Some(head) = queue.front_mut() else {
                    break;
                };
                if head.slot.is_closed() {
                    trace!(?key, id = head.id, "Dropping abandoned request");
                    queue.pop_front();
                    if let Some(line) = promote(queue, now) {
                        transmit.push(line);
                    }
                    continue;
                }
                match head.deadline {
                    Some(deadline) if deadline <= now => {}
                    _ => break,
                }
                if head.retries_remaining > 0 {
                    head.retries_remaining -= 1;
                    head.deadline = Some(now + head.policy.timeout);
                    debug!(
                        ?key,
                        id = head.id,
                        retries_left = head.retries_remaining,
                        "Request timed out, retransmitting"
                    );
                    transmit.push(head.line.clone());
                    break;
                }
                if let Some(expired) = queue.pop_front() {
                    debug!(?key, id = expired.id, "Request exhausted its retries");
                    let _ = expired.slot.send(Err(PckError::Timeout {
                        command: expired.line,
                    }));
                }
                if let Some(line) = promote(queue, now) {
                    transmit.push(line);
                }
            }
            !queue.is_empty()
        });

        transmit
    }

    /// Fail every pending request, in flight or queued.
    pub fn fail_all(&mut self, make_error: impl Fn() -> PckError) {
        let count: usize = self.queues.values().map(VecDeque::len).sum();
        if count > 0 {
            debug!(count, "Failing all pending requests");
        }
        for (_, queue) in self.queues.drain() {
            for request in queue {
                let _ = request.slot.send(Err(make_error()));
            }
        }
    }

    /// Whether a request for `key` is in flight or queued.
    pub fn is_occupied(&self, key: &RequestKey) -> bool {
        self.queues.contains_key(key)
    }

    /// Number of pending requests across all keys.
    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

/// Make the first live request of `queue` the in-flight head.
fn promote(queue: &mut VecDeque<PendingRequest>, now: Instant) -> Option<String> {
    while let Some(head) = queue.front_mut() {
        if head.slot.is_closed() {
            queue.pop_front();
            continue;
        }
        head.deadline = Some(now + head.policy.timeout);
        return Some(head.line.clone());
    }
    None
}
