//! Reliable-messaging retransmission table.
//!
//! Messages sent with [`SendFlags::REQUEST_ACK`](crate::message::SendFlags)
//! on exchanges without a connection are tracked here until acknowledged.
//! Entries are ordered in a min-heap by retransmission deadline, with
//! exponential backoff on each retry and a bounded retry count.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

use bytes::Bytes;

use crate::ids::ExchangeId;

/// Retransmissions attempted before a message is given up on.
pub const MAX_RETRIES: u32 = 3;

/// Identifies one tracked message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub exchange: ExchangeId,
    pub message_id: u32,
}

#[derive(Debug, Clone)]
struct Entry {
    key: PendingKey,
    msg_type: u8,
    payload: Bytes,
    due: Duration,
    backoff: Duration,
    attempts: u32,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earliest deadline first.
        other.due.cmp(&self.due)
    }
}

/// A tracked message whose deadline passed.
#[derive(Debug, Clone)]
pub struct Retransmit {
    pub key: PendingKey,
    pub msg_type: u8,
    pub payload: Bytes,
    pub attempt: u32,
}

/// Outcome of polling the table.
#[derive(Debug, Default)]
pub struct PollResult {
    pub retransmit: Vec<Retransmit>,
    pub given_up: Vec<PendingKey>,
}

/// Messages awaiting acknowledgement.
#[derive(Debug, Default)]
pub struct RetransmissionTable {
    heap: BinaryHeap<Entry>,
    pending: HashSet<PendingKey>,
}

impl RetransmissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `payload` until acknowledged; first retransmission at `now + timeout`.
    pub fn track(
        &mut self,
        key: PendingKey,
        msg_type: u8,
        payload: Bytes,
        now: Duration,
        timeout: Duration,
    ) {
        self.pending.insert(key);
        self.heap.push(Entry {
            key,
            msg_type,
            payload,
            due: now + timeout,
            backoff: timeout,
            attempts: 0,
        });
    }

    /// Returns true if `key` was still awaiting acknowledgement.
    pub fn acknowledge(&mut self, key: PendingKey) -> bool {
        // Stale heap entries are skipped in poll_expired.
        self.pending.remove(&key)
    }

    /// Forget every message sent on `exchange`.
    pub fn forget_exchange(&mut self, exchange: ExchangeId) {
        self.pending.retain(|k| k.exchange != exchange);
    }

    pub fn is_pending(&self, key: PendingKey) -> bool {
        self.pending.contains(&key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Collect messages due for retransmission at `now`.
    pub fn poll_expired(&mut self, now: Duration) -> PollResult {
        let mut result = PollResult::default();

        while self.heap.peek().is_some_and(|e| e.due <= now) {
            let Some(entry) = self.heap.pop() else { break };
            if !self.pending.contains(&entry.key) {
                continue;
            }

            if entry.attempts >= MAX_RETRIES {
                self.pending.remove(&entry.key);
                result.given_up.push(entry.key);
                continue;
            }

            let attempt = entry.attempts + 1;
            result.retransmit.push(Retransmit {
                key: entry.key,
                msg_type: entry.msg_type,
                payload: entry.payload.clone(),
                attempt,
            });
            let backoff = entry.backoff * 2;
            self.heap.push(Entry {
                due: now + backoff,
                backoff,
                attempts: attempt,
                ..entry
            });
        }

        result
    }
}
