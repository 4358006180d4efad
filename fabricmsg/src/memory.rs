//! In-memory exchange and system layers.
//!
//! [`MemoryExchangeLayer`] records every outbound message in a queue instead
//! of putting it on a network, and lets a harness feed acknowledgements and
//! inbound exchanges back in. [`ManualSystemLayer`] is a virtual clock whose
//! timers fire only when the harness advances time. Together they let a
//! session manager run deterministically without sockets or a runtime.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{ExchangeError, Result};
use crate::exchange::{ExchangeInfo, ExchangeLayer, ExchangeTarget};
use crate::ids::{ConnectionId, EncryptionType, ExchangeId, KeyId, NodeId};
use crate::message::{ProfileId, SendFlags};
use crate::retransmission::{PendingKey, PollResult, RetransmissionTable};
use crate::system::{SystemLayer, TimerId};

/// Default reliable-messaging acknowledgement timeout.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(200);

/// One message handed to the layer for transmission.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub exchange: ExchangeId,
    pub peer: NodeId,
    pub connection: Option<ConnectionId>,
    pub profile: ProfileId,
    pub msg_type: u8,
    pub message_id: u32,
    pub key_id: KeyId,
    pub encryption_type: EncryptionType,
    pub flags: SendFlags,
    pub payload: Bytes,
}

/// Lifecycle of an exchange held by the layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStatus {
    Open,
    Closed,
    Aborted,
}

/// A key failure reported to the layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFailure {
    pub peer: NodeId,
    pub key_id: KeyId,
    pub error_code: u16,
}

/// An acknowledgement the layer has put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentAck {
    pub exchange: ExchangeId,
    pub message_id: u32,
}

#[derive(Debug)]
struct ExchangeRecord {
    info: ExchangeInfo,
    key_id: KeyId,
    encryption_type: EncryptionType,
    status: ExchangeStatus,
    owed_acks: Vec<u32>,
    flushes: u32,
}

#[derive(Debug)]
struct Inner {
    next_exchange: u32,
    next_message_id: u32,
    exchanges: HashMap<ExchangeId, ExchangeRecord>,
    handlers: HashSet<ProfileId>,
    key_failures: Vec<KeyFailure>,
    retransmit: RetransmissionTable,
    now: Duration,
    ack_timeout: Duration,
    fail_sends: bool,
}

impl Inner {
    fn open_record(&mut self, id: ExchangeId) -> Result<&mut ExchangeRecord> {
        let record = self
            .exchanges
            .get_mut(&id)
            .ok_or(ExchangeError::UnknownExchange(id))?;
        if record.status != ExchangeStatus::Open {
            return Err(ExchangeError::ExchangeClosed(id));
        }
        Ok(record)
    }

    fn insert(&mut self, peer: NodeId, connection: Option<ConnectionId>) -> ExchangeId {
        self.next_exchange += 1;
        let id = ExchangeId(self.next_exchange);
        self.exchanges.insert(
            id,
            ExchangeRecord {
                info: ExchangeInfo { id, peer, connection },
                key_id: KeyId::NONE,
                encryption_type: EncryptionType::None,
                status: ExchangeStatus::Open,
                owed_acks: Vec::new(),
                flushes: 0,
            },
        );
        id
    }
}

/// Exchange layer that queues outbound traffic in memory.
#[derive(Debug)]
pub struct MemoryExchangeLayer {
    inner: Mutex<Inner>,
    outbound: SegQueue<SentMessage>,
    acks: SegQueue<SentAck>,
}

impl MemoryExchangeLayer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_exchange: 0,
                next_message_id: 0,
                exchanges: HashMap::new(),
                handlers: HashSet::new(),
                key_failures: Vec::new(),
                retransmit: RetransmissionTable::new(),
                now: Duration::ZERO,
                ack_timeout: DEFAULT_ACK_TIMEOUT,
                fail_sends: false,
            }),
            outbound: SegQueue::new(),
            acks: SegQueue::new(),
        }
    }

    /// Register an exchange opened by a peer (the receive side of an
    /// unsolicited message).
    pub fn accept_exchange(&self, peer: NodeId, connection: Option<ConnectionId>) -> ExchangeId {
        self.inner.lock().insert(peer, connection)
    }

    /// Record receipt of `message_id` on `exchange`; an acknowledgement is
    /// owed if the sender asked for one.
    pub fn note_received(&self, exchange: ExchangeId, message_id: u32, ack_requested: bool) {
        if !ack_requested {
            return;
        }
        if let Some(record) = self.inner.lock().exchanges.get_mut(&exchange) {
            record.owed_acks.push(message_id);
        }
    }

    /// Drain messages handed to the layer since the last call.
    pub fn take_sent(&self) -> Vec<SentMessage> {
        std::iter::from_fn(|| self.outbound.pop()).collect()
    }

    /// Drain acknowledgements put on the wire since the last call.
    pub fn take_acks(&self) -> Vec<SentAck> {
        std::iter::from_fn(|| self.acks.pop()).collect()
    }

    /// Apply an acknowledgement from the peer; returns true if the message
    /// was still awaiting one.
    pub fn acknowledge(&self, exchange: ExchangeId, message_id: u32) -> bool {
        self.inner
            .lock()
            .retransmit
            .acknowledge(PendingKey { exchange, message_id })
    }

    /// Messages due for retransmission at the layer's current time.
    pub fn poll_retransmissions(&self) -> PollResult {
        let mut inner = self.inner.lock();
        let now = inner.now;
        inner.retransmit.poll_expired(now)
    }

    pub fn awaiting_ack(&self, exchange: ExchangeId, message_id: u32) -> bool {
        self.inner
            .lock()
            .retransmit
            .is_pending(PendingKey { exchange, message_id })
    }

    pub fn set_now(&self, now: Duration) {
        self.inner.lock().now = now;
    }

    pub fn set_ack_timeout(&self, timeout: Duration) {
        self.inner.lock().ack_timeout = timeout;
    }

    /// Make every subsequent send fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.inner.lock().fail_sends = fail;
    }

    pub fn status(&self, exchange: ExchangeId) -> Option<ExchangeStatus> {
        self.inner.lock().exchanges.get(&exchange).map(|r| r.status)
    }

    pub fn open_exchange_count(&self) -> usize {
        self.inner
            .lock()
            .exchanges
            .values()
            .filter(|r| r.status == ExchangeStatus::Open)
            .count()
    }

    pub fn exchange_key(&self, exchange: ExchangeId) -> Option<(KeyId, EncryptionType)> {
        self.inner
            .lock()
            .exchanges
            .get(&exchange)
            .map(|r| (r.key_id, r.encryption_type))
    }

    /// Number of explicit `flush_acks` calls made on `exchange`.
    pub fn flush_count(&self, exchange: ExchangeId) -> u32 {
        self.inner
            .lock()
            .exchanges
            .get(&exchange)
            .map_or(0, |r| r.flushes)
    }

    pub fn key_failures(&self) -> Vec<KeyFailure> {
        self.inner.lock().key_failures.clone()
    }

    pub fn has_handler(&self, profile: ProfileId) -> bool {
        self.inner.lock().handlers.contains(&profile)
    }

    fn emit_owed_acks(&self, record: &mut ExchangeRecord) {
        for message_id in record.owed_acks.drain(..) {
            self.acks.push(SentAck {
                exchange: record.info.id,
                message_id,
            });
        }
    }
}

impl Default for MemoryExchangeLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeLayer for MemoryExchangeLayer {
    fn register_unsolicited_handler(&self, profile: ProfileId) -> Result<()> {
        if !self.inner.lock().handlers.insert(profile) {
            return Err(ExchangeError::HandlerAlreadyRegistered(profile));
        }
        Ok(())
    }

    fn unregister_unsolicited_handler(&self, profile: ProfileId) -> Result<()> {
        if !self.inner.lock().handlers.remove(&profile) {
            return Err(ExchangeError::HandlerNotRegistered(profile));
        }
        Ok(())
    }

    fn new_exchange(&self, target: &ExchangeTarget) -> Result<ExchangeId> {
        Ok(self.inner.lock().insert(target.peer(), target.connection()))
    }

    fn exchange_info(&self, exchange: ExchangeId) -> Result<ExchangeInfo> {
        self.inner
            .lock()
            .exchanges
            .get(&exchange)
            .map(|r| r.info.clone())
            .ok_or(ExchangeError::UnknownExchange(exchange))
    }

    fn set_exchange_key(
        &self,
        exchange: ExchangeId,
        key_id: KeyId,
        encryption_type: EncryptionType,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner.open_record(exchange)?;
        record.key_id = key_id;
        record.encryption_type = encryption_type;
        Ok(())
    }

    fn send(
        &self,
        exchange: ExchangeId,
        profile: ProfileId,
        msg_type: u8,
        payload: Bytes,
        flags: SendFlags,
    ) -> Result<u32> {
        let mut inner = self.inner.lock();
        if inner.fail_sends {
            return Err(ExchangeError::SendFailed("send disabled".into()));
        }
        inner.next_message_id += 1;
        let message_id = inner.next_message_id;
        let now = inner.now;
        let ack_timeout = inner.ack_timeout;

        let record = inner.open_record(exchange)?;
        // Outbound traffic piggybacks any acknowledgement owed on the exchange.
        let owed: Vec<u32> = record.owed_acks.drain(..).collect();
        let sent = SentMessage {
            exchange,
            peer: record.info.peer,
            connection: record.info.connection,
            profile,
            msg_type,
            message_id,
            key_id: record.key_id,
            encryption_type: record.encryption_type,
            flags,
            payload: payload.clone(),
        };
        let reliable = record.info.uses_reliable_messaging();

        for id in owed {
            self.acks.push(SentAck { exchange, message_id: id });
        }
        if reliable && flags.contains(SendFlags::REQUEST_ACK) {
            inner.retransmit.track(
                PendingKey { exchange, message_id },
                msg_type,
                payload,
                now,
                ack_timeout,
            );
        }
        trace!(%exchange, msg_type, message_id, "queued outbound message");
        self.outbound.push(sent);
        Ok(message_id)
    }

    fn flush_acks(&self, exchange: ExchangeId) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner.open_record(exchange)?;
        record.flushes += 1;
        self.emit_owed_acks(record);
        Ok(())
    }

    fn close(&self, exchange: ExchangeId) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.exchanges.get_mut(&exchange) {
            if record.status == ExchangeStatus::Open {
                record.status = ExchangeStatus::Closed;
                self.emit_owed_acks(record);
            }
        }
    }

    fn abort(&self, exchange: ExchangeId) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.exchanges.get_mut(&exchange) {
            if record.status == ExchangeStatus::Open {
                record.status = ExchangeStatus::Aborted;
                record.owed_acks.clear();
            }
        }
        inner.retransmit.forget_exchange(exchange);
    }

    fn on_key_failed(&self, peer: NodeId, key_id: KeyId, error_code: u16) {
        self.inner.lock().key_failures.push(KeyFailure {
            peer,
            key_id,
            error_code,
        });
    }
}

#[derive(Debug, Default)]
struct Clock {
    now: Duration,
    timers: HashMap<TimerId, Duration>,
    crypto_started: u32,
    crypto_ended: u32,
}

/// Virtual clock implementing [`SystemLayer`].
#[derive(Debug, Default)]
pub struct ManualSystemLayer {
    clock: Mutex<Clock>,
}

impl ManualSystemLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        self.clock.lock().now
    }

    /// Advance time by `by`; returns the timers that fired, earliest first.
    /// Fired timers are disarmed.
    pub fn advance(&self, by: Duration) -> Vec<TimerId> {
        let mut clock = self.clock.lock();
        clock.now += by;
        let now = clock.now;

        let mut fired: Vec<(Duration, TimerId)> = clock
            .timers
            .iter()
            .filter(|(_, due)| **due <= now)
            .map(|(id, due)| (*due, *id))
            .collect();
        fired.sort_by_key(|(due, id)| (*due, id.0));
        for (_, id) in &fired {
            clock.timers.remove(id);
        }
        fired.into_iter().map(|(_, id)| id).collect()
    }

    pub fn is_armed(&self, timer: TimerId) -> bool {
        self.clock.lock().timers.contains_key(&timer)
    }

    /// Time remaining until `timer` fires, if armed.
    pub fn remaining(&self, timer: TimerId) -> Option<Duration> {
        let clock = self.clock.lock();
        clock.timers.get(&timer).map(|due| due.saturating_sub(clock.now))
    }

    /// `(started, ended)` counts of expensive-crypto brackets.
    pub fn crypto_brackets(&self) -> (u32, u32) {
        let clock = self.clock.lock();
        (clock.crypto_started, clock.crypto_ended)
    }
}

impl SystemLayer for ManualSystemLayer {
    fn start_timer(&self, timer: TimerId, after: Duration) {
        let mut clock = self.clock.lock();
        let due = clock.now + after;
        clock.timers.insert(timer, due);
    }

    fn cancel_timer(&self, timer: TimerId) {
        self.clock.lock().timers.remove(&timer);
    }

    fn on_expensive_crypto_start(&self) {
        self.clock.lock().crypto_started += 1;
    }

    fn on_expensive_crypto_end(&self) {
        self.clock.lock().crypto_ended += 1;
    }
}
