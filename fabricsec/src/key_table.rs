//! Session key table.
//!
//! Holds one entry per (key id, peer) pair. An entry is created unkeyed when
//! a handshake starts and receives its key material when the handshake
//! completes. Holders keep an entry alive through reservations; the table
//! decides what happens when the last reservation goes away:
//!
//! - `remove_on_idle` entries stay until an idle sweep finds them unused
//! - entries bound to a connection stay until the connection closes
//! - everything else is removed immediately
//!
//! Each entry carries a generation number so a stale reservation (one whose
//! entry was removed and whose id was later reused) can never touch the
//! replacement entry.
//!
//! Once an idle timer is attached the table arms it whenever an idle
//! candidate exists and cancels it when none is left, whichever path
//! (manager call or a dropped guard) changed the entries.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use fabricmsg::{ConnectionId, EncryptionType, KeyId, NodeId, SystemLayer, TimerId};
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, trace};

use crate::crypto::keys::SessionKeyMaterial;
use crate::error::{Result, SecurityError};
use crate::types::AuthMode;

pub const DEFAULT_MAX_SESSION_KEYS: usize = 16;

/// Attempts at drawing an unused random key id before giving up.
const RANDOM_ID_ATTEMPTS: usize = 64;

/// Handle to a table shared between the manager and reservation guards.
pub type SharedKeyTable = Arc<Mutex<SessionKeyTable>>;

/// One session key entry.
#[derive(Debug)]
pub struct SessionKey {
    key_id: KeyId,
    peer: NodeId,
    encryption_type: EncryptionType,
    auth_mode: AuthMode,
    material: Option<SessionKeyMaterial>,
    reserve_count: u32,
    locally_initiated: bool,
    remove_on_idle: bool,
    recently_active: bool,
    connection: Option<ConnectionId>,
    shared: bool,
    end_nodes: Vec<NodeId>,
    generation: u64,
}

impl SessionKey {
    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// The node the key was negotiated with (the terminating node for a
    /// shared session).
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    pub fn encryption_type(&self) -> EncryptionType {
        self.encryption_type
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.auth_mode
    }

    /// True once the handshake committed key material.
    pub fn is_keyed(&self) -> bool {
        self.material.is_some()
    }

    pub fn material(&self) -> Option<&SessionKeyMaterial> {
        self.material.as_ref()
    }

    pub fn reserve_count(&self) -> u32 {
        self.reserve_count
    }

    pub fn is_locally_initiated(&self) -> bool {
        self.locally_initiated
    }

    pub fn remove_on_idle(&self) -> bool {
        self.remove_on_idle
    }

    pub fn is_recently_active(&self) -> bool {
        self.recently_active
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Peers reaching the terminating node through a shared session.
    pub fn end_nodes(&self) -> &[NodeId] {
        &self.end_nodes
    }

    pub fn slot(&self) -> KeySlot {
        KeySlot {
            key_id: self.key_id,
            peer: self.peer,
            generation: self.generation,
        }
    }

    fn matches(&self, key_id: KeyId, peer: NodeId) -> bool {
        self.key_id == key_id
            && (self.peer == peer || (self.shared && self.end_nodes.contains(&peer)))
    }
}

/// Identity of one table entry across its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySlot {
    pub key_id: KeyId,
    pub peer: NodeId,
    pub generation: u64,
}

/// Parameters for a new, unkeyed entry.
#[derive(Debug, Clone)]
pub struct NewSessionKey {
    /// Requested id; `None` draws a random unused session key id.
    pub key_id: Option<KeyId>,
    pub peer: NodeId,
    pub encryption_type: EncryptionType,
    pub auth_mode: AuthMode,
    pub connection: Option<ConnectionId>,
    pub locally_initiated: bool,
    pub remove_on_idle: bool,
    /// First end node of a shared session, if the entry is shared.
    pub shared_end_node: Option<NodeId>,
}

/// The host timer that paces idle sweeps.
struct IdleTimer {
    system: Arc<dyn SystemLayer>,
    timer: TimerId,
    period: Duration,
    armed: bool,
}

impl fmt::Debug for IdleTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleTimer")
            .field("timer", &self.timer)
            .field("period", &self.period)
            .field("armed", &self.armed)
            .finish()
    }
}

/// Fixed-capacity table of session keys.
#[derive(Debug)]
pub struct SessionKeyTable {
    entries: Vec<SessionKey>,
    capacity: usize,
    next_generation: u64,
    idle_timer: Option<IdleTimer>,
}

impl SessionKeyTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            next_generation: 1,
            idle_timer: None,
        }
    }

    /// Let the table drive `timer` on `system`, one sweep per `period`.
    pub fn attach_idle_timer(&mut self, system: Arc<dyn SystemLayer>, timer: TimerId, period: Duration) {
        self.detach_idle_timer();
        self.idle_timer = Some(IdleTimer {
            system,
            timer,
            period,
            armed: false,
        });
        self.sync_idle_timer();
    }

    /// Cancel and forget the idle timer.
    pub fn detach_idle_timer(&mut self) {
        if let Some(idle) = self.idle_timer.take() {
            if idle.armed {
                idle.system.cancel_timer(idle.timer);
            }
        }
    }

    pub fn is_idle_timer_armed(&self) -> bool {
        self.idle_timer.as_ref().is_some_and(|t| t.armed)
    }

    /// The idle timer fired: sweep, then re-arm if candidates remain.
    pub fn on_idle_timer(&mut self) -> Vec<SessionKey> {
        if let Some(idle) = self.idle_timer.as_mut() {
            idle.armed = false;
        }
        let removed = self.sweep_idle();
        self.sync_idle_timer();
        removed
    }

    fn sync_idle_timer(&mut self) {
        let wanted = self.has_idle_candidates();
        let Some(idle) = self.idle_timer.as_mut() else {
            return;
        };
        if wanted && !idle.armed {
            idle.system.start_timer(idle.timer, idle.period);
            idle.armed = true;
            trace!(period = ?idle.period, "idle sweep armed");
        } else if !wanted && idle.armed {
            idle.system.cancel_timer(idle.timer);
            idle.armed = false;
            trace!("idle sweep disarmed");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionKey> {
        self.entries.iter()
    }

    /// Create an unkeyed entry holding one reservation for its creator.
    pub fn alloc(&mut self, req: NewSessionKey) -> Result<KeySlot> {
        if self.entries.len() >= self.capacity {
            return Err(SecurityError::NoMemory);
        }
        let key_id = match req.key_id {
            Some(id) if !id.is_session() => {
                return Err(SecurityError::InvalidField("session key id"));
            }
            Some(id) => {
                if self.find(id, req.peer).is_some() {
                    return Err(SecurityError::DuplicateKeyId(id));
                }
                id
            }
            None => self.random_key_id(req.peer)?,
        };

        let generation = self.next_generation;
        self.next_generation += 1;
        self.entries.push(SessionKey {
            key_id,
            peer: req.peer,
            encryption_type: req.encryption_type,
            auth_mode: req.auth_mode,
            material: None,
            reserve_count: 1,
            locally_initiated: req.locally_initiated,
            remove_on_idle: req.remove_on_idle,
            recently_active: false,
            connection: req.connection,
            shared: req.shared_end_node.is_some(),
            end_nodes: req.shared_end_node.into_iter().collect(),
            generation,
        });
        debug!(%key_id, peer = %req.peer, generation, "allocated session key");
        Ok(KeySlot {
            key_id,
            peer: req.peer,
            generation,
        })
    }

    fn random_key_id(&self, peer: NodeId) -> Result<KeyId> {
        let mut rng = rand::thread_rng();
        for _ in 0..RANDOM_ID_ATTEMPTS {
            let id = KeyId::session(rng.gen_range(1..=KeyId::MAX_SESSION_NUMBER));
            if !self.entries.iter().any(|e| e.key_id == id && e.peer == peer) {
                return Ok(id);
            }
        }
        Err(SecurityError::NoMemory)
    }

    /// Find the entry for `key_id` used with `peer`, including shared
    /// sessions that list `peer` as an end node.
    pub fn find(&self, key_id: KeyId, peer: NodeId) -> Option<&SessionKey> {
        self.entries.iter().find(|e| e.matches(key_id, peer))
    }

    /// Find a shared session to `terminating` compatible with the request.
    /// In-progress (unkeyed) sessions are returned too.
    pub fn find_shared(
        &self,
        terminating: NodeId,
        auth_mode: AuthMode,
        encryption_type: EncryptionType,
    ) -> Option<&SessionKey> {
        self.entries.iter().find(|e| {
            e.shared
                && e.peer == terminating
                && e.encryption_type == encryption_type
                && (!e.is_keyed() || e.auth_mode.satisfies(auth_mode))
        })
    }

    fn entry_mut(&mut self, slot: &KeySlot) -> Option<&mut SessionKey> {
        self.entries.iter_mut().find(|e| {
            e.key_id == slot.key_id && e.peer == slot.peer && e.generation == slot.generation
        })
    }

    /// Commit the negotiated key to an entry.
    pub fn set_key(
        &mut self,
        slot: &KeySlot,
        material: SessionKeyMaterial,
        auth_mode: AuthMode,
    ) -> Result<()> {
        let entry = self
            .entry_mut(slot)
            .ok_or(SecurityError::KeyNotFound(slot.key_id))?;
        entry.material = Some(material);
        entry.auth_mode = auth_mode;
        debug!(key_id = %slot.key_id, peer = %slot.peer, %auth_mode, "session key established");
        Ok(())
    }

    /// Add `node` to a shared session's end nodes.
    pub fn add_end_node(&mut self, slot: &KeySlot, node: NodeId) -> Result<()> {
        let entry = self
            .entry_mut(slot)
            .ok_or(SecurityError::KeyNotFound(slot.key_id))?;
        if !entry.shared {
            return Err(SecurityError::InvalidArgument("not a shared session"));
        }
        if !entry.end_nodes.contains(&node) {
            entry.end_nodes.push(node);
        }
        Ok(())
    }

    /// Take a reservation on an established key.
    pub fn reserve(&mut self, key_id: KeyId, peer: NodeId) -> Result<KeySlot> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.matches(key_id, peer))
            .ok_or(SecurityError::KeyNotFound(key_id))?;
        entry.reserve_count += 1;
        entry.recently_active = true;
        trace!(%key_id, %peer, count = entry.reserve_count, "reserved session key");
        let slot = entry.slot();
        self.sync_idle_timer();
        Ok(slot)
    }

    /// Drop one reservation; returns true if the entry was removed.
    ///
    /// Stale slots are ignored. An idle candidate counts as active at the
    /// moment its last reservation goes, so it survives the next sweep.
    pub fn release(&mut self, slot: &KeySlot) -> bool {
        let Some(entry) = self.entry_mut(slot) else {
            trace!(key_id = %slot.key_id, "release of stale reservation ignored");
            return false;
        };
        entry.reserve_count = entry.reserve_count.saturating_sub(1);
        trace!(key_id = %slot.key_id, count = entry.reserve_count, "released session key");
        if entry.reserve_count > 0 {
            return false;
        }
        if entry.remove_on_idle {
            entry.recently_active = true;
            self.sync_idle_timer();
            return false;
        }
        if entry.connection.is_some() {
            return false;
        }
        self.remove_slot(slot).is_some()
    }

    /// Drop `peer`'s use of `key_id`. A shared session that still serves
    /// other end nodes only forgets `peer`; any other match is removed.
    /// Returns false if nothing matched.
    pub fn remove_for_peer(&mut self, key_id: KeyId, peer: NodeId) -> bool {
        let Some(idx) = self.entries.iter().position(|e| e.matches(key_id, peer)) else {
            return false;
        };
        let entry = &mut self.entries[idx];
        if entry.shared && entry.peer != peer && entry.end_nodes.len() > 1 {
            entry.end_nodes.retain(|n| *n != peer);
            debug!(%key_id, end_node = %peer, "end node left shared session");
            return true;
        }
        let entry = self.entries.swap_remove(idx);
        debug!(%key_id, peer = %entry.peer, "removed session key");
        self.sync_idle_timer();
        true
    }

    /// Remove exactly the entry identified by `slot`.
    pub fn remove_slot(&mut self, slot: &KeySlot) -> Option<SessionKey> {
        let idx = self.entries.iter().position(|e| {
            e.key_id == slot.key_id && e.peer == slot.peer && e.generation == slot.generation
        })?;
        let entry = self.entries.swap_remove(idx);
        debug!(key_id = %slot.key_id, peer = %slot.peer, "removed session key");
        self.sync_idle_timer();
        Some(entry)
    }

    /// Remove every entry bound to `connection`.
    pub fn remove_connection(&mut self, connection: ConnectionId) -> Vec<SessionKey> {
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| e.connection == Some(connection));
        self.entries = kept;
        if !removed.is_empty() {
            debug!(%connection, count = removed.len(), "removed connection session keys");
            self.sync_idle_timer();
        }
        removed
    }

    /// Note traffic protected by `key_id` from `peer`.
    pub fn mark_active(&mut self, key_id: KeyId, peer: NodeId) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.matches(key_id, peer)) {
            entry.recently_active = true;
        }
    }

    /// True while any unreserved entry waits for an idle sweep.
    pub fn has_idle_candidates(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.remove_on_idle && e.reserve_count == 0)
    }

    /// Remove idle candidates with no activity since the last sweep and
    /// clear the activity flag on the rest.
    pub fn sweep_idle(&mut self) -> Vec<SessionKey> {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            let entry = &mut self.entries[i];
            if !entry.remove_on_idle || entry.reserve_count > 0 {
                i += 1;
                continue;
            }
            if entry.recently_active {
                entry.recently_active = false;
                i += 1;
                continue;
            }
            removed.push(self.entries.swap_remove(i));
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "idle sweep removed session keys");
        }
        removed
    }
}

/// A counted hold on a session key.
///
/// The hold is given up when the guard is dropped or released. Guards must
/// not be dropped while the table lock is held.
pub struct KeyReservation {
    table: Weak<Mutex<SessionKeyTable>>,
    slot: KeySlot,
    released: bool,
}

impl KeyReservation {
    /// Wrap a reservation already counted in the table.
    pub(crate) fn adopt(table: &SharedKeyTable, slot: KeySlot) -> Self {
        Self {
            table: Arc::downgrade(table),
            slot,
            released: false,
        }
    }

    pub fn key_id(&self) -> KeyId {
        self.slot.key_id
    }

    /// The entry's own peer (the terminating node for a shared session).
    pub fn peer(&self) -> NodeId {
        self.slot.peer
    }

    pub fn slot(&self) -> KeySlot {
        self.slot
    }

    /// Give up the reservation now.
    pub fn release(mut self) {
        self.release_inner();
    }

    /// Remove the entry outright instead of releasing; returns true if it
    /// was still present.
    pub(crate) fn remove_key(mut self) -> bool {
        self.released = true;
        match self.table.upgrade() {
            Some(table) => table.lock().remove_slot(&self.slot).is_some(),
            None => false,
        }
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(table) = self.table.upgrade() {
            table.lock().release(&self.slot);
        }
    }
}

impl Drop for KeyReservation {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for KeyReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyReservation")
            .field("key_id", &self.slot.key_id)
            .field("peer", &self.slot.peer)
            .field("released", &self.released)
            .finish()
    }
}
