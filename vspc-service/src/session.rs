//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! The logical VM serial session
//!
//! A [`Session`] is the identity that survives reconnection and live
//! migration: at most one *active* transport sources and sinks its serial
//! bytes, at most one *pending peer* transport is staged during a vMotion,
//! and any number of observers subscribe to the byte stream.
//!
//! All session state lives behind a plain (non-async) mutex that is never
//! held across a suspension point, so every state-machine transition is
//! atomic with respect to every other task. Serial delivery happens under
//! the same lock, which makes it the single egress ordering point: bytes
//! fanned out before a migration handoff are visible to subscribers before
//! any byte from the successor connection.

use crate::connection::ConnectionHandle;
use crate::error::VspcError;
use crate::types::{ConnectionId, PortId, VmUuid};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vspc_telnetcodec::admin::AccessMode;

/// Migration state of a session, as visible between transitions.
///
/// `SrcBegun`, `Completing` and `Aborted` only occur inside a single
/// critical section; other tasks can never observe them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// No migration in progress.
    Idle,
    /// A `VMOTION-BEGIN` is being arbitrated.
    SrcBegun,
    /// `VMOTION-GOAHEAD` has been issued; waiting for the destination.
    SrcGoaheadSent,
    /// A destination presented valid credentials and holds the peer slot.
    DstPeerAccepted,
    /// A `VMOTION-COMPLETE` handoff is being applied.
    Completing,
    /// A migration is being torn down.
    Aborted,
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationState::Idle => write!(f, "IDLE"),
            MigrationState::SrcBegun => write!(f, "SRC-BEGUN"),
            MigrationState::SrcGoaheadSent => write!(f, "SRC-GOAHEAD-SENT"),
            MigrationState::DstPeerAccepted => write!(f, "DST-PEER-ACCEPTED"),
            MigrationState::Completing => write!(f, "COMPLETING"),
            MigrationState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// A pending migration's identity. The id is the opaque sequence from
/// `VMOTION-BEGIN`; the generation guards timer tasks against acting on a
/// later migration that reuses the same id.
#[derive(Debug, Clone)]
pub(crate) struct Migration {
    pub id: Bytes,
    pub secret: u64,
    pub generation: u64,
}

/// A migration that was still pending when a new `VMOTION-BEGIN` replaced
/// it.
pub(crate) struct ReplacedMigration {
    pub migration: Migration,
    pub pending_peer: Option<ConnectionHandle>,
}

/// Result of a `VMOTION-COMPLETE` request.
pub(crate) enum HandoffOutcome {
    /// The pending peer is now active. The superseded connection (if the
    /// source was still attached) must be closed by the caller, and the
    /// migration id unregistered.
    Completed {
        superseded: Option<ConnectionHandle>,
        migration_id: Bytes,
    },
    /// The request did not come from the pending peer; logged and ignored.
    Ignored,
}

/// What a closing connection meant to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClosedTransition {
    /// The active transport dropped; the session is now unattached.
    WasActive,
    /// The staged migration peer dropped; the migration reverts to
    /// `SRC-GOAHEAD-SENT` and another peer may still rendezvous.
    WasPendingPeer,
    /// The connection was already superseded or never attached.
    Orphaned,
}

/// A successful migration abort.
pub(crate) struct AbortedMigration {
    pub migration_id: Bytes,
    pub pending_peer: Option<ConnectionHandle>,
}

/// Everything an observer needs after attaching as a subscriber.
pub struct SubscriberAttachment {
    /// Identifier for later detach.
    pub id: u64,
    /// Serial byte stream, scrollback first.
    pub rx: mpsc::UnboundedReceiver<Bytes>,
    /// Outstanding-byte counter shared with the fan-out; the consumer
    /// decrements it as bytes are written out.
    pub queued: Arc<AtomicUsize>,
    /// Whether input from this subscriber is forwarded to the VM.
    pub write_ok: bool,
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
    queued: Arc<AtomicUsize>,
    queue_cap: usize,
    mode: AccessMode,
    write_ok: bool,
}

/// Bounded ring of the most recent serial output, replayed to late
/// joiners.
struct Scrollback {
    buf: VecDeque<u8>,
    cap: usize,
}

impl Scrollback {
    fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.min(4096)),
            cap,
        }
    }

    fn push(&mut self, data: &[u8]) {
        if self.cap == 0 {
            return;
        }
        if data.len() >= self.cap {
            self.buf.clear();
            self.buf.extend(&data[data.len() - self.cap..]);
            return;
        }
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend(data);
    }

    fn contents(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.buf.len());
        let (front, back) = self.buf.as_slices();
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        out.freeze()
    }
}

struct SessionInner {
    vm_name: Option<String>,
    vm_bios_uuid: Option<String>,
    vm_location: Option<String>,
    port_label: Option<String>,
    active: Option<ConnectionHandle>,
    pending_peer: Option<ConnectionHandle>,
    migration: Option<Migration>,
    state: MigrationState,
    generation: u64,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
    scrollback: Scrollback,
    last_activity: Instant,
}

/// The logical VM. See the module documentation for the concurrency
/// contract.
pub struct Session {
    uuid: VmUuid,
    created_at: Instant,
    inner: Mutex<SessionInner>,
}

impl Session {
    /// Creates a session for a newly observed VM identity.
    pub fn new(uuid: VmUuid, scrollback_bytes: usize) -> Self {
        Self {
            uuid,
            created_at: Instant::now(),
            inner: Mutex::new(SessionInner {
                vm_name: None,
                vm_bios_uuid: None,
                vm_location: None,
                port_label: None,
                active: None,
                pending_peer: None,
                migration: None,
                state: MigrationState::Idle,
                generation: 0,
                subscribers: Vec::new(),
                next_subscriber_id: 1,
                scrollback: Scrollback::new(scrollback_bytes),
                last_activity: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        // A poisoned session mutex means a panic mid-transition; there is
        // no sane recovery, so propagate the panic.
        self.inner.lock().expect("session state poisoned")
    }

    /// The VM identity this session belongs to.
    pub fn uuid(&self) -> &VmUuid {
        &self.uuid
    }

    /// When the session was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// The identifier this port is published under.
    pub fn port_id(&self) -> PortId {
        let inner = self.lock();
        PortId::new(self.uuid.clone(), inner.port_label.clone())
    }

    /// The VM's display name, once learned.
    pub fn vm_name(&self) -> Option<String> {
        self.lock().vm_name.clone()
    }

    /// Current migration state.
    pub fn migration_state(&self) -> MigrationState {
        self.lock().state
    }

    /// Whether an active transport is attached.
    pub fn has_active(&self) -> bool {
        self.lock().active.is_some()
    }

    /// The active transport's id, if any.
    pub fn active_id(&self) -> Option<ConnectionId> {
        self.lock().active.as_ref().map(ConnectionHandle::id)
    }

    /// Whether a migration peer is staged.
    pub fn has_pending_peer(&self) -> bool {
        self.lock().pending_peer.is_some()
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Marks activity for the idle-grace reaper.
    pub fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    /// Whether the idle-grace reaper may destroy this session.
    pub fn is_reapable(&self, grace: Duration) -> bool {
        let inner = self.lock();
        inner.active.is_none()
            && inner.pending_peer.is_none()
            && inner.migration.is_none()
            && inner.last_activity.elapsed() >= grace
    }

    // =========== Metadata enrichment ===========

    /// Records the VM name. First writer wins; later differing values are
    /// logged and ignored.
    pub fn set_vm_name(&self, name: &str) {
        let mut inner = self.lock();
        match &inner.vm_name {
            None => {
                info!(uuid = %self.uuid, name, "VM name learned");
                inner.vm_name = Some(name.to_owned());
            }
            Some(existing) if existing != name => {
                debug!(uuid = %self.uuid, existing, name, "Ignoring changed VM name");
            }
            Some(_) => {}
        }
    }

    /// Records the VM BIOS UUID.
    pub fn set_vm_bios_uuid(&self, value: &str) {
        self.lock().vm_bios_uuid.get_or_insert_with(|| value.to_owned());
    }

    /// Records the VM location URI. Updated on every report; it changes
    /// when the VM moves hosts.
    pub fn set_vm_location(&self, value: &str) {
        self.lock().vm_location = Some(value.to_owned());
    }

    /// Records the proxy port label.
    pub fn set_port_label(&self, value: &str) {
        self.lock().port_label.get_or_insert_with(|| value.to_owned());
    }

    // =========== Connection attachment ===========

    /// Attaches `handle` as the active transport outside of any migration
    /// (first connection, or a VM reconnecting after a crash). Returns the
    /// superseded transport, which the caller must close.
    pub(crate) fn attach_active(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut inner = self.lock();
        inner.last_activity = Instant::now();
        let superseded = inner.active.replace(handle);
        if let Some(old) = &superseded {
            warn!(
                uuid = %self.uuid,
                old = %old.id(),
                "New connection supersedes the current transport"
            );
        }
        superseded
    }

    /// The session has lost the given transport. Returns what the loss
    /// meant so the caller can log and update registrations.
    pub(crate) fn connection_closed(&self, id: ConnectionId) -> ClosedTransition {
        let mut inner = self.lock();
        if inner.active.as_ref().map(ConnectionHandle::id) == Some(id) {
            inner.active = None;
            inner.last_activity = Instant::now();
            // A migration registration, if any, stays alive: the
            // destination may still rendezvous within its window.
            return ClosedTransition::WasActive;
        }
        if inner.pending_peer.as_ref().map(ConnectionHandle::id) == Some(id) {
            inner.pending_peer = None;
            if inner.state == MigrationState::DstPeerAccepted {
                inner.state = MigrationState::SrcGoaheadSent;
            }
            return ClosedTransition::WasPendingPeer;
        }
        ClosedTransition::Orphaned
    }

    // =========== Serial data path ===========

    /// Delivers serial bytes decoded from connection `from`.
    ///
    /// Only the active transport may source data; bytes from a superseded
    /// or staged connection are rejected so that subscribers observe one
    /// contiguous stream across a handoff. Returns `true` when delivered.
    pub fn deliver_serial(&self, from: ConnectionId, data: &Bytes) -> bool {
        let mut inner = self.lock();
        if inner.active.as_ref().map(ConnectionHandle::id) != Some(from) {
            warn!(
                uuid = %self.uuid,
                from = %from,
                "Dropping serial data from a connection that is not active"
            );
            return false;
        }
        inner.last_activity = Instant::now();
        inner.scrollback.push(data);

        let mut dropped = Vec::new();
        for (index, subscriber) in inner.subscribers.iter().enumerate() {
            let outstanding = subscriber.queued.load(Ordering::Acquire);
            if outstanding + data.len() > subscriber.queue_cap {
                warn!(
                    uuid = %self.uuid,
                    subscriber = subscriber.id,
                    outstanding,
                    "Subscriber queue overflow; disconnecting subscriber"
                );
                dropped.push(index);
                continue;
            }
            subscriber.queued.fetch_add(data.len(), Ordering::AcqRel);
            if subscriber.tx.send(data.clone()).is_err() {
                dropped.push(index);
            }
        }
        for index in dropped.into_iter().rev() {
            inner.subscribers.swap_remove(index);
        }
        true
    }

    /// Forwards observer input to the VM. Returns `false` when there is no
    /// active transport or its writer refused the bytes.
    pub fn write_to_vm(&self, data: Bytes) -> bool {
        let inner = self.lock();
        match &inner.active {
            Some(active) => active.send_data(data),
            None => false,
        }
    }

    // =========== Subscribers ===========

    /// Attaches a subscriber under the requested access mode. The
    /// attachment's channel is pre-loaded with the scrollback contents so
    /// a late joiner sees recent output before live data.
    pub fn add_subscriber(
        &self,
        mode: AccessMode,
        queue_cap: usize,
    ) -> Result<SubscriberAttachment, VspcError> {
        let mut inner = self.lock();
        let write_ok = Self::arbitrate_access(&inner.subscribers, mode)?;

        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));

        let replay = inner.scrollback.contents();
        if !replay.is_empty() {
            queued.fetch_add(replay.len(), Ordering::AcqRel);
            // The receiver is in hand; this send cannot fail.
            let _ = tx.send(replay);
        }

        inner.subscribers.push(Subscriber {
            id,
            tx,
            queued: queued.clone(),
            queue_cap,
            mode,
            write_ok,
        });
        debug!(uuid = %self.uuid, subscriber = id, ?mode, write_ok, "Subscriber attached");
        Ok(SubscriberAttachment {
            id,
            rx,
            queued,
            write_ok,
        })
    }

    /// Detaches a subscriber. Unknown ids are ignored (the subscriber may
    /// already have been dropped for overflow).
    pub fn remove_subscriber(&self, id: u64) {
        let mut inner = self.lock();
        inner.subscribers.retain(|subscriber| subscriber.id != id);
    }

    /// Applies the access-mode arbitration rules against the present
    /// subscriber set. Returns whether the new subscriber may write.
    fn arbitrate_access(subscribers: &[Subscriber], mode: AccessMode) -> Result<bool, VspcError> {
        if subscribers
            .iter()
            .any(|s| s.mode == AccessMode::Exclusive)
        {
            return Err(VspcError::AccessDenied(
                "another client has exclusive access to this port".into(),
            ));
        }
        let mut write_ok = mode != AccessMode::ReadOnly;
        if subscribers
            .iter()
            .any(|s| s.mode == AccessMode::ExclusiveWrite)
        {
            match mode {
                AccessMode::ReadOnlyOk => write_ok = false,
                AccessMode::ReadOnly => {}
                _ => {
                    return Err(VspcError::AccessDenied(
                        "another client has exclusive write access to this port".into(),
                    ));
                }
            }
        }
        match mode {
            AccessMode::Exclusive if !subscribers.is_empty() => {
                return Err(VspcError::AccessDenied(
                    "exclusive access was requested but another client has access to this port"
                        .into(),
                ));
            }
            AccessMode::ExclusiveWrite if subscribers.iter().any(|s| s.write_ok) => {
                return Err(VspcError::AccessDenied(
                    "exclusive write access was requested but another client has write access"
                        .into(),
                ));
            }
            _ => {}
        }
        Ok(write_ok)
    }

    // =========== Migration state machine ===========

    /// Installs a fresh migration after a `VMOTION-BEGIN` was accepted.
    /// Returns the new migration generation and, when a prior migration
    /// was still pending, its remains for the caller to unregister
    /// (the source should have sent `VMOTION-ABORT` but did not).
    pub(crate) fn set_migration(&self, id: Bytes, secret: u64) -> (u64, Option<ReplacedMigration>) {
        let mut inner = self.lock();
        inner.state = MigrationState::SrcBegun;
        let replaced = inner.migration.take().map(|migration| {
            warn!(
                uuid = %self.uuid,
                "A prior vMotion did not complete; replacing it"
            );
            ReplacedMigration {
                migration,
                pending_peer: inner.pending_peer.take(),
            }
        });
        inner.generation += 1;
        let generation = inner.generation;
        inner.migration = Some(Migration {
            id,
            secret,
            generation,
        });
        inner.state = MigrationState::SrcGoaheadSent;
        (generation, replaced)
    }

    /// Stages `handle` as the migration peer if the id matches an
    /// outstanding `GOAHEAD` and no peer is staged yet. Returns the
    /// migration generation on success.
    pub(crate) fn accept_peer(&self, handle: ConnectionHandle, id: &Bytes) -> Option<u64> {
        let mut inner = self.lock();
        if inner.state != MigrationState::SrcGoaheadSent || inner.pending_peer.is_some() {
            return None;
        }
        let generation = match &inner.migration {
            Some(migration) if migration.id == *id => migration.generation,
            _ => return None,
        };
        inner.pending_peer = Some(handle);
        inner.state = MigrationState::DstPeerAccepted;
        Some(generation)
    }

    /// Applies the handoff on `VMOTION-COMPLETE` from connection `from`.
    ///
    /// The swap, the state reset, and the loss of the superseded
    /// transport's delivery rights all happen inside one critical section,
    /// so subscribers can never observe an intermediate state.
    pub(crate) fn complete_handoff(&self, from: ConnectionId) -> HandoffOutcome {
        let mut inner = self.lock();
        if inner.state != MigrationState::DstPeerAccepted
            || inner.pending_peer.as_ref().map(ConnectionHandle::id) != Some(from)
        {
            return HandoffOutcome::Ignored;
        }
        inner.state = MigrationState::Completing;
        let peer = inner.pending_peer.take();
        let superseded = std::mem::replace(&mut inner.active, peer);
        let migration_id = inner
            .migration
            .take()
            .map(|migration| migration.id)
            .unwrap_or_default();
        inner.generation += 1;
        inner.state = MigrationState::Idle;
        inner.last_activity = Instant::now();
        info!(uuid = %self.uuid, new_active = %from, "vMotion handoff complete");
        HandoffOutcome::Completed {
            superseded,
            migration_id,
        }
    }

    /// Tears the migration down on `VMOTION-ABORT` from connection `from`.
    /// Only the source (active) connection may abort; a carried id, when
    /// present, must match. Returns the migration remains on success.
    pub(crate) fn abort_migration(
        &self,
        from: ConnectionId,
        wire_id: Option<&Bytes>,
    ) -> Option<AbortedMigration> {
        let mut inner = self.lock();
        if inner.active.as_ref().map(ConnectionHandle::id) != Some(from) {
            debug!(uuid = %self.uuid, from = %from, "Ignoring VMOTION-ABORT from a non-active connection");
            return None;
        }
        let migration = inner.migration.as_ref()?;
        if let Some(wire_id) = wire_id {
            if *wire_id != migration.id {
                debug!(uuid = %self.uuid, "Ignoring VMOTION-ABORT with a stale migration id");
                return None;
            }
        }
        inner.state = MigrationState::Aborted;
        let migration = inner.migration.take()?;
        let pending_peer = inner.pending_peer.take();
        inner.generation += 1;
        inner.state = MigrationState::Idle;
        Some(AbortedMigration {
            migration_id: migration.id,
            pending_peer,
        })
    }

    /// Expires a migration the destination never claimed. Guarded by the
    /// generation captured when the `GOAHEAD` was issued.
    pub(crate) fn expire_goahead(
        &self,
        generation: u64,
    ) -> Option<(Bytes, Option<ConnectionHandle>)> {
        let mut inner = self.lock();
        match &inner.migration {
            Some(migration)
                if migration.generation == generation
                    && inner.state == MigrationState::SrcGoaheadSent =>
            {
                let migration = inner.migration.take()?;
                inner.generation += 1;
                inner.state = MigrationState::Idle;
                Some((migration.id, inner.active.clone()))
            }
            _ => None,
        }
    }

    /// Expires a claimed migration whose `VMOTION-COMPLETE` never arrived.
    /// The staged peer is returned for closing; the source stays active.
    pub(crate) fn expire_complete(
        &self,
        generation: u64,
    ) -> Option<(Bytes, Option<ConnectionHandle>)> {
        let mut inner = self.lock();
        match &inner.migration {
            Some(migration)
                if migration.generation == generation
                    && inner.state == MigrationState::DstPeerAccepted =>
            {
                let migration = inner.migration.take()?;
                let peer = inner.pending_peer.take();
                inner.generation += 1;
                inner.state = MigrationState::Idle;
                Some((migration.id, peer))
            }
            _ => None,
        }
    }

    /// The current migration's generation, used to re-arm expiry timers.
    pub(crate) fn migration_generation(&self) -> Option<u64> {
        self.lock().migration.as_ref().map(|m| m.generation)
    }

    /// Closes every transport and drops every subscriber; used at server
    /// shutdown.
    pub(crate) fn close_all(&self) {
        let mut inner = self.lock();
        if let Some(active) = inner.active.take() {
            active.close();
        }
        if let Some(peer) = inner.pending_peer.take() {
            peer.close();
        }
        inner.subscribers.clear();
        inner.migration = None;
        inner.state = MigrationState::Idle;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Session")
            .field("uuid", &self.uuid)
            .field("vm_name", &inner.vm_name)
            .field("state", &inner.state)
            .field("active", &inner.active.as_ref().map(ConnectionHandle::id))
            .field(
                "pending_peer",
                &inner.pending_peer.as_ref().map(ConnectionHandle::id),
            )
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHandle;

    fn test_uuid() -> VmUuid {
        VmUuid::parse("4213f5a6-95b0-1f70-0d5e-7caeb0a6b0ae").unwrap()
    }

    fn handle(id: u64) -> ConnectionHandle {
        let (handle, rx, _token) = ConnectionHandle::channel(ConnectionId::new(id));
        // Keep the writer end alive for the duration of the test.
        std::mem::forget(rx);
        handle
    }

    fn session() -> Session {
        Session::new(test_uuid(), 1024)
    }

    #[test]
    fn test_attach_and_supersede() {
        let session = session();
        assert!(session.attach_active(handle(1)).is_none());
        let superseded = session.attach_active(handle(2));
        assert_eq!(
            superseded.map(|h| h.id()),
            Some(ConnectionId::new(1)),
            "second attach must supersede the first"
        );
        assert_eq!(session.active_id(), Some(ConnectionId::new(2)));
    }

    #[tokio::test]
    async fn test_fanout_and_scrollback_replay() {
        let session = session();
        session.attach_active(handle(1));

        // First subscriber sees live data.
        let mut early = session.add_subscriber(AccessMode::ReadWrite, 4096).unwrap();
        assert!(session.deliver_serial(ConnectionId::new(1), &Bytes::from_static(b"hello ")));
        assert!(session.deliver_serial(ConnectionId::new(1), &Bytes::from_static(b"world")));
        assert_eq!(early.rx.try_recv().unwrap(), Bytes::from_static(b"hello "));
        assert_eq!(early.rx.try_recv().unwrap(), Bytes::from_static(b"world"));

        // Late joiner gets the scrollback first.
        let mut late = session.add_subscriber(AccessMode::ReadOnly, 4096).unwrap();
        assert_eq!(late.rx.try_recv().unwrap(), Bytes::from_static(b"hello world"));
        assert!(!late.write_ok);
    }

    #[test]
    fn test_scrollback_ring_caps() {
        let session = Session::new(test_uuid(), 8);
        session.attach_active(handle(1));
        session.deliver_serial(ConnectionId::new(1), &Bytes::from_static(b"0123456789"));
        session.deliver_serial(ConnectionId::new(1), &Bytes::from_static(b"AB"));
        let mut sub = session.add_subscriber(AccessMode::ReadOnly, 4096).unwrap();
        assert_eq!(sub.rx.try_recv().unwrap(), Bytes::from_static(b"456789AB"));
    }

    #[test]
    fn test_slow_subscriber_is_disconnected() {
        let session = session();
        session.attach_active(handle(1));
        let attachment = session.add_subscriber(AccessMode::ReadWrite, 8).unwrap();
        assert_eq!(session.subscriber_count(), 1);

        // Nothing drains `queued`, so the second chunk overflows the cap.
        assert!(session.deliver_serial(ConnectionId::new(1), &Bytes::from_static(b"123456")));
        assert!(session.deliver_serial(ConnectionId::new(1), &Bytes::from_static(b"7890")));
        assert_eq!(session.subscriber_count(), 0);
        drop(attachment);

        // The serial path itself is unaffected.
        assert!(session.deliver_serial(ConnectionId::new(1), &Bytes::from_static(b"x")));
    }

    #[test]
    fn test_serial_rejected_from_non_active() {
        let session = session();
        session.attach_active(handle(1));
        assert!(!session.deliver_serial(ConnectionId::new(9), &Bytes::from_static(b"ghost")));
    }

    #[test]
    fn test_access_arbitration() {
        let session = session();

        let _rw = session.add_subscriber(AccessMode::ReadWrite, 64).unwrap();
        // Exclusive cannot join an occupied port.
        assert!(session.add_subscriber(AccessMode::Exclusive, 64).is_err());
        // Exclusive-write cannot join while a writer exists.
        assert!(session.add_subscriber(AccessMode::ExclusiveWrite, 64).is_err());
        // Plain read-only is fine.
        let _ro = session.add_subscriber(AccessMode::ReadOnly, 64).unwrap();
    }

    #[test]
    fn test_readonly_ok_downgrades_under_exclusive_writer() {
        let session = session();
        let _writer = session
            .add_subscriber(AccessMode::ExclusiveWrite, 64)
            .unwrap();
        let downgraded = session.add_subscriber(AccessMode::ReadOnlyOk, 64).unwrap();
        assert!(!downgraded.write_ok);
        // A plain read-write attach is refused.
        assert!(session.add_subscriber(AccessMode::ReadWrite, 64).is_err());
    }

    #[test]
    fn test_migration_lifecycle() {
        let session = session();
        session.attach_active(handle(1));
        assert_eq!(session.migration_state(), MigrationState::Idle);

        let id = Bytes::from_static(&[0x01]);
        let (generation, replaced) = session.set_migration(id.clone(), 7);
        assert!(replaced.is_none());
        assert_eq!(session.migration_state(), MigrationState::SrcGoaheadSent);

        // Peer with the wrong id is refused.
        assert!(session
            .accept_peer(handle(2), &Bytes::from_static(&[0x02]))
            .is_none());
        // Peer with the right id is staged.
        assert_eq!(session.accept_peer(handle(2), &id), Some(generation));
        assert_eq!(session.migration_state(), MigrationState::DstPeerAccepted);
        // A second peer cannot claim the slot.
        assert!(session.accept_peer(handle(3), &id).is_none());

        // COMPLETE from the source is ignored.
        assert!(matches!(
            session.complete_handoff(ConnectionId::new(1)),
            HandoffOutcome::Ignored
        ));

        // COMPLETE from the peer applies the handoff.
        match session.complete_handoff(ConnectionId::new(2)) {
            HandoffOutcome::Completed {
                superseded,
                migration_id,
            } => {
                assert_eq!(superseded.map(|h| h.id()), Some(ConnectionId::new(1)));
                assert_eq!(migration_id, id);
            }
            HandoffOutcome::Ignored => panic!("handoff should have completed"),
        }
        assert_eq!(session.migration_state(), MigrationState::Idle);
        assert_eq!(session.active_id(), Some(ConnectionId::new(2)));
        assert!(!session.has_pending_peer());

        // A duplicate COMPLETE is idempotent.
        assert!(matches!(
            session.complete_handoff(ConnectionId::new(2)),
            HandoffOutcome::Ignored
        ));
    }

    #[test]
    fn test_splice_ordering_across_handoff() {
        let session = session();
        session.attach_active(handle(1));
        let mut sub = session.add_subscriber(AccessMode::ReadOnly, 4096).unwrap();

        let id = Bytes::from_static(&[0x01]);
        session.set_migration(id.clone(), 1);
        session.accept_peer(handle(2), &id);

        session.deliver_serial(ConnectionId::new(1), &Bytes::from_static(b"old1 "));
        session.complete_handoff(ConnectionId::new(2));
        // Late bytes from the superseded source are discarded.
        assert!(!session.deliver_serial(ConnectionId::new(1), &Bytes::from_static(b"STRAGGLER")));
        session.deliver_serial(ConnectionId::new(2), &Bytes::from_static(b"new1"));

        let mut seen = Vec::new();
        while let Ok(chunk) = sub.rx.try_recv() {
            seen.extend_from_slice(&chunk);
        }
        assert_eq!(seen, b"old1 new1");
    }

    #[test]
    fn test_abort_only_from_source() {
        let session = session();
        session.attach_active(handle(1));
        let id = Bytes::from_static(&[0x05]);
        session.set_migration(id.clone(), 2);
        session.accept_peer(handle(2), &id);

        // The staged peer may not abort.
        assert!(session.abort_migration(ConnectionId::new(2), None).is_none());
        // A mismatched id is ignored.
        assert!(session
            .abort_migration(ConnectionId::new(1), Some(&Bytes::from_static(&[0x09])))
            .is_none());
        // The bare form from the source works.
        let aborted = session.abort_migration(ConnectionId::new(1), None).unwrap();
        assert_eq!(aborted.migration_id, id);
        assert!(aborted.pending_peer.is_some());
        assert_eq!(session.migration_state(), MigrationState::Idle);
        assert_eq!(session.active_id(), Some(ConnectionId::new(1)));
    }

    #[test]
    fn test_peer_drop_reverts_to_goahead_sent() {
        let session = session();
        session.attach_active(handle(1));
        let id = Bytes::from_static(&[0x06]);
        session.set_migration(id.clone(), 3);
        session.accept_peer(handle(2), &id);

        assert_eq!(
            session.connection_closed(ConnectionId::new(2)),
            ClosedTransition::WasPendingPeer
        );
        assert_eq!(session.migration_state(), MigrationState::SrcGoaheadSent);

        // Another peer may still rendezvous.
        assert!(session.accept_peer(handle(3), &id).is_some());
    }

    #[test]
    fn test_source_drop_keeps_migration() {
        let session = session();
        session.attach_active(handle(1));
        let id = Bytes::from_static(&[0x07]);
        let (generation, _) = session.set_migration(id.clone(), 4);

        assert_eq!(
            session.connection_closed(ConnectionId::new(1)),
            ClosedTransition::WasActive
        );
        // The rendezvous window stays open with no active transport.
        assert_eq!(session.migration_state(), MigrationState::SrcGoaheadSent);
        assert!(session.accept_peer(handle(2), &id).is_some());
        match session.complete_handoff(ConnectionId::new(2)) {
            HandoffOutcome::Completed { superseded, .. } => assert!(superseded.is_none()),
            HandoffOutcome::Ignored => panic!("handoff should have completed"),
        }
        let _ = generation;
    }

    #[test]
    fn test_expiry_generation_guard() {
        let session = session();
        session.attach_active(handle(1));
        let (stale_generation, _) = session.set_migration(Bytes::from_static(&[0x01]), 5);
        // A replacement BEGIN supersedes the first migration.
        let (_, replaced) = session.set_migration(Bytes::from_static(&[0x02]), 6);
        assert!(replaced.is_some());

        // The stale timer must not touch the new migration.
        assert!(session.expire_goahead(stale_generation).is_none());
        assert_eq!(session.migration_state(), MigrationState::SrcGoaheadSent);
    }

    #[test]
    fn test_reapable_only_when_fully_idle() {
        let session = session();
        assert!(session.is_reapable(Duration::ZERO));
        session.attach_active(handle(1));
        assert!(!session.is_reapable(Duration::ZERO));
        session.connection_closed(ConnectionId::new(1));
        assert!(session.is_reapable(Duration::ZERO));
        assert!(!session.is_reapable(Duration::from_secs(3600)));
    }
}
