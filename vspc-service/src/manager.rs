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

//! Session manager
//!
//! The `SessionManager` is the only process-wide structure. It owns:
//!
//! - the registry mapping VM identities to their [`Session`]s, and
//! - the pending-migration map keyed by migration id, through which a
//!   source's `VMOTION-BEGIN` and a destination's `VMOTION-PEER` meet.
//!
//! The rendezvous — lookup, secret comparison, and peer attachment — runs
//! in a single critical section of the migration map's mutex, with session
//! state always locked *inside* that section (never the other way around),
//! so no interleaving of two connections can double-grant a migration.

use crate::config::VspcConfig;
use crate::connection::ConnectionHandle;
use crate::metrics::VspcMetrics;
use crate::session::{ClosedTransition, HandoffOutcome, Session};
use crate::types::{ConnectionId, VmUuid};
use bytes::Bytes;
use dashmap::DashMap;
use rand::RngCore;
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vspc_telnetcodec::{TelnetFrame, TelnetArgument, vmware::VmwareExtMessage};

/// A migration awaiting its destination peer.
struct PendingMigration {
    uuid: VmUuid,
    secret: u64,
    registered_at: Instant,
}

/// Process-wide registry of sessions and pending migrations.
pub struct SessionManager {
    config: Arc<VspcConfig>,
    metrics: Arc<VspcMetrics>,
    sessions: DashMap<VmUuid, Arc<Session>>,
    migrations: Mutex<HashMap<Bytes, PendingMigration>>,
}

impl SessionManager {
    /// Creates an empty manager.
    pub fn new(config: Arc<VspcConfig>, metrics: Arc<VspcMetrics>) -> Self {
        Self {
            config,
            metrics,
            sessions: DashMap::new(),
            migrations: Mutex::new(HashMap::new()),
        }
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &Arc<VspcConfig> {
        &self.config
    }

    /// The shared metrics sink.
    pub fn metrics(&self) -> &Arc<VspcMetrics> {
        &self.metrics
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of migrations awaiting a peer.
    pub fn pending_migration_count(&self) -> usize {
        self.migrations_lock().len()
    }

    fn migrations_lock(&self) -> MutexGuard<'_, HashMap<Bytes, PendingMigration>> {
        self.migrations.lock().expect("migration map poisoned")
    }

    /// Looks up the session for a VM identity, creating it on first
    /// observation.
    pub fn resolve_session(&self, uuid: &VmUuid) -> Arc<Session> {
        self.sessions
            .entry(uuid.clone())
            .or_insert_with(|| {
                self.metrics.session_created();
                info!(%uuid, "New VM port");
                Arc::new(Session::new(uuid.clone(), self.config.scrollback_bytes))
            })
            .clone()
    }

    /// Looks up an existing session without creating one.
    pub fn get_session(&self, uuid: &VmUuid) -> Option<Arc<Session>> {
        self.sessions.get(uuid).map(|entry| entry.clone())
    }

    // =========== vMotion rendezvous ===========

    /// Arbitrates a `VMOTION-BEGIN` from the session's source connection.
    ///
    /// On acceptance a fresh secret is generated, `id → session` is
    /// registered for the destination to find, the goahead expiry timer is
    /// armed, and the secret is returned for the `GOAHEAD` reply. `None`
    /// means the caller must answer `VMOTION-NOTNOW`.
    pub fn begin_vmotion(self: &Arc<Self>, session: &Arc<Session>, id: Bytes) -> Option<u64> {
        self.metrics.vmotion_begin();
        if !self.config.migrations_enabled {
            info!(uuid = %session.uuid(), "Refusing vMotion; migrations are disabled");
            return None;
        }

        let secret = OsRng.next_u64();

        let mut migrations = self.migrations_lock();
        let (generation, replaced) = session.set_migration(id.clone(), secret);
        if let Some(replaced) = replaced {
            migrations.remove(&replaced.migration.id);
            if let Some(peer) = replaced.pending_peer {
                peer.close();
            }
            self.metrics.vmotion_abandon();
        }
        migrations.insert(
            id.clone(),
            PendingMigration {
                uuid: session.uuid().clone(),
                secret,
                registered_at: Instant::now(),
            },
        );
        drop(migrations);

        self.arm_goahead_expiry(session, generation);
        Some(secret)
    }

    /// Attempts the destination-side rendezvous for a `VMOTION-PEER`.
    ///
    /// The id must name a registered migration, the secret must match, and
    /// the session must still be waiting for a peer. On success the
    /// connection is staged as the pending peer, the completion timer is
    /// armed, and the session is returned so the caller can emit
    /// `PEER-OK`. On any failure nothing is emitted (the protocol defines
    /// no error reply) and `None` is returned.
    pub fn claim_peer(
        self: &Arc<Self>,
        id: &Bytes,
        secret: u64,
        handle: ConnectionHandle,
    ) -> Option<Arc<Session>> {
        self.metrics.vmotion_peer();
        let migrations = self.migrations_lock();
        let Some(entry) = migrations.get(id) else {
            warn!("vMotion peer presented an unknown migration id");
            return None;
        };
        if entry.secret != secret {
            warn!(uuid = %entry.uuid, "vMotion peer presented a bad secret");
            return None;
        }
        let waited = entry.registered_at.elapsed();
        let Some(session) = self.sessions.get(&entry.uuid).map(|s| s.clone()) else {
            warn!(uuid = %entry.uuid, "vMotion registration outlived its session");
            return None;
        };
        let Some(generation) = session.accept_peer(handle, id) else {
            warn!(uuid = %entry.uuid, "vMotion peer arrived in the wrong state");
            return None;
        };
        drop(migrations);
        debug!(uuid = %session.uuid(), waited_ms = waited.as_millis() as u64, "vMotion rendezvous");

        self.arm_complete_expiry(&session, generation);
        Some(session)
    }

    /// Applies a `VMOTION-COMPLETE` from connection `from`. Returns `true`
    /// when the handoff took effect.
    pub fn complete_vmotion(&self, session: &Arc<Session>, from: ConnectionId) -> bool {
        let mut migrations = self.migrations_lock();
        match session.complete_handoff(from) {
            HandoffOutcome::Completed {
                superseded,
                migration_id,
            } => {
                migrations.remove(&migration_id);
                drop(migrations);
                self.metrics.vmotion_complete();
                if let Some(old) = superseded {
                    old.close();
                }
                true
            }
            HandoffOutcome::Ignored => {
                debug!(
                    uuid = %session.uuid(),
                    from = %from,
                    "Ignoring duplicate or misdirected VMOTION-COMPLETE"
                );
                false
            }
        }
    }

    /// Applies a `VMOTION-ABORT` from connection `from`. The wire id, when
    /// carried, must match the pending migration.
    pub fn abort_vmotion(&self, session: &Arc<Session>, from: ConnectionId, wire_id: Option<Bytes>) {
        let mut migrations = self.migrations_lock();
        match session.abort_migration(from, wire_id.as_ref()) {
            Some(aborted) => {
                migrations.remove(&aborted.migration_id);
                drop(migrations);
                self.metrics.vmotion_abort();
                if let Some(peer) = aborted.pending_peer {
                    peer.close();
                }
                info!(uuid = %session.uuid(), "vMotion aborted by source");
            }
            None => {
                debug!(uuid = %session.uuid(), from = %from, "Ignoring VMOTION-ABORT");
            }
        }
    }

    /// Notifies the session that one of its transports closed, and re-arms
    /// the rendezvous window when a staged peer was lost.
    pub fn connection_closed(self: &Arc<Self>, session: &Arc<Session>, id: ConnectionId) {
        match session.connection_closed(id) {
            ClosedTransition::WasActive => {
                debug!(uuid = %session.uuid(), connection = %id, "Active transport lost");
            }
            ClosedTransition::WasPendingPeer => {
                debug!(
                    uuid = %session.uuid(),
                    connection = %id,
                    "Pending migration peer lost; rendezvous window reopened"
                );
                // The goahead timer may already have fired harmlessly while
                // the peer was staged; give the reopened window its own
                // deadline so the registration cannot leak.
                if let Some(generation) = session.migration_generation() {
                    self.arm_goahead_expiry(session, generation);
                }
            }
            ClosedTransition::Orphaned => {}
        }
    }

    fn arm_goahead_expiry(self: &Arc<Self>, session: &Arc<Session>, generation: u64) {
        let manager = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            tokio::time::sleep(manager.config.goahead_timeout).await;
            manager.expire_goahead(&session, generation);
        });
    }

    fn arm_complete_expiry(self: &Arc<Self>, session: &Arc<Session>, generation: u64) {
        let manager = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            tokio::time::sleep(manager.config.complete_timeout).await;
            manager.expire_complete(&session, generation);
        });
    }

    /// Expires a migration whose destination never claimed it. The source
    /// stays active and is told the migration is off.
    fn expire_goahead(&self, session: &Arc<Session>, generation: u64) {
        let mut migrations = self.migrations_lock();
        if let Some((id, active)) = session.expire_goahead(generation) {
            migrations.remove(&id);
            drop(migrations);
            warn!(uuid = %session.uuid(), "vMotion expired waiting for its peer");
            self.metrics.vmotion_abandon();
            if let Some(active) = active {
                active.send_frame(TelnetFrame::Subnegotiate(TelnetArgument::Vmware(
                    VmwareExtMessage::VmotionAbort(Some(id)),
                )));
            }
        }
    }

    /// Expires a claimed migration whose `COMPLETE` never arrived: the
    /// staged peer is dropped, the source remains active.
    fn expire_complete(&self, session: &Arc<Session>, generation: u64) {
        let mut migrations = self.migrations_lock();
        if let Some((id, peer)) = session.expire_complete(generation) {
            migrations.remove(&id);
            drop(migrations);
            warn!(uuid = %session.uuid(), "vMotion peer never completed; dropping it");
            self.metrics.vmotion_abandon();
            if let Some(peer) = peer {
                peer.close();
            }
        }
    }

    // =========== Port directory ===========

    /// The list of known VM ports, for observer clients.
    pub fn port_list(&self) -> Vec<vspc_telnetcodec::admin::PortListing> {
        self.sessions
            .iter()
            .map(|entry| vspc_telnetcodec::admin::PortListing {
                port_id: entry.port_id().to_string(),
                vm_name: entry.vm_name().unwrap_or_default(),
                listening_uri: String::new(),
            })
            .collect()
    }

    /// Resolves an observer's port identifier: an exact port id first,
    /// then a unique VM name.
    pub fn find_port(&self, port_id: &str) -> Option<Arc<Session>> {
        for entry in self.sessions.iter() {
            if entry.port_id().to_string() == port_id {
                return Some(entry.clone());
            }
        }
        let mut by_name = None;
        for entry in self.sessions.iter() {
            if entry.vm_name().as_deref() == Some(port_id) {
                if by_name.is_some() {
                    debug!(port_id, "VM name is ambiguous; refusing lookup");
                    return None;
                }
                by_name = Some(entry.clone());
            }
        }
        by_name
    }

    // =========== Lifecycle ===========

    /// Spawns the idle-grace reaper. Sessions are destroyed only here:
    /// once they have no active transport, no staged peer, no registered
    /// migration, and have been idle for the configured grace.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let tick = (manager.config.session_idle_grace / 4)
                .max(std::time::Duration::from_millis(50));
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                manager.reap_idle_sessions();
            }
        })
    }

    fn reap_idle_sessions(&self) {
        let grace = self.config.session_idle_grace;
        let reapable: Vec<VmUuid> = self
            .sessions
            .iter()
            .filter(|entry| entry.is_reapable(grace))
            .map(|entry| entry.uuid().clone())
            .collect();
        for uuid in reapable {
            // Re-check under the entry lock; a connection may have bound in
            // the meantime.
            if let Some((_, session)) =
                self.sessions.remove_if(&uuid, |_, session| session.is_reapable(grace))
            {
                info!(%uuid, "Session destroyed after idle grace");
                self.metrics.session_reaped();
                session.close_all();
            }
        }
    }

    /// Drains every session and forgets all state; used at server
    /// shutdown.
    pub fn shutdown(&self) {
        for entry in self.sessions.iter() {
            entry.close_all();
        }
        self.sessions.clear();
        self.migrations_lock().clear();
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.session_count())
            .field("pending_migrations", &self.pending_migration_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_manager(config: VspcConfig) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            Arc::new(config),
            Arc::new(VspcMetrics::new()),
        ))
    }

    fn test_uuid() -> VmUuid {
        VmUuid::parse("4213f5a6-95b0-1f70-0d5e-7caeb0a6b0ae").unwrap()
    }

    fn handle(id: u64) -> ConnectionHandle {
        let (handle, rx, _token) = ConnectionHandle::channel(ConnectionId::new(id));
        std::mem::forget(rx);
        handle
    }

    #[tokio::test]
    async fn test_resolve_session_is_idempotent() {
        let manager = test_manager(VspcConfig::default());
        let first = manager.resolve_session(&test_uuid());
        let second = manager.resolve_session(&test_uuid());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.session_count(), 1);
    }

    #[tokio::test]
    async fn test_rendezvous_happy_path() {
        let manager = test_manager(VspcConfig::default());
        let session = manager.resolve_session(&test_uuid());
        session.attach_active(handle(1));

        let id = Bytes::from_static(&[0x01]);
        let secret = manager.begin_vmotion(&session, id.clone()).unwrap();
        assert_eq!(manager.pending_migration_count(), 1);

        let claimed = manager.claim_peer(&id, secret, handle(2)).unwrap();
        assert!(Arc::ptr_eq(&claimed, &session));

        assert!(manager.complete_vmotion(&session, ConnectionId::new(2)));
        assert_eq!(manager.pending_migration_count(), 0);
        assert_eq!(session.active_id(), Some(ConnectionId::new(2)));
    }

    #[tokio::test]
    async fn test_wrong_secret_is_refused() {
        let manager = test_manager(VspcConfig::default());
        let session = manager.resolve_session(&test_uuid());
        session.attach_active(handle(1));

        let id = Bytes::from_static(&[0x01]);
        let secret = manager.begin_vmotion(&session, id.clone()).unwrap();
        let wrong = secret ^ 0xFF;

        assert!(manager.claim_peer(&id, wrong, handle(2)).is_none());
        assert!(!session.has_pending_peer());
        // The registration survives for the real peer.
        assert!(manager.claim_peer(&id, secret, handle(3)).is_some());
    }

    #[tokio::test]
    async fn test_unknown_id_is_refused() {
        let manager = test_manager(VspcConfig::default());
        let session = manager.resolve_session(&test_uuid());
        session.attach_active(handle(1));
        let secret = manager
            .begin_vmotion(&session, Bytes::from_static(&[0x01]))
            .unwrap();
        assert!(manager
            .claim_peer(&Bytes::from_static(&[0x99]), secret, handle(2))
            .is_none());
    }

    #[tokio::test]
    async fn test_migrations_disabled_refuses_begin() {
        let manager = test_manager(VspcConfig::default().with_migrations_enabled(false));
        let session = manager.resolve_session(&test_uuid());
        session.attach_active(handle(1));
        assert!(manager
            .begin_vmotion(&session, Bytes::from_static(&[0x02]))
            .is_none());
        assert_eq!(manager.pending_migration_count(), 0);
    }

    #[tokio::test]
    async fn test_secrets_are_not_repeated() {
        let manager = test_manager(VspcConfig::default());
        let session = manager.resolve_session(&test_uuid());
        session.attach_active(handle(1));
        let mut seen = std::collections::HashSet::new();
        for index in 0..16u8 {
            let secret = manager
                .begin_vmotion(&session, Bytes::copy_from_slice(&[index]))
                .unwrap();
            assert!(seen.insert(secret), "secret repeated");
        }
    }

    #[tokio::test]
    async fn test_goahead_expiry_returns_session_to_idle() {
        let config = VspcConfig::default().with_goahead_timeout(Duration::from_millis(50));
        let manager = test_manager(config);
        let session = manager.resolve_session(&test_uuid());
        session.attach_active(handle(1));

        manager
            .begin_vmotion(&session, Bytes::from_static(&[0x03]))
            .unwrap();
        assert_eq!(manager.pending_migration_count(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(manager.pending_migration_count(), 0);
        assert_eq!(
            session.migration_state(),
            crate::session::MigrationState::Idle
        );
        assert_eq!(session.active_id(), Some(ConnectionId::new(1)));
    }

    #[tokio::test]
    async fn test_complete_expiry_drops_peer_keeps_source() {
        let config = VspcConfig::default().with_complete_timeout(Duration::from_millis(50));
        let manager = test_manager(config);
        let session = manager.resolve_session(&test_uuid());
        session.attach_active(handle(1));

        let id = Bytes::from_static(&[0x04]);
        let secret = manager.begin_vmotion(&session, id.clone()).unwrap();
        manager.claim_peer(&id, secret, handle(2)).unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!session.has_pending_peer());
        assert_eq!(session.active_id(), Some(ConnectionId::new(1)));
        assert_eq!(manager.pending_migration_count(), 0);
    }

    #[tokio::test]
    async fn test_find_port_by_id_and_name() {
        let manager = test_manager(VspcConfig::default());
        let session = manager.resolve_session(&test_uuid());
        session.set_vm_name("build-host");

        let port_id = session.port_id().to_string();
        assert!(manager.find_port(&port_id).is_some());
        assert!(manager.find_port("build-host").is_some());
        assert!(manager.find_port("no-such-vm").is_none());
    }

    #[tokio::test]
    async fn test_reaper_destroys_idle_sessions_only() {
        let config = VspcConfig::default().with_session_idle_grace(Duration::from_millis(50));
        let manager = test_manager(config);
        let reaper = manager.spawn_reaper();

        let idle = manager.resolve_session(&test_uuid());
        let busy_uuid = VmUuid::parse("AABBCCDDEEFF00112233445566778899").unwrap();
        let busy = manager.resolve_session(&busy_uuid);
        busy.attach_active(handle(1));
        let _ = idle;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(manager.get_session(&test_uuid()).is_none(), "idle session reaped");
        assert!(manager.get_session(&busy_uuid).is_some(), "attached session kept");
        reaper.abort();
    }
}
