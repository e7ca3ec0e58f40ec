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

//! Lock-free metrics for the vSPC
//!
//! All metrics are stored as atomics and can be accessed concurrently
//! without locks. Use the `snapshot()` method to get a consistent view of
//! all metrics at a point in time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lock-free vSPC runtime metrics.
#[derive(Debug)]
pub struct VspcMetrics {
    // Connection counts per listener class
    vm_connections_total: AtomicU64,
    vm_connections_active: AtomicU64,
    observer_connections_total: AtomicU64,
    observer_connections_active: AtomicU64,

    // Serial throughput
    serial_bytes_received: AtomicU64,
    serial_bytes_transmitted: AtomicU64,

    // vMotion activity
    vmotion_begins: AtomicU64,
    vmotion_peers: AtomicU64,
    vmotion_completes: AtomicU64,
    vmotion_aborts: AtomicU64,
    vmotion_abandons: AtomicU64,

    // Errors
    protocol_errors: AtomicU64,

    // Sessions
    sessions_created: AtomicU64,
    sessions_reaped: AtomicU64,

    started_at: Instant,
}

/// A point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Total VM connections accepted since start.
    pub vm_connections_total: u64,
    /// Currently open VM connections.
    pub vm_connections_active: u64,
    /// Total observer connections accepted since start.
    pub observer_connections_total: u64,
    /// Currently open observer connections.
    pub observer_connections_active: u64,
    /// Serial bytes received from VMs.
    pub serial_bytes_received: u64,
    /// Serial bytes transmitted to VMs.
    pub serial_bytes_transmitted: u64,
    /// `VMOTION-BEGIN` requests seen.
    pub vmotion_begins: u64,
    /// `VMOTION-PEER` claims seen.
    pub vmotion_peers: u64,
    /// Completed handoffs.
    pub vmotion_completes: u64,
    /// Explicit aborts.
    pub vmotion_aborts: u64,
    /// Migrations abandoned by timeout or replacement.
    pub vmotion_abandons: u64,
    /// Fatal protocol errors observed.
    pub protocol_errors: u64,
    /// Sessions created.
    pub sessions_created: u64,
    /// Sessions destroyed by the idle-grace reaper.
    pub sessions_reaped: u64,
}

impl Default for VspcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl VspcMetrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        Self {
            vm_connections_total: AtomicU64::new(0),
            vm_connections_active: AtomicU64::new(0),
            observer_connections_total: AtomicU64::new(0),
            observer_connections_active: AtomicU64::new(0),
            serial_bytes_received: AtomicU64::new(0),
            serial_bytes_transmitted: AtomicU64::new(0),
            vmotion_begins: AtomicU64::new(0),
            vmotion_peers: AtomicU64::new(0),
            vmotion_completes: AtomicU64::new(0),
            vmotion_aborts: AtomicU64::new(0),
            vmotion_abandons: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            sessions_reaped: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Record a VM connection being opened
    pub fn vm_connection_opened(&self) {
        self.vm_connections_total.fetch_add(1, Ordering::Relaxed);
        self.vm_connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a VM connection being closed
    pub fn vm_connection_closed(&self) {
        self.vm_connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record an observer connection being opened
    pub fn observer_connection_opened(&self) {
        self.observer_connections_total
            .fetch_add(1, Ordering::Relaxed);
        self.observer_connections_active
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record an observer connection being closed
    pub fn observer_connection_closed(&self) {
        self.observer_connections_active
            .fetch_sub(1, Ordering::Relaxed);
    }

    /// Record serial bytes received from a VM
    pub fn serial_received(&self, count: u64) {
        self.serial_bytes_received.fetch_add(count, Ordering::Relaxed);
    }

    /// Record serial bytes transmitted to a VM
    pub fn serial_transmitted(&self, count: u64) {
        self.serial_bytes_transmitted
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Record a `VMOTION-BEGIN`
    pub fn vmotion_begin(&self) {
        self.vmotion_begins.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a `VMOTION-PEER`
    pub fn vmotion_peer(&self) {
        self.vmotion_peers.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed handoff
    pub fn vmotion_complete(&self) {
        self.vmotion_completes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an explicit abort
    pub fn vmotion_abort(&self) {
        self.vmotion_aborts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an abandoned migration
    pub fn vmotion_abandon(&self) {
        self.vmotion_abandons.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fatal protocol error
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session creation
    pub fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session reaped by idle grace
    pub fn session_reaped(&self) {
        self.sessions_reaped.fetch_add(1, Ordering::Relaxed);
    }

    /// Uptime since metrics creation.
    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Get a consistent snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            vm_connections_total: self.vm_connections_total.load(Ordering::Relaxed),
            vm_connections_active: self.vm_connections_active.load(Ordering::Relaxed),
            observer_connections_total: self.observer_connections_total.load(Ordering::Relaxed),
            observer_connections_active: self.observer_connections_active.load(Ordering::Relaxed),
            serial_bytes_received: self.serial_bytes_received.load(Ordering::Relaxed),
            serial_bytes_transmitted: self.serial_bytes_transmitted.load(Ordering::Relaxed),
            vmotion_begins: self.vmotion_begins.load(Ordering::Relaxed),
            vmotion_peers: self.vmotion_peers.load(Ordering::Relaxed),
            vmotion_completes: self.vmotion_completes.load(Ordering::Relaxed),
            vmotion_aborts: self.vmotion_aborts.load(Ordering::Relaxed),
            vmotion_abandons: self.vmotion_abandons.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_reaped: self.sessions_reaped.load(Ordering::Relaxed),
        }
    }

    /// Emit the periodic statistics log line.
    pub fn log_stats(&self, sessions: usize, pending_migrations: usize) {
        let s = self.snapshot();
        tracing::info!(
            uptime_s = self.uptime().as_secs(),
            sessions,
            pending_migrations,
            vm_active = s.vm_connections_active,
            vm_total = s.vm_connections_total,
            observer_active = s.observer_connections_active,
            observer_total = s.observer_connections_total,
            serial_rx = s.serial_bytes_received,
            serial_tx = s.serial_bytes_transmitted,
            vmotion_begins = s.vmotion_begins,
            vmotion_peers = s.vmotion_peers,
            vmotion_completes = s.vmotion_completes,
            vmotion_aborts = s.vmotion_aborts,
            vmotion_abandons = s.vmotion_abandons,
            "vSPC statistics"
        );
    }
}
