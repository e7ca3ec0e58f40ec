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

//! vSPC configuration
//!
//! # Example
//!
//! ```
//! use vspc_service::VspcConfig;
//! use std::time::Duration;
//!
//! let config = VspcConfig::new("0.0.0.0:13370".parse().unwrap())
//!     .with_observer_listen_addr(Some("127.0.0.1:13371".parse().unwrap()))
//!     .with_goahead_timeout(Duration::from_secs(120));
//! ```

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for a [`crate::VspcServer`] and everything beneath it.
#[derive(Debug, Clone)]
pub struct VspcConfig {
    /// Address the VM-facing Telnet listener binds to.
    pub listen_addr: SocketAddr,

    /// Address of the observer (admin) listener; `None` disables it.
    pub observer_listen_addr: Option<SocketAddr>,

    /// How long a connection may remain unidentified (no `VM-VC-UUID`, not
    /// accepted as a migration peer) before it is dropped.
    pub admission_timeout: Duration,

    /// How long a granted migration may wait for its destination peer.
    pub goahead_timeout: Duration,

    /// Grace before a connection whose `VMOTION-PEER` was rejected is
    /// dropped.
    pub peer_timeout: Duration,

    /// How long an accepted peer may wait before sending
    /// `VMOTION-COMPLETE`.
    pub complete_timeout: Duration,

    /// How long a session survives with no active connection, no pending
    /// peer, and no registered migration.
    pub session_idle_grace: Duration,

    /// Bytes of recent serial output replayed to newly attached observers.
    pub scrollback_bytes: usize,

    /// Per-observer outbound queue cap; an observer exceeding it is
    /// disconnected rather than allowed to stall the serial path.
    pub subscriber_queue_bytes: usize,

    /// Cap on serial bytes buffered for a connection that has not yet been
    /// bound to a session. Oldest bytes are discarded on overflow.
    pub admission_buffer_bytes: usize,

    /// Whether `VMOTION-BEGIN` is granted. When false every request is
    /// answered with `VMOTION-NOTNOW`.
    pub migrations_enabled: bool,

    /// The service URI this concentrator answers to in `DO-PROXY`.
    pub service_uri: String,

    /// Interval between runtime statistics log lines.
    pub stats_interval: Duration,
}

impl VspcConfig {
    /// Creates a configuration with the given VM listener address and
    /// defaults for everything else.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Self::default()
        }
    }

    /// Set the observer listener address (`None` disables the listener).
    pub fn with_observer_listen_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.observer_listen_addr = addr;
        self
    }

    /// Set the admission timeout.
    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = timeout;
        self
    }

    /// Set the migration goahead timeout.
    pub fn with_goahead_timeout(mut self, timeout: Duration) -> Self {
        self.goahead_timeout = timeout;
        self
    }

    /// Set the rejected-peer grace period.
    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    /// Set the peer completion timeout.
    pub fn with_complete_timeout(mut self, timeout: Duration) -> Self {
        self.complete_timeout = timeout;
        self
    }

    /// Set the session idle grace period.
    pub fn with_session_idle_grace(mut self, grace: Duration) -> Self {
        self.session_idle_grace = grace;
        self
    }

    /// Set the scrollback ring size.
    pub fn with_scrollback_bytes(mut self, bytes: usize) -> Self {
        self.scrollback_bytes = bytes;
        self
    }

    /// Set the per-observer outbound queue cap.
    pub fn with_subscriber_queue_bytes(mut self, bytes: usize) -> Self {
        self.subscriber_queue_bytes = bytes;
        self
    }

    /// Set the pre-admission buffer cap.
    pub fn with_admission_buffer_bytes(mut self, bytes: usize) -> Self {
        self.admission_buffer_bytes = bytes;
        self
    }

    /// Enable or disable migration grants.
    pub fn with_migrations_enabled(mut self, enabled: bool) -> Self {
        self.migrations_enabled = enabled;
        self
    }

    /// Set the advertised service URI.
    pub fn with_service_uri(mut self, uri: impl Into<String>) -> Self {
        self.service_uri = uri.into();
        self
    }

    /// Set the statistics logging interval.
    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }
}

impl Default for VspcConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:13370".parse().unwrap(),
            observer_listen_addr: Some("127.0.0.1:13371".parse().unwrap()),
            admission_timeout: Duration::from_secs(10),
            goahead_timeout: Duration::from_secs(300),
            peer_timeout: Duration::from_secs(30),
            complete_timeout: Duration::from_secs(300),
            session_idle_grace: Duration::from_secs(60),
            scrollback_bytes: 64 * 1024,
            subscriber_queue_bytes: 1024 * 1024,
            admission_buffer_bytes: 64 * 1024,
            migrations_enabled: true,
            service_uri: "vSPC".to_string(),
            stats_interval: Duration::from_secs(60),
        }
    }
}
