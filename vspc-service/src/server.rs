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

//! vSPC server
//!
//! The `VspcServer` is the entry point: it binds the VM-facing listener
//! (and the optional observer listener), accepts connections, and hands
//! each to its worker. All session and migration logic lives in the
//! [`SessionManager`].
//!
//! # Example
//!
//! ```no_run
//! use vspc_service::{VspcConfig, VspcServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = VspcConfig::new("0.0.0.0:13370".parse()?);
//!     let server = VspcServer::new(config).await?;
//!     server.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await?;
//!     Ok(())
//! }
//! ```

use crate::config::VspcConfig;
use crate::error::{Result, VspcError};
use crate::manager::SessionManager;
use crate::metrics::VspcMetrics;
use crate::types::ConnectionId;
use crate::{observer, worker};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Which listener a connection arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ListenerClass {
    Vm,
    Observer,
}

/// The virtual serial port concentrator server.
pub struct VspcServer {
    config: Arc<VspcConfig>,
    manager: Arc<SessionManager>,
    metrics: Arc<VspcMetrics>,
    vm_listener: Mutex<Option<TcpListener>>,
    observer_listener: Mutex<Option<TcpListener>>,
    vm_addr: SocketAddr,
    observer_addr: Option<SocketAddr>,
    next_id: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

impl VspcServer {
    /// Binds the configured listeners. Connections are not accepted until
    /// [`VspcServer::start`] is called.
    pub async fn new(config: VspcConfig) -> Result<Self> {
        let vm_listener = TcpListener::bind(config.listen_addr).await?;
        let vm_addr = vm_listener.local_addr()?;

        let mut observer_listener = None;
        let mut observer_addr = None;
        if let Some(addr) = config.observer_listen_addr {
            let listener = TcpListener::bind(addr).await?;
            observer_addr = Some(listener.local_addr()?);
            observer_listener = Some(listener);
        }

        let config = Arc::new(config);
        let metrics = Arc::new(VspcMetrics::new());
        let manager = Arc::new(SessionManager::new(config.clone(), metrics.clone()));

        info!(vm = %vm_addr, observer = ?observer_addr, "vSPC bound");

        Ok(Self {
            config,
            manager,
            metrics,
            vm_listener: Mutex::new(Some(vm_listener)),
            observer_listener: Mutex::new(observer_listener),
            vm_addr,
            observer_addr,
            next_id: Arc::new(AtomicU64::new(1)),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        })
    }

    /// Starts accepting connections and the background housekeeping tasks.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(VspcError::Other("server already running".into()));
        }
        info!(vm = %self.vm_addr, "Starting vSPC");

        let mut tasks = self.tasks.lock().expect("task list poisoned");
        let vm_listener = self
            .vm_listener
            .lock()
            .expect("listener poisoned")
            .take()
            .ok_or_else(|| VspcError::Other("server cannot be restarted".into()))?;
        tasks.push(self.spawn_accept_loop(vm_listener, ListenerClass::Vm));
        if let Some(listener) = self.observer_listener.lock().expect("listener poisoned").take() {
            tasks.push(self.spawn_accept_loop(listener, ListenerClass::Observer));
        }
        tasks.push(self.manager.spawn_reaper());
        tasks.push(self.spawn_stats_ticker());
        Ok(())
    }

    fn spawn_accept_loop(&self, listener: TcpListener, class: ListenerClass) -> JoinHandle<()> {
        let manager = self.manager.clone();
        let metrics = self.metrics.clone();
        let next_id = self.next_id.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = shutdown.cancelled() => break,
                };
                match accepted {
                    Ok((socket, peer_addr)) => {
                        let id = ConnectionId::new(next_id.fetch_add(1, Ordering::SeqCst));
                        debug!(connection = %id, peer = %peer_addr, ?class, "Accepted connection");
                        let manager = manager.clone();
                        match class {
                            ListenerClass::Vm => {
                                metrics.vm_connection_opened();
                                tokio::spawn(worker::run_vm_connection(
                                    socket, peer_addr, id, manager,
                                ));
                            }
                            ListenerClass::Observer => {
                                metrics.observer_connection_opened();
                                tokio::spawn(observer::run_observer_connection(
                                    socket, peer_addr, id, manager,
                                ));
                            }
                        }
                    }
                    Err(err) => {
                        tracing::error!(%err, "Failed to accept connection");
                        // Back off on errors to avoid a tight loop.
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
            info!(?class, "Accept loop terminated");
        })
    }

    fn spawn_stats_ticker(&self) -> JoinHandle<()> {
        let manager = self.manager.clone();
        let metrics = self.metrics.clone();
        let interval = self.config.stats_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick carries no news
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        metrics.log_stats(
                            manager.session_count(),
                            manager.pending_migration_count(),
                        );
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    /// Stops accepting, closes every connection, and drains all sessions.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(VspcError::ServerNotRunning);
        }
        info!("Shutting down vSPC");
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("task list poisoned"));
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        self.manager.shutdown();
        info!("vSPC shutdown complete");
        Ok(())
    }

    /// Whether the server is accepting connections.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The bound VM listener address.
    pub fn vm_addr(&self) -> SocketAddr {
        self.vm_addr
    }

    /// The bound observer listener address, when enabled.
    pub fn observer_addr(&self) -> Option<SocketAddr> {
        self.observer_addr
    }

    /// The session manager.
    pub fn manager(&self) -> Arc<SessionManager> {
        self.manager.clone()
    }

    /// The metrics sink.
    pub fn metrics(&self) -> Arc<VspcMetrics> {
        self.metrics.clone()
    }

    /// The server configuration.
    pub fn config(&self) -> &VspcConfig {
        &self.config
    }
}

impl std::fmt::Debug for VspcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VspcServer")
            .field("vm_addr", &self.vm_addr)
            .field("observer_addr", &self.observer_addr)
            .field("running", &self.is_running())
            .field("sessions", &self.manager.session_count())
            .field("uptime", &self.started_at.elapsed())
            .finish()
    }
}

impl Drop for VspcServer {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            tracing::warn!("VspcServer dropped while still running");
            self.shutdown.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> VspcConfig {
        VspcConfig::new("127.0.0.1:0".parse().unwrap())
            .with_observer_listen_addr(Some("127.0.0.1:0".parse().unwrap()))
    }

    #[tokio::test]
    async fn test_server_lifecycle() {
        let server = VspcServer::new(loopback_config()).await.unwrap();
        assert!(!server.is_running());

        server.start().await.unwrap();
        assert!(server.is_running());

        server.shutdown().await.unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_server_double_start() {
        let server = VspcServer::new(loopback_config()).await.unwrap();
        server.start().await.unwrap();
        assert!(server.start().await.is_err());
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_binds_ephemeral_ports() {
        let server = VspcServer::new(loopback_config()).await.unwrap();
        assert_ne!(server.vm_addr().port(), 0);
        assert_ne!(server.observer_addr().unwrap().port(), 0);
    }
}
