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

//! Observer connection worker
//!
//! Observers speak the vSPC admin option: they list VM ports, attach to
//! one as a subscriber, receive its serial stream (scrollback first), and
//! may send bytes back to the VM when their access mode allows writing.
//!
//! A forwarding task per attachment moves bytes from the session's fan-out
//! into this connection's writer; its awaited sends are what ties the
//! per-subscriber byte accounting to real socket progress. When the
//! session drops the subscriber for overflow the forwarding task observes
//! the closed channel and closes the whole connection.

use crate::connection::{ConnectionHandle, observer_bootstrap_frames, spawn_writer};
use crate::manager::SessionManager;
use crate::session::Session;
use crate::types::ConnectionId;
use bytes::Bytes;
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, trace, warn};
use vspc_telnetcodec::admin::AdminMessage;
use vspc_telnetcodec::{TelnetArgument, TelnetCodec, TelnetEvent, TelnetFrame};

/// Runs an observer-facing connection to completion.
pub(crate) async fn run_observer_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    id: ConnectionId,
    manager: Arc<SessionManager>,
) {
    let (read_half, write_half) = stream.into_split();
    let (handle, writer_rx, shutdown) = ConnectionHandle::channel(id);
    let writer = spawn_writer(id, write_half, writer_rx, shutdown.clone());
    let mut framed = FramedRead::new(read_half, TelnetCodec::new());

    for frame in observer_bootstrap_frames(framed.decoder_mut()) {
        handle.send_frame(frame);
    }

    let mut observer = ObserverConnection::new(id, manager.clone(), handle.clone());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = framed.next() => match event {
                Some(Ok(event)) => {
                    observer.on_event(event);
                    if framed.decoder().has_pending_responses() {
                        for frame in framed.decoder_mut().take_responses() {
                            handle.send_frame(frame);
                        }
                    }
                }
                Some(Err(err)) => {
                    manager.metrics().protocol_error();
                    warn!(connection = %id, peer = %peer_addr, %err, "Observer protocol error");
                    break;
                }
                None => break,
            }
        }
    }

    observer.detach();
    handle.close();
    manager.metrics().observer_connection_closed();
    info!(connection = %id, peer = %peer_addr, "Observer connection closed");
    let _ = writer.await;
}

/// A live attachment of this observer to a VM port.
struct Attachment {
    session: Arc<Session>,
    subscriber_id: u64,
    write_ok: bool,
    forward: JoinHandle<()>,
}

struct ObserverConnection {
    id: ConnectionId,
    manager: Arc<SessionManager>,
    handle: ConnectionHandle,
    attachment: Option<Attachment>,
}

impl ObserverConnection {
    fn new(id: ConnectionId, manager: Arc<SessionManager>, handle: ConnectionHandle) -> Self {
        Self {
            id,
            manager,
            handle,
            attachment: None,
        }
    }

    fn send_admin(&self, message: AdminMessage) {
        self.handle
            .send_frame(TelnetFrame::Subnegotiate(TelnetArgument::Admin(message)));
    }

    fn on_event(&mut self, event: TelnetEvent) {
        match event {
            TelnetEvent::Data(chunk) => self.on_input(chunk),
            TelnetEvent::Subnegotiate(TelnetArgument::Admin(message)) => self.on_admin(message),
            TelnetEvent::Subnegotiate(argument) => {
                warn!(connection = %self.id, %argument, "Unexpected subnegotiation from observer");
            }
            TelnetEvent::OptionStatus(option, side, enabled) => {
                debug!(connection = %self.id, %option, %side, enabled, "Option status");
            }
            other => {
                trace!(connection = %self.id, ?other, "Ignoring control event");
            }
        }
    }

    /// In-band observer bytes are input for the attached VM.
    fn on_input(&mut self, chunk: Bytes) {
        let Some(attachment) = &self.attachment else {
            debug!(connection = %self.id, "Discarding input; observer is not attached");
            return;
        };
        if !attachment.write_ok {
            debug!(connection = %self.id, "Discarding input from a read-only observer");
            return;
        }
        self.manager
            .metrics()
            .serial_transmitted(chunk.len() as u64);
        if !attachment.session.write_to_vm(chunk) {
            debug!(
                connection = %self.id,
                uuid = %attachment.session.uuid(),
                "VM transport refused observer input"
            );
        }
    }

    fn on_admin(&mut self, message: AdminMessage) {
        match message {
            AdminMessage::GetPortList => {
                self.send_admin(AdminMessage::PortList(self.manager.port_list()));
            }
            AdminMessage::Connect { mode, port_id } => {
                self.detach();
                let attached = self.attach(&port_id, mode);
                self.send_admin(if attached {
                    AdminMessage::Connected
                } else {
                    AdminMessage::Disconnected
                });
            }
            AdminMessage::Disconnect => {
                self.detach();
                self.send_admin(AdminMessage::Disconnected);
            }
            AdminMessage::Unknown { subopcode, .. } => {
                trace!(connection = %self.id, subopcode, "Unknown admin subopcode ignored");
            }
            AdminMessage::PortList(_) | AdminMessage::Connected | AdminMessage::Disconnected => {
                warn!(connection = %self.id, "Ignoring server-directed admin message from client");
            }
        }
    }

    fn attach(&mut self, port_id: &str, mode: vspc_telnetcodec::admin::AccessMode) -> bool {
        let Some(session) = self.manager.find_port(port_id) else {
            debug!(connection = %self.id, port_id, "Attach refused; no such port");
            return false;
        };
        let queue_cap = self.manager.config().subscriber_queue_bytes;
        match session.add_subscriber(mode, queue_cap) {
            Ok(attachment) => {
                info!(
                    connection = %self.id,
                    uuid = %session.uuid(),
                    write_ok = attachment.write_ok,
                    "Observer attached"
                );
                let forward = spawn_forward(attachment.rx, attachment.queued, self.handle.clone());
                self.attachment = Some(Attachment {
                    session,
                    subscriber_id: attachment.id,
                    write_ok: attachment.write_ok,
                    forward,
                });
                true
            }
            Err(err) => {
                info!(connection = %self.id, uuid = %session.uuid(), %err, "Attach refused");
                false
            }
        }
    }

    fn detach(&mut self) {
        if let Some(attachment) = self.attachment.take() {
            attachment.forward.abort();
            attachment
                .session
                .remove_subscriber(attachment.subscriber_id);
            debug!(
                connection = %self.id,
                uuid = %attachment.session.uuid(),
                "Observer detached"
            );
        }
    }
}

/// Moves fanned-out serial bytes into this observer's writer. The awaited
/// send provides the backpressure that the session's overflow accounting
/// measures. A closed channel without a prior detach means the session
/// dropped this subscriber; the connection is closed in response.
fn spawn_forward(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    queued: Arc<AtomicUsize>,
    handle: ConnectionHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            let len = chunk.len();
            if !handle.send_data_wait(chunk).await {
                break;
            }
            queued.fetch_sub(len, Ordering::AcqRel);
        }
        handle.close();
    })
}
