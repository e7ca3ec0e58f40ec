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

//! VM connection worker
//!
//! One worker task drives each VM-facing connection: it opens the
//! negotiation, decodes events, routes serial data into the bound session,
//! and feeds VMware-extension control messages into the session manager's
//! migration machinery. The matching writer task is spawned by the
//! connection plumbing; the worker only ever queues outbound work on its
//! [`ConnectionHandle`].

use crate::connection::{
    ConnectionHandle, match_service_uri, spawn_writer, vm_bootstrap_frames,
};
use crate::error::{Result, VspcError};
use crate::manager::SessionManager;
use crate::session::Session;
use crate::types::{ConnectionId, VmUuid};
use bytes::{Buf, Bytes, BytesMut};
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, trace, warn};
use vspc_telnetcodec::vmware::{KNOWN_SUBOPTIONS, VmwareExtMessage};
use vspc_telnetcodec::{
    TelnetArgument, TelnetCodec, TelnetEvent, TelnetFrame, TelnetOption, TelnetSide,
};

/// Runs a VM-facing connection to completion.
pub(crate) async fn run_vm_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    id: ConnectionId,
    manager: Arc<SessionManager>,
) {
    let (read_half, write_half) = stream.into_split();
    let (handle, writer_rx, shutdown) = ConnectionHandle::channel(id);
    let writer = spawn_writer(id, write_half, writer_rx, shutdown.clone());
    let mut framed = FramedRead::new(read_half, TelnetCodec::new());

    for frame in vm_bootstrap_frames(framed.decoder_mut()) {
        handle.send_frame(frame);
    }

    let mut connection = VmConnection::new(id, peer_addr, manager.clone(), handle.clone());
    let admission_deadline =
        tokio::time::Instant::now() + manager.config().admission_timeout;

    let result: Result<()> = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            _ = tokio::time::sleep_until(admission_deadline), if !connection.is_admitted() => {
                break Err(VspcError::AdmissionTimeout(id));
            }
            event = framed.next() => match event {
                Some(Ok(event)) => {
                    let outcome = connection.on_event(event);
                    flush_responses(framed.decoder_mut(), &handle);
                    if let Err(err) = outcome {
                        break Err(err);
                    }
                }
                Some(Err(err)) => {
                    manager.metrics().protocol_error();
                    break Err(err.into());
                }
                None => break Ok(()),
            }
        }
    };

    match &result {
        Ok(()) => info!(connection = %id, peer = %peer_addr, "VM connection closed"),
        Err(err) => warn!(connection = %id, peer = %peer_addr, %err, "VM connection dropped"),
    }

    handle.close();
    if let Some(session) = connection.session.take() {
        manager.connection_closed(&session, id);
    }
    manager.metrics().vm_connection_closed();
    let _ = writer.await;
}

/// Drains negotiation replies queued by the decoder onto the wire.
fn flush_responses(codec: &mut TelnetCodec, handle: &ConnectionHandle) {
    if codec.has_pending_responses() {
        for frame in codec.take_responses() {
            handle.send_frame(frame);
        }
    }
}

/// Per-connection state for a VM-facing transport.
struct VmConnection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    manager: Arc<SessionManager>,
    handle: ConnectionHandle,
    session: Option<Arc<Session>>,
    /// Set while this connection holds a session's pending-peer slot.
    staged_as_peer: bool,
    /// Shared with the rejected-peer grace timer.
    admitted: Arc<AtomicBool>,
    vc_uuid: Option<VmUuid>,
    vm_name: Option<String>,
    vm_bios_uuid: Option<String>,
    vm_location: Option<String>,
    port_label: Option<String>,
    will_proxy: bool,
    admission_buffer: BytesMut,
}

impl VmConnection {
    fn new(
        id: ConnectionId,
        peer_addr: SocketAddr,
        manager: Arc<SessionManager>,
        handle: ConnectionHandle,
    ) -> Self {
        Self {
            id,
            peer_addr,
            manager,
            handle,
            session: None,
            staged_as_peer: false,
            admitted: Arc::new(AtomicBool::new(false)),
            vc_uuid: None,
            vm_name: None,
            vm_bios_uuid: None,
            vm_location: None,
            port_label: None,
            will_proxy: false,
            admission_buffer: BytesMut::new(),
        }
    }

    fn is_admitted(&self) -> bool {
        self.session.is_some()
    }

    fn send_vmware(&self, message: VmwareExtMessage) {
        self.handle
            .send_frame(TelnetFrame::Subnegotiate(TelnetArgument::Vmware(message)));
    }

    fn on_event(&mut self, event: TelnetEvent) -> Result<()> {
        match event {
            TelnetEvent::Data(chunk) => self.on_data(chunk),
            TelnetEvent::OptionStatus(TelnetOption::VmwareExt, TelnetSide::Remote, true) => {
                // The extension is live; advertise what we speak.
                self.send_vmware(VmwareExtMessage::KnownSuboptions2(Bytes::from_static(
                    KNOWN_SUBOPTIONS,
                )));
                Ok(())
            }
            TelnetEvent::OptionStatus(option, side, enabled) => {
                debug!(connection = %self.id, %option, %side, enabled, "Option status");
                Ok(())
            }
            TelnetEvent::Subnegotiate(TelnetArgument::Vmware(message)) => {
                self.on_vmware(message)
            }
            TelnetEvent::Subnegotiate(argument) => {
                // AUTHENTICATION passthrough and anything else we carry but
                // do not interpret on the VM listener.
                debug!(connection = %self.id, %argument, "Ignoring subnegotiation");
                Ok(())
            }
            other => {
                trace!(connection = %self.id, ?other, "Ignoring control event");
                Ok(())
            }
        }
    }

    fn on_data(&mut self, chunk: Bytes) -> Result<()> {
        self.manager.metrics().serial_received(chunk.len() as u64);
        if self.staged_as_peer {
            // A destination must not source serial data before COMPLETE.
            warn!(connection = %self.id, "Dropping serial data from a staged migration peer");
            return Ok(());
        }
        match &self.session {
            Some(session) => {
                session.deliver_serial(self.id, &chunk);
            }
            None => self.buffer_preadmission(&chunk),
        }
        Ok(())
    }

    /// Serial data before identification goes to a bounded buffer; the
    /// oldest bytes fall off when the cap is exceeded.
    fn buffer_preadmission(&mut self, chunk: &Bytes) {
        let cap = self.manager.config().admission_buffer_bytes;
        self.admission_buffer.extend_from_slice(chunk);
        if self.admission_buffer.len() > cap {
            let excess = self.admission_buffer.len() - cap;
            self.admission_buffer.advance(excess);
        }
    }

    fn on_vmware(&mut self, message: VmwareExtMessage) -> Result<()> {
        match message {
            VmwareExtMessage::VcUuid(text) => self.on_vc_uuid(&text),
            VmwareExtMessage::VmName(name) => {
                if let Some(session) = &self.session {
                    session.set_vm_name(&name);
                }
                self.vm_name = Some(name);
                Ok(())
            }
            VmwareExtMessage::VmBiosUuid(value) => {
                if let Some(session) = &self.session {
                    session.set_vm_bios_uuid(&value);
                }
                self.vm_bios_uuid = Some(value);
                Ok(())
            }
            VmwareExtMessage::VmLocationUri(value) => {
                if let Some(session) = &self.session {
                    session.set_vm_location(&value);
                }
                self.vm_location = Some(value);
                Ok(())
            }
            VmwareExtMessage::DoProxy { direction, uri } => {
                match match_service_uri(&self.manager.config().service_uri, &uri) {
                    Some(args) => {
                        self.will_proxy = true;
                        if let Some((_, label)) =
                            args.into_iter().find(|(key, _)| key == "port")
                        {
                            if let Some(session) = &self.session {
                                session.set_port_label(&label);
                            }
                            self.port_label = Some(label);
                        }
                        self.send_vmware(VmwareExtMessage::WillProxy);
                        self.send_vmware(VmwareExtMessage::GetVcUuid);
                        self.send_vmware(VmwareExtMessage::GetVmName);
                    }
                    None => {
                        warn!(
                            connection = %self.id,
                            direction = ?direction,
                            uri,
                            "Proxy direction/serviceURI mismatch"
                        );
                        self.send_vmware(VmwareExtMessage::WontProxy);
                    }
                }
                Ok(())
            }
            VmwareExtMessage::VmotionBegin(id) => {
                match &self.session {
                    Some(session) => match self.manager.begin_vmotion(session, id.clone()) {
                        Some(secret) => {
                            info!(
                                connection = %self.id,
                                uuid = %session.uuid(),
                                "vMotion granted"
                            );
                            self.send_vmware(VmwareExtMessage::VmotionGoahead { id, secret });
                        }
                        None => self.send_vmware(VmwareExtMessage::VmotionNotNow(id)),
                    },
                    None => {
                        warn!(connection = %self.id, "VMOTION-BEGIN before identification");
                        self.send_vmware(VmwareExtMessage::VmotionNotNow(id));
                    }
                }
                Ok(())
            }
            VmwareExtMessage::VmotionPeer { id, secret } => {
                if self.session.is_some() {
                    warn!(connection = %self.id, "Ignoring VMOTION-PEER from a bound connection");
                    return Ok(());
                }
                match self.manager.claim_peer(&id, secret, self.handle.clone()) {
                    Some(session) => {
                        info!(
                            connection = %self.id,
                            uuid = %session.uuid(),
                            "vMotion peer accepted"
                        );
                        self.session = Some(session);
                        self.staged_as_peer = true;
                        self.admitted.store(true, Ordering::Release);
                        self.send_vmware(VmwareExtMessage::VmotionPeerOk(id));
                    }
                    None => {
                        // No error reply exists in the protocol. The
                        // connection is dropped once the grace elapses
                        // unless it identifies itself some other way.
                        let handle = self.handle.clone();
                        let admitted = self.admitted.clone();
                        let grace = self.manager.config().peer_timeout;
                        tokio::spawn(async move {
                            tokio::time::sleep(grace).await;
                            if !admitted.load(Ordering::Acquire) {
                                handle.close();
                            }
                        });
                    }
                }
                Ok(())
            }
            VmwareExtMessage::VmotionComplete(_) => {
                match &self.session {
                    Some(session) => {
                        if self.manager.complete_vmotion(session, self.id) {
                            self.staged_as_peer = false;
                        }
                    }
                    None => {
                        warn!(connection = %self.id, "VMOTION-COMPLETE from an unbound connection");
                    }
                }
                Ok(())
            }
            VmwareExtMessage::VmotionAbort(wire_id) => {
                debug!(
                    connection = %self.id,
                    carries_id = wire_id.is_some(),
                    "VMOTION-ABORT observed"
                );
                if let Some(session) = &self.session {
                    self.manager.abort_vmotion(session, self.id, wire_id);
                }
                Ok(())
            }
            VmwareExtMessage::KnownSuboptions1(list) => {
                debug!(connection = %self.id, entries = list.len(), "Peer feature advertisement");
                Ok(())
            }
            VmwareExtMessage::VmotionGoahead { .. }
            | VmwareExtMessage::VmotionNotNow(_)
            | VmwareExtMessage::VmotionPeerOk(_)
            | VmwareExtMessage::KnownSuboptions2(_)
            | VmwareExtMessage::WillProxy
            | VmwareExtMessage::WontProxy => {
                warn!(connection = %self.id, "Ignoring server-directed subopcode from peer");
                Ok(())
            }
            VmwareExtMessage::GetVcUuid
            | VmwareExtMessage::GetVmName
            | VmwareExtMessage::GetVmBiosUuid
            | VmwareExtMessage::GetVmLocationUri => {
                trace!(connection = %self.id, "Ignoring metadata request from peer");
                Ok(())
            }
            VmwareExtMessage::Unknown { subopcode, .. } => {
                // Already warned during parsing; semantic errors never
                // close the transport.
                trace!(connection = %self.id, subopcode, "Unknown VMware subopcode ignored");
                Ok(())
            }
        }
    }

    fn on_vc_uuid(&mut self, text: &str) -> Result<()> {
        let Some(uuid) = VmUuid::parse(text) else {
            warn!(connection = %self.id, text, "Unparseable VM-VC-UUID");
            return Ok(());
        };
        match &self.vc_uuid {
            Some(existing) if *existing == uuid => Ok(()),
            Some(_) => {
                // Identity change mid-session is not meaningful; drop the
                // connection rather than guess which VM this stream is.
                Err(VspcError::IdentityChanged(self.id))
            }
            None => {
                if let Some(session) = &self.session {
                    // Already attached through the migration rendezvous;
                    // the late-arriving identity must agree with it.
                    if session.uuid() != &uuid {
                        return Err(VspcError::IdentityChanged(self.id));
                    }
                    self.vc_uuid = Some(uuid);
                    return Ok(());
                }
                self.vc_uuid = Some(uuid);
                self.bind_session();
                Ok(())
            }
        }
    }

    /// Binds this connection to its session on first identification:
    /// resolves (or creates) the session, takes the active slot, applies
    /// stashed metadata, and replays any pre-admission serial bytes.
    fn bind_session(&mut self) {
        let Some(uuid) = self.vc_uuid.clone() else {
            return;
        };
        let session = self.manager.resolve_session(&uuid);
        if let Some(superseded) = session.attach_active(self.handle.clone()) {
            superseded.close();
        }
        if let Some(name) = &self.vm_name {
            session.set_vm_name(name);
        }
        if let Some(value) = &self.vm_bios_uuid {
            session.set_vm_bios_uuid(value);
        }
        if let Some(value) = &self.vm_location {
            session.set_vm_location(value);
        }
        if let Some(label) = &self.port_label {
            session.set_port_label(label);
        }
        self.admitted.store(true, Ordering::Release);
        info!(
            connection = %self.id,
            peer = %self.peer_addr,
            %uuid,
            proxy = self.will_proxy,
            "Connection bound to session"
        );
        if !self.admission_buffer.is_empty() {
            let data = self.admission_buffer.split().freeze();
            session.deliver_serial(self.id, &data);
        }
        self.session = Some(session);
    }
}
