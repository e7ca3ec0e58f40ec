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

//! Transport-level connection plumbing shared by VM and observer
//! connections.
//!
//! Every accepted socket is split into an owned read half, driven by its
//! worker's event loop, and an owned write half, driven by a dedicated
//! writer task fed through a bounded channel. Upper layers hold a
//! [`ConnectionHandle`]: a cheap, cloneable, non-owning reference through
//! which they can queue outbound data or ask the connection to close. A
//! handle whose connection has gone away simply reports the send as failed.

use crate::types::ConnectionId;
use bytes::Bytes;
use futures_util::SinkExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use vspc_telnetcodec::{TelnetCodec, TelnetFrame, TelnetOption};

/// Outbound work for a connection's writer task.
#[derive(Debug)]
pub(crate) enum WriteCommand {
    /// In-band serial data (IAC-escaped by the codec).
    Data(Bytes),
    /// A control or subnegotiation frame.
    Frame(TelnetFrame),
}

/// Depth of the writer channel. Deep enough to absorb bursts, shallow
/// enough that a stalled socket surfaces as backpressure quickly.
const WRITER_QUEUE_DEPTH: usize = 256;

/// A non-owning handle to a live connection.
///
/// The session holds one of these for its active connection and one for a
/// pending migration peer; observers hold one for their own transport.
/// Dropping a handle does not close the connection; [`ConnectionHandle::close`]
/// does.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<WriteCommand>,
    shutdown: CancellationToken,
}

impl ConnectionHandle {
    /// Creates a handle plus the receiving side for a writer task.
    pub(crate) fn channel(
        id: ConnectionId,
    ) -> (Self, mpsc::Receiver<WriteCommand>, CancellationToken) {
        let (tx, rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
        let shutdown = CancellationToken::new();
        (
            Self {
                id,
                tx,
                shutdown: shutdown.clone(),
            },
            rx,
            shutdown,
        )
    }

    /// The connection's identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues serial data without waiting. Returns `false` when the
    /// connection is gone or its writer is saturated; the caller decides
    /// whether that means dropping bytes or disconnecting.
    pub fn send_data(&self, data: Bytes) -> bool {
        self.tx.try_send(WriteCommand::Data(data)).is_ok()
    }

    /// Queues serial data, waiting for writer capacity. Used by observer
    /// forwarding, where backpressure feeds the per-subscriber byte
    /// accounting.
    pub async fn send_data_wait(&self, data: Bytes) -> bool {
        self.tx.send(WriteCommand::Data(data)).await.is_ok()
    }

    /// Queues a protocol frame without waiting.
    pub fn send_frame(&self, frame: TelnetFrame) -> bool {
        self.tx.try_send(WriteCommand::Frame(frame)).is_ok()
    }

    /// Asks the connection to close. Idempotent; the reader and writer
    /// tasks both observe the cancellation.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Whether close has been requested or the connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.tx.is_closed()
    }
}

/// Runs a connection's writer: drains the command channel into the framed
/// write half until the channel closes or shutdown is requested, then
/// flushes.
pub(crate) fn spawn_writer(
    id: ConnectionId,
    write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<WriteCommand>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut framed = FramedWrite::new(write_half, TelnetCodec::new());
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(WriteCommand::Data(data)) => {
                        trace!(connection = %id, bytes = data.len(), "write data");
                        if framed.send(TelnetFrame::Data(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(WriteCommand::Frame(frame)) => {
                        trace!(connection = %id, ?frame, "write frame");
                        if framed.send(frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }
        let _ = futures_util::SinkExt::<TelnetFrame>::flush(&mut framed).await;
        debug!(connection = %id, "writer task finished");
    })
}

/// The negotiation volley a VM-facing connection opens with: we perform
/// ECHO, SGA and BINARY, and we ask the peer for BINARY and the VMware
/// extension.
pub(crate) fn vm_bootstrap_frames(codec: &mut TelnetCodec) -> Vec<TelnetFrame> {
    [
        codec.enable_local(TelnetOption::Echo),
        codec.enable_local(TelnetOption::SuppressGoAhead),
        codec.enable_local(TelnetOption::TransmitBinary),
        codec.enable_remote(TelnetOption::TransmitBinary),
        codec.enable_remote(TelnetOption::VmwareExt),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// The negotiation volley an observer-facing connection opens with: we
/// offer the admin option and binary transmission both ways.
pub(crate) fn observer_bootstrap_frames(codec: &mut TelnetCodec) -> Vec<TelnetFrame> {
    [
        codec.enable_local(TelnetOption::VspcAdmin),
        codec.enable_local(TelnetOption::TransmitBinary),
        codec.enable_remote(TelnetOption::TransmitBinary),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Checks a `DO-PROXY` service URI against the one we serve. A trailing
/// `?key=value&...` query is allowed and parsed; the result is the list of
/// query arguments (empty for an exact match), or `None` on mismatch.
pub(crate) fn match_service_uri(expected: &str, presented: &str) -> Option<Vec<(String, String)>> {
    if presented == expected {
        return Some(Vec::new());
    }
    let query = presented.strip_prefix(expected)?.strip_prefix('?')?;
    let mut args = Vec::new();
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some((key, value)) => args.push((key.to_string(), value.to_string())),
            None => args.push((pair.to_string(), String::new())),
        }
    }
    Some(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_service_uri_exact() {
        assert_eq!(match_service_uri("vSPC", "vSPC"), Some(Vec::new()));
        assert_eq!(match_service_uri("vSPC", "other"), None);
    }

    #[test]
    fn test_match_service_uri_with_query() {
        let args = match_service_uri("vSPC", "vSPC?port=com2&raw").unwrap();
        assert_eq!(
            args,
            vec![
                ("port".to_string(), "com2".to_string()),
                ("raw".to_string(), String::new()),
            ]
        );
        // The query separator is required; a mere prefix is not a match.
        assert_eq!(match_service_uri("vSPC", "vSPCextra"), None);
    }

    #[tokio::test]
    async fn test_handle_send_after_close() {
        let (handle, mut rx, _shutdown) = ConnectionHandle::channel(ConnectionId::new(1));
        assert!(handle.send_data(Bytes::from_static(b"x")));
        rx.close();
        while rx.recv().await.is_some() {}
        drop(rx);
        assert!(!handle.send_data(Bytes::from_static(b"y")));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_bootstrap_frames() {
        let mut codec = TelnetCodec::new();
        let frames = vm_bootstrap_frames(&mut codec);
        assert_eq!(
            frames,
            vec![
                TelnetFrame::Will(TelnetOption::Echo),
                TelnetFrame::Will(TelnetOption::SuppressGoAhead),
                TelnetFrame::Will(TelnetOption::TransmitBinary),
                TelnetFrame::Do(TelnetOption::TransmitBinary),
                TelnetFrame::Do(TelnetOption::VmwareExt),
            ]
        );
        // Re-running must not re-negotiate.
        assert!(vm_bootstrap_frames(&mut codec).is_empty());
    }
}
