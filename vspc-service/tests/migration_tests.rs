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

//! End-to-end tests for the concentrator
//!
//! These tests run a real [`VspcServer`] on loopback and drive it with a
//! raw byte-level Telnet client, the way a hypervisor's virtual serial
//! port would: negotiation, VM identification, serial traffic, the
//! vMotion rendezvous, and observer attachment.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use vspc_service::{VspcConfig, VspcServer, VmUuid};

const IAC: u8 = 255;
const SE: u8 = 240;
const SB: u8 = 250;
const WILL: u8 = 251;
const DO: u8 = 253;

const OPT_VMWARE_EXT: u8 = 0xE8;
const OPT_VSPC_ADMIN: u8 = 0xE9;

const VMOTION_BEGIN: u8 = 40;
const VMOTION_GOAHEAD: u8 = 41;
const VMOTION_NOTNOW: u8 = 43;
const VMOTION_PEER: u8 = 44;
const VMOTION_PEER_OK: u8 = 45;
const VMOTION_COMPLETE: u8 = 46;
const VMOTION_ABORT: u8 = 48;
const VM_VC_UUID: u8 = 80;

const GET_VM_PORT_LIST: u8 = 0x10;
const VM_PORT_LIST: u8 = 0x11;
const VM_PORT_SET_CONNECTION: u8 = 0x20;
const VM_PORT_CONNECTED: u8 = 0x21;

const UUID_TEXT: &str = "4213f5a6-95b0-1f70-0d5e-7caeb0a6b0ae";

fn canonical_uuid() -> String {
    VmUuid::parse(UUID_TEXT).unwrap().as_str().to_string()
}

/// Builds `IAC SB option payload IAC SE` with payload escaping.
fn subneg(option: u8, payload: &[u8]) -> Vec<u8> {
    let mut wire = vec![IAC, SB, option];
    for &byte in payload {
        if byte == IAC {
            wire.push(IAC);
        }
        wire.push(byte);
    }
    wire.extend_from_slice(&[IAC, SE]);
    wire
}

/// A minimal blocking-style Telnet test client with its own incremental
/// parser, independent of the codec under test.
struct TestClient {
    stream: TcpStream,
    pending: Vec<u8>,
    data: Vec<u8>,
    subnegs: Vec<(u8, Vec<u8>)>,
}

impl TestClient {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            stream,
            pending: Vec::new(),
            data: Vec::new(),
            subnegs: Vec::new(),
        }
    }

    async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write");
        self.stream.flush().await.expect("flush");
    }

    /// Reads once with a short deadline; false on timeout or EOF.
    async fn pump(&mut self) -> bool {
        let mut buf = [0u8; 4096];
        match tokio::time::timeout(Duration::from_millis(100), self.stream.read(&mut buf)).await {
            Ok(Ok(0)) => false,
            Ok(Ok(n)) => {
                self.pending.extend_from_slice(&buf[..n]);
                self.parse();
                true
            }
            Ok(Err(_)) => false,
            Err(_) => true,
        }
    }

    /// Consumes complete items from the pending buffer.
    fn parse(&mut self) {
        let mut index = 0;
        loop {
            let rest = &self.pending[index..];
            if rest.is_empty() {
                break;
            }
            if rest[0] != IAC {
                let end = rest.iter().position(|&b| b == IAC).unwrap_or(rest.len());
                self.data.extend_from_slice(&rest[..end]);
                index += end;
                continue;
            }
            if rest.len() < 2 {
                break;
            }
            match rest[1] {
                IAC => {
                    self.data.push(IAC);
                    index += 2;
                }
                SB => {
                    // Find the closing IAC SE, honoring IAC IAC escapes.
                    let mut payload = Vec::new();
                    let mut cursor = 2;
                    let mut closed = false;
                    while cursor + 1 < rest.len() {
                        if rest[cursor] == IAC {
                            match rest[cursor + 1] {
                                IAC => {
                                    payload.push(IAC);
                                    cursor += 2;
                                }
                                SE => {
                                    closed = true;
                                    cursor += 2;
                                    break;
                                }
                                other => panic!("bad escape 0x{other:02X} in subneg"),
                            }
                        } else {
                            payload.push(rest[cursor]);
                            cursor += 1;
                        }
                    }
                    if !closed {
                        break;
                    }
                    assert!(!payload.is_empty(), "empty subnegotiation");
                    self.subnegs.push((payload[0], payload[1..].to_vec()));
                    index += cursor;
                }
                251..=254 => {
                    if rest.len() < 3 {
                        break;
                    }
                    // Negotiation commands are ignored; the test client
                    // accepts everything silently.
                    index += 3;
                }
                _command => {
                    index += 2;
                }
            }
        }
        self.pending.drain(..index);
    }

    /// Pumps until a subnegotiation for `option` whose first payload byte
    /// is `subopcode` arrives; returns the payload body after the
    /// subopcode.
    async fn expect_subneg(&mut self, option: u8, subopcode: u8) -> Vec<u8> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(position) = self
                .subnegs
                .iter()
                .position(|(opt, payload)| *opt == option && payload.first() == Some(&subopcode))
            {
                let (_, payload) = self.subnegs.remove(position);
                return payload[1..].to_vec();
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for subneg opt={option} subop={subopcode}; saw {:?}",
                self.subnegs
            );
            self.pump().await;
        }
    }

    /// Asserts that no subnegotiation with the given subopcode shows up
    /// within the window.
    async fn expect_no_subneg(&mut self, option: u8, subopcode: u8, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        while tokio::time::Instant::now() < deadline {
            self.pump().await;
            assert!(
                !self
                    .subnegs
                    .iter()
                    .any(|(opt, payload)| *opt == option
                        && payload.first() == Some(&subopcode)),
                "unexpected subneg opt={option} subop={subopcode}"
            );
        }
    }

    /// Pumps until the accumulated in-band data contains `needle`.
    async fn expect_data(&mut self, needle: &[u8]) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if self
                .data
                .windows(needle.len().max(1))
                .any(|window| window == needle)
            {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for data {:?}; have {:?}",
                String::from_utf8_lossy(needle),
                String::from_utf8_lossy(&self.data)
            );
            self.pump().await;
        }
    }

    /// Pumps until the server closes the connection.
    async fn expect_close(&mut self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if !self.pump().await {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "connection was not closed"
            );
        }
    }
}

/// Connects a VM client: offers the VMware extension and identifies
/// itself with the canonical test UUID.
async fn connect_vm(addr: std::net::SocketAddr) -> TestClient {
    let mut vm = TestClient::connect(addr).await;
    vm.send(&[IAC, WILL, OPT_VMWARE_EXT]).await;
    let mut identify = Vec::new();
    identify.extend_from_slice(&subneg(
        OPT_VMWARE_EXT,
        &[&[VM_VC_UUID][..], UUID_TEXT.as_bytes()].concat(),
    ));
    vm.send(&identify).await;
    vm
}

/// Connects an observer and attaches it to the test VM's port in
/// read-write mode.
async fn connect_observer(addr: std::net::SocketAddr) -> TestClient {
    let mut observer = TestClient::connect(addr).await;
    observer.send(&[IAC, DO, OPT_VSPC_ADMIN]).await;
    let mut attach = vec![VM_PORT_SET_CONNECTION, 0x00];
    attach.extend_from_slice(canonical_uuid().as_bytes());
    observer.send(&subneg(OPT_VSPC_ADMIN, &attach)).await;
    observer
        .expect_subneg(OPT_VSPC_ADMIN, VM_PORT_CONNECTED)
        .await;
    observer
}

async fn start_server(config: VspcConfig) -> VspcServer {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
    let server = VspcServer::new(
        config.with_observer_listen_addr(Some("127.0.0.1:0".parse().unwrap())),
    )
    .await
    .expect("bind");
    server.start().await.expect("start");
    server
}

fn loopback_config() -> VspcConfig {
    VspcConfig::new("127.0.0.1:0".parse().unwrap())
}

// ============================================================================
// Scenario: normal life of a VM serial port
// ============================================================================

#[tokio::test]
async fn vm_serial_data_reaches_observer() {
    let server = start_server(loopback_config()).await;

    let mut vm = connect_vm(server.vm_addr()).await;
    vm.send(b"hello\r\n").await;

    // Give the binding a moment, then attach and expect the scrollback
    // replay to carry the earlier bytes.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut observer = connect_observer(server.observer_addr().unwrap()).await;
    observer.expect_data(b"hello\r\n").await;

    // Live data flows too.
    vm.send(b"more output\r\n").await;
    observer.expect_data(b"more output\r\n").await;

    // Observer input reaches the VM.
    observer.send(b"reboot\r").await;
    vm.expect_data(b"reboot\r").await;

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn identification_split_across_writes_still_binds() {
    let server = start_server(loopback_config()).await;

    let mut vm = TestClient::connect(server.vm_addr()).await;
    vm.send(&[IAC, WILL, OPT_VMWARE_EXT]).await;

    // Split the VC-UUID subnegotiation mid-payload across two writes.
    let mut identify = subneg(
        OPT_VMWARE_EXT,
        &[&[VM_VC_UUID][..], UUID_TEXT.as_bytes()].concat(),
    );
    let tail = identify.split_off(identify.len() / 2);
    vm.send(&identify).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    vm.send(&tail).await;
    vm.send(b"after-split\r\n").await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut observer = connect_observer(server.observer_addr().unwrap()).await;
    observer.expect_data(b"after-split\r\n").await;

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn port_list_names_known_vms() {
    let server = start_server(loopback_config()).await;

    let _vm = connect_vm(server.vm_addr()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut observer = TestClient::connect(server.observer_addr().unwrap()).await;
    observer.send(&[IAC, DO, OPT_VSPC_ADMIN]).await;
    observer
        .send(&subneg(OPT_VSPC_ADMIN, &[GET_VM_PORT_LIST]))
        .await;
    let body = observer.expect_subneg(OPT_VSPC_ADMIN, VM_PORT_LIST).await;
    let text = String::from_utf8(body).unwrap();
    assert!(
        text.contains(&canonical_uuid()),
        "port list should name the VM: {text:?}"
    );

    server.shutdown().await.unwrap();
}

// ============================================================================
// Scenario: successful migration
// ============================================================================

#[tokio::test]
async fn migration_splices_stream_without_loss() {
    let server = start_server(loopback_config()).await;

    let mut source = connect_vm(server.vm_addr()).await;
    source.send(b"before-").await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut observer = connect_observer(server.observer_addr().unwrap()).await;
    observer.expect_data(b"before-").await;

    // Source announces the migration and is granted a secret.
    source
        .send(&subneg(OPT_VMWARE_EXT, &[VMOTION_BEGIN, 0x01]))
        .await;
    let goahead = source.expect_subneg(OPT_VMWARE_EXT, VMOTION_GOAHEAD).await;
    assert_eq!(goahead[0], 0x01, "goahead echoes the migration id");
    assert_eq!(goahead.len(), 1 + 8, "id plus 64-bit secret");

    // Destination rendezvouses with the same credentials.
    let mut destination = TestClient::connect(server.vm_addr()).await;
    destination.send(&[IAC, WILL, OPT_VMWARE_EXT]).await;
    let mut peer = vec![VMOTION_PEER];
    peer.extend_from_slice(&goahead);
    destination.send(&subneg(OPT_VMWARE_EXT, &peer)).await;
    let peer_ok = destination
        .expect_subneg(OPT_VMWARE_EXT, VMOTION_PEER_OK)
        .await;
    assert_eq!(peer_ok, vec![0x01]);

    // One more byte from the source before the cutover.
    source.send(b"last-").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    destination
        .send(&subneg(OPT_VMWARE_EXT, &[VMOTION_COMPLETE, 0x01]))
        .await;
    destination.send(b"after").await;

    // The old transport is closed and the stream is contiguous.
    source.expect_close().await;
    observer.expect_data(b"before-last-after").await;

    let manager = server.manager();
    assert_eq!(manager.pending_migration_count(), 0);
    assert_eq!(manager.session_count(), 1);

    server.shutdown().await.unwrap();
}

// ============================================================================
// Scenario: wrong secret
// ============================================================================

#[tokio::test]
async fn wrong_secret_gets_no_peer_ok_and_is_dropped() {
    let config = loopback_config().with_peer_timeout(Duration::from_millis(200));
    let server = start_server(config).await;

    let mut source = connect_vm(server.vm_addr()).await;
    source
        .send(&subneg(OPT_VMWARE_EXT, &[VMOTION_BEGIN, 0x01]))
        .await;
    let goahead = source.expect_subneg(OPT_VMWARE_EXT, VMOTION_GOAHEAD).await;

    // Corrupt the secret's last byte.
    let mut peer = vec![VMOTION_PEER];
    peer.extend_from_slice(&goahead);
    let last = peer.len() - 1;
    peer[last] ^= 0xFF;

    let mut imposter = TestClient::connect(server.vm_addr()).await;
    imposter.send(&[IAC, WILL, OPT_VMWARE_EXT]).await;
    imposter.send(&subneg(OPT_VMWARE_EXT, &peer)).await;

    imposter
        .expect_no_subneg(OPT_VMWARE_EXT, VMOTION_PEER_OK, Duration::from_millis(300))
        .await;
    imposter.expect_close().await;

    // The source remains active.
    source.send(b"still here\r\n").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut observer = connect_observer(server.observer_addr().unwrap()).await;
    observer.expect_data(b"still here\r\n").await;

    server.shutdown().await.unwrap();
}

// ============================================================================
// Scenario: migration refused by policy
// ============================================================================

#[tokio::test]
async fn disabled_migrations_answer_notnow() {
    let config = loopback_config().with_migrations_enabled(false);
    let server = start_server(config).await;

    let mut vm = connect_vm(server.vm_addr()).await;
    vm.send(&subneg(OPT_VMWARE_EXT, &[VMOTION_BEGIN, 0x02]))
        .await;
    let body = vm.expect_subneg(OPT_VMWARE_EXT, VMOTION_NOTNOW).await;
    assert_eq!(body, vec![0x02]);
    assert_eq!(server.manager().pending_migration_count(), 0);

    server.shutdown().await.unwrap();
}

// ============================================================================
// Scenario: goahead expiry
// ============================================================================

#[tokio::test]
async fn goahead_expiry_aborts_and_source_continues() {
    let config = loopback_config().with_goahead_timeout(Duration::from_millis(150));
    let server = start_server(config).await;

    let mut source = connect_vm(server.vm_addr()).await;
    source
        .send(&subneg(OPT_VMWARE_EXT, &[VMOTION_BEGIN, 0x03]))
        .await;
    source.expect_subneg(OPT_VMWARE_EXT, VMOTION_GOAHEAD).await;

    // No destination ever appears; the server calls the migration off.
    let abort = source.expect_subneg(OPT_VMWARE_EXT, VMOTION_ABORT).await;
    assert_eq!(abort, vec![0x03]);
    assert_eq!(server.manager().pending_migration_count(), 0);

    // The source is still the active transport.
    source.send(b"survived\r\n").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut observer = connect_observer(server.observer_addr().unwrap()).await;
    observer.expect_data(b"survived\r\n").await;

    server.shutdown().await.unwrap();
}

// ============================================================================
// Admission policy
// ============================================================================

#[tokio::test]
async fn unidentified_connection_is_dropped_at_deadline() {
    let config = loopback_config().with_admission_timeout(Duration::from_millis(200));
    let server = start_server(config).await;

    let mut anonymous = TestClient::connect(server.vm_addr()).await;
    anonymous.send(b"no identity here").await;
    anonymous.expect_close().await;
    assert_eq!(server.manager().session_count(), 0);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn changed_uuid_closes_the_connection() {
    let server = start_server(loopback_config()).await;

    let mut vm = connect_vm(server.vm_addr()).await;
    // A different identity on the same connection is not meaningful.
    vm.send(&subneg(
        OPT_VMWARE_EXT,
        &[&[VM_VC_UUID][..], b"AABBCCDDEEFF00112233445566778899"].concat(),
    ))
    .await;
    vm.expect_close().await;

    server.shutdown().await.unwrap();
}
