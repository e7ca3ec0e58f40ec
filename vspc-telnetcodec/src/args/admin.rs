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

//! vSPC administrative option
//!
//! The admin option (Telnet option 0xE9) is spoken only between a vSPC and
//! its observer clients. It lets the server publish the list of known VM
//! ports and lets a client attach its in-band Telnet data to one of them,
//! with an access mode governing concurrent attachment.

use crate::args::write_escaped;
use bytes::Bytes;
use std::fmt::Formatter;
use tracing::warn;

/// Client requests the VM port list.
pub const GET_VM_PORT_LIST: u8 = 0x10;
/// Server's VM port list reply.
pub const VM_PORT_LIST: u8 = 0x11;
/// Client attaches to (or, with an empty body, detaches from) a VM port.
pub const VM_PORT_SET_CONNECTION: u8 = 0x20;
/// Server ack: the client is attached.
pub const VM_PORT_CONNECTED: u8 = 0x21;
/// Server ack: the client is not attached.
pub const VM_PORT_DISCONNECTED: u8 = 0x22;

/// Access mode requested when attaching to a VM port.
///
/// `ReadWrite` is the default and places no restrictions on concurrent
/// attachments. The exclusive modes fail (or, for `ReadOnlyOk`, downgrade)
/// when they would conflict with an existing attachment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum AccessMode {
    /// Read-write; no exclusivity claimed.
    ReadWrite = 0x00,
    /// Read-only; no exclusivity claimed.
    ReadOnly = 0x01,
    /// Sole attachment of any kind.
    Exclusive = 0x10,
    /// Sole writer; read-only attachments tolerated.
    ExclusiveWrite = 0x11,
    /// Read-write if possible, read-only when another exclusive writer
    /// exists.
    ReadOnlyOk = 0x20,
}

impl AccessMode {
    /// Decode a mode byte.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(AccessMode::ReadWrite),
            0x01 => Some(AccessMode::ReadOnly),
            0x10 => Some(AccessMode::Exclusive),
            0x11 => Some(AccessMode::ExclusiveWrite),
            0x20 => Some(AccessMode::ReadOnlyOk),
            _ => None,
        }
    }

    /// The wire byte for this mode.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// One entry of the VM port list: identifier, display name, and the URI an
/// out-of-band listener serves it on (empty when none).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PortListing {
    /// The port identifier used for attachment.
    pub port_id: String,
    /// The VM's display name.
    pub vm_name: String,
    /// Listening URI, if any.
    pub listening_uri: String,
}

///
/// A parsed admin-option subnegotiation.
///
#[derive(Clone, Debug, PartialEq)]
pub enum AdminMessage {
    /// Client requests the port list.
    GetPortList,
    /// Server's port list.
    PortList(Vec<PortListing>),
    /// Client attaches to a port.
    Connect {
        /// Requested access mode.
        mode: AccessMode,
        /// The port identifier to attach to.
        port_id: String,
    },
    /// Client detaches (empty-bodied `VM-PORT-SET-CONNECTION`).
    Disconnect,
    /// Server ack: attached.
    Connected,
    /// Server ack: detached or attach refused.
    Disconnected,
    /// Unparseable or unrecognized admin subnegotiation.
    Unknown {
        /// The subopcode byte.
        subopcode: u8,
        /// The unparsed body.
        data: Bytes,
    },
}

impl AdminMessage {
    /// Parses a subnegotiation payload (`subopcode || body`). The caller
    /// guarantees at least one byte.
    pub fn parse(payload: &[u8]) -> AdminMessage {
        let subopcode = payload[0];
        let body = &payload[1..];
        match subopcode {
            GET_VM_PORT_LIST if body.is_empty() => AdminMessage::GetPortList,
            VM_PORT_LIST => match Self::decode_port_list(body) {
                Some(listings) => AdminMessage::PortList(listings),
                None => Self::malformed(subopcode, body, "port list is not field triples"),
            },
            VM_PORT_SET_CONNECTION if body.is_empty() => AdminMessage::Disconnect,
            VM_PORT_SET_CONNECTION => {
                let Some(mode) = AccessMode::from_u8(body[0]) else {
                    return Self::malformed(subopcode, body, "invalid access mode");
                };
                match std::str::from_utf8(&body[1..]) {
                    Ok(port_id) if !port_id.is_empty() => AdminMessage::Connect {
                        mode,
                        port_id: port_id.to_owned(),
                    },
                    _ => Self::malformed(subopcode, body, "missing or non-UTF-8 port id"),
                }
            }
            VM_PORT_CONNECTED if body.is_empty() => AdminMessage::Connected,
            VM_PORT_DISCONNECTED if body.is_empty() => AdminMessage::Disconnected,
            _ => Self::malformed(subopcode, body, "unrecognized admin subnegotiation"),
        }
    }

    fn malformed(subopcode: u8, body: &[u8], reason: &str) -> AdminMessage {
        warn!(subopcode, reason, "Bad admin subnegotiation");
        AdminMessage::Unknown {
            subopcode,
            data: Bytes::copy_from_slice(body),
        }
    }

    /// Port list entries are flattened into NUL-separated fields, three per
    /// entry. An empty body is an empty list.
    fn decode_port_list(body: &[u8]) -> Option<Vec<PortListing>> {
        if body.is_empty() {
            return Some(Vec::new());
        }
        let fields: Vec<&[u8]> = body.split(|&b| b == 0).collect();
        if fields.len() % 3 != 0 {
            return None;
        }
        let mut listings = Vec::with_capacity(fields.len() / 3);
        for triple in fields.chunks_exact(3) {
            listings.push(PortListing {
                port_id: std::str::from_utf8(triple[0]).ok()?.to_owned(),
                vm_name: std::str::from_utf8(triple[1]).ok()?.to_owned(),
                listening_uri: std::str::from_utf8(triple[2]).ok()?.to_owned(),
            });
        }
        Some(listings)
    }

    fn encode_port_list(listings: &[PortListing]) -> Vec<u8> {
        let mut body = Vec::new();
        for (index, listing) in listings.iter().enumerate() {
            if index > 0 {
                body.push(0);
            }
            body.extend_from_slice(listing.port_id.as_bytes());
            body.push(0);
            body.extend_from_slice(listing.vm_name.as_bytes());
            body.push(0);
            body.extend_from_slice(listing.listening_uri.as_bytes());
        }
        body
    }

    /// The subopcode byte this message encodes to.
    pub fn subopcode(&self) -> u8 {
        match self {
            AdminMessage::GetPortList => GET_VM_PORT_LIST,
            AdminMessage::PortList(_) => VM_PORT_LIST,
            AdminMessage::Connect { .. } | AdminMessage::Disconnect => VM_PORT_SET_CONNECTION,
            AdminMessage::Connected => VM_PORT_CONNECTED,
            AdminMessage::Disconnected => VM_PORT_DISCONNECTED,
            AdminMessage::Unknown { subopcode, .. } => *subopcode,
        }
    }

    /// Unescaped payload length (subopcode plus body).
    pub fn len(&self) -> usize {
        1 + match self {
            AdminMessage::GetPortList
            | AdminMessage::Disconnect
            | AdminMessage::Connected
            | AdminMessage::Disconnected => 0,
            AdminMessage::PortList(listings) => Self::encode_port_list(listings).len(),
            AdminMessage::Connect { port_id, .. } => 1 + port_id.len(),
            AdminMessage::Unknown { data, .. } => data.len(),
        }
    }

    /// Returns `true` if only the subopcode byte would be written.
    pub fn is_empty(&self) -> bool {
        self.len() == 1
    }

    /// Writes the payload (subopcode plus IAC-escaped body).
    pub fn write<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<usize> {
        writer.write_all(&[self.subopcode()])?;
        match self {
            AdminMessage::GetPortList
            | AdminMessage::Disconnect
            | AdminMessage::Connected
            | AdminMessage::Disconnected => Ok(1),
            AdminMessage::PortList(listings) => {
                Ok(1 + write_escaped(writer, &Self::encode_port_list(listings))?)
            }
            AdminMessage::Connect { mode, port_id } => {
                let mut written = 1 + write_escaped(writer, &[mode.to_u8()])?;
                written += write_escaped(writer, port_id.as_bytes())?;
                Ok(written)
            }
            AdminMessage::Unknown { data, .. } => Ok(1 + write_escaped(writer, data)?),
        }
    }
}

impl std::fmt::Display for AdminMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AdminMessage::GetPortList => write!(f, "GET-VM-PORT-LIST"),
            AdminMessage::PortList(listings) => {
                write!(f, "VM-PORT-LIST({} entries)", listings.len())
            }
            AdminMessage::Connect { mode, port_id } => {
                write!(f, "VM-PORT-SET-CONNECTION({mode:?}, {port_id})")
            }
            AdminMessage::Disconnect => write!(f, "VM-PORT-SET-CONNECTION()"),
            AdminMessage::Connected => write!(f, "VM-PORT-CONNECTED"),
            AdminMessage::Disconnected => write!(f, "VM-PORT-DISCONNECTED"),
            AdminMessage::Unknown { subopcode, data } => {
                write!(f, "UNKNOWN-{subopcode:02x}({} bytes)", data.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get_port_list() {
        assert_eq!(
            AdminMessage::parse(&[GET_VM_PORT_LIST]),
            AdminMessage::GetPortList
        );
    }

    #[test]
    fn test_port_list_round_trip() {
        let listings = vec![
            PortListing {
                port_id: "4213F5A695B01F700D5E7CAEB0A6B0AE".into(),
                vm_name: "build-host".into(),
                listening_uri: String::new(),
            },
            PortListing {
                port_id: "AABBCCDDEEFF00112233445566778899.com2".into(),
                vm_name: "db".into(),
                listening_uri: "telnet://0.0.0.0:9901".into(),
            },
        ];
        let message = AdminMessage::PortList(listings);
        let mut out = Vec::new();
        message.write(&mut out).unwrap();
        assert_eq!(AdminMessage::parse(&out), message);
    }

    #[test]
    fn test_empty_port_list() {
        let message = AdminMessage::PortList(Vec::new());
        let mut out = Vec::new();
        message.write(&mut out).unwrap();
        assert_eq!(out, vec![VM_PORT_LIST]);
        assert_eq!(AdminMessage::parse(&out), message);
    }

    #[test]
    fn test_parse_connect_and_disconnect() {
        let mut payload = vec![VM_PORT_SET_CONNECTION, 0x01];
        payload.extend_from_slice(b"uuid-1");
        assert_eq!(
            AdminMessage::parse(&payload),
            AdminMessage::Connect {
                mode: AccessMode::ReadOnly,
                port_id: "uuid-1".into(),
            }
        );
        assert_eq!(
            AdminMessage::parse(&[VM_PORT_SET_CONNECTION]),
            AdminMessage::Disconnect
        );
    }

    #[test]
    fn test_parse_bad_mode_degrades() {
        let payload = [VM_PORT_SET_CONNECTION, 0x7F, b'x'];
        assert!(matches!(
            AdminMessage::parse(&payload),
            AdminMessage::Unknown { .. }
        ));
    }

    #[test]
    fn test_uneven_port_list_degrades() {
        let payload = [VM_PORT_LIST, b'a', 0, b'b'];
        assert!(matches!(
            AdminMessage::parse(&payload),
            AdminMessage::Unknown { .. }
        ));
    }
}
