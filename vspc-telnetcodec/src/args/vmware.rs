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

//! VMware Serial Port Proxy extension
//!
//! The VMware extension (Telnet option 0xE8) provides enhanced capabilities
//! for emulated serial ports attached to virtual machines. Its most
//! noteworthy feature is to facilitate vMotion (live migration) of virtual
//! machines with a serial port: the `VMOTION-*` subopcodes implement the
//! rendezvous through which two host connections are stitched into one
//! logical serial session.
//!
//! Subnegotiation payloads have the layout `subopcode (1 byte) || body`.
//! Bodies are either opaque byte strings (migration ids and secrets) or
//! UTF-8 text (VM identity metadata).

use crate::args::write_escaped;
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use std::fmt::Formatter;
use tracing::warn;

/// Supported-subopcode list, sent by the peer on option activation.
pub const KNOWN_SUBOPTIONS_1: u8 = 0;
/// Supported-subopcode list, our acknowledging advertisement.
pub const KNOWN_SUBOPTIONS_2: u8 = 1;
/// Migration source announces an impending vMotion.
pub const VMOTION_BEGIN: u8 = 40;
/// Our permission for the vMotion, carrying the rendezvous secret.
pub const VMOTION_GOAHEAD: u8 = 41;
/// Our refusal of the vMotion at this time.
pub const VMOTION_NOTNOW: u8 = 43;
/// Migration destination claims the peer slot.
pub const VMOTION_PEER: u8 = 44;
/// Our acceptance of the peer claim.
pub const VMOTION_PEER_OK: u8 = 45;
/// Destination commits the handoff.
pub const VMOTION_COMPLETE: u8 = 46;
/// Source abandons the migration.
pub const VMOTION_ABORT: u8 = 48;
/// Peer asks whether we will proxy for a service URI.
pub const DO_PROXY: u8 = 70;
/// We accept the proxy request.
pub const WILL_PROXY: u8 = 71;
/// We refuse the proxy request.
pub const WONT_PROXY: u8 = 73;
/// VM's vCenter UUID.
pub const VM_VC_UUID: u8 = 80;
/// Request for the VM's vCenter UUID.
pub const GET_VM_VC_UUID: u8 = 81;
/// VM's display name.
pub const VM_NAME: u8 = 82;
/// Request for the VM's display name.
pub const GET_VM_NAME: u8 = 83;
/// VM's BIOS UUID.
pub const VM_BIOS_UUID: u8 = 84;
/// Request for the VM's BIOS UUID.
pub const GET_VM_BIOS_UUID: u8 = 85;
/// URI locating the VM on its current host.
pub const VM_LOCATION_URI: u8 = 86;
/// Request for the VM's location URI.
pub const GET_VM_LOCATION_URI: u8 = 87;

/// Length of the migration secret we generate for `VMOTION-GOAHEAD`.
pub const SECRET_LEN: usize = 8;

/// The subopcodes this concentrator advertises in `KNOWN-SUBOPTIONS-2`.
pub const KNOWN_SUBOPTIONS: &[u8] = &[
    KNOWN_SUBOPTIONS_1,
    KNOWN_SUBOPTIONS_2,
    VMOTION_BEGIN,
    VMOTION_GOAHEAD,
    VMOTION_NOTNOW,
    VMOTION_PEER,
    VMOTION_PEER_OK,
    VMOTION_COMPLETE,
    VMOTION_ABORT,
    DO_PROXY,
    WILL_PROXY,
    WONT_PROXY,
    VM_VC_UUID,
    GET_VM_VC_UUID,
    VM_NAME,
    GET_VM_NAME,
    VM_BIOS_UUID,
    GET_VM_BIOS_UUID,
    VM_LOCATION_URI,
    GET_VM_LOCATION_URI,
];

/// Requested proxy direction from `DO-PROXY`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProxyDirection {
    /// `C` — the peer is the client end of the proxied port.
    Client,
    /// `S` — the peer is the server end of the proxied port.
    Server,
}

impl ProxyDirection {
    /// Decode the direction byte; anything other than `C`/`S` is invalid.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            b'C' => Some(ProxyDirection::Client),
            b'S' => Some(ProxyDirection::Server),
            _ => None,
        }
    }

    /// The wire byte for this direction.
    pub fn to_u8(self) -> u8 {
        match self {
            ProxyDirection::Client => b'C',
            ProxyDirection::Server => b'S',
        }
    }
}

///
/// A parsed VMware-extension subnegotiation.
///
/// Parsing never fails the connection: unknown subopcodes and known
/// subopcodes with malformed bodies come back as [`VmwareExtMessage::Unknown`]
/// with a logged warning, and the upper layer ignores them.
///
#[derive(Clone, Debug, PartialEq)]
pub enum VmwareExtMessage {
    /// Peer's supported-subopcode advertisement.
    KnownSuboptions1(Bytes),
    /// Our supported-subopcode advertisement.
    KnownSuboptions2(Bytes),
    /// VM vCenter UUID text.
    VcUuid(String),
    /// Request for the VC UUID.
    GetVcUuid,
    /// VM display name text.
    VmName(String),
    /// Request for the VM name.
    GetVmName,
    /// VM BIOS UUID text.
    VmBiosUuid(String),
    /// Request for the BIOS UUID.
    GetVmBiosUuid,
    /// VM location URI text.
    VmLocationUri(String),
    /// Request for the location URI.
    GetVmLocationUri,
    /// Proxy request: direction plus service URI.
    DoProxy {
        /// Which end of the port the peer presents.
        direction: ProxyDirection,
        /// The service URI, possibly carrying `?key=value` arguments.
        uri: String,
    },
    /// Proxy accepted.
    WillProxy,
    /// Proxy refused.
    WontProxy,
    /// Migration source announces a vMotion, identified by an opaque
    /// sequence the destination will echo back.
    VmotionBegin(Bytes),
    /// Our permission: the sequence plus a fresh secret.
    VmotionGoahead {
        /// The migration id from `VMOTION-BEGIN`.
        id: Bytes,
        /// The secret the destination must present, as a big-endian
        /// 64-bit value on the wire.
        secret: u64,
    },
    /// Our refusal of the announced vMotion.
    VmotionNotNow(Bytes),
    /// Destination claims the peer slot with the id and secret from our
    /// `GOAHEAD`.
    VmotionPeer {
        /// The migration id.
        id: Bytes,
        /// The presented secret.
        secret: u64,
    },
    /// We accept the peer claim.
    VmotionPeerOk(Bytes),
    /// Destination commits the handoff. The body may be empty.
    VmotionComplete(Bytes),
    /// Source abandons the migration. The id is optional on the wire; both
    /// forms occur in the wild.
    VmotionAbort(Option<Bytes>),
    /// A subopcode we do not understand, or a known subopcode with a
    /// malformed body. Carried for logging, otherwise ignored.
    Unknown {
        /// The subopcode byte.
        subopcode: u8,
        /// The unparsed body.
        data: Bytes,
    },
}

impl VmwareExtMessage {
    /// Parses a subnegotiation payload (`subopcode || body`). The caller
    /// guarantees at least one byte.
    pub fn parse(payload: &[u8]) -> VmwareExtMessage {
        let subopcode = payload[0];
        let body = &payload[1..];
        match subopcode {
            KNOWN_SUBOPTIONS_1 => {
                VmwareExtMessage::KnownSuboptions1(Bytes::copy_from_slice(body))
            }
            KNOWN_SUBOPTIONS_2 => {
                VmwareExtMessage::KnownSuboptions2(Bytes::copy_from_slice(body))
            }
            VM_VC_UUID => Self::text(subopcode, body, VmwareExtMessage::VcUuid),
            GET_VM_VC_UUID => VmwareExtMessage::GetVcUuid,
            VM_NAME => Self::text(subopcode, body, VmwareExtMessage::VmName),
            GET_VM_NAME => VmwareExtMessage::GetVmName,
            VM_BIOS_UUID => Self::text(subopcode, body, VmwareExtMessage::VmBiosUuid),
            GET_VM_BIOS_UUID => VmwareExtMessage::GetVmBiosUuid,
            VM_LOCATION_URI => Self::text(subopcode, body, VmwareExtMessage::VmLocationUri),
            GET_VM_LOCATION_URI => VmwareExtMessage::GetVmLocationUri,
            DO_PROXY => {
                let Some(direction) = body.first().copied().and_then(ProxyDirection::from_u8)
                else {
                    return Self::malformed(subopcode, body, "missing or invalid direction");
                };
                match std::str::from_utf8(&body[1..]) {
                    Ok(uri) => VmwareExtMessage::DoProxy {
                        direction,
                        uri: uri.to_owned(),
                    },
                    Err(_) => Self::malformed(subopcode, body, "service URI is not UTF-8"),
                }
            }
            WILL_PROXY => VmwareExtMessage::WillProxy,
            WONT_PROXY => VmwareExtMessage::WontProxy,
            VMOTION_BEGIN => {
                if body.is_empty() {
                    Self::malformed(subopcode, body, "empty migration id")
                } else {
                    VmwareExtMessage::VmotionBegin(Bytes::copy_from_slice(body))
                }
            }
            VMOTION_GOAHEAD => match Self::split_secret(body) {
                Some((id, secret)) => VmwareExtMessage::VmotionGoahead { id, secret },
                None => Self::malformed(subopcode, body, "body shorter than id plus secret"),
            },
            VMOTION_NOTNOW => VmwareExtMessage::VmotionNotNow(Bytes::copy_from_slice(body)),
            VMOTION_PEER => match Self::split_secret(body) {
                Some((id, secret)) => VmwareExtMessage::VmotionPeer { id, secret },
                None => Self::malformed(subopcode, body, "body shorter than id plus secret"),
            },
            VMOTION_PEER_OK => VmwareExtMessage::VmotionPeerOk(Bytes::copy_from_slice(body)),
            VMOTION_COMPLETE => VmwareExtMessage::VmotionComplete(Bytes::copy_from_slice(body)),
            VMOTION_ABORT => {
                if body.is_empty() {
                    VmwareExtMessage::VmotionAbort(None)
                } else {
                    VmwareExtMessage::VmotionAbort(Some(Bytes::copy_from_slice(body)))
                }
            }
            _ => {
                warn!(
                    subopcode,
                    len = body.len(),
                    "Unrecognized VMware extension subopcode"
                );
                VmwareExtMessage::Unknown {
                    subopcode,
                    data: Bytes::copy_from_slice(body),
                }
            }
        }
    }

    fn text(
        subopcode: u8,
        body: &[u8],
        build: impl FnOnce(String) -> VmwareExtMessage,
    ) -> VmwareExtMessage {
        match std::str::from_utf8(body) {
            Ok(text) => build(text.to_owned()),
            Err(_) => Self::malformed(subopcode, body, "body is not UTF-8"),
        }
    }

    fn malformed(subopcode: u8, body: &[u8], reason: &str) -> VmwareExtMessage {
        warn!(subopcode, reason, "Malformed VMware extension subnegotiation");
        VmwareExtMessage::Unknown {
            subopcode,
            data: Bytes::copy_from_slice(body),
        }
    }

    /// Splits `id || secret` where the secret occupies the trailing
    /// [`SECRET_LEN`] bytes. The id must be at least one byte.
    fn split_secret(body: &[u8]) -> Option<(Bytes, u64)> {
        if body.len() <= SECRET_LEN {
            return None;
        }
        let split = body.len() - SECRET_LEN;
        let secret = BigEndian::read_u64(&body[split..]);
        Some((Bytes::copy_from_slice(&body[..split]), secret))
    }

    /// The subopcode byte this message encodes to.
    pub fn subopcode(&self) -> u8 {
        match self {
            VmwareExtMessage::KnownSuboptions1(_) => KNOWN_SUBOPTIONS_1,
            VmwareExtMessage::KnownSuboptions2(_) => KNOWN_SUBOPTIONS_2,
            VmwareExtMessage::VcUuid(_) => VM_VC_UUID,
            VmwareExtMessage::GetVcUuid => GET_VM_VC_UUID,
            VmwareExtMessage::VmName(_) => VM_NAME,
            VmwareExtMessage::GetVmName => GET_VM_NAME,
            VmwareExtMessage::VmBiosUuid(_) => VM_BIOS_UUID,
            VmwareExtMessage::GetVmBiosUuid => GET_VM_BIOS_UUID,
            VmwareExtMessage::VmLocationUri(_) => VM_LOCATION_URI,
            VmwareExtMessage::GetVmLocationUri => GET_VM_LOCATION_URI,
            VmwareExtMessage::DoProxy { .. } => DO_PROXY,
            VmwareExtMessage::WillProxy => WILL_PROXY,
            VmwareExtMessage::WontProxy => WONT_PROXY,
            VmwareExtMessage::VmotionBegin(_) => VMOTION_BEGIN,
            VmwareExtMessage::VmotionGoahead { .. } => VMOTION_GOAHEAD,
            VmwareExtMessage::VmotionNotNow(_) => VMOTION_NOTNOW,
            VmwareExtMessage::VmotionPeer { .. } => VMOTION_PEER,
            VmwareExtMessage::VmotionPeerOk(_) => VMOTION_PEER_OK,
            VmwareExtMessage::VmotionComplete(_) => VMOTION_COMPLETE,
            VmwareExtMessage::VmotionAbort(_) => VMOTION_ABORT,
            VmwareExtMessage::Unknown { subopcode, .. } => *subopcode,
        }
    }

    /// Unescaped payload length (subopcode plus body).
    pub fn len(&self) -> usize {
        1 + match self {
            VmwareExtMessage::KnownSuboptions1(list)
            | VmwareExtMessage::KnownSuboptions2(list) => list.len(),
            VmwareExtMessage::VcUuid(text)
            | VmwareExtMessage::VmName(text)
            | VmwareExtMessage::VmBiosUuid(text)
            | VmwareExtMessage::VmLocationUri(text) => text.len(),
            VmwareExtMessage::GetVcUuid
            | VmwareExtMessage::GetVmName
            | VmwareExtMessage::GetVmBiosUuid
            | VmwareExtMessage::GetVmLocationUri
            | VmwareExtMessage::WillProxy
            | VmwareExtMessage::WontProxy => 0,
            VmwareExtMessage::DoProxy { uri, .. } => 1 + uri.len(),
            VmwareExtMessage::VmotionBegin(id)
            | VmwareExtMessage::VmotionNotNow(id)
            | VmwareExtMessage::VmotionPeerOk(id)
            | VmwareExtMessage::VmotionComplete(id) => id.len(),
            VmwareExtMessage::VmotionGoahead { id, .. }
            | VmwareExtMessage::VmotionPeer { id, .. } => id.len() + SECRET_LEN,
            VmwareExtMessage::VmotionAbort(id) => id.as_ref().map_or(0, Bytes::len),
            VmwareExtMessage::Unknown { data, .. } => data.len(),
        }
    }

    /// Returns `true` if only the subopcode byte would be written.
    pub fn is_empty(&self) -> bool {
        self.len() == 1
    }

    /// Writes the payload (subopcode plus IAC-escaped body).
    pub fn write<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<usize> {
        writer.write_all(&[self.subopcode()])?;
        let body = match self {
            VmwareExtMessage::KnownSuboptions1(list)
            | VmwareExtMessage::KnownSuboptions2(list) => {
                return Ok(1 + write_escaped(writer, list)?);
            }
            VmwareExtMessage::VcUuid(text)
            | VmwareExtMessage::VmName(text)
            | VmwareExtMessage::VmBiosUuid(text)
            | VmwareExtMessage::VmLocationUri(text) => {
                return Ok(1 + write_escaped(writer, text.as_bytes())?);
            }
            VmwareExtMessage::GetVcUuid
            | VmwareExtMessage::GetVmName
            | VmwareExtMessage::GetVmBiosUuid
            | VmwareExtMessage::GetVmLocationUri
            | VmwareExtMessage::WillProxy
            | VmwareExtMessage::WontProxy => return Ok(1),
            VmwareExtMessage::DoProxy { direction, uri } => {
                let mut written = 1 + write_escaped(writer, &[direction.to_u8()])?;
                written += write_escaped(writer, uri.as_bytes())?;
                return Ok(written);
            }
            VmwareExtMessage::VmotionBegin(id)
            | VmwareExtMessage::VmotionNotNow(id)
            | VmwareExtMessage::VmotionPeerOk(id)
            | VmwareExtMessage::VmotionComplete(id) => id.clone(),
            VmwareExtMessage::VmotionGoahead { id, secret }
            | VmwareExtMessage::VmotionPeer { id, secret } => {
                let mut wire_secret = [0u8; SECRET_LEN];
                BigEndian::write_u64(&mut wire_secret, *secret);
                let mut written = 1 + write_escaped(writer, id)?;
                written += write_escaped(writer, &wire_secret)?;
                return Ok(written);
            }
            VmwareExtMessage::VmotionAbort(id) => id.clone().unwrap_or_default(),
            VmwareExtMessage::Unknown { data, .. } => data.clone(),
        };
        Ok(1 + write_escaped(writer, &body)?)
    }
}

impl std::fmt::Display for VmwareExtMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            VmwareExtMessage::KnownSuboptions1(list) => {
                write!(f, "KNOWN-SUBOPTIONS-1({} entries)", list.len())
            }
            VmwareExtMessage::KnownSuboptions2(list) => {
                write!(f, "KNOWN-SUBOPTIONS-2({} entries)", list.len())
            }
            VmwareExtMessage::VcUuid(text) => write!(f, "VM-VC-UUID({text})"),
            VmwareExtMessage::GetVcUuid => write!(f, "GET-VM-VC-UUID"),
            VmwareExtMessage::VmName(text) => write!(f, "VM-NAME({text})"),
            VmwareExtMessage::GetVmName => write!(f, "GET-VM-NAME"),
            VmwareExtMessage::VmBiosUuid(text) => write!(f, "VM-BIOS-UUID({text})"),
            VmwareExtMessage::GetVmBiosUuid => write!(f, "GET-VM-BIOS-UUID"),
            VmwareExtMessage::VmLocationUri(text) => write!(f, "VM-LOCATION-URI({text})"),
            VmwareExtMessage::GetVmLocationUri => write!(f, "GET-VM-LOCATION-URI"),
            VmwareExtMessage::DoProxy { direction, uri } => {
                write!(f, "DO-PROXY({}, {uri})", direction.to_u8() as char)
            }
            VmwareExtMessage::WillProxy => write!(f, "WILL-PROXY"),
            VmwareExtMessage::WontProxy => write!(f, "WONT-PROXY"),
            VmwareExtMessage::VmotionBegin(id) => write!(f, "VMOTION-BEGIN({id:02x?})"),
            VmwareExtMessage::VmotionGoahead { id, .. } => {
                write!(f, "VMOTION-GOAHEAD({id:02x?}, <secret>)")
            }
            VmwareExtMessage::VmotionNotNow(id) => write!(f, "VMOTION-NOTNOW({id:02x?})"),
            VmwareExtMessage::VmotionPeer { id, .. } => {
                write!(f, "VMOTION-PEER({id:02x?}, <secret>)")
            }
            VmwareExtMessage::VmotionPeerOk(id) => write!(f, "VMOTION-PEER-OK({id:02x?})"),
            VmwareExtMessage::VmotionComplete(id) => write!(f, "VMOTION-COMPLETE({id:02x?})"),
            VmwareExtMessage::VmotionAbort(Some(id)) => write!(f, "VMOTION-ABORT({id:02x?})"),
            VmwareExtMessage::VmotionAbort(None) => write!(f, "VMOTION-ABORT"),
            VmwareExtMessage::Unknown { subopcode, data } => {
                write!(f, "UNKNOWN-{subopcode:02x}({} bytes)", data.len())
            }
        }
    }
}

/// Normalizes VM UUID text into the canonical 32-hex-character form.
///
/// vCenter transmits UUIDs in several shapes (`xxxxxxxx-xxxx-...`,
/// `xx xx xx ...`). Non-hex characters are stripped and the result must be
/// exactly 32 hex digits, else the UUID is rejected.
pub fn sanitize_uuid(text: &str) -> Option<String> {
    let uuid: String = text
        .to_uppercase()
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect();
    if uuid.len() == 32 { Some(uuid) } else { None }
}
