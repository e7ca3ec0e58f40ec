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

//! Core identifier types for the vSPC service

use std::fmt;
use vspc_telnetcodec::vmware;

/// Unique identifier for a transport connection (monotonically increasing,
/// never reused).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new connection ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the underlying u64 value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The stable identity of a virtual machine, derived from the `VM-VC-UUID`
/// subnegotiation and normalized to 32 uppercase hex characters.
///
/// This is the key under which a logical serial session survives
/// reconnection and migration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VmUuid(String);

impl VmUuid {
    /// Parses and normalizes UUID text from the wire.
    ///
    /// vCenter-style UUIDs (32 hex digits in any punctuation) are
    /// canonicalized so that every spelling of the same identity maps to
    /// one session. Other non-empty printable identities are accepted
    /// verbatim; only empty or control-character text is rejected.
    pub fn parse(text: &str) -> Option<Self> {
        if let Some(canonical) = vmware::sanitize_uuid(text) {
            return Some(VmUuid(canonical));
        }
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_control) {
            return None;
        }
        Some(VmUuid(trimmed.to_owned()))
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The identifier a VM port is published under: the VC UUID, plus a port
/// label when the VM exposes more than one serial port
/// (`<uuid>` or `<uuid>.<label>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortId {
    uuid: VmUuid,
    label: Option<String>,
}

impl PortId {
    /// Builds a port id from its parts.
    pub fn new(uuid: VmUuid, label: Option<String>) -> Self {
        Self { uuid, label }
    }

    /// The VM identity component.
    pub fn uuid(&self) -> &VmUuid {
        &self.uuid
    }

    /// The port label component, if any.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{}.{}", self.uuid, label),
            None => write!(f, "{}", self.uuid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(7).to_string(), "conn-7");
    }

    #[test]
    fn test_vm_uuid_normalization() {
        let a = VmUuid::parse("4213f5a6-95b0-1f70-0d5e-7caeb0a6b0ae").unwrap();
        let b = VmUuid::parse("4213F5A6 95B0 1F70 0D5E 7CAEB0A6B0AE").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_vm_uuid_opaque_identities() {
        // Identities that are not vCenter UUIDs pass through verbatim.
        assert_eq!(VmUuid::parse("abc-123").unwrap().as_str(), "abc-123");
        assert!(VmUuid::parse("").is_none());
        assert!(VmUuid::parse("  ").is_none());
        assert!(VmUuid::parse("bad\x07id").is_none());
    }

    #[test]
    fn test_port_id_display() {
        let uuid = VmUuid::parse("4213f5a6-95b0-1f70-0d5e-7caeb0a6b0ae").unwrap();
        assert_eq!(
            PortId::new(uuid.clone(), None).to_string(),
            uuid.as_str().to_owned()
        );
        assert_eq!(
            PortId::new(uuid.clone(), Some("com2".into())).to_string(),
            format!("{}.com2", uuid)
        );
    }
}
