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

//! Error types for the vSPC service

use crate::types::ConnectionId;
use thiserror::Error;

/// Result type for vSPC operations
pub type Result<T> = std::result::Result<T, VspcError>;

/// vSPC service error types
#[derive(Debug, Error)]
pub enum VspcError {
    /// I/O error from the underlying TCP stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error from the codec layer
    #[error("Protocol error: {0}")]
    Protocol(#[from] vspc_telnetcodec::CodecError),

    /// A connection re-announced a different VC UUID mid-session
    #[error("Connection {0} changed its VM identity mid-session")]
    IdentityChanged(ConnectionId),

    /// Connection has been closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// A connection produced no VM identity within the admission window
    #[error("Connection {0} was not admitted before the deadline")]
    AdmissionTimeout(ConnectionId),

    /// An observer requested access the port arbitration refused
    #[error("Port access denied: {0}")]
    AccessDenied(String),

    /// No VM port matches the requested identifier
    #[error("VM port {0:?} not found")]
    PortNotFound(String),

    /// Server is not running
    #[error("Server not running")]
    ServerNotRunning,

    /// Generic error with a message
    #[error("{0}")]
    Other(String),
}

impl VspcError {
    /// Whether the error only concerns a single connection. Per-connection
    /// errors never destroy the session the connection was bound to.
    pub fn is_connection_local(&self) -> bool {
        matches!(
            self,
            VspcError::Io(_)
                | VspcError::Protocol(_)
                | VspcError::IdentityChanged(_)
                | VspcError::ConnectionClosed
                | VspcError::AdmissionTimeout(_)
        )
    }

    /// Whether the error came from the Telnet protocol layer.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, VspcError::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VspcError::IdentityChanged(ConnectionId::new(42));
        assert_eq!(
            err.to_string(),
            "Connection conn-42 changed its VM identity mid-session"
        );
    }

    #[test]
    fn test_error_is_connection_local() {
        assert!(VspcError::ConnectionClosed.is_connection_local());
        assert!(VspcError::AdmissionTimeout(ConnectionId::new(1)).is_connection_local());
        assert!(!VspcError::ServerNotRunning.is_connection_local());
        assert!(!VspcError::AccessDenied("busy".into()).is_connection_local());
    }
}
