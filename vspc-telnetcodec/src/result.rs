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

/// Result Type for Codec Operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Represents possible errors that can occur in the codec handling process.
///
/// Frame-level errors returned from `decode` are fatal for the connection:
/// the stream can no longer be framed reliably and the transport should be
/// closed. Semantic problems inside an otherwise well-framed subnegotiation
/// are *not* reported through this type; they degrade to
/// [`TelnetArgument::Unknown`](crate::TelnetArgument::Unknown) instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// An I/O error occurred while reading from or writing to the underlying stream.
    IOError {
        /// The kind of I/O error that occurred
        kind: std::io::ErrorKind,
        /// Description of the operation that failed
        operation: String,
    },

    /// Error occurred during telnet option negotiation.
    NegotiationError {
        /// Description of what went wrong during negotiation
        reason: String,
        /// The frame type that caused the error, if available
        frame_type: Option<String>,
    },

    /// Error occurred while framing or parsing an option subnegotiation.
    SubnegotiationError {
        /// The telnet option being subnegotiated, if it was read
        option: Option<u8>,
        /// Specific reason for the failure
        reason: SubnegotiationErrorKind,
    },

    /// An unknown or invalid telnet command byte was encountered where the
    /// protocol forbids recovery (e.g. a bare `IAC SE`).
    UnexpectedCommand(u8),
}

/// Specific kinds of subnegotiation errors with structured context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubnegotiationErrorKind {
    /// An `IAC` inside the payload was followed by a byte that is neither
    /// `IAC` nor `SE`. The payload framing is unrecoverable.
    InvalidEscape {
        /// The offending command byte
        command: u8,
    },

    /// The accumulated payload exceeded the decoder's size cap.
    Overlong {
        /// The configured maximum payload size
        limit: usize,
    },

    /// The subnegotiation carried no option code or payload at all.
    Empty,

    /// Generic subnegotiation error with a description.
    Other {
        /// Description of the error
        description: String,
    },
}

impl std::error::Error for CodecError {}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::IOError { kind, operation } => {
                write!(f, "I/O error ({kind}) during {operation}")
            }
            CodecError::NegotiationError { reason, frame_type } => match frame_type {
                Some(frame) => write!(f, "negotiation error: {reason} (frame: {frame})"),
                None => write!(f, "negotiation error: {reason}"),
            },
            CodecError::SubnegotiationError { option, reason } => match option {
                Some(code) => write!(f, "subnegotiation error for option {code}: {reason}"),
                None => write!(f, "subnegotiation error: {reason}"),
            },
            CodecError::UnexpectedCommand(command) => {
                write!(f, "unexpected telnet command 0x{command:02X}")
            }
        }
    }
}

impl std::fmt::Display for SubnegotiationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubnegotiationErrorKind::InvalidEscape { command } => {
                write!(f, "IAC followed by 0x{command:02X} inside payload")
            }
            SubnegotiationErrorKind::Overlong { limit } => {
                write!(f, "payload exceeded {limit} bytes")
            }
            SubnegotiationErrorKind::Empty => write!(f, "missing option code"),
            SubnegotiationErrorKind::Other { description } => write!(f, "{description}"),
        }
    }
}

impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        CodecError::IOError {
            kind: err.kind(),
            operation: err.to_string(),
        }
    }
}
