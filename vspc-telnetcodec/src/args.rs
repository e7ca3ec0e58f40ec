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

use crate::TelnetOption;
use crate::args::admin::AdminMessage;
use crate::args::vmware::VmwareExtMessage;
use crate::result::CodecResult;
use bytes::{BufMut, BytesMut};
use std::fmt::Formatter;

/// vSPC administrative option argument parsing and handling
pub mod admin;
/// VMware serial-port proxy extension argument parsing and handling
pub mod vmware;

///
/// Telnet Subnegotiation Argument
///
/// Payloads for the options this codec understands are parsed into typed
/// messages; everything else is carried opaquely so callers can decide how
/// to react (the connection layer logs and ignores them).
///
#[derive(Clone, Debug, PartialEq)]
pub enum TelnetArgument {
    /// A VMware serial-port proxy extension message.
    Vmware(VmwareExtMessage),
    /// A vSPC administrative option message.
    Admin(AdminMessage),
    /// A subnegotiation for an option we do not interpret.
    Unknown(TelnetOption, BytesMut),
}

impl TelnetArgument {
    /// Returns the unescaped payload length of this argument, suitable for
    /// buffer reservation before encoding. The wire form may be longer when
    /// payload bytes require IAC escaping.
    pub fn len(&self) -> usize {
        match self {
            TelnetArgument::Vmware(inner) => inner.len(),
            TelnetArgument::Admin(inner) => inner.len(),
            TelnetArgument::Unknown(_option, inner) => inner.len(),
        }
    }

    /// Returns `true` if the encoded payload would be empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encodes this argument's payload (subopcode and body, IAC-escaped)
    /// into a `BufMut` buffer. The surrounding `IAC SB option .. IAC SE`
    /// framing is written by the codec.
    pub fn encode<T: BufMut>(&self, dst: &mut T) -> CodecResult<usize> {
        Ok(self.write(&mut dst.writer())?)
    }

    /// Writes this argument's payload to a `std::io::Write` writer,
    /// escaping any embedded IAC bytes.
    pub fn write<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<usize> {
        match self {
            TelnetArgument::Vmware(inner) => inner.write(writer),
            TelnetArgument::Admin(inner) => inner.write(writer),
            TelnetArgument::Unknown(_option, payload) => write_escaped(writer, payload),
        }
    }

    /// Returns the `TelnetOption` this argument belongs to, for routing.
    pub fn option(&self) -> TelnetOption {
        match self {
            TelnetArgument::Vmware(_) => TelnetOption::VmwareExt,
            TelnetArgument::Admin(_) => TelnetOption::VspcAdmin,
            TelnetArgument::Unknown(option, _) => *option,
        }
    }
}

impl std::fmt::Display for TelnetArgument {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TelnetArgument::Vmware(v) => write!(f, "{v}"),
            TelnetArgument::Admin(v) => write!(f, "{v}"),
            TelnetArgument::Unknown(o, v) => write!(f, "{o}-{v:?}"),
        }
    }
}

/// Writes `payload` doubling every IAC (0xFF) byte, returning the number of
/// bytes put on the wire.
pub(crate) fn write_escaped<W: std::io::Write>(
    writer: &mut W,
    payload: &[u8],
) -> std::io::Result<usize> {
    let mut written = 0;
    for &byte in payload {
        if byte == crate::consts::IAC {
            writer.write_all(&[crate::consts::IAC, crate::consts::IAC])?;
            written += 2;
        } else {
            writer.write_all(&[byte])?;
            written += 1;
        }
    }
    Ok(written)
}
