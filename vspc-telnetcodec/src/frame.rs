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
use crate::args::TelnetArgument;
use bytes::Bytes;

///
/// `TelnetFrame` represents the low-level wire items of a Telnet stream:
/// in-band data, NVT control functions, option negotiation commands, and
/// option subnegotiations. Frames are what the [`crate::TelnetCodec`]
/// encoder accepts; the decoder surfaces the higher-level
/// [`crate::TelnetEvent`] instead.
///
#[derive(Clone, Debug, PartialEq)]
pub enum TelnetFrame {
    /// In-band data. IAC bytes are escaped on the wire.
    Data(Bytes),
    /// No Operation
    NoOperation,
    /// End of urgent Data Stream
    DataMark,
    /// Operator pressed the Break key or the Attention key.
    Break,
    /// Interrupt current process.
    InterruptProcess,
    /// Cancel output from the current process.
    AbortOutput,
    /// Request acknowledgment.
    AreYouThere,
    /// Request that the operator erase the previous character.
    EraseCharacter,
    /// Request that the operator erase the previous line.
    EraseLine,
    /// End of input for half-duplex connections.
    GoAhead,
    /// `IAC DO option` — request the other party enable an option.
    Do(TelnetOption),
    /// `IAC DONT option` — request the other party disable an option.
    Dont(TelnetOption),
    /// `IAC WILL option` — offer to enable an option locally.
    Will(TelnetOption),
    /// `IAC WONT option` — refuse or disable an option locally.
    Wont(TelnetOption),
    /// `IAC SB option payload IAC SE`
    Subnegotiate(TelnetArgument),
}

impl TelnetFrame {
    /// Wrap a byte slice as an in-band data frame.
    pub fn data(bytes: impl Into<Bytes>) -> Self {
        TelnetFrame::Data(bytes.into())
    }
}
