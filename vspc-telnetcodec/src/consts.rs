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

//! Telnet protocol constants per RFC 854, plus the option codes negotiated
//! by a virtual serial port concentrator.

/// Option Subnegotiation End
pub const SE: u8 = 240;
/// No Operation
pub const NOP: u8 = 241;
/// Data Mark, end of urgent data stream
pub const DM: u8 = 242;
/// Break
pub const BRK: u8 = 243;
/// Interrupt Process
pub const IP: u8 = 244;
/// Abort Output
pub const AO: u8 = 245;
/// Are You There
pub const AYT: u8 = 246;
/// Erase Character
pub const EC: u8 = 247;
/// Erase Line
pub const EL: u8 = 248;
/// Go Ahead
pub const GA: u8 = 249;
/// Option Subnegotiation Begin
pub const SB: u8 = 250;
/// Offer an option
pub const WILL: u8 = 251;
/// Decline an offered option
pub const WONT: u8 = 252;
/// Request an option
pub const DO: u8 = 253;
/// Reject a requested option
pub const DONT: u8 = 254;
/// Interpret As Command
pub const IAC: u8 = 255;

/// Telnet option codes recognized by this codec.
pub mod option {
    /// Binary Transmission [RFC856](https://tools.ietf.org/html/rfc856)
    pub const BINARY: u8 = 0;
    /// Echo [RFC857](https://tools.ietf.org/html/rfc857)
    pub const ECHO: u8 = 1;
    /// Suppress Go Ahead [RFC858](https://tools.ietf.org/html/rfc858)
    pub const SGA: u8 = 3;
    /// Authentication [RFC2941](https://tools.ietf.org/html/rfc2941)
    pub const AUTHENTICATION: u8 = 37;
    /// VMware serial-port proxy extension (vendor assigned)
    pub const VMWARE_EXT: u8 = 0xE8;
    /// vSPC administrative option (vendor assigned)
    pub const VSPC_ADMIN: u8 = 0xE9;
}
