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

use crate::{CodecError, CodecResult, TelnetFrame, consts};
use std::fmt::Formatter;

///
/// The Telnet options negotiated by a virtual serial port concentrator.
///
/// Anything outside this set decodes to [`TelnetOption::Unknown`] and is
/// refused during negotiation.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TelnetOption {
    /// [`consts::option::BINARY`] Telnet Binary Transmission [RFC856](https://tools.ietf.org/html/rfc856)
    TransmitBinary,
    /// [`consts::option::ECHO`] Telnet Echo Option [RFC857](https://tools.ietf.org/html/rfc857)
    Echo,
    /// [`consts::option::SGA`] Suppress Go Ahead [RFC858](https://tools.ietf.org/html/rfc858)
    SuppressGoAhead,
    /// [`consts::option::AUTHENTICATION`] Authentication Option [RFC2941](https://tools.ietf.org/html/rfc2941).
    /// Advertised only; subnegotiation content is passed through untouched.
    Authentication,
    /// [`consts::option::VMWARE_EXT`] VMware serial-port proxy extension.
    /// Subopcodes carry VM identity and the vMotion rendezvous.
    VmwareExt,
    /// [`consts::option::VSPC_ADMIN`] vSPC administrative option used by
    /// observer connections.
    VspcAdmin,
    /// Unknown Option
    Unknown(u8),
}

impl TelnetOption {
    /// Converts a `TelnetOption` into its wire option code.
    pub fn to_u8(&self) -> u8 {
        match self {
            TelnetOption::TransmitBinary => consts::option::BINARY,
            TelnetOption::Echo => consts::option::ECHO,
            TelnetOption::SuppressGoAhead => consts::option::SGA,
            TelnetOption::Authentication => consts::option::AUTHENTICATION,
            TelnetOption::VmwareExt => consts::option::VMWARE_EXT,
            TelnetOption::VspcAdmin => consts::option::VSPC_ADMIN,
            TelnetOption::Unknown(byte) => *byte,
        }
    }

    /// Converts a wire option code into the corresponding `TelnetOption`.
    /// Codes we do not negotiate map to [`TelnetOption::Unknown`].
    pub fn from_u8(byte: u8) -> Self {
        match byte {
            consts::option::BINARY => TelnetOption::TransmitBinary,
            consts::option::ECHO => TelnetOption::Echo,
            consts::option::SGA => TelnetOption::SuppressGoAhead,
            consts::option::AUTHENTICATION => TelnetOption::Authentication,
            consts::option::VMWARE_EXT => TelnetOption::VmwareExt,
            consts::option::VSPC_ADMIN => TelnetOption::VspcAdmin,
            byte => TelnetOption::Unknown(byte),
        }
    }

    /// Whether we are willing to perform this option ourselves (we may say
    /// WILL, and we accept an incoming DO).
    pub fn supported_local(&self) -> bool {
        matches!(
            self,
            TelnetOption::TransmitBinary
                | TelnetOption::Echo
                | TelnetOption::SuppressGoAhead
                | TelnetOption::Authentication
                | TelnetOption::VspcAdmin
        )
    }

    /// Whether we are willing to let the other party perform this option
    /// (we may say DO, and we accept an incoming WILL).
    pub fn supported_remote(&self) -> bool {
        matches!(
            self,
            TelnetOption::TransmitBinary
                | TelnetOption::SuppressGoAhead
                | TelnetOption::VmwareExt
                | TelnetOption::VspcAdmin
        )
    }
}

impl std::fmt::Display for TelnetOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TelnetOption::TransmitBinary => write!(f, "TransmitBinary"),
            TelnetOption::Echo => write!(f, "Echo"),
            TelnetOption::SuppressGoAhead => write!(f, "SuppressGoAhead"),
            TelnetOption::Authentication => write!(f, "Authentication"),
            TelnetOption::VmwareExt => write!(f, "VmwareExt"),
            TelnetOption::VspcAdmin => write!(f, "VspcAdmin"),
            TelnetOption::Unknown(option) => write!(f, "Unknown({option})"),
        }
    }
}

impl From<u8> for TelnetOption {
    fn from(byte: u8) -> Self {
        Self::from_u8(byte)
    }
}

impl From<TelnetOption> for u8 {
    fn from(option: TelnetOption) -> Self {
        option.to_u8()
    }
}

/// Negotiation state for every Telnet option on one connection.
///
/// Each option tracks two independent RFC 1143 state machines: one for our
/// side of the connection (`local`, driven by WILL/WONT and answered by
/// DO/DONT) and one for the other party (`remote`, driven by DO/DONT and
/// answered by WILL/WONT).
#[derive(Clone, Debug)]
pub struct TelnetOptions {
    state: [OptionState; 256],
}

impl TelnetOptions {
    /// Gets the local QState for an option
    pub(crate) fn local_qstate(&self, option: TelnetOption) -> QState {
        self.state[option.to_u8() as usize].local
    }

    /// Gets the remote QState for an option
    pub(crate) fn remote_qstate(&self, option: TelnetOption) -> QState {
        self.state[option.to_u8() as usize].remote
    }

    /// Checks whether the option is enabled on our side.
    ///
    /// RFC 1143: an option is enabled if and only if its state is YES. The
    /// `WantNo` states still count as enabled here because the disable has
    /// not yet been acknowledged.
    pub fn local_enabled(&self, option: TelnetOption) -> bool {
        matches!(
            self.state[option.to_u8() as usize].local,
            QState::Yes | QState::WantNo | QState::WantNoOpposite
        )
    }

    /// Checks whether the option is enabled on the remote side.
    pub fn remote_enabled(&self, option: TelnetOption) -> bool {
        matches!(
            self.state[option.to_u8() as usize].remote,
            QState::Yes | QState::WantNo | QState::WantNoOpposite
        )
    }

    /// Request that *we* enable the option (send WILL).
    /// Returns the frame to put on the wire, if negotiation is needed.
    pub fn enable_local(&mut self, option: TelnetOption) -> Option<TelnetFrame> {
        if !option.supported_local() {
            return None;
        }
        match self.state[option.to_u8() as usize].local {
            QState::Yes | QState::WantYes | QState::WantNoOpposite => None,
            QState::No => {
                self.state[option.to_u8() as usize].local = QState::WantYes;
                Some(TelnetFrame::Will(option))
            }
            QState::WantNo => {
                // Disable still in flight; queue the opposite request.
                self.state[option.to_u8() as usize].local = QState::WantNoOpposite;
                None
            }
            QState::WantYesOpposite => {
                // Cancel the queued disable.
                self.state[option.to_u8() as usize].local = QState::WantYes;
                None
            }
        }
    }

    /// Request that *we* disable the option (send WONT).
    pub fn disable_local(&mut self, option: TelnetOption) -> Option<TelnetFrame> {
        match self.state[option.to_u8() as usize].local {
            QState::No | QState::WantNo | QState::WantYesOpposite => None,
            QState::Yes => {
                self.state[option.to_u8() as usize].local = QState::WantNo;
                Some(TelnetFrame::Wont(option))
            }
            QState::WantYes => {
                self.state[option.to_u8() as usize].local = QState::WantYesOpposite;
                None
            }
            QState::WantNoOpposite => {
                // Cancel the queued re-enable.
                self.state[option.to_u8() as usize].local = QState::WantNo;
                None
            }
        }
    }

    /// Request that the remote party enable the option (send DO).
    pub fn enable_remote(&mut self, option: TelnetOption) -> Option<TelnetFrame> {
        if !option.supported_remote() {
            return None;
        }
        match self.state[option.to_u8() as usize].remote {
            QState::Yes | QState::WantYes | QState::WantNoOpposite => None,
            QState::No => {
                self.state[option.to_u8() as usize].remote = QState::WantYes;
                Some(TelnetFrame::Do(option))
            }
            QState::WantNo => {
                self.state[option.to_u8() as usize].remote = QState::WantNoOpposite;
                None
            }
            QState::WantYesOpposite => {
                self.state[option.to_u8() as usize].remote = QState::WantYes;
                None
            }
        }
    }

    /// Request that the remote party disable the option (send DONT).
    pub fn disable_remote(&mut self, option: TelnetOption) -> Option<TelnetFrame> {
        match self.state[option.to_u8() as usize].remote {
            QState::No | QState::WantNo | QState::WantYesOpposite => None,
            QState::Yes => {
                self.state[option.to_u8() as usize].remote = QState::WantNo;
                Some(TelnetFrame::Dont(option))
            }
            QState::WantYes => {
                self.state[option.to_u8() as usize].remote = QState::WantYesOpposite;
                None
            }
            QState::WantNoOpposite => {
                self.state[option.to_u8() as usize].remote = QState::WantNo;
                None
            }
        }
    }

    /// Handles a received negotiation frame, returning the frame to send in
    /// reply (if any).
    ///
    /// Only `Do`/`Dont`/`Will`/`Wont` frames are valid here; anything else
    /// is a negotiation error.
    pub fn handle_received(&mut self, frame: TelnetFrame) -> CodecResult<Option<TelnetFrame>> {
        match frame {
            TelnetFrame::Do(option) => Ok(self.recv_do(option)),
            TelnetFrame::Dont(option) => Ok(self.recv_dont(option)),
            TelnetFrame::Will(option) => Ok(self.recv_will(option)),
            TelnetFrame::Wont(option) => Ok(self.recv_wont(option)),
            _ => Err(CodecError::NegotiationError {
                reason: "Unsupported frame type".into(),
                frame_type: Some(format!("{:?}", frame)),
            }),
        }
    }

    /// Process an incoming WILL (remote offers to perform the option).
    ///
    /// Invariant: we never acknowledge a state we are already in, so no ack
    /// loops can form.
    fn recv_will(&mut self, option: TelnetOption) -> Option<TelnetFrame> {
        let idx = option.to_u8() as usize;
        match self.state[idx].remote {
            QState::No => {
                if option.supported_remote() {
                    self.state[idx].remote = QState::Yes;
                    Some(TelnetFrame::Do(option))
                } else {
                    Some(TelnetFrame::Dont(option))
                }
            }
            QState::Yes => None,
            QState::WantNo => {
                // RFC 1143: "Error: DONT answered by WILL."
                self.state[idx].remote = QState::No;
                None
            }
            QState::WantNoOpposite => {
                // RFC 1143: "Error: DONT answered by WILL", but the queued
                // opposite request means we end up enabled.
                self.state[idx].remote = QState::Yes;
                None
            }
            QState::WantYes => {
                self.state[idx].remote = QState::Yes;
                None
            }
            QState::WantYesOpposite => {
                self.state[idx].remote = QState::WantNo;
                Some(TelnetFrame::Dont(option))
            }
        }
    }

    /// Process an incoming WONT.
    fn recv_wont(&mut self, option: TelnetOption) -> Option<TelnetFrame> {
        let idx = option.to_u8() as usize;
        match self.state[idx].remote {
            QState::No => None,
            QState::Yes => {
                self.state[idx].remote = QState::No;
                Some(TelnetFrame::Dont(option))
            }
            QState::WantNo => {
                self.state[idx].remote = QState::No;
                None
            }
            QState::WantNoOpposite => {
                // The queued enable request goes out now.
                self.state[idx].remote = QState::WantYes;
                Some(TelnetFrame::Do(option))
            }
            QState::WantYes | QState::WantYesOpposite => {
                self.state[idx].remote = QState::No;
                None
            }
        }
    }

    /// Process an incoming DO (remote asks us to perform the option).
    fn recv_do(&mut self, option: TelnetOption) -> Option<TelnetFrame> {
        let idx = option.to_u8() as usize;
        match self.state[idx].local {
            QState::No => {
                if option.supported_local() {
                    self.state[idx].local = QState::Yes;
                    Some(TelnetFrame::Will(option))
                } else {
                    Some(TelnetFrame::Wont(option))
                }
            }
            QState::Yes => None,
            QState::WantNo => {
                self.state[idx].local = QState::No;
                None
            }
            QState::WantNoOpposite => {
                self.state[idx].local = QState::Yes;
                None
            }
            QState::WantYes => {
                self.state[idx].local = QState::Yes;
                None
            }
            QState::WantYesOpposite => {
                self.state[idx].local = QState::WantNo;
                Some(TelnetFrame::Wont(option))
            }
        }
    }

    /// Process an incoming DONT.
    fn recv_dont(&mut self, option: TelnetOption) -> Option<TelnetFrame> {
        let idx = option.to_u8() as usize;
        match self.state[idx].local {
            QState::No => None,
            QState::Yes => {
                self.state[idx].local = QState::No;
                Some(TelnetFrame::Wont(option))
            }
            QState::WantNo => {
                self.state[idx].local = QState::No;
                None
            }
            QState::WantNoOpposite => {
                self.state[idx].local = QState::WantYes;
                Some(TelnetFrame::Will(option))
            }
            QState::WantYes | QState::WantYesOpposite => {
                self.state[idx].local = QState::No;
                None
            }
        }
    }
}

impl Default for TelnetOptions {
    fn default() -> Self {
        TelnetOptions {
            state: core::array::from_fn(|_| OptionState::default()),
        }
    }
}

/// Which side of the connection an option state change refers to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TelnetSide {
    /// The local side of the Telnet connection (what we perform)
    Local,
    /// The remote side of the Telnet connection (what the peer performs)
    Remote,
}

impl std::fmt::Display for TelnetSide {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TelnetSide::Local => write!(f, "Local"),
            TelnetSide::Remote => write!(f, "Remote"),
        }
    }
}

/// Per-option pair of Q-method states, one per side.
#[derive(Clone, Copy, Debug, Default)]
struct OptionState {
    pub local: QState,
    pub remote: QState,
}

/// RFC 1143 negotiation states. The `us`/`usq` and `them`/`themq` pairs of
/// the RFC are collapsed into six states per side.
#[derive(Copy, Clone, Debug, Default, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub(crate) enum QState {
    /// Disabled.
    #[default]
    No,
    /// Enabled, disable requested, waiting for the ack.
    WantNo,
    /// WantNo with a queued re-enable.
    WantNoOpposite,
    /// Enabled.
    Yes,
    /// Disabled, enable requested, waiting for the ack.
    WantYes,
    /// WantYes with a queued disable.
    WantYesOpposite,
}

impl std::fmt::Display for QState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QState::No => write!(f, "No"),
            QState::WantNo => write!(f, "WantNo"),
            QState::WantNoOpposite => write!(f, "WantNoOpposite"),
            QState::Yes => write!(f, "Yes"),
            QState::WantYes => write!(f, "WantYes"),
            QState::WantYesOpposite => write!(f, "WantYesOpposite"),
        }
    }
}
