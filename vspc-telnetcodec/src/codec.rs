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

use super::{CodecError, TelnetEvent, TelnetFrame, TelnetOption, consts};
use crate::args::TelnetArgument;
use crate::args::admin::AdminMessage;
use crate::args::vmware::VmwareExtMessage;
use crate::options::{QState, TelnetOptions, TelnetSide};
use crate::result::SubnegotiationErrorKind;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Upper bound on a buffered subnegotiation payload. Nothing in the VMware
/// vocabulary comes close; exceeding it indicates a broken or hostile peer.
const MAX_SUBNEGOTIATION: usize = 4096;

/// A codec for handling the Telnet protocol, providing functionality to
/// encode and decode Telnet messages.
///
/// `TelnetCodec` implements the [`Decoder`] and [`Encoder`] traits from
/// `tokio_util::codec` and is intended to sit inside a `FramedRead` /
/// `FramedWrite` pair. It maintains the state needed to parse Telnet
/// sequences that arrive split across arbitrary read boundaries, and it
/// runs the RFC 1143 Q-method negotiation engine internally:
///
/// - Incoming `DO`/`DONT`/`WILL`/`WONT` commands are answered by the state
///   machine; reply frames accumulate on the codec and must be drained via
///   [`TelnetCodec::take_responses`] and written out by the caller.
/// - Completed negotiations surface as [`TelnetEvent::OptionStatus`].
/// - Subnegotiation payloads are unescaped, bounded, and parsed into typed
///   [`TelnetArgument`]s.
///
/// Frame-level protocol violations (an unterminated IAC escape inside a
/// subnegotiation, a stray `IAC SE`, an oversized payload) are returned as
/// errors; the connection owning the codec is expected to close.
///
/// # Example
/// ```
/// use vspc_telnetcodec::{TelnetCodec, TelnetEvent};
/// use tokio_util::codec::Decoder;
/// use bytes::BytesMut;
///
/// let mut codec = TelnetCodec::new();
/// let mut input = BytesMut::from(&b"hello"[..]);
/// match codec.decode(&mut input).unwrap() {
///     Some(TelnetEvent::Data(chunk)) => assert_eq!(&chunk[..], b"hello"),
///     other => panic!("unexpected: {other:?}"),
/// }
/// ```
pub struct TelnetCodec {
    decoder_buffer: BytesMut,
    decoder_state: DecoderState,
    options: TelnetOptions,
    responses: VecDeque<TelnetFrame>,
}

impl TelnetCodec {
    /// Creates a new instance of `TelnetCodec` with all options disabled
    /// and the decoder in the normal-data state.
    pub fn new() -> TelnetCodec {
        TelnetCodec::default()
    }

    /// Checks if a specific Telnet option is enabled locally.
    pub fn is_enabled_local(&self, option: TelnetOption) -> bool {
        self.options.local_enabled(option)
    }

    /// Checks if a specific Telnet option is enabled on the remote side.
    pub fn is_enabled_remote(&self, option: TelnetOption) -> bool {
        self.options.remote_enabled(option)
    }

    /// Request to enable a Telnet option locally (we will send WILL).
    ///
    /// Returns the negotiation frame to put on the wire, or `None` when no
    /// negotiation is needed (already enabled, in progress, or
    /// unsupported).
    pub fn enable_local(&mut self, option: TelnetOption) -> Option<TelnetFrame> {
        self.options.enable_local(option)
    }

    /// Request to disable a Telnet option locally (we will send WONT).
    pub fn disable_local(&mut self, option: TelnetOption) -> Option<TelnetFrame> {
        self.options.disable_local(option)
    }

    /// Request that the remote side enable an option (we will send DO).
    pub fn enable_remote(&mut self, option: TelnetOption) -> Option<TelnetFrame> {
        self.options.enable_remote(option)
    }

    /// Request that the remote side disable an option (we will send DONT).
    pub fn disable_remote(&mut self, option: TelnetOption) -> Option<TelnetFrame> {
        self.options.disable_remote(option)
    }

    /// Whether the negotiation engine has produced reply frames that still
    /// need to be written to the peer.
    pub fn has_pending_responses(&self) -> bool {
        !self.responses.is_empty()
    }

    /// Drains the negotiation replies produced during decoding. The caller
    /// must encode and send these after every decode batch.
    pub fn take_responses(&mut self) -> Vec<TelnetFrame> {
        self.responses.drain(..).collect()
    }

    /// Routes a received negotiation frame through the Q-method engine,
    /// queues any reply, and reports a completed toggle for `side`.
    ///
    /// When a reply was queued without a status change (e.g. refusing an
    /// unsupported option), a `NoOperation` event is surfaced so the
    /// caller's read loop wakes up and flushes the reply instead of
    /// leaving it queued until unrelated traffic arrives.
    fn negotiate(
        &mut self,
        frame: TelnetFrame,
        option: TelnetOption,
        side: TelnetSide,
    ) -> Result<Option<TelnetEvent>, CodecError> {
        let qstate = |options: &TelnetOptions| match side {
            TelnetSide::Local => options.local_qstate(option),
            TelnetSide::Remote => options.remote_qstate(option),
        };
        let was_yes = qstate(&self.options) == QState::Yes;
        let mut replied = false;
        if let Some(response) = self.options.handle_received(frame)? {
            self.responses.push_back(response);
            replied = true;
        }
        let is_yes = qstate(&self.options) == QState::Yes;
        if is_yes != was_yes {
            Ok(Some(TelnetEvent::OptionStatus(option, side, is_yes)))
        } else if replied {
            Ok(Some(TelnetEvent::NoOperation))
        } else {
            Ok(None)
        }
    }

    /// Builds the subnegotiation event once `IAC SE` closes the payload.
    fn finish_subnegotiation(&mut self, option_code: u8) -> TelnetEvent {
        let option = TelnetOption::from_u8(option_code);
        let buffer = self.decoder_buffer.split();
        let argument = match option {
            _ if buffer.is_empty() => {
                warn!(%option, "Empty subnegotiation payload");
                TelnetArgument::Unknown(option, buffer)
            }
            TelnetOption::VmwareExt => TelnetArgument::Vmware(VmwareExtMessage::parse(&buffer)),
            TelnetOption::VspcAdmin => TelnetArgument::Admin(AdminMessage::parse(&buffer)),
            _ => TelnetArgument::Unknown(option, buffer),
        };
        TelnetEvent::Subnegotiate(argument)
    }
}

impl Default for TelnetCodec {
    fn default() -> Self {
        TelnetCodec {
            decoder_buffer: BytesMut::new(),
            decoder_state: DecoderState::NormalData,
            options: TelnetOptions::default(),
            responses: VecDeque::new(),
        }
    }
}

impl Decoder for TelnetCodec {
    type Item = TelnetEvent;
    type Error = CodecError;

    /// Decodes bytes from `src` into the next [`TelnetEvent`].
    ///
    /// The decoder consumes input byte-state-machine style and is
    /// restartable at any boundary: a partially received command or
    /// subnegotiation leaves its state in the codec and `Ok(None)` is
    /// returned until the remainder arrives.
    ///
    /// In-band data is returned in maximal chunks: all bytes up to the next
    /// `IAC` (or the end of the read) form one `Data` event, with `IAC IAC`
    /// unescaped to a single 0xFF byte.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<TelnetEvent>, Self::Error> {
        while !src.is_empty() {
            match self.decoder_state {
                DecoderState::NormalData => {
                    if src[0] == consts::IAC {
                        src.advance(1);
                        self.decoder_state = DecoderState::InterpretAsCommand;
                        continue;
                    }
                    let end = src
                        .iter()
                        .position(|&byte| byte == consts::IAC)
                        .unwrap_or(src.len());
                    let chunk = src.split_to(end).freeze();
                    return Ok(Some(TelnetEvent::Data(chunk)));
                }
                DecoderState::InterpretAsCommand => {
                    let byte = src.get_u8();
                    self.decoder_state = DecoderState::NormalData;
                    match byte {
                        consts::IAC => {
                            // Escaped data byte.
                            return Ok(Some(TelnetEvent::Data(Bytes::from_static(&[0xFF]))));
                        }
                        consts::NOP => return Ok(Some(TelnetEvent::NoOperation)),
                        consts::DM => return Ok(Some(TelnetEvent::DataMark)),
                        consts::BRK => return Ok(Some(TelnetEvent::Break)),
                        consts::IP => return Ok(Some(TelnetEvent::InterruptProcess)),
                        consts::AO => return Ok(Some(TelnetEvent::AbortOutput)),
                        consts::AYT => return Ok(Some(TelnetEvent::AreYouThere)),
                        consts::EC => return Ok(Some(TelnetEvent::EraseCharacter)),
                        consts::EL => return Ok(Some(TelnetEvent::EraseLine)),
                        consts::GA => return Ok(Some(TelnetEvent::GoAhead)),
                        consts::DO => self.decoder_state = DecoderState::NegotiateDo,
                        consts::DONT => self.decoder_state = DecoderState::NegotiateDont,
                        consts::WILL => self.decoder_state = DecoderState::NegotiateWill,
                        consts::WONT => self.decoder_state = DecoderState::NegotiateWont,
                        consts::SB => self.decoder_state = DecoderState::Subnegotiate,
                        consts::SE => {
                            // SE with no matching SB; the stream cannot be
                            // framed reliably past this point.
                            return Err(CodecError::UnexpectedCommand(consts::SE));
                        }
                        _ => {
                            warn!("Received unknown command {:#X}", byte);
                            return Ok(Some(TelnetEvent::NoOperation));
                        }
                    }
                }
                DecoderState::NegotiateDo => {
                    let option = TelnetOption::from_u8(src.get_u8());
                    self.decoder_state = DecoderState::NormalData;
                    if let Some(event) =
                        self.negotiate(TelnetFrame::Do(option), option, TelnetSide::Local)?
                    {
                        return Ok(Some(event));
                    }
                }
                DecoderState::NegotiateDont => {
                    let option = TelnetOption::from_u8(src.get_u8());
                    self.decoder_state = DecoderState::NormalData;
                    if let Some(event) =
                        self.negotiate(TelnetFrame::Dont(option), option, TelnetSide::Local)?
                    {
                        return Ok(Some(event));
                    }
                }
                DecoderState::NegotiateWill => {
                    let option = TelnetOption::from_u8(src.get_u8());
                    self.decoder_state = DecoderState::NormalData;
                    if let Some(event) =
                        self.negotiate(TelnetFrame::Will(option), option, TelnetSide::Remote)?
                    {
                        return Ok(Some(event));
                    }
                }
                DecoderState::NegotiateWont => {
                    let option = TelnetOption::from_u8(src.get_u8());
                    self.decoder_state = DecoderState::NormalData;
                    if let Some(event) =
                        self.negotiate(TelnetFrame::Wont(option), option, TelnetSide::Remote)?
                    {
                        return Ok(Some(event));
                    }
                }
                DecoderState::Subnegotiate => {
                    let byte = src.get_u8();
                    if byte == consts::IAC {
                        // IAC where the option code belongs; there is no
                        // payload to resynchronize on.
                        return Err(CodecError::SubnegotiationError {
                            option: None,
                            reason: SubnegotiationErrorKind::Empty,
                        });
                    }
                    self.decoder_state = DecoderState::SubnegotiateArgument(byte);
                }
                DecoderState::SubnegotiateArgument(option) => {
                    let end = src
                        .iter()
                        .position(|&byte| byte == consts::IAC)
                        .unwrap_or(src.len());
                    if self.decoder_buffer.len() + end > MAX_SUBNEGOTIATION {
                        self.decoder_buffer.clear();
                        self.decoder_state = DecoderState::NormalData;
                        return Err(CodecError::SubnegotiationError {
                            option: Some(option),
                            reason: SubnegotiationErrorKind::Overlong {
                                limit: MAX_SUBNEGOTIATION,
                            },
                        });
                    }
                    self.decoder_buffer.extend_from_slice(&src.split_to(end));
                    if !src.is_empty() {
                        src.advance(1);
                        self.decoder_state = DecoderState::SubnegotiateArgumentIAC(option);
                    }
                }
                DecoderState::SubnegotiateArgumentIAC(option) => {
                    let byte = src.get_u8();
                    match byte {
                        consts::IAC => {
                            self.decoder_buffer.put_u8(consts::IAC);
                            self.decoder_state = DecoderState::SubnegotiateArgument(option);
                        }
                        consts::SE => {
                            self.decoder_state = DecoderState::NormalData;
                            return Ok(Some(self.finish_subnegotiation(option)));
                        }
                        _ => {
                            self.decoder_buffer.clear();
                            self.decoder_state = DecoderState::NormalData;
                            return Err(CodecError::SubnegotiationError {
                                option: Some(option),
                                reason: SubnegotiationErrorKind::InvalidEscape { command: byte },
                            });
                        }
                    }
                }
            }
        }
        Ok(None)
    }
}

impl Encoder<TelnetFrame> for TelnetCodec {
    type Error = CodecError;

    /// Encodes a `TelnetFrame` into its wire representation.
    ///
    /// Data frames are IAC-escaped; negotiation frames become the
    /// three-byte `IAC <verb> <option>` sequences; subnegotiations are
    /// bracketed with `IAC SB <option> ... IAC SE` with the payload escaped
    /// by the argument writer.
    fn encode(&mut self, item: TelnetFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            TelnetFrame::Data(chunk) => {
                dst.reserve(chunk.len() + 4);
                for &byte in chunk.iter() {
                    if byte == consts::IAC {
                        dst.put_u8(consts::IAC);
                    }
                    dst.put_u8(byte);
                }
            }
            TelnetFrame::NoOperation => put_command(dst, consts::NOP),
            TelnetFrame::DataMark => put_command(dst, consts::DM),
            TelnetFrame::Break => put_command(dst, consts::BRK),
            TelnetFrame::InterruptProcess => put_command(dst, consts::IP),
            TelnetFrame::AbortOutput => put_command(dst, consts::AO),
            TelnetFrame::AreYouThere => put_command(dst, consts::AYT),
            TelnetFrame::EraseCharacter => put_command(dst, consts::EC),
            TelnetFrame::EraseLine => put_command(dst, consts::EL),
            TelnetFrame::GoAhead => put_command(dst, consts::GA),
            TelnetFrame::Do(option) => put_negotiation(dst, consts::DO, option),
            TelnetFrame::Dont(option) => put_negotiation(dst, consts::DONT, option),
            TelnetFrame::Will(option) => put_negotiation(dst, consts::WILL, option),
            TelnetFrame::Wont(option) => put_negotiation(dst, consts::WONT, option),
            TelnetFrame::Subnegotiate(argument) => {
                dst.reserve(5 + argument.len());
                dst.put_u8(consts::IAC);
                dst.put_u8(consts::SB);
                dst.put_u8(argument.option().to_u8());
                argument.encode(dst)?;
                dst.put_u8(consts::IAC);
                dst.put_u8(consts::SE);
            }
        }
        Ok(())
    }
}

impl Encoder<Bytes> for TelnetCodec {
    type Error = CodecError;

    /// Encodes raw in-band data, escaping IAC bytes.
    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode(TelnetFrame::Data(item), dst)
    }
}

fn put_command(dst: &mut BytesMut, command: u8) {
    dst.reserve(2);
    dst.put_u8(consts::IAC);
    dst.put_u8(command);
}

fn put_negotiation(dst: &mut BytesMut, action: u8, option: TelnetOption) {
    dst.reserve(3);
    dst.put_u8(consts::IAC);
    dst.put_u8(action);
    dst.put_u8(option.to_u8());
}

///
/// Represents the internal state of the Telnet decoder between reads.
///
#[derive(Clone, Copy, Debug)]
enum DecoderState {
    /// Normal data
    NormalData,
    /// Received IAC, next byte is a command
    InterpretAsCommand,
    /// Received DO command, next byte is the option
    NegotiateDo,
    /// Received DONT command, next byte is the option
    NegotiateDont,
    /// Received WILL command, next byte is the option
    NegotiateWill,
    /// Received WONT command, next byte is the option
    NegotiateWont,
    /// Received SB, next byte is the option
    Subnegotiate,
    /// Accumulating subnegotiation payload for the given option
    SubnegotiateArgument(u8),
    /// Received IAC during subnegotiation, next byte decides escape or end
    SubnegotiateArgumentIAC(u8),
}
