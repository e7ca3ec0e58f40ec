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

//! # vSPC Telnet Protocol Codec
//!
//! This crate provides the Telnet codec used by a virtual serial port
//! concentrator (vSPC) to talk to hypervisor-hosted virtual machines and to
//! observer clients. It is designed to work with asynchronous networking
//! libraries like Tokio and provides a stateful, byte-oriented interface
//! for handling Telnet communication.
//!
//! ## Overview
//!
//! The Telnet protocol (RFC 854) frames three kinds of traffic over a TCP
//! stream, all of which this codec handles:
//!
//! - **Data transmission**: raw serial bytes with proper IAC (Interpret As
//!   Command) escaping
//! - **Option negotiation**: DO, DONT, WILL, WONT commands driven by the
//!   RFC 1143 Q-method so that negotiation can never loop
//! - **Subnegotiation**: bracketed per-option payloads
//!   (`IAC SB ... IAC SE`), parsed into typed arguments
//!
//! On top of the RFC 854 base the codec understands two vendor options:
//!
//! - **VMWARE-EXT** (0xE8): VM identity metadata (`VM-VC-UUID`, `VM-NAME`,
//!   ...), the proxy handshake (`DO-PROXY`/`WILL-PROXY`), and the vMotion
//!   rendezvous (`VMOTION-BEGIN`/`GOAHEAD`/`PEER`/`COMPLETE`/`ABORT`) that
//!   lets a serial session survive live migration. See [`args::vmware`].
//! - **VSPC-ADMIN** (0xE9): the observer-side option carrying the VM port
//!   list and attach/detach requests. See [`args::admin`].
//!
//! ## Core Components
//!
//! ### [`TelnetCodec`]
//!
//! The main codec structure, implementing [`tokio_util::codec::Decoder`]
//! and [`tokio_util::codec::Encoder`]. It maintains decoder state across
//! arbitrary read boundaries, runs option negotiation internally, and
//! queues the negotiation replies for the caller to flush.
//!
//! ### [`TelnetFrame`]
//!
//! The low-level wire items accepted by the encoder: data chunks, control
//! functions, negotiation commands, and subnegotiations.
//!
//! ### [`TelnetEvent`]
//!
//! Higher-level events produced by the decoder: data chunks, control
//! functions, `OptionStatus` notifications for completed negotiations, and
//! parsed subnegotiation arguments.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use vspc_telnetcodec::{TelnetCodec, TelnetEvent, TelnetOption};
//! use tokio_util::codec::{Decoder, Encoder};
//! use bytes::BytesMut;
//!
//! let mut codec = TelnetCodec::new();
//!
//! // Kick off negotiation: ask the peer to speak the VMware extension.
//! let mut outbound = BytesMut::new();
//! if let Some(frame) = codec.enable_remote(TelnetOption::VmwareExt) {
//!     codec.encode(frame, &mut outbound).unwrap();
//! }
//!
//! // Feed received bytes through the decoder.
//! let mut inbound = BytesMut::from(&b"console output"[..]);
//! while let Some(event) = codec.decode(&mut inbound).unwrap() {
//!     match event {
//!         TelnetEvent::Data(chunk) => println!("{} serial bytes", chunk.len()),
//!         TelnetEvent::Subnegotiate(arg) => println!("control: {arg}"),
//!         _ => {}
//!     }
//! }
//! // Negotiation replies produced during decode must be flushed.
//! for frame in codec.take_responses() {
//!     codec.encode(frame, &mut outbound).unwrap();
//! }
//! ```
//!
//! ## Error Handling
//!
//! The codec distinguishes frame-level violations, which surface as
//! [`CodecError`] and require the transport to be closed (the stream can no
//! longer be framed), from semantic problems inside a well-framed
//! subnegotiation, which degrade to [`TelnetArgument::Unknown`] with a
//! logged warning and leave the connection healthy.
//!
//! ## Thread Safety
//!
//! `TelnetCodec` is **not** thread-safe; each connection owns its own codec
//! instance (typically one for the read half and one for the write half).
//!
//! ## Related RFCs
//!
//! - RFC 854: Telnet Protocol Specification
//! - RFC 855: Telnet Option Specifications
//! - RFC 856: Telnet Binary Transmission
//! - RFC 857: Telnet Echo Option
//! - RFC 858: Telnet Suppress Go Ahead Option
//! - RFC 1143: The Q Method of Implementing Telnet Option Negotiation

#![warn(
    clippy::cargo,
    missing_docs,
    clippy::pedantic,
    future_incompatible,
    rust_2018_idioms
)]
#![allow(
    clippy::option_if_let_else,
    clippy::module_name_repetitions,
    clippy::missing_errors_doc
)]

mod args;
mod codec;
pub mod consts;
mod event;
mod frame;
mod options;
mod result;

pub use self::args::{TelnetArgument, admin, vmware};
pub use self::codec::TelnetCodec;
pub use self::event::TelnetEvent;
pub use self::frame::TelnetFrame;
pub use self::options::{TelnetOption, TelnetSide};
pub use self::result::{CodecError, CodecResult, SubnegotiationErrorKind};

/// Raw protocol constants (IAC commands and option codes).
pub use self::consts as protocol;

#[cfg(test)]
mod tests {
    use super::{TelnetCodec, TelnetEvent, TelnetFrame, TelnetOption, protocol};
    use crate::options::TelnetSide;
    use bytes::{Bytes, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    #[tokio::test]
    async fn telnet_decode() {
        let mut codec = TelnetCodec::new();
        let mut input_buffer = BytesMut::from("Terminated line\r\n");
        let mut actual_output = Vec::new();
        while let Some(event) = codec.decode(&mut input_buffer).unwrap() {
            actual_output.push(event)
        }
        assert_eq!(
            actual_output,
            vec![TelnetEvent::Data(Bytes::from_static(b"Terminated line\r\n"))],
            "telnet_decode didn't match"
        );
    }

    #[test]
    fn telnet_encode() {
        let mut codec = TelnetCodec::new();
        let expected_output = BytesMut::from(&b"Raw Ascii Data\r\n"[..]);
        let mut actual_output = BytesMut::with_capacity(20);
        codec
            .encode(TelnetFrame::data(&b"Raw Ascii Data\r\n"[..]), &mut actual_output)
            .unwrap();
        assert_eq!(expected_output, actual_output, "telnet_encode didn't match");
    }

    #[test]
    fn decode_iac_activation() {
        let mut codec = TelnetCodec::new();
        let mut input_buffer = BytesMut::from(
            &[
                // Data
                b'L', b'o', b'g', b'i', b'n', b':', b'\r', b'\n',
                // Command Do Binary
                protocol::IAC,
                protocol::DO,
                protocol::option::BINARY,
                // Data
                b'O', b'K', b'\r', b'\n',
                // Command Will Binary
                protocol::IAC,
                protocol::WILL,
                protocol::option::BINARY,
            ][..],
        );
        let expected_output = vec![
            TelnetEvent::Data(Bytes::from_static(b"Login:\r\n")),
            // Received DO Binary -> engine responds WILL and reports status
            TelnetEvent::OptionStatus(TelnetOption::TransmitBinary, TelnetSide::Local, true),
            TelnetEvent::Data(Bytes::from_static(b"OK\r\n")),
            // Received WILL Binary -> engine responds DO and reports status
            TelnetEvent::OptionStatus(TelnetOption::TransmitBinary, TelnetSide::Remote, true),
        ];
        let mut actual_output = Vec::new();
        while let Some(event) = codec.decode(&mut input_buffer).unwrap() {
            actual_output.push(event)
        }
        assert_eq!(expected_output, actual_output);

        assert_eq!(
            codec.take_responses(),
            vec![
                TelnetFrame::Will(TelnetOption::TransmitBinary),
                TelnetFrame::Do(TelnetOption::TransmitBinary),
            ]
        );
    }
}
