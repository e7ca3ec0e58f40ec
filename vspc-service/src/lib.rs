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

//! vSPC Service - Virtual serial port concentrator
//!
//! This crate implements the server side of a virtual serial port
//! concentrator (vSPC) for hypervisor-hosted virtual machines: a
//! long-lived Telnet server that terminates VM serial-port connections,
//! tracks each VM as a logical [`Session`] keyed by its VC UUID, and fans
//! the serial byte stream out to observer connections.
//!
//! # vMotion
//!
//! The distinctive responsibility of a vSPC is keeping the serial session
//! intact while a VM live-migrates between hosts. The source host
//! announces the move (`VMOTION-BEGIN`); the concentrator grants it with a
//! fresh one-time secret (`VMOTION-GOAHEAD`) and registers the migration
//! id; the destination host connects and presents the id and secret
//! (`VMOTION-PEER`); and on `VMOTION-COMPLETE` the two transports are
//! spliced atomically, with no byte loss, duplication, or reordering
//! visible to observers. See [`SessionManager`] for the rendezvous and
//! [`Session`] for the handoff itself.
//!
//! # Architecture
//!
//! - One worker task per connection decodes Telnet events; a paired writer
//!   task owns the write half.
//! - [`Session`] state sits behind a non-async lock that is never held
//!   across a suspension point: state transitions are atomic, and serial
//!   delivery through the same lock is the stream's single ordering
//!   point.
//! - [`SessionManager`] owns the only process-wide maps (sessions and
//!   pending migrations) and arbitrates the migration rendezvous in one
//!   critical section.
//!
//! # Quick Start
//!
//! ```no_run
//! use vspc_service::{VspcConfig, VspcServer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = VspcServer::new(VspcConfig::default()).await?;
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod error;
mod manager;
mod metrics;
mod observer;
mod server;
mod session;
mod types;
mod worker;

pub use config::VspcConfig;
pub use connection::ConnectionHandle;
pub use error::{Result, VspcError};
pub use manager::SessionManager;
pub use metrics::{MetricsSnapshot, VspcMetrics};
pub use server::VspcServer;
pub use session::{MigrationState, Session, SubscriberAttachment};
pub use types::{ConnectionId, PortId, VmUuid};

// Re-export codec types observers and embedders commonly need.
pub use vspc_telnetcodec::{
    CodecError, TelnetArgument, TelnetCodec, TelnetEvent, TelnetFrame, TelnetOption, TelnetSide,
    admin, vmware,
};
