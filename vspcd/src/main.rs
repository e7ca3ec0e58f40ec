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

//! vSPC daemon entry point.
//!
//! Listens for VM serial-port connections (default `0.0.0.0:13370`) and
//! observer connections (default `127.0.0.1:13371`) until interrupted.
//! Listener addresses can be overridden through `VSPC_LISTEN` and
//! `VSPC_OBSERVER_LISTEN`; set `VSPC_OBSERVER_LISTEN=off` to disable the
//! observer listener.

use std::net::SocketAddr;
use tracing::info;
use vspc_service::{VspcConfig, VspcServer};

fn env_addr(name: &str, default: &str) -> Result<Option<SocketAddr>, Box<dyn std::error::Error>> {
    let value = std::env::var(name).unwrap_or_else(|_| default.to_string());
    if value.eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    Ok(Some(value.parse::<SocketAddr>().map_err(|err| {
        format!("invalid {name} ({value}): {err}")
    })?))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let listen = env_addr("VSPC_LISTEN", "0.0.0.0:13370")?
        .ok_or("VSPC_LISTEN cannot be disabled")?;
    let observer = env_addr("VSPC_OBSERVER_LISTEN", "127.0.0.1:13371")?;

    let config = VspcConfig::new(listen).with_observer_listen_addr(observer);
    let server = VspcServer::new(config).await?;
    server.start().await?;
    info!(vm = %server.vm_addr(), observer = ?server.observer_addr(), "vSPC serving");

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received");
    server.shutdown().await?;
    Ok(())
}
