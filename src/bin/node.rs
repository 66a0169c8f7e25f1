// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Responder node: a synthetic pulse sensor behind a TCP listener.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulselink::config::Config;
use pulselink::link::TcpAcceptor;
use pulselink::sensor::SyntheticSensor;
use pulselink::session::Responder;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pulselink=info".parse().unwrap()),
        )
        .init();

    info!("Starting pulselink node v{}...", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    let acceptor = TcpAcceptor::bind(&config.link.host, config.link.port).await?;
    info!("Listening on {}", acceptor.local_addr()?);

    let (responder, mut events) =
        Responder::spawn(acceptor, SyntheticSensor::new(), config.timing.clone());

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                info!(?event, "session event");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                responder.shutdown();
                break;
            }
        }
    }

    info!("pulselink node stopped");
    Ok(())
}
