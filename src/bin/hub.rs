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

//! Interactive initiator console for driving a responder node.
//!
//! Usage: cargo run --bin hub
//! Then type: connect, start, stop, data, state, disconnect, exit

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulselink::config::Config;
use pulselink::link::TcpConnector;
use pulselink::session::{Command, Initiator};

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

    let config = Config::load()?;
    info!(
        "Dialing {}:{} on connect",
        config.link.host, config.link.port
    );

    let connector = TcpConnector::new(config.link.host.clone(), config.link.port);
    let (initiator, mut events) = Initiator::spawn(connector, config.timing.clone());

    // Surface session events as they happen; ends when the worker does.
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!(?event, "session event");
        }
    });

    println!("Commands: connect, start, stop, data, state, disconnect, exit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "connect" => {
                        initiator.enqueue(Command::Connect);
                    }
                    "start" => {
                        initiator.enqueue(Command::Start);
                    }
                    "stop" => {
                        initiator.enqueue(Command::Stop);
                    }
                    "disconnect" => {
                        initiator.enqueue(Command::Disconnect);
                    }
                    "data" => match initiator.latest_frame() {
                        Some(frame) => println!("{}", serde_json::to_string(&frame)?),
                        None => println!("No data yet"),
                    },
                    "state" => println!("{}", initiator.state().as_str()),
                    "exit" | "quit" => break,
                    "" => {}
                    other => {
                        println!("Unknown command: {}", other);
                        println!("Commands: connect, start, stop, data, state, disconnect, exit");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    // Exit flushes teardown on the worker before it stops.
    initiator.enqueue(Command::Exit);
    let _ = printer.await;

    info!("pulselink hub stopped");
    Ok(())
}
