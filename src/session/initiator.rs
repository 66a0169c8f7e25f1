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

//! Initiator role: command dispatch and the consuming side of a session.
//!
//! A single worker task owns the connection and executes commands one at
//! a time, in submission order. Each command runs to completion,
//! handshake round trips included, before the next is dequeued; that is
//! what guarantees at most one protocol operation in flight.

use std::mem;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::config::TimingConfig;
use crate::error::LinkError;
use crate::link::{self, Connector, MessageReader, MessageWriter};
use crate::protocol::PulseFrame;
use crate::session::pump::{self, PumpEnd, PumpExit, StreamPump};
use crate::session::{
    handshake, Command, FrameSlot, HandshakeKind, SessionEvent, SessionState, StateCell,
    EVENT_CHANNEL_SIZE,
};

/// Handle to a running initiator worker.
///
/// Cheap to clone. Producers only enqueue commands and poll the cached
/// frame; protocol logic runs exclusively on the worker.
#[derive(Clone)]
pub struct Initiator {
    commands: mpsc::UnboundedSender<Command>,
    frames: FrameSlot,
    state: StateCell,
}

impl Initiator {
    /// Spawn the session worker. Commands enqueue through the returned
    /// handle; status reports flow out on the event channel.
    pub fn spawn<C>(connector: C, timing: TimingConfig) -> (Self, mpsc::Receiver<SessionEvent>)
    where
        C: Connector,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let frames = FrameSlot::new();
        let state = StateCell::new();
        let worker = SessionWorker {
            connector,
            timing,
            events: event_tx,
            frames: frames.clone(),
            state: state.clone(),
            wire: Wire::Down,
        };
        tokio::spawn(worker.run(command_rx));
        (
            Self {
                commands: command_tx,
                frames,
                state,
            },
            event_rx,
        )
    }

    /// Queue a command for the worker. Never blocks. Returns false once
    /// the worker has exited.
    pub fn enqueue(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Most recent telemetry frame received, if any.
    pub fn latest_frame(&self) -> Option<PulseFrame> {
        self.frames.latest()
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state.get()
    }
}

/// Connection resources, by lifecycle phase.
enum Wire<S> {
    /// No connection.
    Down,
    /// Connected; the worker holds both halves.
    Up {
        peer: String,
        reader: MessageReader<ReadHalf<S>>,
        writer: MessageWriter<WriteHalf<S>>,
    },
    /// Streaming; the receive pump owns the reader.
    Pumping {
        peer: String,
        writer: MessageWriter<WriteHalf<S>>,
        pump: StreamPump<ReadHalf<S>>,
    },
}

enum Flow {
    Continue,
    Exit,
}

enum Wake<R> {
    Command(Option<Command>),
    Pump(Result<PumpExit<R>, JoinError>),
}

struct SessionWorker<C: Connector> {
    connector: C,
    timing: TimingConfig,
    events: mpsc::Sender<SessionEvent>,
    frames: FrameSlot,
    state: StateCell,
    wire: Wire<C::Stream>,
}

impl<C: Connector> SessionWorker<C> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!("session worker started");
        loop {
            // While streaming, a pump exit must be handled even when no
            // command arrives.
            let wake = match &mut self.wire {
                Wire::Pumping { pump, .. } => tokio::select! {
                    command = commands.recv() => Wake::Command(command),
                    exit = &mut pump.join => Wake::Pump(exit),
                },
                _ => Wake::Command(commands.recv().await),
            };
            match wake {
                Wake::Pump(exit) => self.on_pump_exit(exit).await,
                Wake::Command(Some(command)) => {
                    if matches!(self.dispatch(command).await, Flow::Exit) {
                        break;
                    }
                }
                Wake::Command(None) => {
                    debug!("command queue closed");
                    self.close_wire().await;
                    break;
                }
            }
        }
        info!("session worker stopped");
    }

    async fn dispatch(&mut self, command: Command) -> Flow {
        debug!(command = command.as_str(), "executing command");
        match command {
            Command::Connect => self.connect().await,
            Command::Start => self.start().await,
            Command::Stop => self.stop().await,
            Command::Disconnect => self.disconnect().await,
            Command::Exit => {
                info!("exit requested");
                self.close_wire().await;
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    async fn connect(&mut self) {
        if !matches!(self.wire, Wire::Down) {
            return self.ignored(Command::Connect, "already connected").await;
        }
        self.state.set(SessionState::Connecting);
        match self.connector.connect().await {
            Ok((stream, peer)) => {
                let (reader, writer) = link::split(stream);
                info!(%peer, "connected");
                self.state.set(SessionState::Connected);
                let _ = self
                    .events
                    .send(SessionEvent::Connected { peer: peer.clone() })
                    .await;
                self.wire = Wire::Up {
                    peer,
                    reader,
                    writer,
                };
            }
            Err(err) => {
                let err = LinkError::Connection(err);
                warn!(error = %err, "connect failed");
                self.state.set(SessionState::Idle);
                let _ = self
                    .events
                    .send(SessionEvent::ConnectFailed {
                        reason: err.to_string(),
                    })
                    .await;
            }
        }
    }

    async fn start(&mut self) {
        match self.wire {
            Wire::Down => return self.ignored(Command::Start, "not connected").await,
            Wire::Pumping { .. } => return self.ignored(Command::Start, "already streaming").await,
            Wire::Up { .. } => {}
        }
        self.state.set(SessionState::HandshakingStart);
        info!("requesting stream start");
        let deadline = self.timing.handshake_timeout();
        let result = match &mut self.wire {
            Wire::Up { reader, writer, .. } => {
                handshake::request_direct(HandshakeKind::Start, reader, writer, deadline).await
            }
            _ => return,
        };
        match result {
            Ok(()) => {
                let Wire::Up {
                    peer,
                    reader,
                    writer,
                } = mem::replace(&mut self.wire, Wire::Down)
                else {
                    return;
                };
                let pump = pump::start_recv_pump(
                    reader,
                    self.frames.clone(),
                    self.timing.stream_recv_timeout(),
                );
                self.wire = Wire::Pumping { peer, writer, pump };
                self.state.set(SessionState::Streaming);
                info!("streaming started");
                let _ = self.events.send(SessionEvent::StreamStarted).await;
            }
            Err(err) => self.fail_handshake(HandshakeKind::Start, err).await,
        }
    }

    async fn stop(&mut self) {
        if !matches!(self.wire, Wire::Pumping { .. }) {
            return self.ignored(Command::Stop, "not streaming").await;
        }
        self.state.set(SessionState::HandshakingStop);
        info!("requesting stream stop");
        let deadline = self.timing.handshake_timeout();
        let result = match &mut self.wire {
            Wire::Pumping { writer, pump, .. } => {
                handshake::request_via_pump(HandshakeKind::Stop, &mut pump.control, writer, deadline)
                    .await
            }
            _ => return,
        };
        match result {
            Ok(()) => {
                let Wire::Pumping { peer, writer, pump } = mem::replace(&mut self.wire, Wire::Down)
                else {
                    return;
                };
                // The stream is not stopped until the pump is gone and
                // the reader is back in hand.
                match pump.halt().await {
                    Some(exit) => {
                        self.wire = Wire::Up {
                            peer,
                            reader: exit.reader,
                            writer,
                        };
                        self.state.set(SessionState::Connected);
                        info!("streaming stopped");
                        let _ = self.events.send(SessionEvent::StreamStopped).await;
                    }
                    None => {
                        // The pump task failed and took the reader with it.
                        self.state.set(SessionState::Idle);
                        let _ = self.events.send(SessionEvent::Disconnected).await;
                    }
                }
            }
            Err(err) => self.fail_handshake(HandshakeKind::Stop, err).await,
        }
    }

    async fn disconnect(&mut self) {
        if matches!(self.wire, Wire::Down) {
            return self.ignored(Command::Disconnect, "not connected").await;
        }
        self.close_wire().await;
    }

    /// A handshake round trip failed. Transport failures end the whole
    /// session; anything else leaves the pre-handshake state in place.
    async fn fail_handshake(&mut self, kind: HandshakeKind, err: LinkError) {
        warn!(kind = kind.as_str(), error = %err, "handshake failed");
        let reason = err.to_string();
        let event = match kind {
            HandshakeKind::Start => SessionEvent::StartFailed { reason },
            HandshakeKind::Stop => SessionEvent::StopFailed { reason },
        };
        let _ = self.events.send(event).await;
        if matches!(err, LinkError::Transport(_)) {
            self.close_wire().await;
        } else {
            let state = match kind {
                HandshakeKind::Start => SessionState::Connected,
                HandshakeKind::Stop => SessionState::Streaming,
            };
            self.state.set(state);
        }
    }

    /// The pump stopped on its own: receive window elapsed, transport
    /// failure, or task failure.
    async fn on_pump_exit(&mut self, exit: Result<PumpExit<ReadHalf<C::Stream>>, JoinError>) {
        let (peer, writer) = match mem::replace(&mut self.wire, Wire::Down) {
            Wire::Pumping { peer, writer, .. } => (peer, writer),
            other => {
                // Stale wake; nothing to do.
                self.wire = other;
                return;
            }
        };
        match exit {
            Ok(PumpExit {
                reader,
                end: PumpEnd::Ended,
            }) => {
                info!("stream went quiet; treating it as ended");
                self.wire = Wire::Up {
                    peer,
                    reader,
                    writer,
                };
                self.state.set(SessionState::Connected);
                let _ = self.events.send(SessionEvent::StreamStopped).await;
            }
            Ok(PumpExit {
                reader,
                end: PumpEnd::Cancelled,
            }) => {
                // Halting paths join the pump themselves; recover anyway.
                debug!("pump reported cancellation out of band");
                self.wire = Wire::Up {
                    peer,
                    reader,
                    writer,
                };
                self.state.set(SessionState::Connected);
            }
            Ok(PumpExit {
                end: PumpEnd::Failed(err),
                ..
            }) => {
                warn!(error = %err, "stream receive failed");
                self.state.set(SessionState::Idle);
                let _ = self.events.send(SessionEvent::Disconnected).await;
            }
            Err(err) => {
                error!(error = %err, "receive pump task failed");
                self.state.set(SessionState::Idle);
                let _ = self.events.send(SessionEvent::Disconnected).await;
            }
        }
    }

    /// Stop any pump, drop the connection halves, and report Idle.
    /// No-op when already down.
    async fn close_wire(&mut self) {
        match mem::replace(&mut self.wire, Wire::Down) {
            Wire::Down => return,
            Wire::Up { peer, .. } => {
                info!(%peer, "disconnected");
            }
            Wire::Pumping { peer, pump, .. } => {
                // Local teardown only; no stop handshake on the way out.
                let _ = pump.halt().await;
                info!(%peer, "disconnected");
            }
        }
        self.state.set(SessionState::Idle);
        let _ = self.events.send(SessionEvent::Disconnected).await;
    }

    async fn ignored(&mut self, command: Command, why: &'static str) {
        warn!(command = command.as_str(), why, "command ignored");
        let _ = self.events.send(SessionEvent::Ignored { command }).await;
    }
}
