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

//! Responder role: accept one peer at a time and serve its handshakes
//! and telemetry.
//!
//! The accept loop never exits on its own. A connection failure, however
//! deep into a session, tears that session down completely and puts the
//! loop back into accept, so the next initiator finds a clean responder.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::TimingConfig;
use crate::error::LinkError;
use crate::link::{self, Acceptor, MessageWriter};
use crate::protocol::{ControlToken, WireMessage};
use crate::sensor::SensorReader;
use crate::session::{
    pump, HandshakeCoordinator, HandshakeKind, SessionEvent, SessionState, StateCell,
    EVENT_CHANNEL_SIZE,
};

/// How long to back off after a failed accept before listening again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Handle to a running responder accept loop.
pub struct Responder {
    state: StateCell,
    handle: JoinHandle<()>,
}

impl Responder {
    /// Spawn the accept loop. It serves one peer at a time and runs
    /// until [`Responder::shutdown`].
    pub fn spawn<A, S>(
        acceptor: A,
        sensor: S,
        timing: TimingConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>)
    where
        A: Acceptor,
        S: SensorReader,
    {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let state = StateCell::new();
        let handle = tokio::spawn(accept_loop(
            acceptor,
            sensor,
            timing,
            event_tx,
            state.clone(),
        ));
        (Self { state, handle }, event_rx)
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Stop accepting and drop the current connection, if any.
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

async fn accept_loop<A, S>(
    mut acceptor: A,
    sensor: S,
    timing: TimingConfig,
    events: mpsc::Sender<SessionEvent>,
    state: StateCell,
) where
    A: Acceptor,
    S: SensorReader,
{
    // One sensor for the lifetime of the responder; warmup and history
    // carry across connections.
    let sensor = Arc::new(SyncMutex::new(sensor));
    info!("accepting connections");
    loop {
        let (stream, peer) = match acceptor.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                let err = LinkError::Connection(err);
                warn!(error = %err, "accept failed");
                let _ = events
                    .send(SessionEvent::ConnectFailed {
                        reason: err.to_string(),
                    })
                    .await;
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };
        info!(%peer, "peer connected");
        state.set(SessionState::Connected);
        let _ = events
            .send(SessionEvent::Connected { peer: peer.clone() })
            .await;

        serve_connection(stream, Arc::clone(&sensor), &timing, &events, &state).await;

        // The one place a finished connection is reported, whatever
        // ended it.
        state.set(SessionState::Idle);
        info!(%peer, "peer disconnected");
        let _ = events.send(SessionEvent::Disconnected).await;
    }
}

/// Serve one connection until it ends. All teardown happens before this
/// returns, so the caller can go straight back to accepting.
async fn serve_connection<IO, S>(
    stream: IO,
    sensor: Arc<SyncMutex<S>>,
    timing: &TimingConfig,
    events: &mpsc::Sender<SessionEvent>,
    state: &StateCell,
) where
    IO: AsyncRead + AsyncWrite + Send + 'static,
    S: SensorReader,
{
    let (mut reader, writer) = link::split(stream);
    let (fault_tx, mut fault_rx) = mpsc::channel(1);
    let mut peer = PeerLink {
        writer: Arc::new(AsyncMutex::new(writer)),
        coordinator: HandshakeCoordinator::new(
            timing.handshake_timeout(),
            events.clone(),
            state.clone(),
        ),
        sensor,
        pump_interval: timing.pump_interval(),
        events: events.clone(),
        faults: fault_tx,
        pump: None,
    };

    loop {
        let received = tokio::select! {
            received = reader.recv() => received,
            Some(err) = fault_rx.recv() => {
                warn!(error = %err, "data pump reported a transport fault");
                break;
            }
        };
        match received {
            Ok(Some(WireMessage::Control(token))) => {
                if !peer.on_token(token).await {
                    break;
                }
            }
            Ok(Some(WireMessage::Frame(_))) => {
                warn!("unexpected telemetry frame from the initiator; dropping");
            }
            Ok(None) => {
                info!("peer closed the stream");
                break;
            }
            Err(LinkError::Violation(detail)) => {
                warn!(%detail, "dropping malformed payload");
            }
            Err(err) => {
                warn!(error = %err, "receive failed");
                break;
            }
        }
    }

    peer.teardown().await;
    // The transport halves drop here, before the next accept.
}

/// Per-connection responder state: the shared writer, the handshake
/// coordinator, and the data pump if one is running.
struct PeerLink<W, S> {
    writer: Arc<AsyncMutex<MessageWriter<W>>>,
    coordinator: HandshakeCoordinator,
    sensor: Arc<SyncMutex<S>>,
    pump_interval: Duration,
    events: mpsc::Sender<SessionEvent>,
    faults: mpsc::Sender<LinkError>,
    pump: Option<JoinHandle<()>>,
}

impl<W, S> PeerLink<W, S>
where
    W: AsyncWrite + Send + Unpin + 'static,
    S: SensorReader,
{
    /// Handle one control token. Returns false when the connection must
    /// be torn down.
    async fn on_token(&mut self, token: ControlToken) -> bool {
        match token {
            ControlToken::StartSync => self.on_request(HandshakeKind::Start).await,
            ControlToken::StopSync => self.on_request(HandshakeKind::Stop).await,
            ControlToken::AckAck => {
                self.on_ack_ack().await;
                true
            }
            ControlToken::Ack => {
                warn!("unexpected ACK from the initiator; dropping");
                true
            }
        }
    }

    async fn on_request(&mut self, kind: HandshakeKind) -> bool {
        if let Err(err) = self.coordinator.begin(kind) {
            // No ACK for a rejected request; the initiator's own
            // deadline deals with it.
            warn!(kind = kind.as_str(), error = %err, "ignoring handshake request");
            return true;
        }
        if let Err(err) = self.writer.lock().await.send_token(ControlToken::Ack).await {
            warn!(error = %err, "ACK send failed");
            return false;
        }
        true
    }

    async fn on_ack_ack(&mut self) {
        match self.coordinator.acknowledge() {
            Some(HandshakeKind::Start) => {
                self.pump = Some(pump::start_feed_pump(
                    Arc::clone(&self.writer),
                    Arc::clone(&self.sensor),
                    self.coordinator.clone(),
                    self.pump_interval,
                    self.faults.clone(),
                ));
                let _ = self.events.send(SessionEvent::StreamStarted).await;
            }
            Some(HandshakeKind::Stop) => {
                // Not stopped until the pump has actually wound down.
                if let Some(handle) = self.pump.take() {
                    pump::join_feed_pump(handle).await;
                }
                let _ = self.events.send(SessionEvent::StreamStopped).await;
            }
            None => {}
        }
    }

    async fn teardown(mut self) {
        self.coordinator.reset();
        if let Some(handle) = self.pump.take() {
            pump::join_feed_pump(handle).await;
        }
    }
}
