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

//! Data pumps: the loops that move frames while streaming is active.
//!
//! The responder pump produces frames from the sensor and sends them at
//! a fixed cadence. The initiator pump receives frames into the
//! latest-frame slot, diverts control tokens to the handshake path, and
//! hands its reader half back when it exits.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::error::LinkError;
use crate::link::{MessageReader, MessageWriter};
use crate::protocol::{ControlToken, WireMessage};
use crate::sensor::SensorReader;
use crate::session::{FrameSlot, HandshakeCoordinator};

/// Stray tokens beyond this are dropped rather than queued forever.
const CONTROL_CHANNEL_SIZE: usize = 8;

/// How long a clean shutdown waits for the responder pump before
/// aborting it.
const FEED_JOIN_GRACE: Duration = Duration::from_secs(5);

/// Why the receive pump stopped.
#[derive(Debug)]
pub(crate) enum PumpEnd {
    /// Cooperative stop via the cancel signal.
    Cancelled,
    /// Nothing arrived within the receive window; the stream is over.
    Ended,
    /// The transport failed mid-stream.
    Failed(LinkError),
}

/// What the receive pump leaves behind.
pub(crate) struct PumpExit<R> {
    pub(crate) reader: MessageReader<R>,
    pub(crate) end: PumpEnd,
}

/// A running receive pump and the levers the session worker keeps:
/// completion, cancellation, and the control-token diversion channel.
pub(crate) struct StreamPump<R> {
    pub(crate) join: JoinHandle<PumpExit<R>>,
    pub(crate) control: mpsc::Receiver<ControlToken>,
    cancel: oneshot::Sender<()>,
}

impl<R> StreamPump<R> {
    /// Ask the pump to stop and wait for the reader to come back.
    /// Returns `None` only if the pump task itself failed.
    pub(crate) async fn halt(self) -> Option<PumpExit<R>> {
        let _ = self.cancel.send(());
        match self.join.await {
            Ok(exit) => Some(exit),
            Err(err) => {
                error!(error = %err, "receive pump task failed");
                None
            }
        }
    }
}

/// Spawn the initiator-side pump. It owns the reader until it exits.
pub(crate) fn start_recv_pump<R>(
    reader: MessageReader<R>,
    frames: FrameSlot,
    recv_timeout: Duration,
) -> StreamPump<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_SIZE);
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let join = tokio::spawn(recv_loop(reader, frames, control_tx, recv_timeout, cancel_rx));
    StreamPump {
        join,
        control: control_rx,
        cancel: cancel_tx,
    }
}

async fn recv_loop<R>(
    mut reader: MessageReader<R>,
    frames: FrameSlot,
    control: mpsc::Sender<ControlToken>,
    recv_timeout: Duration,
    mut cancel: oneshot::Receiver<()>,
) -> PumpExit<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    debug!("receive pump started");
    let end = loop {
        let received = tokio::select! {
            _ = &mut cancel => break PumpEnd::Cancelled,
            received = tokio::time::timeout(recv_timeout, reader.recv()) => received,
        };
        match received {
            Err(_elapsed) => {
                debug!("no traffic within the receive window");
                break PumpEnd::Ended;
            }
            Ok(Ok(Some(WireMessage::Frame(frame)))) => {
                trace!(bpm = frame.beats_per_minute, "frame received");
                frames.store(frame);
            }
            Ok(Ok(Some(WireMessage::Control(token)))) => {
                // Handshake traffic is not pump data; divert it.
                if control.try_send(token).is_err() {
                    warn!(
                        token = token.as_str(),
                        "dropping control token nobody is waiting for"
                    );
                }
            }
            Ok(Ok(None)) => {
                break PumpEnd::Failed(LinkError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the stream",
                )));
            }
            Ok(Err(LinkError::Violation(detail))) => {
                warn!(%detail, "dropping malformed payload");
            }
            Ok(Err(err)) => break PumpEnd::Failed(err),
        }
    };
    debug!("receive pump stopped");
    PumpExit { reader, end }
}

/// Spawn the responder-side pump. Runs while the streaming flag holds,
/// sending at most one frame per tick; a send failure is pushed onto the
/// fault channel so the receive loop tears the connection down.
pub(crate) fn start_feed_pump<W, S>(
    writer: Arc<AsyncMutex<MessageWriter<W>>>,
    sensor: Arc<SyncMutex<S>>,
    coordinator: HandshakeCoordinator,
    interval: Duration,
    faults: mpsc::Sender<LinkError>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Send + Unpin + 'static,
    S: SensorReader,
{
    tokio::spawn(async move {
        debug!("data pump started");
        while coordinator.is_streaming() {
            // The sensor guard must not be held across an await.
            let frame = sensor.lock().next_frame();
            if let Some(frame) = frame {
                trace!(bpm = frame.beats_per_minute, "sending frame");
                if let Err(err) = writer.lock().await.send_frame(&frame).await {
                    warn!(error = %err, "frame send failed");
                    let _ = faults.try_send(err);
                    break;
                }
            }
            tokio::time::sleep(interval).await;
        }
        debug!("data pump stopped");
    })
}

/// Wait for the responder pump to finish. The pump observes the cleared
/// streaming flag within one tick; the grace period only covers a send
/// blocked on a dead peer.
pub(crate) async fn join_feed_pump(mut handle: JoinHandle<()>) {
    match tokio::time::timeout(FEED_JOIN_GRACE, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "data pump task failed"),
        Err(_) => {
            warn!("data pump still running after grace period; aborting");
            handle.abort();
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link;
    use crate::protocol::PulseFrame;
    use crate::sensor::SyntheticSensor;
    use crate::session::{HandshakeKind, StateCell};
    use tokio::io::AsyncWriteExt;

    fn frame(bpm: f64) -> PulseFrame {
        PulseFrame {
            pulse: 500.0,
            impulses_per_minute: bpm,
            beats_per_minute: bpm,
            root_mean_square: None,
            hrstd: None,
        }
    }

    fn streaming_coordinator() -> HandshakeCoordinator {
        let (events, _) = mpsc::channel(32);
        let hs = HandshakeCoordinator::new(Duration::from_secs(20), events, StateCell::new());
        hs.begin(HandshakeKind::Start).unwrap();
        hs.acknowledge();
        hs
    }

    #[tokio::test]
    async fn test_recv_pump_caches_frames_and_diverts_tokens() {
        let (near, far) = tokio::io::duplex(4096);
        let (reader, _near_tx) = link::split(near);
        let (_far_rx, mut far_tx) = link::split(far);

        let frames = FrameSlot::new();
        let mut pump = start_recv_pump(reader, frames.clone(), Duration::from_secs(30));

        far_tx.send_frame(&frame(60.0)).await.unwrap();
        far_tx.send_frame(&frame(61.0)).await.unwrap();
        far_tx.send_token(ControlToken::Ack).await.unwrap();

        // Messages are processed in order, so once the token shows up on
        // the diversion channel both frames have been cached.
        assert_eq!(pump.control.recv().await, Some(ControlToken::Ack));
        assert_eq!(frames.latest().unwrap().beats_per_minute, 61.0);

        let exit = pump.halt().await.unwrap();
        assert!(matches!(exit.end, PumpEnd::Cancelled));

        // The reader comes back usable.
        let mut reader = exit.reader;
        far_tx.send_token(ControlToken::Ack).await.unwrap();
        assert_eq!(
            reader.recv().await.unwrap(),
            Some(WireMessage::Control(ControlToken::Ack))
        );
    }

    #[tokio::test]
    async fn test_recv_pump_survives_malformed_payloads() {
        let (near, mut far) = tokio::io::duplex(4096);
        let (reader, _near_tx) = link::split(near);

        let frames = FrameSlot::new();
        let pump = start_recv_pump(reader, frames.clone(), Duration::from_secs(30));

        far.write_all(b"definitely not a frame\n").await.unwrap();
        far.write_all(frame(70.0).to_json().unwrap().as_bytes())
            .await
            .unwrap();
        far.write_all(b"ACK\n").await.unwrap();

        // The token arriving proves the garbage line did not kill the pump.
        let StreamPump {
            mut control,
            cancel: _cancel,
            ..
        } = pump;
        assert_eq!(control.recv().await, Some(ControlToken::Ack));
        assert_eq!(frames.latest().unwrap().beats_per_minute, 70.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_pump_ends_after_silence() {
        let (near, far) = tokio::io::duplex(64);
        let (reader, _near_tx) = link::split(near);
        // Keep the peer open; the pump must end on silence, not EOF.
        let _far = far;

        let StreamPump {
            join,
            control: _control,
            cancel: _cancel,
        } = start_recv_pump(reader, FrameSlot::new(), Duration::from_secs(1000));

        let exit = join.await.unwrap();
        assert!(matches!(exit.end, PumpEnd::Ended));
    }

    #[tokio::test]
    async fn test_recv_pump_fails_on_peer_close() {
        let (near, far) = tokio::io::duplex(64);
        let (reader, _near_tx) = link::split(near);
        drop(far);

        let StreamPump {
            join,
            control: _control,
            cancel: _cancel,
        } = start_recv_pump(reader, FrameSlot::new(), Duration::from_secs(30));

        let exit = join.await.unwrap();
        assert!(matches!(exit.end, PumpEnd::Failed(LinkError::Transport(_))));
    }

    #[tokio::test]
    async fn test_feed_pump_streams_until_flag_clears() {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (_near_rx, near_tx) = link::split(near);
        let (mut far_rx, _far_tx) = link::split(far);

        let hs = streaming_coordinator();
        let writer = Arc::new(AsyncMutex::new(near_tx));
        let sensor = Arc::new(SyncMutex::new(SyntheticSensor::warmed_up()));
        let (fault_tx, _fault_rx) = mpsc::channel(1);

        let handle = start_feed_pump(
            writer,
            sensor,
            hs.clone(),
            Duration::from_millis(1),
            fault_tx,
        );

        match far_rx.recv().await.unwrap() {
            Some(WireMessage::Frame(_)) => {}
            other => panic!("expected a frame, got {:?}", other),
        }

        hs.reset();
        join_feed_pump(handle).await;
    }

    #[tokio::test]
    async fn test_feed_pump_reports_send_failure() {
        let (near, far) = tokio::io::duplex(64);
        let (_near_rx, near_tx) = link::split(near);
        drop(far);

        let hs = streaming_coordinator();
        let writer = Arc::new(AsyncMutex::new(near_tx));
        let sensor = Arc::new(SyncMutex::new(SyntheticSensor::warmed_up()));
        let (fault_tx, mut fault_rx) = mpsc::channel(1);

        let handle = start_feed_pump(
            writer,
            sensor,
            hs,
            Duration::from_millis(1),
            fault_tx,
        );

        let err = fault_rx.recv().await.unwrap();
        assert!(matches!(err, LinkError::Transport(_)));
        join_feed_pump(handle).await;
    }
}
