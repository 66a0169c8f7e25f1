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

//! Start/stop handshake coordination.
//!
//! The responder side accepts a request, replies ACK, and keeps a
//! [`PendingAck`] until ACK_ACK arrives or the deadline passes. Ack
//! arrival and deadline expiry race; the pending slot's mutex decides the
//! winner and the loser observes an empty slot and does nothing.
//!
//! The initiator side drives the mirror-image round trip: send the
//! request, require ACK within the deadline, confirm with ACK_ACK.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{LinkError, Result};
use crate::link::{MessageReader, MessageWriter};
use crate::protocol::{ControlToken, WireMessage};
use crate::session::{SessionEvent, SessionState, StateCell};

/// Which stream transition a handshake negotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeKind {
    Start,
    Stop,
}

impl HandshakeKind {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }

    /// The token that opens this handshake on the wire.
    pub(crate) fn request_token(self) -> ControlToken {
        match self {
            Self::Start => ControlToken::StartSync,
            Self::Stop => ControlToken::StopSync,
        }
    }
}

impl fmt::Display for HandshakeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An accepted handshake awaiting ACK_ACK.
///
/// Exists for at most one kind at a time. The deadline lives with the
/// watcher task spawned alongside it; dropping the `cancel` sender wakes
/// that watcher early.
struct PendingAck {
    kind: HandshakeKind,
    seq: u64,
    _cancel: oneshot::Sender<()>,
}

struct CoordinatorInner {
    pending: Mutex<Option<PendingAck>>,
    streaming: AtomicBool,
    seq: AtomicU64,
}

/// Responder-side handshake state for one connection.
///
/// Clones share the same state; the receive loop and the data pump each
/// hold one.
#[derive(Clone)]
pub struct HandshakeCoordinator {
    inner: Arc<CoordinatorInner>,
    timeout: Duration,
    events: mpsc::Sender<SessionEvent>,
    state: StateCell,
}

impl HandshakeCoordinator {
    pub fn new(timeout: Duration, events: mpsc::Sender<SessionEvent>, state: StateCell) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                pending: Mutex::new(None),
                streaming: AtomicBool::new(false),
                seq: AtomicU64::new(0),
            }),
            timeout,
            events,
            state,
        }
    }

    /// Whether a fully acknowledged start handshake is in effect.
    pub fn is_streaming(&self) -> bool {
        self.inner.streaming.load(Ordering::SeqCst)
    }

    /// Accept a start or stop request, installing a pending handshake and
    /// its deadline watcher. The caller replies ACK only on `Ok`.
    ///
    /// A request that overlaps a pending handshake, or that does not
    /// apply to the current streaming state, is a protocol violation and
    /// leaves everything unchanged.
    pub fn begin(&self, kind: HandshakeKind) -> Result<()> {
        let mut pending = self.inner.pending.lock();
        if let Some(current) = pending.as_ref() {
            return Err(LinkError::Violation(format!(
                "{} requested while a {} handshake is still pending",
                kind, current.kind
            )));
        }
        let streaming = self.inner.streaming.load(Ordering::SeqCst);
        match kind {
            HandshakeKind::Start if streaming => {
                return Err(LinkError::Violation(
                    "start requested while already streaming".to_string(),
                ));
            }
            HandshakeKind::Stop if !streaming => {
                return Err(LinkError::Violation(
                    "stop requested while not streaming".to_string(),
                ));
            }
            _ => {}
        }

        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        *pending = Some(PendingAck {
            kind,
            seq,
            _cancel: cancel_tx,
        });
        drop(pending);
        self.state.set(match kind {
            HandshakeKind::Start => SessionState::HandshakingStart,
            HandshakeKind::Stop => SessionState::HandshakingStop,
        });
        info!(kind = kind.as_str(), "handshake pending; awaiting ACK_ACK");

        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();
        let state = self.state.clone();
        let deadline = self.timeout;
        tokio::spawn(async move {
            // Resolution drops the cancel sender and completes this wait
            // before the deadline; only a genuine expiry falls through.
            if tokio::time::timeout(deadline, cancel_rx).await.is_ok() {
                return;
            }
            let expired = {
                let mut pending = inner.pending.lock();
                match pending.take() {
                    Some(p) if p.seq == seq => true,
                    Some(other) => {
                        *pending = Some(other);
                        false
                    }
                    None => false,
                }
            };
            if expired {
                warn!(kind = kind.as_str(), "handshake timed out awaiting ACK_ACK");
                let reason = LinkError::HandshakeTimeout(kind).to_string();
                // An expired handshake changes nothing: back to the state
                // the request found.
                let (event, fallback) = match kind {
                    HandshakeKind::Start => {
                        (SessionEvent::StartFailed { reason }, SessionState::Connected)
                    }
                    HandshakeKind::Stop => {
                        (SessionEvent::StopFailed { reason }, SessionState::Streaming)
                    }
                };
                state.set(fallback);
                let _ = events.send(event).await;
            }
        });
        Ok(())
    }

    /// Resolve the pending handshake on ACK_ACK arrival. Returns the
    /// resolved kind, or `None` when nothing was pending (late or
    /// duplicate ACK_ACK).
    pub fn acknowledge(&self) -> Option<HandshakeKind> {
        let mut pending = self.inner.pending.lock();
        let Some(resolved) = pending.take() else {
            debug!("ACK_ACK with no handshake pending; ignoring");
            return None;
        };
        // The flag flips under the same lock the watcher takes, so
        // exactly one of ack arrival and deadline expiry resolves this
        // handshake.
        let streaming_on = matches!(resolved.kind, HandshakeKind::Start);
        self.inner.streaming.store(streaming_on, Ordering::SeqCst);
        drop(pending);
        self.state.set(if streaming_on {
            SessionState::Streaming
        } else {
            SessionState::Connected
        });
        info!(kind = resolved.kind.as_str(), "handshake acknowledged");
        Some(resolved.kind)
    }

    /// Drop any pending handshake and force streaming off. Part of every
    /// disconnect teardown.
    pub fn reset(&self) {
        let mut pending = self.inner.pending.lock();
        if pending.take().is_some() {
            debug!("clearing pending handshake");
        }
        self.inner.streaming.store(false, Ordering::SeqCst);
    }
}

/// Initiator side, direct variant: the worker still owns the reader.
/// Used for the start handshake.
pub(crate) async fn request_direct<R, W>(
    kind: HandshakeKind,
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    deadline: Duration,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.send_token(kind.request_token()).await?;
    let expires = tokio::time::Instant::now() + deadline;
    let reply = loop {
        let received = tokio::time::timeout_at(expires, reader.recv())
            .await
            .map_err(|_| LinkError::HandshakeTimeout(kind))??;
        match received {
            // Telemetry residue from a just-stopped stream is not a reply.
            Some(WireMessage::Frame(_)) => {
                debug!("skipping telemetry while awaiting ACK");
            }
            other => break other,
        }
    };
    confirm(kind, reply, writer).await
}

/// Initiator side, diverted variant: the receive pump owns the reader,
/// so the reply arrives over the pump's control-token channel. Used for
/// the stop handshake.
pub(crate) async fn request_via_pump<W>(
    kind: HandshakeKind,
    control: &mut mpsc::Receiver<ControlToken>,
    writer: &mut MessageWriter<W>,
    deadline: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    // Tokens that arrived outside any handshake must not satisfy this one.
    while let Ok(stale) = control.try_recv() {
        warn!(token = stale.as_str(), "discarding stale control token");
    }
    writer.send_token(kind.request_token()).await?;
    let reply = tokio::time::timeout(deadline, control.recv())
        .await
        .map_err(|_| LinkError::HandshakeTimeout(kind))?;
    confirm(kind, reply.map(WireMessage::Control), writer).await
}

async fn confirm<W>(
    kind: HandshakeKind,
    reply: Option<WireMessage>,
    writer: &mut MessageWriter<W>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match reply {
        Some(WireMessage::Control(ControlToken::Ack)) => {
            writer.send_token(ControlToken::AckAck).await?;
            Ok(())
        }
        Some(other) => Err(LinkError::HandshakeRejected {
            kind,
            reply: other.describe().to_string(),
        }),
        None => Err(LinkError::HandshakeRejected {
            kind,
            reply: "closed stream".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link;
    use crate::protocol::PulseFrame;

    fn coordinator(secs: u64) -> (HandshakeCoordinator, mpsc::Receiver<SessionEvent>, StateCell) {
        let (tx, rx) = mpsc::channel(32);
        let state = StateCell::new();
        state.set(SessionState::Connected);
        (
            HandshakeCoordinator::new(Duration::from_secs(secs), tx, state.clone()),
            rx,
            state,
        )
    }

    #[tokio::test]
    async fn test_ack_ack_flips_streaming_on_and_off() {
        let (hs, _events, state) = coordinator(20);
        assert!(!hs.is_streaming());

        hs.begin(HandshakeKind::Start).unwrap();
        assert!(!hs.is_streaming(), "streaming must wait for ACK_ACK");
        assert_eq!(state.get(), SessionState::HandshakingStart);
        assert_eq!(hs.acknowledge(), Some(HandshakeKind::Start));
        assert!(hs.is_streaming());
        assert_eq!(state.get(), SessionState::Streaming);

        hs.begin(HandshakeKind::Stop).unwrap();
        assert!(hs.is_streaming(), "streaming holds until ACK_ACK");
        assert_eq!(state.get(), SessionState::HandshakingStop);
        assert_eq!(hs.acknowledge(), Some(HandshakeKind::Stop));
        assert!(!hs.is_streaming());
        assert_eq!(state.get(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_overlapping_request_is_rejected() {
        let (hs, _events, _state) = coordinator(20);
        hs.begin(HandshakeKind::Start).unwrap();

        let err = hs.begin(HandshakeKind::Start).unwrap_err();
        assert!(matches!(err, LinkError::Violation(_)));
        let err = hs.begin(HandshakeKind::Stop).unwrap_err();
        assert!(matches!(err, LinkError::Violation(_)));

        // The original pending handshake is untouched and still resolves.
        assert_eq!(hs.acknowledge(), Some(HandshakeKind::Start));
        assert!(hs.is_streaming());
    }

    #[tokio::test]
    async fn test_wrong_state_requests_are_rejected() {
        let (hs, _events, _state) = coordinator(20);

        let err = hs.begin(HandshakeKind::Stop).unwrap_err();
        assert!(matches!(err, LinkError::Violation(_)));

        hs.begin(HandshakeKind::Start).unwrap();
        hs.acknowledge();

        let err = hs.begin(HandshakeKind::Start).unwrap_err();
        assert!(matches!(err, LinkError::Violation(_)));
        assert!(hs.is_streaming());
    }

    #[tokio::test]
    async fn test_duplicate_ack_ack_is_noop() {
        let (hs, _events, _state) = coordinator(20);
        hs.begin(HandshakeKind::Start).unwrap();

        assert_eq!(hs.acknowledge(), Some(HandshakeKind::Start));
        assert_eq!(hs.acknowledge(), None);
        assert!(hs.is_streaming(), "duplicate must not flip the flag");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_reports_and_leaves_streaming_off() {
        let (hs, mut events, state) = coordinator(20);
        hs.begin(HandshakeKind::Start).unwrap();

        // Virtual time advances to the deadline once everything is idle.
        let event = events.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::StartFailed { .. }));
        assert!(!hs.is_streaming());
        assert_eq!(state.get(), SessionState::Connected);

        // A late ACK_ACK finds nothing to resolve.
        assert_eq!(hs.acknowledge(), None);
        assert!(!hs.is_streaming());

        // And a fresh handshake can begin.
        hs.begin(HandshakeKind::Start).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_timeout_keeps_streaming() {
        let (hs, mut events, state) = coordinator(20);
        hs.begin(HandshakeKind::Start).unwrap();
        hs.acknowledge();

        hs.begin(HandshakeKind::Stop).unwrap();
        let event = events.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::StopFailed { .. }));
        assert!(hs.is_streaming(), "an unresolved stop leaves the stream running");
        assert_eq!(state.get(), SessionState::Streaming);
    }

    #[tokio::test]
    async fn test_reset_clears_pending_and_streaming() {
        let (hs, _events, _state) = coordinator(20);
        hs.begin(HandshakeKind::Start).unwrap();
        hs.acknowledge();
        hs.begin(HandshakeKind::Stop).unwrap();

        hs.reset();
        assert!(!hs.is_streaming());
        assert_eq!(hs.acknowledge(), None);
        hs.begin(HandshakeKind::Start).unwrap();
    }

    #[tokio::test]
    async fn test_request_direct_round_trip() {
        let (near, far) = tokio::io::duplex(1024);
        let (mut reader, mut writer) = link::split(near);
        let (mut peer_rx, mut peer_tx) = link::split(far);

        let peer = tokio::spawn(async move {
            assert_eq!(
                peer_rx.recv().await.unwrap(),
                Some(WireMessage::Control(ControlToken::StartSync))
            );
            peer_tx.send_token(ControlToken::Ack).await.unwrap();
            assert_eq!(
                peer_rx.recv().await.unwrap(),
                Some(WireMessage::Control(ControlToken::AckAck))
            );
        });

        request_direct(
            HandshakeKind::Start,
            &mut reader,
            &mut writer,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        peer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_direct_times_out_on_silence() {
        let (near, far) = tokio::io::duplex(1024);
        let (mut reader, mut writer) = link::split(near);
        // Keep the far side open so silence, not EOF, is what we test.
        let _far = far;

        let err = request_direct(
            HandshakeKind::Start,
            &mut reader,
            &mut writer,
            Duration::from_secs(20),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LinkError::HandshakeTimeout(HandshakeKind::Start)));
    }

    #[tokio::test]
    async fn test_request_direct_rejects_non_ack_reply() {
        let (near, far) = tokio::io::duplex(1024);
        let (mut reader, mut writer) = link::split(near);
        let (mut peer_rx, mut peer_tx) = link::split(far);

        let peer = tokio::spawn(async move {
            peer_rx.recv().await.unwrap();
            // ACK_ACK is not ACK.
            peer_tx.send_token(ControlToken::AckAck).await.unwrap();
        });

        let err = request_direct(
            HandshakeKind::Stop,
            &mut reader,
            &mut writer,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LinkError::HandshakeRejected { .. }));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_direct_skips_telemetry_residue() {
        let (near, far) = tokio::io::duplex(1024);
        let (mut reader, mut writer) = link::split(near);
        let (mut peer_rx, mut peer_tx) = link::split(far);

        let peer = tokio::spawn(async move {
            assert_eq!(
                peer_rx.recv().await.unwrap(),
                Some(WireMessage::Control(ControlToken::StartSync))
            );
            // A frame still in flight from the stream that just stopped.
            let stale = PulseFrame {
                pulse: 500.0,
                impulses_per_minute: 72.0,
                beats_per_minute: 72.0,
                root_mean_square: None,
                hrstd: None,
            };
            peer_tx.send_frame(&stale).await.unwrap();
            peer_tx.send_token(ControlToken::Ack).await.unwrap();
            assert_eq!(
                peer_rx.recv().await.unwrap(),
                Some(WireMessage::Control(ControlToken::AckAck))
            );
        });

        request_direct(
            HandshakeKind::Start,
            &mut reader,
            &mut writer,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_via_pump_discards_stale_tokens() {
        let (near, far) = tokio::io::duplex(1024);
        let (_reader, mut writer) = link::split(near);
        let (mut peer_rx, _peer_tx) = link::split(far);

        let (control_tx, mut control_rx) = mpsc::channel(8);
        // A token left over from earlier traffic must not satisfy the wait.
        control_tx.try_send(ControlToken::Ack).unwrap();

        let peer = tokio::spawn(async move {
            assert_eq!(
                peer_rx.recv().await.unwrap(),
                Some(WireMessage::Control(ControlToken::StopSync))
            );
            control_tx.send(ControlToken::Ack).await.unwrap();
            assert_eq!(
                peer_rx.recv().await.unwrap(),
                Some(WireMessage::Control(ControlToken::AckAck))
            );
        });

        request_via_pump(
            HandshakeKind::Stop,
            &mut control_rx,
            &mut writer,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        peer.await.unwrap();

        // The fresh ack was consumed; had the stale one been used, it
        // would still be sitting in the channel.
        assert!(control_rx.try_recv().is_err());
    }
}
