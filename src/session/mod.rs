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

//! Session layer.
//!
//! Owns the connection lifecycle for one peer at a time: the initiator's
//! command worker, the responder's accept loop, the start/stop handshake
//! coordination, and the data pumps that move frames while streaming.

mod handshake;
mod initiator;
mod pump;
mod responder;

pub use handshake::HandshakeKind;
pub(crate) use handshake::HandshakeCoordinator;
pub use initiator::Initiator;
pub use responder::Responder;

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::protocol::PulseFrame;

/// Connection lifecycle states for one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    HandshakingStart,
    Streaming,
    HandshakingStop,
}

impl SessionState {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::HandshakingStart => "handshaking-start",
            Self::Streaming => "streaming",
            Self::HandshakingStop => "handshaking-stop",
        }
    }
}

/// Commands accepted by the initiator's dispatcher.
///
/// Producers only enqueue; the session worker executes them one at a
/// time, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Start,
    Stop,
    Disconnect,
    Exit,
}

impl Command {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Disconnect => "disconnect",
            Self::Exit => "exit",
        }
    }
}

/// Status reports emitted by both roles.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected { peer: String },
    ConnectFailed { reason: String },
    Disconnected,
    StreamStarted,
    StreamStopped,
    StartFailed { reason: String },
    StopFailed { reason: String },
    Ignored { command: Command },
}

/// Capacity of the event channel handed to the embedding process.
pub(crate) const EVENT_CHANNEL_SIZE: usize = 32;

/// Latest-frame cache with overwrite semantics.
///
/// The receive pump overwrites; external readers poll. There is no
/// queueing and no notification.
#[derive(Clone, Default)]
pub struct FrameSlot {
    inner: Arc<RwLock<Option<PulseFrame>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent frame received, if any.
    pub fn latest(&self) -> Option<PulseFrame> {
        self.inner.read().clone()
    }

    pub(crate) fn store(&self, frame: PulseFrame) {
        *self.inner.write() = Some(frame);
    }
}

/// Shared view of the session state, readable outside the worker.
#[derive(Clone, Default)]
pub(crate) struct StateCell {
    inner: Arc<RwLock<SessionState>>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self) -> SessionState {
        *self.inner.read()
    }

    pub(crate) fn set(&self, state: SessionState) {
        debug!(state = state.as_str(), "session state");
        *self.inner.write() = state;
    }
}
