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

//! Pulse telemetry over a serial-style duplex link.
//!
//! One initiator drives one responder through a two-phase start/stop
//! handshake (request, ACK, ACK_ACK); between an acknowledged start and
//! an acknowledged stop the responder streams newline-delimited JSON
//! pulse frames. The session layer is generic over the transport, with
//! TCP implementations included.

pub mod config;
pub mod error;
pub mod link;
pub mod protocol;
pub mod sensor;
pub mod session;

pub use error::{LinkError, Result};
pub use protocol::{ControlToken, PulseFrame, WireMessage};
pub use session::{Command, HandshakeKind, Initiator, Responder, SessionEvent, SessionState};
