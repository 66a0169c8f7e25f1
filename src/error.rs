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

//! Error types for the link and session layers.

use thiserror::Error;

use crate::session::HandshakeKind;

/// Errors produced while establishing or running a session.
///
/// `Violation` is recoverable at the receive loop (the offending payload
/// is dropped and the session continues); `Transport` is not (the
/// connection is torn down).
#[derive(Debug, Error)]
pub enum LinkError {
    /// Dial, bind, or accept failed before a session existed.
    #[error("connection failed: {0}")]
    Connection(#[source] std::io::Error),

    /// The peer did not complete a handshake within the deadline.
    #[error("{0} handshake timed out")]
    HandshakeTimeout(HandshakeKind),

    /// The peer answered a handshake request with something other than ACK.
    #[error("{kind} handshake rejected: got {reply} instead of ACK")]
    HandshakeRejected { kind: HandshakeKind, reply: String },

    /// Send or receive failed on an established connection.
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    /// The peer sent something the protocol does not allow.
    #[error("protocol violation: {0}")]
    Violation(String),
}

pub type Result<T> = std::result::Result<T, LinkError>;
