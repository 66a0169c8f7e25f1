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

//! Wire protocol definitions and serialization.
//!
//! Every payload is one UTF-8 line: control tokens are bare literals,
//! telemetry frames are JSON objects. An inbound line is matched against
//! the token set before any frame decode is attempted, so a stray token
//! can never reach the frame parser.

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

/// Control tokens exchanged during the start/stop handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlToken {
    StartSync,
    StopSync,
    Ack,
    AckAck,
}

impl ControlToken {
    /// Convert to the wire literal.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartSync => "START_SYNC",
            Self::StopSync => "STOP_SYNC",
            Self::Ack => "ACK",
            Self::AckAck => "ACK_ACK",
        }
    }

    /// Parse a wire literal. Exact match only; in particular `ACK_ACK`
    /// never parses as `ACK`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "START_SYNC" => Some(Self::StartSync),
            "STOP_SYNC" => Some(Self::StopSync),
            "ACK" => Some(Self::Ack),
            "ACK_ACK" => Some(Self::AckAck),
            _ => None,
        }
    }
}

/// One telemetry sample.
///
/// `root_mean_square` and `hrstd` are null on the wire until the sensor
/// has enough history to compute them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseFrame {
    /// Raw pulse amplitude.
    pub pulse: f64,

    /// Impulse rate derived from peak detection.
    pub impulses_per_minute: f64,

    /// Smoothed heart rate.
    pub beats_per_minute: f64,

    /// RMSSD over the recent beat intervals.
    #[serde(default)]
    pub root_mean_square: Option<f64>,

    /// Standard deviation of the recent heart-rate window.
    #[serde(default)]
    pub hrstd: Option<f64>,
}

impl PulseFrame {
    /// Serialize to a JSON line with newline delimiter.
    pub fn to_json(&self) -> Result<String> {
        let json = serde_json::to_string(self)
            .map_err(|e| LinkError::Violation(format!("frame encode failed: {e}")))?;
        Ok(format!("{}\n", json))
    }

    /// Parse from a JSON line.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json.trim())
            .map_err(|e| LinkError::Violation(format!("malformed frame: {e}")))
    }
}

/// A decoded inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Control(ControlToken),
    Frame(PulseFrame),
}

impl WireMessage {
    /// Decode one line from the transport.
    pub fn decode(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if let Some(token) = ControlToken::parse(trimmed) {
            return Ok(Self::Control(token));
        }
        PulseFrame::from_json(trimmed).map(Self::Frame)
    }

    /// Short description for log lines.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Control(token) => token.as_str(),
            Self::Frame(_) => "telemetry frame",
        }
    }
}

/// Encode a control token as a wire line.
pub fn encode_token(token: ControlToken) -> String {
    format!("{}\n", token.as_str())
}
