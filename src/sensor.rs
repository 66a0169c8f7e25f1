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

//! Sensor seam and the synthetic pulse source.
//!
//! A real signal-processing pipeline plugs in by implementing
//! [`SensorReader`]; the data pump only sees this trait.

use std::collections::VecDeque;

use rand::Rng;

use crate::protocol::PulseFrame;

/// Source of telemetry frames for the responder's data pump.
pub trait SensorReader: Send + 'static {
    /// Produce the next frame, or `None` while no valid sample exists.
    /// Called once per pump tick; must not block.
    fn next_frame(&mut self) -> Option<PulseFrame>;
}

/// Synthetic pulse source for the reference responder and tests.
///
/// Returns `None` during a short warmup, then frames with resting-range
/// metrics. `hrstd` is the standard deviation of the last
/// [`BPM_WINDOW`](Self::BPM_WINDOW) heart-rate values and stays `None`
/// until that window fills.
pub struct SyntheticSensor {
    warmup_remaining: u32,
    bpm_window: VecDeque<f64>,
}

impl SyntheticSensor {
    /// Samples of heart-rate history needed before `hrstd` is reported.
    pub const BPM_WINDOW: usize = 10;

    const WARMUP_TICKS: u32 = 3;

    pub fn new() -> Self {
        Self {
            warmup_remaining: Self::WARMUP_TICKS,
            bpm_window: VecDeque::with_capacity(Self::BPM_WINDOW),
        }
    }

    /// Sensor with the warmup already elapsed, for tests that need a
    /// frame on the first tick.
    pub fn warmed_up() -> Self {
        Self {
            warmup_remaining: 0,
            bpm_window: VecDeque::with_capacity(Self::BPM_WINDOW),
        }
    }
}

impl Default for SyntheticSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorReader for SyntheticSensor {
    fn next_frame(&mut self) -> Option<PulseFrame> {
        if self.warmup_remaining > 0 {
            self.warmup_remaining -= 1;
            return None;
        }

        let mut rng = rand::thread_rng();
        let beats_per_minute = rng.gen_range(55.0..100.0);

        self.bpm_window.push_back(beats_per_minute);
        if self.bpm_window.len() > Self::BPM_WINDOW {
            self.bpm_window.pop_front();
        }
        let hrstd =
            (self.bpm_window.len() == Self::BPM_WINDOW).then(|| std_deviation(&self.bpm_window));

        Some(PulseFrame {
            pulse: rng.gen_range(400.0..700.0),
            impulses_per_minute: rng.gen_range(55.0..100.0),
            beats_per_minute,
            root_mean_square: Some(rng.gen_range(15.0..80.0)),
            hrstd,
        })
    }
}

fn std_deviation(window: &VecDeque<f64>) -> f64 {
    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}
