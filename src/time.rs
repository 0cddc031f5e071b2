// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Musical time types and tempo mapping.
//!
//! Musical time is measured in integer ticks at [`TICKS_PER_BEAT`] resolution
//! so that repeated conversions never accumulate floating-point error.
//! Conversion to and from sample time goes through a [`TempoMap`], which the
//! host injects and must keep stable for the duration of a process block.

use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// Ticks per quarter note. 1920 divides cleanly by all common subdivisions
/// (including triplets and dotted values).
pub const TICKS_PER_BEAT: i64 = 1920;

/// Musical time as an integer tick count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Beats {
    ticks: i64,
}

impl Beats {
    /// The start of the timeline.
    pub const ZERO: Beats = Beats { ticks: 0 };

    pub fn from_ticks(ticks: i64) -> Self {
        Self { ticks }
    }

    /// Builds a beat count from whole beats plus leftover ticks, the shape
    /// quantization settings come in.
    pub fn new(beats: i64, ticks: i64) -> Self {
        Self {
            ticks: beats * TICKS_PER_BEAT + ticks,
        }
    }

    pub fn ticks(self) -> i64 {
        self.ticks
    }

    pub fn to_f64(self) -> f64 {
        self.ticks as f64 / TICKS_PER_BEAT as f64
    }

    /// Snaps this time up to the next multiple of `grid`.
    ///
    /// Values already on the grid stay put, so a launch requested exactly on
    /// a grid point fires at that point rather than a full grid period late.
    /// A zero grid means "no quantization" and returns the value unchanged.
    pub fn snap_to(self, grid: Beats) -> Beats {
        if grid.ticks <= 0 {
            return self;
        }
        let rem = self.ticks.rem_euclid(grid.ticks);
        if rem == 0 {
            self
        } else {
            Beats {
                ticks: self.ticks - rem + grid.ticks,
            }
        }
    }
}

impl Add for Beats {
    type Output = Beats;

    fn add(self, rhs: Beats) -> Beats {
        Beats {
            ticks: self.ticks + rhs.ticks,
        }
    }
}

impl Sub for Beats {
    type Output = Beats;

    fn sub(self, rhs: Beats) -> Beats {
        Beats {
            ticks: self.ticks - rhs.ticks,
        }
    }
}

impl fmt::Display for Beats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.ticks / TICKS_PER_BEAT,
            self.ticks % TICKS_PER_BEAT
        )
    }
}

/// A musical offset expressed as bars, beats and ticks. Used for launch
/// quantization settings. Bar-level quantization is not yet implemented by
/// the engine; see [`BbtOffset::bar_level`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BbtOffset {
    pub bars: i32,
    pub beats: i32,
    pub ticks: i32,
}

impl BbtOffset {
    pub fn new(bars: i32, beats: i32, ticks: i32) -> Self {
        Self { bars, beats, ticks }
    }

    /// True when this offset is entirely zero, meaning "no quantization".
    pub fn is_zero(&self) -> bool {
        self.bars == 0 && self.beats == 0 && self.ticks == 0
    }

    /// True when the offset requires bar-level grid computation.
    pub fn bar_level(&self) -> bool {
        self.bars != 0
    }

    /// The beat-and-tick part of the offset as a [`Beats`] grid.
    pub fn beat_grid(&self) -> Beats {
        Beats::new(self.beats as i64, self.ticks as i64)
    }
}

impl fmt::Display for BbtOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.bars, self.beats, self.ticks)
    }
}

/// Conversion between sample time and musical time.
///
/// Implementations must be snapshots: every call within one process block
/// sees the same mapping.
pub trait TempoMap: Send + Sync {
    /// The musical time at the given sample position.
    fn beats_at(&self, sample: i64) -> Beats;

    /// The sample position of the given musical time.
    fn samples_at(&self, beats: Beats) -> i64;

    /// The sample rate the map converts against.
    fn sample_rate(&self) -> u32;
}

/// A constant-tempo map. Sufficient for hosts without tempo automation and
/// for tests; hosts with a full tempo timeline implement [`TempoMap`] over
/// their own structures.
#[derive(Debug, Clone)]
pub struct FixedTempoMap {
    bpm: f64,
    sample_rate: u32,
}

impl FixedTempoMap {
    pub fn new(bpm: f64, sample_rate: u32) -> Self {
        Self { bpm, sample_rate }
    }

    fn samples_per_tick(&self) -> f64 {
        (self.sample_rate as f64 * 60.0) / (self.bpm * TICKS_PER_BEAT as f64)
    }
}

impl TempoMap for FixedTempoMap {
    fn beats_at(&self, sample: i64) -> Beats {
        Beats::from_ticks((sample as f64 / self.samples_per_tick()).floor() as i64)
    }

    fn samples_at(&self, beats: Beats) -> i64 {
        (beats.ticks() as f64 * self.samples_per_tick()).round() as i64
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
