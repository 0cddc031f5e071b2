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

//! Offline time-stretching of clip audio.
//!
//! The engine does not implement a stretcher itself; it drives one through
//! the [`TimeStretcher`] trait using a study pass, a process pass, and a
//! final drain, feeding fixed-size blocks. The trait mirrors offline
//! phase-vocoder engines, which may process asynchronously: output can lag
//! input, so the drain loop waits until the engine reports completion.
//!
//! Stretching runs on the control thread during clip load. It may sleep and
//! allocate; it must never be called from the process callback.

use std::thread;
use std::time::Duration;

use tracing::debug;

/// Block size used for both the study and process passes.
pub const STRETCH_BLOCK: usize = 16384;

/// Safety margin added to the stretched-output allocation, and the tolerance
/// callers should allow when comparing a stretched length to its target.
pub const STRETCH_MARGIN: usize = 16;

/// Output availability reported by a stretch engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StretchAvail {
    /// This many frames can be retrieved now.
    Ready(usize),
    /// Nothing available yet, but more output is coming.
    Pending,
    /// All output has been produced and retrieved.
    Finished,
}

/// An offline time-stretch engine.
///
/// Call order per stretch: configuration, one full study pass, one full
/// process pass (draining as output appears), then a final drain until
/// [`StretchAvail::Finished`].
pub trait TimeStretcher {
    /// Output-to-input duration ratio. 2.0 doubles the clip length.
    fn set_time_ratio(&mut self, ratio: f64);

    /// Upper bound on the frame count of any study/process call.
    fn set_max_process_size(&mut self, frames: usize);

    /// Total input duration, declared ahead of the study pass.
    fn set_expected_input_duration(&mut self, frames: usize);

    /// Feeds one block of the analysis pass. `last` marks the final block.
    fn study(&mut self, input: &[&[f32]], last: bool);

    /// Feeds one block of the synthesis pass. `last` marks the final block.
    fn process(&mut self, input: &[&[f32]], last: bool);

    fn available(&self) -> StretchAvail;

    /// Appends up to the currently available frames onto each channel of
    /// `output`, returning how many frames were appended.
    fn retrieve(&mut self, output: &mut [Vec<f32>]) -> usize;
}

/// Runs the full offline protocol over planar `data`, returning the
/// stretched channels. `data` must be non-empty with equal-length channels.
pub fn stretch_channels(
    data: &[Vec<f32>],
    ratio: f64,
    stretcher: &mut dyn TimeStretcher,
) -> Vec<Vec<f32>> {
    let nchans = data.len();
    let data_length = data.first().map(Vec::len).unwrap_or(0);
    if nchans == 0 || data_length == 0 {
        return data.to_vec();
    }

    debug!(
        channels = nchans,
        input_frames = data_length,
        ratio,
        "Offline stretch starting"
    );

    stretcher.set_time_ratio(ratio);
    stretcher.set_max_process_size(STRETCH_BLOCK);
    stretcher.set_expected_input_duration(data_length);

    let expected = (data_length as f64 * ratio).ceil() as usize + STRETCH_MARGIN;
    let mut stretched: Vec<Vec<f32>> = (0..nchans).map(|_| Vec::with_capacity(expected)).collect();

    let block_slices = |read: usize, to_read: usize| -> Vec<&[f32]> {
        data.iter().map(|ch| &ch[read..read + to_read]).collect()
    };

    // Study pass.
    let mut read = 0;
    while read < data_length {
        let to_read = STRETCH_BLOCK.min(data_length - read);
        let slices = block_slices(read, to_read);
        read += to_read;
        stretcher.study(&slices, read >= data_length);
    }

    // Process pass, draining output as it appears.
    read = 0;
    while read < data_length {
        let to_read = STRETCH_BLOCK.min(data_length - read);
        let slices = block_slices(read, to_read);
        read += to_read;
        stretcher.process(&slices, read >= data_length);

        while let StretchAvail::Ready(_) = stretcher.available() {
            stretcher.retrieve(&mut stretched);
        }
    }

    // Final drain: the engine may still be producing output asynchronously.
    loop {
        match stretcher.available() {
            StretchAvail::Ready(_) => {
                stretcher.retrieve(&mut stretched);
            }
            StretchAvail::Pending => thread::sleep(Duration::from_millis(10)),
            StretchAvail::Finished => break,
        }
    }

    debug!(
        output_frames = stretched.first().map(Vec::len).unwrap_or(0),
        "Offline stretch finished"
    );

    stretched
}

/// A stretch engine that linearly resamples its input to the target length.
///
/// This changes pitch along with duration, so it is a stand-in for tests and
/// previews; a production host injects a phase-vocoder implementation behind
/// the same trait.
pub struct LinearStretcher {
    ratio: f64,
    max_chunk: usize,
    input: Vec<Vec<f32>>,
    output: Vec<Vec<f32>>,
    out_pos: usize,
    input_done: bool,
}

impl LinearStretcher {
    pub fn new() -> Self {
        Self {
            ratio: 1.0,
            max_chunk: STRETCH_BLOCK,
            input: Vec::new(),
            output: Vec::new(),
            out_pos: 0,
            input_done: false,
        }
    }

    fn render(&mut self) {
        let in_len = self.input.first().map(Vec::len).unwrap_or(0);
        let out_len = (in_len as f64 * self.ratio).round() as usize;

        self.output = self
            .input
            .iter()
            .map(|ch| {
                (0..out_len)
                    .map(|i| {
                        let pos = i as f64 / self.ratio;
                        let i0 = pos.floor() as usize;
                        let frac = (pos - i0 as f64) as f32;
                        let a = ch.get(i0).copied().unwrap_or(0.0);
                        let b = ch.get(i0 + 1).copied().unwrap_or(a);
                        a + (b - a) * frac
                    })
                    .collect()
            })
            .collect();
    }
}

impl Default for LinearStretcher {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeStretcher for LinearStretcher {
    fn set_time_ratio(&mut self, ratio: f64) {
        self.ratio = ratio;
    }

    fn set_max_process_size(&mut self, frames: usize) {
        self.max_chunk = frames.max(1);
    }

    fn set_expected_input_duration(&mut self, _frames: usize) {}

    fn study(&mut self, _input: &[&[f32]], _last: bool) {
        // Linear interpolation needs no analysis pass.
    }

    fn process(&mut self, input: &[&[f32]], last: bool) {
        if self.input.len() != input.len() {
            self.input = vec![Vec::new(); input.len()];
        }
        for (buf, block) in self.input.iter_mut().zip(input) {
            buf.extend_from_slice(block);
        }
        if last {
            self.input_done = true;
            self.render();
        }
    }

    fn available(&self) -> StretchAvail {
        let remaining = self
            .output
            .first()
            .map(Vec::len)
            .unwrap_or(0)
            .saturating_sub(self.out_pos);

        if remaining > 0 {
            StretchAvail::Ready(remaining.min(self.max_chunk))
        } else if self.input_done {
            StretchAvail::Finished
        } else {
            StretchAvail::Pending
        }
    }

    fn retrieve(&mut self, output: &mut [Vec<f32>]) -> usize {
        let n = match self.available() {
            StretchAvail::Ready(n) => n,
            _ => return 0,
        };
        for (out, ch) in output.iter_mut().zip(self.output.iter()) {
            out.extend_from_slice(&ch[self.out_pos..self.out_pos + n]);
        }
        self.out_pos += n;
        n
    }
}
