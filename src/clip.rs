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

//! Decoded clip audio and the playback cursor.
//!
//! An [`AudioClip`] owns planar PCM copied out of a region at load time plus
//! the cursor state the render loop advances. Loading and stretching happen
//! on the control thread; once a block is in flight the data is stable and
//! the audio thread reads it without synchronization.

use tracing::{debug, warn};

use crate::region::{Region, RegionError};
use crate::stretch::{stretch_channels, TimeStretcher};
use crate::time::{BbtOffset, TempoMap};
use crate::trigger::LaunchStyle;

/// Owned clip audio plus playback cursor for one trigger slot.
#[derive(Default)]
pub struct AudioClip {
    /// Planar PCM, one buffer per source channel.
    data: Vec<Vec<f32>>,
    /// Samples per channel after any stretch.
    data_length: usize,
    /// Read origin within the data.
    start_offset: usize,
    /// One-shot extra start offset applied by the next retrigger.
    legato_offset: usize,
    /// Playback cursor.
    read_index: usize,
    /// Samples played per pass, measured from `start_offset`.
    usable_length: usize,
    /// `start_offset + usable_length`, clamped to the data extent.
    last_sample: usize,
}

impl AudioClip {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the region's full audio into per-channel buffers. On failure
    /// any partially loaded channels are discarded and the clip is left
    /// empty.
    pub fn load_data(&mut self, region: &dyn Region) -> Result<(), RegionError> {
        self.data.clear();
        self.data_length = region.length_samples();

        // A previously configured usable length survives a reload unless it
        // no longer fits.
        if self.usable_length == 0 || self.usable_length > self.data_length {
            self.usable_length = self.data_length;
        }
        self.clamp_spans();

        for channel in 0..region.n_channels() {
            let mut buf = vec![0.0f32; self.data_length];
            match region.read(&mut buf, 0, channel) {
                Ok(_) => self.data.push(buf),
                Err(e) => {
                    self.drop_data();
                    return Err(e);
                }
            }
        }

        debug!(
            channels = self.data.len(),
            frames = self.data_length,
            "Clip data loaded"
        );
        Ok(())
    }

    /// Loads the region and, when `new_len` differs from its natural
    /// length, stretches the audio offline to `new_len` samples.
    pub fn set_length(
        &mut self,
        region: &dyn Region,
        new_len: usize,
        stretcher: &mut dyn TimeStretcher,
    ) -> Result<(), RegionError> {
        self.load_data(region)?;

        if new_len == region.length_samples() || self.data_length == 0 {
            return Ok(());
        }

        let ratio = new_len as f64 / self.data_length as f64;
        self.data = stretch_channels(&self.data, ratio, stretcher);
        self.data_length = self.data.first().map(Vec::len).unwrap_or(0);

        if self.usable_length == 0 || self.usable_length > self.data_length {
            self.usable_length = self.data_length;
        }
        self.clamp_spans();
        Ok(())
    }

    /// Recomputes how much of the data one pass plays. Repeat triggers with
    /// a beat-level quantization loop over exactly that musical length;
    /// everything else plays the full data.
    pub fn set_usable_length(
        &mut self,
        launch_style: LaunchStyle,
        quantization: &BbtOffset,
        tempo: &dyn TempoMap,
    ) {
        if launch_style != LaunchStyle::Repeat || quantization.is_zero() {
            self.usable_length = self.data_length;
        } else if quantization.bar_level() {
            // Bar-level quantization is not implemented; play the full data.
            warn!(%quantization, "Bar-level quantization unsupported, repeat uses full clip");
            self.usable_length = self.data_length;
        } else {
            self.usable_length = tempo.samples_at(quantization.beat_grid()).max(0) as usize;
        }
        self.clamp_spans();
    }

    /// Resets the cursor to the start, consuming any pending legato offset.
    pub fn retrigger(&mut self) {
        self.read_index = self.start_offset + self.legato_offset;
        self.legato_offset = 0;
    }

    pub fn current_pos(&self) -> usize {
        self.read_index
    }

    pub fn set_start(&mut self, start: usize) {
        self.start_offset = start;
        if self.data_length > 0 {
            self.clamp_spans();
        } else {
            // No data yet (persisted state restored ahead of region
            // resolution); keep the raw values.
            self.last_sample = self.start_offset + self.usable_length;
        }
    }

    pub fn set_legato_offset(&mut self, offset: usize) {
        self.legato_offset = offset;
    }

    /// Restores a persisted usable length (samples from `start_offset`).
    pub fn restore_usable_length(&mut self, length: usize) {
        self.usable_length = length;
        self.last_sample = self.start_offset + self.usable_length;
        if self.data_length > 0 {
            self.clamp_spans();
        }
    }

    pub fn start_offset(&self) -> usize {
        self.start_offset
    }

    pub fn data_length(&self) -> usize {
        self.data_length
    }

    pub fn usable_length(&self) -> usize {
        self.usable_length
    }

    pub fn last_sample(&self) -> usize {
        self.last_sample
    }

    pub fn n_data_channels(&self) -> usize {
        self.data.len()
    }

    /// Samples left before the cursor reaches the end of the pass.
    pub fn remaining(&self) -> usize {
        self.last_sample.saturating_sub(self.read_index)
    }

    /// The next `len` samples of `channel` at the cursor. `len` must not
    /// exceed [`AudioClip::remaining`].
    pub fn span(&self, channel: usize, len: usize) -> &[f32] {
        &self.data[channel][self.read_index..self.read_index + len]
    }

    pub fn advance(&mut self, len: usize) {
        self.read_index += len;
    }

    pub fn drop_data(&mut self) {
        self.data.clear();
        self.data_length = 0;
    }

    /// Keeps the playback window inside the data so the render path can
    /// slice without bounds failures, whatever combination of persisted
    /// state, trims and stretches produced it.
    fn clamp_spans(&mut self) {
        self.start_offset = self.start_offset.min(self.data_length);
        self.usable_length = self
            .usable_length
            .min(self.data_length - self.start_offset);
        self.last_sample = self.start_offset + self.usable_length;
    }
}
