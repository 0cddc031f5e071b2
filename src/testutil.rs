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

//! Shared helpers for the crate's tests.

use std::sync::Arc;

use crate::buffer::BufferSet;
use crate::region::{MemoryRegion, RegionId};
use crate::triggerbox::TriggerBox;

/// A deterministic non-silent test clip: sample `i` is `(i % 97) / 97` on
/// every channel, so positions are recognizable in output buffers.
pub fn ramp_region(id: &str, len: usize, channels: usize) -> Arc<MemoryRegion> {
    let data: Vec<f32> = (0..len).map(|i| (i % 97) as f32 / 97.0).collect();
    Arc::new(MemoryRegion::new(
        RegionId::new(id),
        id,
        vec![data; channels],
    ))
}

/// A note-on message on channel 1.
pub fn note_on(key: u8, velocity: u8) -> [u8; 3] {
    [0x90, key, velocity]
}

/// A note-off message on channel 1.
pub fn note_off(key: u8) -> [u8; 3] {
    [0x80, key, 64]
}

/// Runs one process block spanning `[start, start + nframes)` and clears the
/// MIDI input afterwards, the way a host would refill it per block.
pub fn run_block(tb: &TriggerBox, bufs: &mut BufferSet, start: i64, nframes: usize) {
    tb.run(bufs, start, start + nframes as i64, 1.0, nframes, true);
    bufs.clear_midi();
}
