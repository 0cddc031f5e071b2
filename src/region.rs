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

//! Audio regions — the clips a trigger slot plays.
//!
//! The engine consumes regions through the [`Region`] trait and never owns
//! the audio layer. [`MemoryRegion`] is the bundled implementation: fully
//! decoded planar PCM, which is also what the WAV loader produces. Regions
//! carry a stable id so persisted trigger state can be resolved against a
//! [`RegionRegistry`] on load.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Errors raised while reading region audio.
#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    #[error("region has no channel {channel} (only {available})")]
    NoSuchChannel { channel: usize, available: usize },

    #[error("region read failed: {0}")]
    ReadFailed(String),
}

/// Stable identifier for a region, unique within a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionId(String);

impl RegionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A referenceable span of audio the engine can load into a trigger slot.
pub trait Region: Send + Sync {
    /// Stable identifier used for persistence round-trips.
    fn id(&self) -> RegionId;

    fn name(&self) -> &str;

    /// Length in samples per channel.
    fn length_samples(&self) -> usize;

    fn n_channels(&self) -> usize;

    /// Reads up to `dst.len()` samples of `channel` starting at `offset`,
    /// returning the number of samples written.
    fn read(&self, dst: &mut [f32], offset: usize, channel: usize) -> Result<usize, RegionError>;
}

/// An in-memory region holding fully decoded planar PCM.
pub struct MemoryRegion {
    id: RegionId,
    name: String,
    channels: Vec<Vec<f32>>,
}

impl MemoryRegion {
    /// Builds a region from planar channel data. All channels must be the
    /// same length; shorter channels are zero-padded to the longest.
    pub fn new(id: RegionId, name: impl Into<String>, mut channels: Vec<Vec<f32>>) -> Self {
        let longest = channels.iter().map(Vec::len).max().unwrap_or(0);
        for ch in &mut channels {
            ch.resize(longest, 0.0);
        }
        Self {
            id,
            name: name.into(),
            channels,
        }
    }

    /// Builds a region from interleaved samples.
    pub fn from_interleaved(
        id: RegionId,
        name: impl Into<String>,
        interleaved: &[f32],
        n_channels: usize,
    ) -> Self {
        let frames = if n_channels > 0 {
            interleaved.len() / n_channels
        } else {
            0
        };
        let mut channels = vec![Vec::with_capacity(frames); n_channels];
        for frame in 0..frames {
            for (ch, buf) in channels.iter_mut().enumerate() {
                buf.push(interleaved[frame * n_channels + ch]);
            }
        }
        Self::new(id, name, channels)
    }
}

impl Region for MemoryRegion {
    fn id(&self) -> RegionId {
        self.id.clone()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn length_samples(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    fn n_channels(&self) -> usize {
        self.channels.len()
    }

    fn read(&self, dst: &mut [f32], offset: usize, channel: usize) -> Result<usize, RegionError> {
        let data = self
            .channels
            .get(channel)
            .ok_or(RegionError::NoSuchChannel {
                channel,
                available: self.channels.len(),
            })?;

        if offset >= data.len() {
            return Ok(0);
        }
        let n = dst.len().min(data.len() - offset);
        dst[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }
}

/// Region lookup by stable id, used when reloading persisted trigger state.
#[derive(Default)]
pub struct RegionRegistry {
    regions: RwLock<HashMap<RegionId, Arc<dyn Region>>>,
}

impl RegionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a region, replacing any previous entry with the same id.
    pub fn insert(&self, region: Arc<dyn Region>) {
        let id = region.id();
        debug!(region = %id, "Region registered");
        self.regions.write().insert(id, region);
    }

    pub fn get(&self, id: &RegionId) -> Option<Arc<dyn Region>> {
        self.regions.read().get(id).cloned()
    }

    pub fn remove(&self, id: &RegionId) -> Option<Arc<dyn Region>> {
        self.regions.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.regions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.read().is_empty()
    }
}
