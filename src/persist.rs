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

//! Persisted trigger-box state.
//!
//! Plain serde data types describing a box and its slots, independent of the
//! on-disk format the host chooses. Regions are stored by id and resolved
//! against a [`crate::region::RegionRegistry`] on load; slots whose id does
//! not resolve come back unbound.

use serde::{Deserialize, Serialize};

use crate::region::RegionId;
use crate::time::BbtOffset;
use crate::trigger::{FollowAction, LaunchStyle};
use crate::triggerbox::DataType;

/// Serialized form of a whole box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TriggerBoxState {
    /// Node discriminator for hosts that mix processor types in one tree.
    #[serde(rename = "type")]
    pub kind: String,
    pub data_type: DataType,
    pub triggers: Vec<TriggerState>,
}

/// Serialized form of one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TriggerState {
    pub legato: bool,
    pub launch_style: LaunchStyle,
    pub follow_action_0: FollowAction,
    pub follow_action_1: FollowAction,
    pub follow_action_probability: i32,
    pub quantization: BbtOffset,
    pub name: String,
    pub index: usize,
    /// Stable region id, resolved through the registry on load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<RegionId>,
    /// Audio payload: read origin within the clip data, in samples.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    /// Audio payload: usable length from `start`, in samples.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<i64>,
}
