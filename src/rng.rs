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

//! Deterministic random numbers for follow-action selection.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Seedable generator used when a follow action picks the next slot.
///
/// Follow-action behavior has to be reproducible under test, so the
/// generator is always seeded; callers that want varied behavior pick a
/// varied seed.
pub struct TriggerRng {
    rng: ChaCha8Rng,
}

impl TriggerRng {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Returns a value in `[0, bound)`. A zero bound returns zero.
    pub fn rand(&mut self, bound: u32) -> u32 {
        if bound == 0 {
            return 0;
        }
        self.rng.gen_range(0..bound)
    }
}
