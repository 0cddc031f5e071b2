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

//! The host transport contract.
//!
//! Triggers only make sense against a rolling transport; when a trigger is
//! armed and the transport is stopped, the box asks it to start. The host
//! supplies the real implementation; [`AtomicTransport`] covers hosts with a
//! simple global play flag, and tests.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

/// The global play state of the host.
pub trait Transport: Send + Sync {
    /// True when the transport is rolling.
    fn rolling(&self) -> bool;

    /// Asks the transport to start rolling. May take effect asynchronously.
    fn start(&self);
}

/// A flag-based transport.
#[derive(Default)]
pub struct AtomicTransport {
    rolling: AtomicBool,
}

impl AtomicTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.rolling.store(false, Ordering::Release);
    }
}

impl Transport for AtomicTransport {
    fn rolling(&self) -> bool {
        self.rolling.load(Ordering::Acquire)
    }

    fn start(&self) {
        if !self.rolling.swap(true, Ordering::AcqRel) {
            debug!("Transport started");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_transport_round_trip() {
        let transport = AtomicTransport::new();
        assert!(!transport.rolling());

        transport.start();
        assert!(transport.rolling());

        transport.stop();
        assert!(!transport.rolling());
    }
}
