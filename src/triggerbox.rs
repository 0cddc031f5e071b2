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

//! The trigger box: an ordered bank of launchable clip slots.
//!
//! The box sits in a host processor graph. Once per block the host calls
//! [`TriggerBox::run`], which folds queued user gestures into each slot's
//! state machine, picks what plays next, and renders the playing slot with
//! sample-accurate starts and stops on the musical grid.
//!
//! Locking follows the mixer convention: the slot array is behind a
//! read-write lock (the audio thread reads, structural changes write), and
//! each slot's mutable state is behind its own mutex that the audio thread
//! locks uncontended. Control-thread gestures never take a slot mutex; they
//! go through the per-slot atomic [`TriggerControl`]. Structural changes and
//! parameter edits are control-thread operations intended for moments when
//! the box is not playing.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use midly::live::LiveEvent;
use midly::MidiMessage;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::buffer::BufferSet;
use crate::loader::{load_wav_region, LoaderError};
use crate::persist::{TriggerBoxState, TriggerState};
use crate::queue::RingQueue;
use crate::region::{Region, RegionError, RegionRegistry};
use crate::rng::TriggerRng;
use crate::time::TempoMap;
use crate::transport::Transport;
use crate::trigger::{FollowAction, RunType, State, Trigger, TriggerControl};

/// Slots created by a new audio box; `add_trigger` grows past this.
pub const DEFAULT_TRIGGERS_PER_BOX: usize = 8;

const LAUNCH_QUEUE_CAPACITY: usize = 64;
const GESTURE_QUEUE_CAPACITY: usize = 1024;

/// The clip type a box hosts. Only audio is implemented; a MIDI box is
/// created empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataType {
    Audio,
    Midi,
}

/// Errors surfaced by control-thread box operations. The realtime path
/// never raises; it degrades.
#[derive(Debug, thiserror::Error)]
pub enum TriggerBoxError {
    #[error("no trigger slot {slot} (box has {len})")]
    InvalidSlot { slot: usize, len: usize },

    #[error("box data type does not support this clip")]
    UnsupportedClipType,

    #[error("region load failed: {0}")]
    RegionLoad(#[from] RegionError),

    #[error("file load failed: {0}")]
    FileLoad(#[from] LoaderError),
}

/// One slot: the control-thread atomic face plus the audio-thread state.
struct TriggerSlot {
    control: Arc<TriggerControl>,
    inner: Mutex<Trigger>,
}

impl TriggerSlot {
    fn new(index: usize, tempo: Arc<dyn TempoMap>) -> Self {
        let control = Arc::new(TriggerControl::new());
        Self {
            inner: Mutex::new(Trigger::new(index, control.clone(), tempo)),
            control,
        }
    }
}

/// State owned by the process callback: the launch queues, the playing slot
/// and the follow-action generator. Behind one mutex that only the audio
/// thread takes.
struct RunState {
    explicit_queue: RingQueue<usize>,
    implicit_queue: RingQueue<usize>,
    // Reserved gesture queues; gestures currently travel through the
    // per-slot atomic counters instead.
    #[allow(dead_code)]
    bang_queue: RingQueue<usize>,
    #[allow(dead_code)]
    unbang_queue: RingQueue<usize>,
    currently_playing: Option<usize>,
    rng: TriggerRng,
}

/// An ordered bank of clip trigger slots driven by a host process loop.
pub struct TriggerBox {
    data_type: DataType,
    tempo: Arc<dyn TempoMap>,
    transport: Arc<dyn Transport>,
    triggers: RwLock<Vec<TriggerSlot>>,
    run_state: Mutex<RunState>,
    stop_all: AtomicBool,
    midi_trigger_map: HashMap<u8, usize>,
}

impl TriggerBox {
    /// Creates a box with the default slot count and a randomized
    /// follow-action seed.
    pub fn new(
        data_type: DataType,
        tempo: Arc<dyn TempoMap>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::with_seed(data_type, tempo, transport, rand::random())
    }

    /// Creates a box whose follow-action randomization is reproducible.
    pub fn with_seed(
        data_type: DataType,
        tempo: Arc<dyn TempoMap>,
        transport: Arc<dyn Transport>,
        seed: u64,
    ) -> Self {
        let mut triggers = Vec::new();
        if data_type == DataType::Audio {
            for n in 0..DEFAULT_TRIGGERS_PER_BOX {
                triggers.push(TriggerSlot::new(n, tempo.clone()));
            }
        }

        // Default performance-surface mapping: one octave from middle C.
        let midi_trigger_map = (0..10u8).map(|n| (60 + n, n as usize)).collect();

        Self {
            data_type,
            tempo,
            transport,
            triggers: RwLock::new(triggers),
            run_state: Mutex::new(RunState {
                explicit_queue: RingQueue::new(LAUNCH_QUEUE_CAPACITY),
                implicit_queue: RingQueue::new(LAUNCH_QUEUE_CAPACITY),
                bang_queue: RingQueue::new(GESTURE_QUEUE_CAPACITY),
                unbang_queue: RingQueue::new(GESTURE_QUEUE_CAPACITY),
                currently_playing: None,
                rng: TriggerRng::new(seed),
            }),
            stop_all: AtomicBool::new(false),
            midi_trigger_map,
        }
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn n_triggers(&self) -> usize {
        self.triggers.read().len()
    }

    /// The slot currently playing, if any.
    pub fn currently_playing(&self) -> Option<usize> {
        self.run_state.lock().currently_playing
    }

    /// Appends an empty slot. Returns its index, or None for a MIDI box.
    pub fn add_trigger(&self) -> Option<usize> {
        if self.data_type != DataType::Audio {
            warn!("MIDI trigger slots are not implemented");
            return None;
        }
        let mut triggers = self.triggers.write();
        let index = triggers.len();
        triggers.push(TriggerSlot::new(index, self.tempo.clone()));
        Some(index)
    }

    /// The control handle for a slot, for wiring to UI or MIDI surfaces.
    pub fn trigger_control(&self, slot: usize) -> Option<Arc<TriggerControl>> {
        self.triggers.read().get(slot).map(|s| s.control.clone())
    }

    /// Launch gesture on a slot. Returns false for an invalid slot.
    pub fn bang_trigger(&self, slot: usize) -> bool {
        match self.triggers.read().get(slot) {
            Some(s) => {
                s.control.bang();
                true
            }
            None => false,
        }
    }

    /// Release gesture on a slot. Returns false for an invalid slot.
    pub fn unbang_trigger(&self, slot: usize) -> bool {
        match self.triggers.read().get(slot) {
            Some(s) => {
                s.control.unbang();
                true
            }
            None => false,
        }
    }

    /// Asks a slot to stop at its next quantization point.
    pub fn stop_trigger(&self, slot: usize) -> bool {
        match self.triggers.read().get(slot) {
            Some(s) => {
                s.control.stop(-1);
                true
            }
            None => false,
        }
    }

    /// Silences everything at the next block boundary.
    pub fn request_stop_all(&self) {
        self.stop_all.store(true, Ordering::Release);
    }

    /// Runs `f` against a slot's state. Control-thread helper; contends
    /// briefly with the audio thread for that one slot.
    pub fn with_trigger<R>(&self, slot: usize, f: impl FnOnce(&Trigger) -> R) -> Option<R> {
        self.triggers.read().get(slot).map(|s| f(&s.inner.lock()))
    }

    /// Runs `f` against a slot's mutable state. Parameter edits belong on
    /// the control thread, while the slot is not playing.
    pub fn with_trigger_mut<R>(&self, slot: usize, f: impl FnOnce(&mut Trigger) -> R) -> Option<R> {
        self.triggers
            .read()
            .get(slot)
            .map(|s| f(&mut s.inner.lock()))
    }

    /// Binds a region to a slot, loading its audio. On failure the slot
    /// keeps its previous binding.
    pub fn set_region(&self, slot: usize, region: Arc<dyn Region>) -> Result<(), TriggerBoxError> {
        if self.data_type != DataType::Audio {
            return Err(TriggerBoxError::UnsupportedClipType);
        }
        let triggers = self.triggers.read();
        let s = triggers.get(slot).ok_or(TriggerBoxError::InvalidSlot {
            slot,
            len: triggers.len(),
        })?;
        s.inner.lock().set_region(region)?;
        Ok(())
    }

    /// Loads a WAV file into a fresh region, registers it, and binds it to
    /// `slot`.
    pub fn set_from_path(
        &self,
        slot: usize,
        path: &Path,
        registry: &RegionRegistry,
    ) -> Result<(), TriggerBoxError> {
        let region = Arc::new(load_wav_region(path, None, self.tempo.sample_rate())?);
        registry.insert(region.clone());
        self.set_region(slot, region)
    }

    /// Processes one block. `bufs` carries this block's MIDI input and
    /// receives the rendered audio; the block spans samples
    /// `[start_sample, end_sample)` of the timeline.
    pub fn run(
        &self,
        bufs: &mut BufferSet,
        start_sample: i64,
        end_sample: i64,
        _speed: f64,
        nframes: usize,
        _result_required: bool,
    ) {
        if start_sample < 0 {
            // Latency-compensation pre-roll; nothing sensible to do yet.
            return;
        }

        let triggers = self.triggers.read();
        let mut rs = self.run_state.lock();
        let rs = &mut *rs;

        self.ingest_midi(bufs, &triggers);

        // Fold queued gestures into every slot's state machine, executing
        // the queue operations each fold asks for.
        for (n, slot) in triggers.iter().enumerate() {
            let outcome = slot.inner.lock().process_state_requests();
            for _ in 0..outcome.explicit_requests {
                Self::queue_explicit(rs, &triggers, n);
            }
            if outcome.clear_implicit {
                rs.implicit_queue.reset();
            }
        }

        if rs.currently_playing.is_none() {
            if let Some(n) = Self::pop_runnable(rs, &triggers) {
                triggers[n].inner.lock().startup();
                rs.currently_playing = Some(n);
            }
        }

        let Some(mut playing) = rs.currently_playing else {
            return;
        };

        // Triggers need a rolling transport.
        if !self.transport.rolling() {
            self.transport.start();
        }

        let start_beats = self.tempo.beats_at(start_sample);
        let end_beats = self.tempo.beats_at(end_sample);

        // Legato pre-emption: a queued legato trigger takes over right now,
        // inheriting the playback position instead of waiting for the grid.
        if let Some(head) = rs.explicit_queue.peek() {
            if head == playing {
                // Redundant self-launch; nothing to do.
                rs.explicit_queue.pop();
            } else {
                let handover = {
                    let t = triggers[head].inner.lock();
                    t.legato() && t.region().is_some()
                };
                if handover {
                    rs.explicit_queue.pop();
                    let pos = triggers[playing].inner.lock().current_pos();
                    {
                        let mut tn = triggers[head].inner.lock();
                        tn.set_legato_offset(pos);
                        tn.jump_start();
                    }
                    triggers[playing].inner.lock().jump_stop();
                    Self::prepare_next(rs, &triggers, head);
                    debug!(from = playing, to = head, "legato switch");
                    playing = head;
                    rs.currently_playing = Some(head);
                }
            }
        }

        if self.stop_all.swap(false, Ordering::AcqRel) {
            debug!("stop all requested");
            for slot in triggers.iter() {
                slot.control.stop(-1);
            }
            rs.explicit_queue.reset();
            rs.implicit_queue.reset();
        }

        // Dispatch. Several triggers can stop and start inside one block;
        // each writes at its own intra-block offset, the first overwriting
        // and the rest mixing. The round bound keeps a pathological
        // follow-action chain (every successor stopping instantly) from
        // wedging the callback; leftovers carry into the next block.
        let mut first = true;
        let mut max_chans = 0usize;
        let max_rounds = 2 * triggers.len() + 4;
        let mut rounds = 0;

        loop {
            if rounds >= max_rounds {
                warn!("dispatch round limit reached, deferring to next block");
                break;
            }
            rounds += 1;

            let mut t = triggers[playing].inner.lock();
            let state_before = t.state();
            let rt = match state_before {
                State::WaitingToStop | State::WaitingToStart | State::WaitingForRetrigger => {
                    t.maybe_compute_next_transition(start_beats, end_beats)
                }
                _ => RunType::RunAll,
            };

            if rt == RunType::RunNone {
                // Still waiting for a boundary beyond this block.
                return;
            }

            let bang_samples = t.bang_samples;
            let state_after = t.state();
            drop(t);

            let became_running = matches!(
                state_before,
                State::WaitingToStart | State::WaitingForRetrigger
            ) && state_after == State::Running;

            if became_running {
                Self::prepare_next(rs, &triggers, playing);
            }

            let (dest_offset, trigger_samples) = match rt {
                RunType::RunEnd => {
                    let boundary =
                        (bang_samples - start_sample).clamp(0, nframes as i64) as usize;
                    (0, nframes - boundary)
                }
                RunType::RunStart => {
                    let off = (bang_samples - start_sample).clamp(0, nframes as i64) as usize;
                    (off, nframes - off)
                }
                _ => (0, nframes),
            };

            if state_before == State::WaitingToStart && state_after == State::Running {
                // Pre-seed follow-action selection for this launch. The
                // enqueue itself happened in prepare_next above.
                let _ = Self::determine_next_trigger(rs, &triggers, playing);
            }

            let next_is_self = Self::peek_next(rs) == Some(playing);

            let mut t = triggers[playing].inner.lock();
            t.run(bufs, trigger_samples, dest_offset, first, next_is_self);
            max_chans = max_chans.max(t.n_channels());
            let stopped = t.state() == State::Stopped;
            drop(t);
            first = false;

            if !stopped {
                break;
            }

            debug!(trigger = playing, "did stop");

            match Self::pop_runnable(rs, &triggers) {
                Some(nxt) => {
                    let pos = triggers[playing].inner.lock().current_pos();
                    let mut tn = triggers[nxt].inner.lock();
                    if tn.legato() {
                        tn.set_legato_offset(pos);
                    }
                    tn.startup();
                    drop(tn);
                    debug!(from = playing, to = nxt, "switching");
                    playing = nxt;
                    rs.currently_playing = Some(nxt);
                }
                None => {
                    rs.currently_playing = None;
                    break;
                }
            }
        }

        bufs.set_audio_count(max_chans);
    }

    /// Serializes the box configuration.
    pub fn get_state(&self) -> TriggerBoxState {
        let triggers = self.triggers.read();
        TriggerBoxState {
            kind: "triggerbox".to_string(),
            data_type: self.data_type,
            triggers: triggers
                .iter()
                .map(|slot| {
                    let t = slot.inner.lock();
                    TriggerState {
                        legato: t.legato(),
                        launch_style: t.launch_style(),
                        follow_action_0: t.follow_action(0),
                        follow_action_1: t.follow_action(1),
                        follow_action_probability: t.follow_action_probability(),
                        quantization: t.quantization(),
                        name: t.name().to_string(),
                        index: t.index(),
                        region: t.region().map(|r| r.id()),
                        start: Some(t.clip().start_offset() as i64),
                        length: Some(t.clip().usable_length() as i64),
                    }
                })
                .collect(),
        }
    }

    /// Rebuilds the box from serialized state, resolving regions against
    /// `registry`. Slots whose region id does not resolve stay unbound.
    pub fn set_state(
        &self,
        state: &TriggerBoxState,
        registry: &RegionRegistry,
    ) -> Result<(), TriggerBoxError> {
        if state.data_type != self.data_type {
            warn!(
                stored = ?state.data_type,
                own = ?self.data_type,
                "Stored data type differs, keeping the box's type"
            );
        }

        let mut slots = Vec::with_capacity(state.triggers.len());
        for (n, ts) in state.triggers.iter().enumerate() {
            let slot = TriggerSlot::new(n, self.tempo.clone());
            {
                let mut t = slot.inner.lock();
                t.set_legato(ts.legato);
                t.set_launch_style(ts.launch_style);
                t.set_follow_action(ts.follow_action_0, 0);
                t.set_follow_action(ts.follow_action_1, 1);
                t.set_follow_action_probability(ts.follow_action_probability);
                t.set_quantization(ts.quantization);
                t.set_name(&ts.name);

                if let Some(region_id) = &ts.region {
                    match registry.get(region_id) {
                        Some(region) => {
                            t.set_region(region)?;
                            // The stored name wins over the region's.
                            t.set_name(&ts.name);
                        }
                        None => {
                            warn!(slot = n, region = %region_id, "Region not found, slot unbound");
                        }
                    }
                }

                if let Some(start) = ts.start {
                    t.set_start(start.max(0) as usize);
                }
                if let Some(length) = ts.length {
                    t.clip_mut().restore_usable_length(length.max(0) as usize);
                }
            }
            slots.push(slot);
        }

        *self.triggers.write() = slots;

        // Queued indices referred to the old slot array.
        let mut rs = self.run_state.lock();
        rs.explicit_queue.reset();
        rs.implicit_queue.reset();
        rs.currently_playing = None;

        Ok(())
    }

    /// Routes MIDI note events to slot gestures: note on bangs, note off
    /// (or note on at velocity zero) unbangs.
    fn ingest_midi(&self, bufs: &BufferSet, triggers: &[TriggerSlot]) {
        for ev in bufs.midi() {
            let event = match LiveEvent::parse(ev.bytes()) {
                Ok(e) => e,
                Err(e) => {
                    debug!(error = ?e, "Unparseable MIDI event ignored");
                    continue;
                }
            };

            let LiveEvent::Midi { message, .. } = event else {
                continue;
            };

            let (key, on) = match message {
                MidiMessage::NoteOn { key, vel } => (key, u8::from(vel) > 0),
                MidiMessage::NoteOff { key, .. } => (key, false),
                _ => continue,
            };

            let Some(&slot) = self.midi_trigger_map.get(&u8::from(key)) else {
                continue;
            };
            let Some(s) = triggers.get(slot) else {
                continue;
            };

            if on {
                s.control.bang();
            } else {
                s.control.unbang();
            }
        }
    }

    /// Queues a user-requested launch. User intent overrides any pending
    /// follow action, and the playing trigger is released so gate-style
    /// slots wind down.
    fn queue_explicit(rs: &mut RunState, triggers: &[TriggerSlot], n: usize) {
        debug!(trigger = n, "explicit queue");
        if !rs.explicit_queue.push(n) {
            warn!(trigger = n, "explicit queue full, launch dropped");
        }
        rs.implicit_queue.reset();

        if let Some(playing) = rs.currently_playing {
            triggers[playing].control.unbang();
        }
    }

    /// Queues a follow-action launch. Explicit requests always win: the
    /// implicit queue only accepts entries while the explicit queue is
    /// empty.
    fn queue_implicit(rs: &mut RunState, n: usize) {
        if !rs.explicit_queue.is_empty() {
            return;
        }
        debug!(trigger = n, "implicit queue");
        if !rs.implicit_queue.push(n) {
            warn!(trigger = n, "implicit queue full, follow action dropped");
        }
    }

    /// The next queued slot without consuming it.
    fn peek_next(rs: &RunState) -> Option<usize> {
        rs.explicit_queue.peek().or_else(|| rs.implicit_queue.peek())
    }

    /// Pops queued slots (explicit first) until one that can actually play
    /// turns up.
    fn pop_runnable(rs: &mut RunState, triggers: &[TriggerSlot]) -> Option<usize> {
        loop {
            let n = rs.explicit_queue.pop().or_else(|| rs.implicit_queue.pop())?;
            match triggers.get(n) {
                Some(slot) if slot.inner.lock().region().is_some() => return Some(n),
                _ => {
                    debug!(trigger = n, "skipping unbound slot");
                }
            }
        }
    }

    /// Picks the slot launched by `current`'s follow action and queues it.
    fn prepare_next(rs: &mut RunState, triggers: &[TriggerSlot], current: usize) {
        if let Some(nxt) = Self::determine_next_trigger(rs, triggers, current) {
            Self::queue_implicit(rs, nxt);
        }
    }

    /// Follow-action selection. Returns None when the chain stops here.
    fn determine_next_trigger(
        rs: &mut RunState,
        triggers: &[TriggerSlot],
        current: usize,
    ) -> Option<usize> {
        let len = triggers.len();
        let runnable = triggers
            .iter()
            .filter(|s| s.inner.lock().region().is_some())
            .count();

        let (probability, actions) = {
            let t = triggers[current].inner.lock();
            (
                t.follow_action_probability(),
                [t.follow_action(0), t.follow_action(1)],
            )
        };

        let roll = rs.rng.rand(100) as i32;
        let action = if roll <= probability {
            actions[0]
        } else {
            actions[1]
        };

        let usable = |n: usize| {
            let t = triggers[n].inner.lock();
            t.region().is_some() && !t.active()
        };

        match action {
            FollowAction::Stop | FollowAction::QueuedTrigger => None,
            // With a single runnable slot, "next" can only be this one.
            _ if runnable <= 1 => Some(current),
            FollowAction::Again => Some(current),
            FollowAction::NextTrigger => {
                let mut n = current;
                loop {
                    n = (n + 1) % len;
                    if n == current {
                        break Some(current);
                    }
                    if usable(n) {
                        break Some(n);
                    }
                }
            }
            FollowAction::PrevTrigger => {
                let mut n = current;
                loop {
                    n = if n == 0 { len - 1 } else { n - 1 };
                    if n == current {
                        break Some(current);
                    }
                    if usable(n) {
                        break Some(n);
                    }
                }
            }
            FollowAction::FirstTrigger => (0..len).find(|&n| usable(n)).or(Some(current)),
            FollowAction::LastTrigger => (0..len).rev().find(|&n| usable(n)).or(Some(current)),
            FollowAction::AnyTrigger => {
                for _ in 0..2 * len {
                    let n = rs.rng.rand(len as u32) as usize;
                    if usable(n) {
                        return Some(n);
                    }
                }
                Some(current)
            }
            FollowAction::OtherTrigger => {
                for _ in 0..2 * len {
                    let n = rs.rng.rand(len as u32) as usize;
                    if n != current && usable(n) {
                        return Some(n);
                    }
                }
                Some(current)
            }
        }
    }
}

/// IO negotiation with the host graph: the box needs at least one MIDI
/// input, and produces at least stereo audio.
pub fn can_support_io_configuration(midi_in: usize, audio_out: &mut usize) -> bool {
    if midi_in < 1 {
        return false;
    }
    *audio_out = (*audio_out).max(2);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{note_off, note_on, ramp_region, run_block};
    use crate::time::{BbtOffset, FixedTempoMap};
    use crate::transport::AtomicTransport;
    use crate::trigger::LaunchStyle;

    const BLOCK: usize = 1024;
    /// One beat at 120 BPM / 48 kHz.
    const BEAT: usize = 24000;

    fn make_box(seed: u64) -> (TriggerBox, Arc<AtomicTransport>) {
        let tempo = Arc::new(FixedTempoMap::new(120.0, 48000));
        let transport = Arc::new(AtomicTransport::new());
        let tb = TriggerBox::with_seed(DataType::Audio, tempo, transport.clone(), seed);
        (tb, transport)
    }

    fn load_slots(tb: &TriggerBox, slots: &[usize], len: usize) {
        for &slot in slots {
            tb.set_region(slot, ramp_region(&format!("region-{}", slot), len, 1))
                .unwrap();
        }
    }

    /// Runs consecutive blocks of `BLOCK` frames starting at `start` until
    /// `end`, returning the buffers of the final block.
    fn run_until(tb: &TriggerBox, start: i64, end: i64) -> BufferSet {
        let mut bufs = BufferSet::new(2, BLOCK);
        let mut at = start;
        while at < end {
            bufs = BufferSet::new(2, BLOCK);
            run_block(tb, &mut bufs, at, BLOCK);
            at += BLOCK as i64;
        }
        bufs
    }

    #[test]
    fn test_default_box_shape() {
        let (tb, _) = make_box(1);
        assert_eq!(tb.n_triggers(), DEFAULT_TRIGGERS_PER_BOX);
        assert_eq!(tb.data_type(), DataType::Audio);
        assert_eq!(tb.currently_playing(), None);
        assert_eq!(tb.add_trigger(), Some(8));
        assert_eq!(tb.n_triggers(), 9);
    }

    #[test]
    fn test_midi_box_is_empty() {
        let tempo = Arc::new(FixedTempoMap::new(120.0, 48000));
        let transport = Arc::new(AtomicTransport::new());
        let tb = TriggerBox::with_seed(DataType::Midi, tempo, transport, 1);
        assert_eq!(tb.n_triggers(), 0);
        assert_eq!(tb.add_trigger(), None);
    }

    #[test]
    fn test_negative_start_sample_is_ignored() {
        let (tb, _) = make_box(1);
        load_slots(&tb, &[0], 48000);
        tb.bang_trigger(0);

        let mut bufs = BufferSet::new(2, BLOCK);
        tb.run(&mut bufs, -512, 512, 1.0, BLOCK, true);
        // Nothing folded: the bang is still pending.
        assert_eq!(tb.currently_playing(), None);
    }

    // Scenario: banged OneShot with one-beat quantization starts exactly on
    // the beat.
    #[test]
    fn test_quantized_launch_is_sample_accurate() {
        let (tb, transport) = make_box(1);
        load_slots(&tb, &[0], 96000);
        tb.with_trigger_mut(0, |t| t.set_launch_style(LaunchStyle::OneShot))
            .unwrap();

        // Bang arrives during block [1024, 2048).
        tb.bang_trigger(0);
        let mut bufs = BufferSet::new(2, BLOCK);
        run_block(&tb, &mut bufs, 1024, BLOCK);

        // Armed but silent: the next beat (sample 24000) is beyond this
        // block.
        assert_eq!(tb.currently_playing(), Some(0));
        assert!(transport.rolling());
        assert!(bufs.audio(0).iter().all(|&s| s == 0.0));

        // Intermediate blocks stay silent.
        let bufs = run_until(&tb, 2048, 23552);
        assert!(bufs.audio(0).iter().all(|&s| s == 0.0));

        // Block [23552, 24576) contains the beat; audio starts at offset
        // 24000 - 23552 = 448, exactly at the clip's first sample.
        let mut bufs = BufferSet::new(2, BLOCK);
        run_block(&tb, &mut bufs, 23552, BLOCK);

        assert!(bufs.audio(0)[..448].iter().all(|&s| s == 0.0));
        let region = ramp_region("check", 96000, 1);
        let mut expect = vec![0.0f32; 576];
        region.read(&mut expect, 0, 0).unwrap();
        assert_eq!(&bufs.audio(0)[448..1024], &expect[..]);
        assert_eq!(bufs.audio_count(), 1);
    }

    // Scenario: legato handover to a queued slot preserves the playback
    // position and bypasses quantization.
    #[test]
    fn test_legato_handover() {
        let (tb, _) = make_box(1);
        load_slots(&tb, &[0, 1], 96000);

        // Start slot 0 and let it run a while.
        tb.bang_trigger(0);
        run_until(&tb, 1024, 50 * BLOCK as i64);
        assert_eq!(tb.currently_playing(), Some(0));
        let pos_a = tb.with_trigger(0, |t| t.current_pos()).unwrap();
        assert!(pos_a > 0);

        // Bang slot 1 (legato defaults to true); the next block switches
        // immediately, at slot 0's position.
        tb.bang_trigger(1);
        let mut bufs = BufferSet::new(2, BLOCK);
        run_block(&tb, &mut bufs, 50 * BLOCK as i64, BLOCK);

        assert_eq!(tb.currently_playing(), Some(1));
        assert_eq!(tb.with_trigger(0, |t| t.state()).unwrap(), State::Stopped);
        let pos_b = tb.with_trigger(1, |t| t.current_pos()).unwrap();
        assert_eq!(pos_b, pos_a + BLOCK);

        // Audio present from intra-block offset 0.
        assert!(bufs.audio(0)[0] != 0.0);
    }

    // Scenario: gate slot unbangs, stops at the next beat boundary, and a
    // short block defers the release.
    #[test]
    fn test_gate_unbang_stops_on_boundary() {
        let (tb, _) = make_box(1);
        load_slots(&tb, &[0], 96000);
        tb.with_trigger_mut(0, |t| {
            t.set_launch_style(LaunchStyle::Gate);
            // The default NextTrigger follow action would requeue the only
            // runnable slot; this test wants the chain to end.
            t.set_follow_action(FollowAction::Stop, 0);
        })
        .unwrap();

        tb.bang_trigger(0);
        run_until(&tb, 1024, 30 * BLOCK as i64);
        assert_eq!(tb.with_trigger(0, |t| t.state()).unwrap(), State::Running);

        tb.unbang_trigger(0);
        // Next block folds the unbang.
        let mut bufs = BufferSet::new(2, BLOCK);
        run_block(&tb, &mut bufs, 30 * BLOCK as i64, BLOCK);
        assert_eq!(
            tb.with_trigger(0, |t| t.state()).unwrap(),
            State::WaitingToStop
        );

        // Run up to just before the next beat (sample 48000), then a short
        // 32-frame block across the boundary: too short to release.
        run_until(&tb, 31 * BLOCK as i64, 46 * BLOCK as i64);
        let mut bufs = BufferSet::new(2, 880);
        run_block(&tb, &mut bufs, 47104, 880);
        assert_eq!(
            tb.with_trigger(0, |t| t.state()).unwrap(),
            State::WaitingToStop
        );

        let mut bufs = BufferSet::new(2, 32);
        run_block(&tb, &mut bufs, 47984, 32);
        assert_eq!(tb.with_trigger(0, |t| t.state()).unwrap(), State::Stopping);

        // The following full-size block completes the stop.
        let mut bufs = BufferSet::new(2, BLOCK);
        run_block(&tb, &mut bufs, 48016, BLOCK);
        assert_eq!(tb.with_trigger(0, |t| t.state()).unwrap(), State::Stopped);
        assert_eq!(tb.currently_playing(), None);
    }

    // Scenario: NextTrigger chains cycle through every runnable slot.
    #[test]
    fn test_follow_action_next_cycles() {
        let (tb, _) = make_box(1);
        // Clips exactly one beat long chain seamlessly.
        load_slots(&tb, &[0, 1, 2, 3], BEAT);
        for slot in 0..4 {
            tb.with_trigger_mut(slot, |t| {
                t.set_launch_style(LaunchStyle::OneShot);
                t.set_follow_action(FollowAction::NextTrigger, 0);
                t.set_follow_action_probability(100);
                // With legato on, each successor would inherit the end
                // position of the previous clip; chain fresh starts.
                t.set_legato(false);
            })
            .unwrap();
        }

        tb.bang_trigger(1);
        let mut seen = Vec::new();
        let mut at: i64 = 1024;
        while seen.len() < 6 && at < 300 * BLOCK as i64 {
            let mut bufs = BufferSet::new(2, BLOCK);
            run_block(&tb, &mut bufs, at, BLOCK);
            at += BLOCK as i64;
            if let Some(n) = tb.currently_playing() {
                if seen.last() != Some(&n) {
                    seen.push(n);
                }
            }
        }

        assert_eq!(seen, vec![1, 2, 3, 0, 1, 2]);
    }

    // Scenario: stop-all silences the playing slot at its quantization
    // boundary and clears the queues.
    #[test]
    fn test_stop_all() {
        let (tb, _) = make_box(1);
        load_slots(&tb, &[0, 1], 96000);

        tb.bang_trigger(0);
        run_until(&tb, 1024, 30 * BLOCK as i64);
        assert_eq!(tb.with_trigger(0, |t| t.state()).unwrap(), State::Running);

        tb.request_stop_all();

        // Stop-all is observed this block (queues reset); the stop request
        // lands in the state machines the block after.
        run_until(&tb, 30 * BLOCK as i64, 32 * BLOCK as i64);
        assert_eq!(
            tb.with_trigger(0, |t| t.state()).unwrap(),
            State::WaitingToStop
        );

        // By the next beat boundary everything is silent.
        run_until(&tb, 32 * BLOCK as i64, 80 * BLOCK as i64);
        assert_eq!(tb.with_trigger(0, |t| t.state()).unwrap(), State::Stopped);
        assert_eq!(tb.currently_playing(), None);
    }

    // Scenario: a repeat slot loops its quantization extent with no gap.
    #[test]
    fn test_repeat_keeps_looping() {
        let (tb, _) = make_box(1);
        load_slots(&tb, &[0], 96000);
        tb.with_trigger_mut(0, |t| {
            t.set_launch_style(LaunchStyle::Repeat);
            t.set_quantization(BbtOffset::new(0, 1, 0));
        })
        .unwrap();
        assert_eq!(tb.with_trigger(0, |t| t.clip().usable_length()), Some(BEAT));

        tb.bang_trigger(0);
        // Run for several beats; the slot must still be running, having
        // wrapped multiple times.
        run_until(&tb, 1024, 6 * BEAT as i64);
        assert_eq!(tb.with_trigger(0, |t| t.state()).unwrap(), State::Running);
        let pos = tb.with_trigger(0, |t| t.current_pos()).unwrap();
        assert!(pos < BEAT);
    }

    #[test]
    fn test_midi_note_maps_to_slot() {
        let (tb, _) = make_box(1);
        load_slots(&tb, &[2], 96000);
        tb.with_trigger_mut(2, |t| t.set_launch_style(LaunchStyle::Gate))
            .unwrap();

        // Note 62 maps to slot 2.
        let mut bufs = BufferSet::new(2, BLOCK);
        bufs.push_midi(0, &note_on(62, 100));
        run_block(&tb, &mut bufs, 1024, BLOCK);
        assert_eq!(tb.currently_playing(), Some(2));

        // Unmapped notes do nothing.
        let mut bufs = BufferSet::new(2, BLOCK);
        bufs.push_midi(0, &note_on(40, 100));
        run_block(&tb, &mut bufs, 2048, BLOCK);
        assert_eq!(tb.currently_playing(), Some(2));

        // Start playing, then note off winds the gate down.
        run_until(&tb, 3072, 30 * BLOCK as i64);
        assert_eq!(tb.with_trigger(2, |t| t.state()).unwrap(), State::Running);

        let mut bufs = BufferSet::new(2, BLOCK);
        bufs.push_midi(0, &note_off(62));
        run_block(&tb, &mut bufs, 30 * BLOCK as i64, BLOCK);
        assert_eq!(
            tb.with_trigger(2, |t| t.state()).unwrap(),
            State::WaitingToStop
        );
    }

    #[test]
    fn test_note_on_velocity_zero_is_note_off() {
        let (tb, _) = make_box(1);
        load_slots(&tb, &[0], 96000);
        tb.with_trigger_mut(0, |t| t.set_launch_style(LaunchStyle::Gate))
            .unwrap();

        tb.bang_trigger(0);
        run_until(&tb, 1024, 30 * BLOCK as i64);
        assert_eq!(tb.with_trigger(0, |t| t.state()).unwrap(), State::Running);

        let mut bufs = BufferSet::new(2, BLOCK);
        bufs.push_midi(0, &note_on(60, 0));
        run_block(&tb, &mut bufs, 30 * BLOCK as i64, BLOCK);
        assert_eq!(
            tb.with_trigger(0, |t| t.state()).unwrap(),
            State::WaitingToStop
        );
    }

    #[test]
    fn test_gesture_counters_drained_every_block() {
        let (tb, _) = make_box(1);
        load_slots(&tb, &[0], 96000);

        for _ in 0..5 {
            tb.bang_trigger(0);
            tb.unbang_trigger(0);
        }
        let mut bufs = BufferSet::new(2, BLOCK);
        run_block(&tb, &mut bufs, 1024, BLOCK);

        let control = tb.trigger_control(0).unwrap();
        assert_eq!(control.pending(), (0, 0));
    }

    #[test]
    fn test_at_most_one_trigger_active() {
        let (tb, _) = make_box(1);
        load_slots(&tb, &[0, 1, 2, 3], 96000);

        for slot in 0..4 {
            tb.bang_trigger(slot);
        }
        run_until(&tb, 1024, 60 * BLOCK as i64);

        let active = (0..tb.n_triggers())
            .filter(|&n| tb.with_trigger(n, |t| t.active()).unwrap())
            .count();
        assert!(active <= 1);
    }

    #[test]
    fn test_playing_slot_state_is_sane_after_run() {
        let (tb, _) = make_box(1);
        load_slots(&tb, &[0, 1], 96000);
        tb.bang_trigger(0);
        tb.bang_trigger(1);

        let mut at: i64 = 1024;
        for _ in 0..100 {
            let mut bufs = BufferSet::new(2, BLOCK);
            run_block(&tb, &mut bufs, at, BLOCK);
            at += BLOCK as i64;

            match tb.currently_playing() {
                None => {}
                Some(n) => {
                    let state = tb.with_trigger(n, |t| t.state()).unwrap();
                    assert!(
                        state >= State::WaitingToStart,
                        "slot {} in state {:?}",
                        n,
                        state
                    );
                }
            }
        }
    }

    #[test]
    fn test_unbound_slot_bang_is_skipped() {
        let (tb, _) = make_box(1);
        load_slots(&tb, &[1], 96000);

        // Slot 0 has no region; banging it must not wedge the box.
        tb.bang_trigger(0);
        let mut bufs = BufferSet::new(2, BLOCK);
        run_block(&tb, &mut bufs, 1024, BLOCK);
        assert_eq!(tb.currently_playing(), None);

        // A bound slot still launches afterwards.
        tb.bang_trigger(1);
        let mut bufs = BufferSet::new(2, BLOCK);
        run_block(&tb, &mut bufs, 2048, BLOCK);
        assert_eq!(tb.currently_playing(), Some(1));
    }

    #[test]
    fn test_set_region_rejects_midi_box() {
        let tempo = Arc::new(FixedTempoMap::new(120.0, 48000));
        let transport = Arc::new(AtomicTransport::new());
        let tb = TriggerBox::with_seed(DataType::Midi, tempo, transport, 1);
        let result = tb.set_region(0, ramp_region("r", 64, 1));
        assert!(matches!(result, Err(TriggerBoxError::UnsupportedClipType)));
    }

    #[test]
    fn test_set_region_invalid_slot() {
        let (tb, _) = make_box(1);
        let result = tb.set_region(99, ramp_region("r", 64, 1));
        assert!(matches!(
            result,
            Err(TriggerBoxError::InvalidSlot { slot: 99, len: 8 })
        ));
    }

    #[test]
    fn test_follow_action_selection_modes() {
        let (tb, _) = make_box(7);
        load_slots(&tb, &[0, 1, 2, 3], 96000);

        let triggers = tb.triggers.read();
        let mut rs_guard = tb.run_state.lock();
        let rs = &mut *rs_guard;

        let set_action = |n: usize, action: FollowAction| {
            let mut t = triggers[n].inner.lock();
            t.set_follow_action(action, 0);
            t.set_follow_action_probability(100);
        };

        set_action(1, FollowAction::NextTrigger);
        assert_eq!(
            TriggerBox::determine_next_trigger(rs, &triggers, 1),
            Some(2)
        );

        set_action(1, FollowAction::PrevTrigger);
        assert_eq!(
            TriggerBox::determine_next_trigger(rs, &triggers, 1),
            Some(0)
        );

        set_action(1, FollowAction::FirstTrigger);
        assert_eq!(
            TriggerBox::determine_next_trigger(rs, &triggers, 1),
            Some(0)
        );

        set_action(1, FollowAction::LastTrigger);
        assert_eq!(
            TriggerBox::determine_next_trigger(rs, &triggers, 1),
            Some(3)
        );

        set_action(1, FollowAction::Again);
        assert_eq!(
            TriggerBox::determine_next_trigger(rs, &triggers, 1),
            Some(1)
        );

        set_action(1, FollowAction::Stop);
        assert_eq!(TriggerBox::determine_next_trigger(rs, &triggers, 1), None);

        set_action(1, FollowAction::QueuedTrigger);
        assert_eq!(TriggerBox::determine_next_trigger(rs, &triggers, 1), None);

        // Random modes always land on a bound slot; OtherTrigger never
        // picks the current one.
        set_action(1, FollowAction::AnyTrigger);
        for _ in 0..32 {
            let n = TriggerBox::determine_next_trigger(rs, &triggers, 1).unwrap();
            assert!(n < 4);
        }
        set_action(1, FollowAction::OtherTrigger);
        for _ in 0..32 {
            let n = TriggerBox::determine_next_trigger(rs, &triggers, 1).unwrap();
            assert!(n < 4 && n != 1);
        }
    }

    #[test]
    fn test_follow_action_skips_unbound_slots() {
        let (tb, _) = make_box(3);
        // Only slots 0 and 2 are bound.
        load_slots(&tb, &[0, 2], 96000);

        let triggers = tb.triggers.read();
        let mut rs_guard = tb.run_state.lock();
        let rs = &mut *rs_guard;

        {
            let mut t = triggers[0].inner.lock();
            t.set_follow_action(FollowAction::NextTrigger, 0);
            t.set_follow_action_probability(100);
        }
        // Slot 1 is unbound and skipped.
        assert_eq!(
            TriggerBox::determine_next_trigger(rs, &triggers, 0),
            Some(2)
        );
    }

    #[test]
    fn test_follow_action_single_runnable_returns_current() {
        let (tb, _) = make_box(3);
        load_slots(&tb, &[2], 96000);

        let triggers = tb.triggers.read();
        let mut rs_guard = tb.run_state.lock();
        let rs = &mut *rs_guard;

        {
            let mut t = triggers[2].inner.lock();
            t.set_follow_action(FollowAction::NextTrigger, 0);
            t.set_follow_action_probability(100);
        }
        assert_eq!(
            TriggerBox::determine_next_trigger(rs, &triggers, 2),
            Some(2)
        );
    }

    #[test]
    fn test_follow_action_probability_selects_second_action() {
        let (tb, _) = make_box(11);
        load_slots(&tb, &[0, 1, 2], 96000);

        let triggers = tb.triggers.read();
        let mut rs_guard = tb.run_state.lock();
        let rs = &mut *rs_guard;

        {
            let mut t = triggers[0].inner.lock();
            t.set_follow_action(FollowAction::NextTrigger, 0);
            t.set_follow_action(FollowAction::Stop, 1);
            // Probability zero: only a roll of exactly 0 picks action 0.
            t.set_follow_action_probability(0);
        }

        let mut stops = 0;
        let mut nexts = 0;
        for _ in 0..200 {
            match TriggerBox::determine_next_trigger(rs, &triggers, 0) {
                None => stops += 1,
                Some(1) => nexts += 1,
                other => panic!("unexpected pick {:?}", other),
            }
        }
        // Almost every roll exceeds 0, so Stop dominates.
        assert!(stops > 150, "stops {} nexts {}", stops, nexts);
    }

    #[test]
    fn test_io_configuration() {
        let mut out = 0;
        assert!(!can_support_io_configuration(0, &mut out));

        let mut out = 1;
        assert!(can_support_io_configuration(1, &mut out));
        assert_eq!(out, 2);

        let mut out = 6;
        assert!(can_support_io_configuration(2, &mut out));
        assert_eq!(out, 6);
    }
}
