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

//! Per-slot trigger state machine and block rendering.
//!
//! A trigger reacts to two kinds of input: asynchronous user gestures
//! (bang/unbang/state requests, delivered through the [`TriggerControl`]
//! atomics) and quantized musical time, folded in once per process block.
//! The audio thread owns all non-atomic state; the control thread never
//! touches it while a block is in flight.

use std::any::Any;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::buffer::BufferSet;
use crate::clip::AudioClip;
use crate::region::{Region, RegionError};
use crate::stretch::TimeStretcher;
use crate::time::{BbtOffset, Beats, TempoMap};

/// Trigger lifecycle states, ordered so that `state >= Running` means the
/// trigger is audible or about to stop being audible. `None` is a sentinel
/// used only for "no requested state".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum State {
    None = 0,
    Stopped = 1,
    WaitingToStart = 2,
    Running = 3,
    WaitingForRetrigger = 4,
    WaitingToStop = 5,
    Stopping = 6,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            1 => State::Stopped,
            2 => State::WaitingToStart,
            3 => State::Running,
            4 => State::WaitingForRetrigger,
            5 => State::WaitingToStop,
            6 => State::Stopping,
            _ => State::None,
        }
    }
}

/// How a trigger responds to bang and unbang.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaunchStyle {
    /// Bang starts; unbang is ignored.
    OneShot,
    /// Runs until unbang, then stops at the next quantization point.
    Gate,
    /// Runs until the next bang.
    Toggle,
    /// Plays the quantization extent repeatedly until unbang.
    Repeat,
}

/// What happens after a trigger finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FollowAction {
    Stop,
    Again,
    /// Reserved; currently equivalent to Stop.
    QueuedTrigger,
    NextTrigger,
    PrevTrigger,
    FirstTrigger,
    LastTrigger,
    AnyTrigger,
    OtherTrigger,
}

/// How much of the block a trigger will fill, given its pending transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunType {
    /// Stops partway through the block.
    RunEnd,
    /// Starts partway through the block.
    RunStart,
    /// Fills the whole block.
    RunAll,
    /// Nothing to render this block.
    RunNone,
}

/// The control-thread face of a trigger: everything here is atomic, written
/// by UI/MIDI handlers and drained exactly once per block by the audio
/// thread.
#[derive(Default)]
pub struct TriggerControl {
    bangs: AtomicU32,
    unbangs: AtomicU32,
    requested_state: AtomicU8,
}

impl TriggerControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a launch gesture (mouse down, note on).
    pub fn bang(&self) {
        self.bangs.fetch_add(1, Ordering::AcqRel);
    }

    /// Records a release gesture (mouse up, note off).
    pub fn unbang(&self) {
        self.unbangs.fetch_add(1, Ordering::AcqRel);
    }

    /// Requests a state change, folded in at the start of the next block.
    pub fn request_state(&self, state: State) {
        self.requested_state.store(state as u8, Ordering::Release);
    }

    /// Asks the trigger to stop at the next quantization point. The
    /// argument names a slot to run afterwards; reserved, currently unused.
    pub fn stop(&self, _next_to_run: i32) {
        self.request_state(State::Stopped);
    }

    /// Pending gesture counts (bangs, unbangs). Diagnostic; the audio
    /// thread drains these to zero every block.
    pub fn pending(&self) -> (u32, u32) {
        (
            self.bangs.load(Ordering::Acquire),
            self.unbangs.load(Ordering::Acquire),
        )
    }

    fn take_requested(&self) -> State {
        State::from_u8(self.requested_state.swap(State::None as u8, Ordering::AcqRel))
    }

    fn pending_bangs(&self) -> u32 {
        self.bangs.load(Ordering::Acquire)
    }

    fn consume_bang(&self) {
        self.bangs.fetch_sub(1, Ordering::AcqRel);
    }

    fn pending_unbangs(&self) -> u32 {
        self.unbangs.load(Ordering::Acquire)
    }

    fn consume_unbang(&self) {
        self.unbangs.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Queue operations a state fold asks the owning box to perform. The box
/// executes them immediately after the fold so ordering within the block is
/// unchanged.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StateRequestOutcome {
    /// Enqueue this trigger on the explicit launch queue this many times.
    pub explicit_requests: u32,
    /// A user gesture overrode any pending follow action.
    pub clear_implicit: bool,
}

/// Frames below which a stop boundary cannot be released click-free; the
/// trigger then holds in Stopping until a long enough block arrives.
const MIN_FADE_FRAMES: usize = 64;

/// One slot of a trigger box.
pub struct Trigger {
    index: usize,
    state: State,
    control: Arc<TriggerControl>,
    launch_style: LaunchStyle,
    follow_action: [FollowAction; 2],
    follow_action_probability: i32,
    quantization: BbtOffset,
    quantization_warned: bool,
    legato: bool,
    name: String,
    region: Option<Arc<dyn Region>>,
    clip: AudioClip,
    tempo: Arc<dyn TempoMap>,
    ui: Option<Box<dyn Any + Send>>,

    /// Sample position of the transition computed for the current block.
    pub bang_samples: i64,
    /// Musical position of that transition.
    pub bang_beats: Beats,
}

impl Trigger {
    pub fn new(index: usize, control: Arc<TriggerControl>, tempo: Arc<dyn TempoMap>) -> Self {
        Self {
            index,
            state: State::Stopped,
            control,
            launch_style: LaunchStyle::Toggle,
            follow_action: [FollowAction::NextTrigger, FollowAction::Stop],
            follow_action_probability: 100,
            quantization: BbtOffset::new(0, 1, 0),
            quantization_warned: false,
            legato: true,
            name: String::new(),
            region: None,
            clip: AudioClip::new(),
            tempo,
            ui: None,
            bang_samples: 0,
            bang_beats: Beats::ZERO,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn active(&self) -> bool {
        self.state >= State::Running
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn launch_style(&self) -> LaunchStyle {
        self.launch_style
    }

    pub fn set_launch_style(&mut self, style: LaunchStyle) {
        self.launch_style = style;
        self.clip
            .set_usable_length(self.launch_style, &self.quantization, self.tempo.as_ref());
    }

    pub fn quantization(&self) -> BbtOffset {
        self.quantization
    }

    pub fn set_quantization(&mut self, quantization: BbtOffset) {
        self.quantization = quantization;
        self.quantization_warned = false;
        self.clip
            .set_usable_length(self.launch_style, &self.quantization, self.tempo.as_ref());
    }

    pub fn follow_action(&self, n: usize) -> FollowAction {
        self.follow_action[n]
    }

    pub fn set_follow_action(&mut self, action: FollowAction, n: usize) {
        self.follow_action[n] = action;
    }

    pub fn follow_action_probability(&self) -> i32 {
        self.follow_action_probability
    }

    pub fn set_follow_action_probability(&mut self, percent: i32) {
        self.follow_action_probability = percent.clamp(0, 100);
    }

    pub fn legato(&self) -> bool {
        self.legato
    }

    pub fn set_legato(&mut self, legato: bool) {
        self.legato = legato;
    }

    pub fn control(&self) -> Arc<TriggerControl> {
        self.control.clone()
    }

    /// Attaches an opaque handle for the UI layer that owns this slot's
    /// widget.
    pub fn set_ui(&mut self, ui: Option<Box<dyn Any + Send>>) {
        self.ui = ui;
    }

    pub fn ui(&self) -> Option<&(dyn Any + Send)> {
        self.ui.as_deref()
    }

    pub fn region(&self) -> Option<Arc<dyn Region>> {
        self.region.clone()
    }

    /// Binds a region to this slot and loads its audio. On failure the slot
    /// keeps its previous binding.
    pub fn set_region(&mut self, region: Arc<dyn Region>) -> Result<(), RegionError> {
        self.clip.load_data(region.as_ref())?;
        self.name = region.name().to_string();
        self.region = Some(region);
        Ok(())
    }

    /// Stretches the clip to `new_len` samples using the supplied engine.
    /// A length equal to the region's natural length reloads without
    /// stretching.
    pub fn set_length(
        &mut self,
        new_len: usize,
        stretcher: &mut dyn TimeStretcher,
    ) -> Result<(), RegionError> {
        let Some(region) = self.region.clone() else {
            return Ok(());
        };
        self.clip.set_length(region.as_ref(), new_len, stretcher)
    }

    /// Moves the read origin within the clip data.
    pub fn set_start(&mut self, start: usize) {
        self.clip.set_start(start);
    }

    /// Trims the clip to end at `end` samples from the data start.
    pub fn set_end(
        &mut self,
        end: usize,
        stretcher: &mut dyn TimeStretcher,
    ) -> Result<(), RegionError> {
        self.set_length(end.saturating_sub(self.clip.start_offset()), stretcher)
    }

    /// Data length after any stretch.
    pub fn current_length(&self) -> usize {
        self.clip.data_length()
    }

    /// The bound region's own length, if any.
    pub fn natural_length(&self) -> Option<usize> {
        self.region.as_ref().map(|r| r.length_samples())
    }

    pub fn current_pos(&self) -> usize {
        self.clip.current_pos()
    }

    pub fn set_legato_offset(&mut self, offset: usize) {
        self.clip.set_legato_offset(offset);
    }

    pub fn clip(&self) -> &AudioClip {
        &self.clip
    }

    pub fn clip_mut(&mut self) -> &mut AudioClip {
        &mut self.clip
    }

    pub fn n_channels(&self) -> usize {
        self.region.as_ref().map(|r| r.n_channels()).unwrap_or(0)
    }

    /// Arms the trigger to start at its next quantization point.
    pub fn startup(&mut self) {
        self.state = State::WaitingToStart;
        self.clip.retrigger();
        debug!(trigger = self.index, "startup");
    }

    /// Starts immediately, bypassing quantization. Used for legato
    /// handovers.
    pub fn jump_start(&mut self) {
        self.state = State::Running;
        self.clip.retrigger();
        debug!(trigger = self.index, "jump start");
    }

    /// Stops immediately, bypassing quantization. The retrigger is
    /// incidental; the slot is about to be unused.
    pub fn jump_stop(&mut self) {
        self.state = State::Stopped;
        self.clip.retrigger();
        debug!(trigger = self.index, "jump stop");
    }

    /// Folds all pending control-thread input into the state machine.
    /// Called exactly once per block, before dispatch, so every gesture
    /// issued before the block is observed within it.
    pub fn process_state_requests(&mut self) -> StateRequestOutcome {
        let mut outcome = StateRequestOutcome::default();

        let requested = self.control.take_requested();
        if requested != State::None && requested != self.state {
            match requested {
                State::Stopped => {
                    if self.state != State::WaitingToStop {
                        debug!(trigger = self.index, from = ?self.state, "=> WaitingToStop");
                        self.state = State::WaitingToStop;
                    }
                }
                State::Running => {
                    outcome.explicit_requests += 1;
                }
                _ => {}
            }
        }

        while self.control.pending_bangs() > 0 {
            self.control.consume_bang();
            debug!(trigger = self.index, state = ?self.state, "handling bang");

            match self.state {
                State::Running => match self.launch_style {
                    LaunchStyle::OneShot => {
                        self.state = State::WaitingForRetrigger;
                    }
                    LaunchStyle::Gate | LaunchStyle::Toggle | LaunchStyle::Repeat => {
                        self.state = State::WaitingToStop;
                        outcome.clear_implicit = true;
                    }
                },
                State::Stopped => {
                    outcome.explicit_requests += 1;
                }
                _ => {}
            }
        }

        while self.control.pending_unbangs() > 0 {
            self.control.consume_unbang();

            if self.launch_style == LaunchStyle::Gate || self.launch_style == LaunchStyle::Repeat {
                match self.state {
                    State::Running => {
                        debug!(trigger = self.index, "unbanged, now WaitingToStop");
                        self.state = State::WaitingToStop;
                    }
                    _ => {
                        // Never got started.
                        debug!(trigger = self.index, "unbanged, never started, now Stopped");
                        self.state = State::Stopped;
                    }
                }
            }
        }

        outcome
    }

    /// Computes whether a quantized transition lands inside the block
    /// `[start, end)` and applies it, returning how the block should be
    /// rendered. On a start transition the caller must seed the follow
    /// action (`prepare_next`).
    pub fn maybe_compute_next_transition(&mut self, start: Beats, end: Beats) -> RunType {
        match self.state {
            State::Stopped => return RunType::RunNone,
            State::Running | State::Stopping => return RunType::RunAll,
            _ => {}
        }

        let ev_time = if self.quantization.bar_level() {
            // Bar-level quantization is not implemented; treat as
            // unquantized and transition at the start of the block.
            if !self.quantization_warned {
                warn!(
                    trigger = self.index,
                    quantization = %self.quantization,
                    "Bar-level quantization unsupported, transitioning unquantized"
                );
                self.quantization_warned = true;
            }
            start
        } else {
            start.snap_to(self.quantization.beat_grid())
        };

        if ev_time >= start && ev_time < end {
            self.bang_samples = self.tempo.samples_at(ev_time);
            self.bang_beats = ev_time;

            match self.state {
                State::WaitingToStop => {
                    self.state = State::Stopping;
                    RunType::RunEnd
                }
                State::WaitingToStart => {
                    self.clip.retrigger();
                    self.state = State::Running;
                    RunType::RunStart
                }
                State::WaitingForRetrigger => {
                    self.clip.retrigger();
                    self.state = State::Running;
                    RunType::RunAll
                }
                _ => RunType::RunNone,
            }
        } else if self.state == State::WaitingForRetrigger || self.state == State::WaitingToStop {
            // The boundary is beyond this block; keep playing until then.
            RunType::RunAll
        } else {
            RunType::RunNone
        }
    }

    /// Renders `nframes` of clip audio into the buffers starting at
    /// `dest_offset`. The first writer of a block overwrites, later writers
    /// accumulate. `next_is_self` enables the seamless self-repeat wrap.
    pub fn run(
        &mut self,
        bufs: &mut BufferSet,
        mut nframes: usize,
        mut dest_offset: usize,
        first: bool,
        next_is_self: bool,
    ) {
        let n_out = self.n_channels().min(bufs.n_audio());
        if n_out == 0 || self.clip.n_data_channels() == 0 {
            return;
        }

        let long_enough_to_fade = nframes >= MIN_FADE_FRAMES;
        let fading = self.state == State::Stopping && long_enough_to_fade;

        while nframes > 0 {
            let this_read = nframes.min(self.clip.remaining());

            if this_read == 0 {
                // Nothing left to read; a zero-length window cannot loop.
                for chn in 0..n_out {
                    bufs.silence(chn, nframes, dest_offset);
                }
                self.state = State::Stopped;
                break;
            }

            // The release fade covers the tail of the last span rendered in
            // this call.
            let fade_tail = if fading && this_read == nframes {
                this_read.min(MIN_FADE_FRAMES)
            } else {
                0
            };

            for chn in 0..n_out {
                let src_channel = chn % self.clip.n_data_channels();
                let src = self.clip.span(src_channel, this_read);
                bufs.mix(chn, src, dest_offset, first, fade_tail);
            }
            self.clip.advance(this_read);

            if self.clip.remaining() == 0 {
                // End of the pass.
                if self.launch_style == LaunchStyle::Repeat || next_is_self {
                    nframes -= this_read;
                    dest_offset += this_read;
                    debug!(trigger = self.index, "reached end, looping");
                    self.clip.retrigger();
                    continue;
                }

                if this_read < nframes {
                    for chn in 0..n_out {
                        bufs.silence(chn, nframes - this_read, dest_offset + this_read);
                    }
                }
                debug!(trigger = self.index, "reached end, now stopped");
                self.state = State::Stopped;
                break;
            }

            nframes -= this_read;
        }

        if self.state == State::Stopping && long_enough_to_fade {
            debug!(trigger = self.index, "was stopping, now stopped");
            self.state = State::Stopped;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{MemoryRegion, RegionId};
    use crate::time::FixedTempoMap;

    fn tempo() -> Arc<FixedTempoMap> {
        Arc::new(FixedTempoMap::new(120.0, 48000))
    }

    fn make_trigger(index: usize) -> Trigger {
        Trigger::new(index, Arc::new(TriggerControl::new()), tempo())
    }

    fn make_loaded_trigger(index: usize, len: usize) -> Trigger {
        let mut t = make_trigger(index);
        let data: Vec<f32> = (0..len).map(|i| (i % 97) as f32 / 97.0).collect();
        let region = Arc::new(MemoryRegion::new(
            RegionId::new(format!("r{}", index)),
            format!("r{}", index),
            vec![data],
        ));
        t.set_region(region).unwrap();
        t
    }

    #[test]
    fn test_bang_while_stopped_requests_explicit_launch() {
        let mut t = make_trigger(0);
        t.control().bang();
        t.control().bang();

        let outcome = t.process_state_requests();
        assert_eq!(outcome.explicit_requests, 2);
        assert!(!outcome.clear_implicit);
        assert_eq!(t.state(), State::Stopped);

        // Counters fully drained.
        assert_eq!(t.process_state_requests(), StateRequestOutcome::default());
    }

    #[test]
    fn test_requested_running_queues_explicit() {
        let mut t = make_trigger(0);
        t.control().request_state(State::Running);
        let outcome = t.process_state_requests();
        assert_eq!(outcome.explicit_requests, 1);
        assert_eq!(t.state(), State::Stopped);
    }

    #[test]
    fn test_requested_stop_waits_for_quantization() {
        let mut t = make_trigger(0);
        t.jump_start();
        t.control().stop(-1);
        t.process_state_requests();
        assert_eq!(t.state(), State::WaitingToStop);

        // A second stop request while already waiting changes nothing.
        t.control().stop(-1);
        t.process_state_requests();
        assert_eq!(t.state(), State::WaitingToStop);
    }

    #[test]
    fn test_bang_while_running_oneshot_retriggers() {
        let mut t = make_trigger(0);
        t.set_launch_style(LaunchStyle::OneShot);
        t.jump_start();

        t.control().bang();
        let outcome = t.process_state_requests();
        assert_eq!(t.state(), State::WaitingForRetrigger);
        assert_eq!(outcome.explicit_requests, 0);
        assert!(!outcome.clear_implicit);
    }

    #[test]
    fn test_bang_while_running_toggle_stops_and_clears_follow() {
        let mut t = make_trigger(0);
        t.jump_start();

        t.control().bang();
        let outcome = t.process_state_requests();
        assert_eq!(t.state(), State::WaitingToStop);
        assert!(outcome.clear_implicit);
    }

    #[test]
    fn test_unbang_gate_running_stops() {
        let mut t = make_trigger(0);
        t.set_launch_style(LaunchStyle::Gate);
        t.jump_start();

        t.control().unbang();
        t.process_state_requests();
        assert_eq!(t.state(), State::WaitingToStop);
    }

    #[test]
    fn test_unbang_gate_waiting_never_starts() {
        let mut t = make_trigger(0);
        t.set_launch_style(LaunchStyle::Gate);
        t.startup();

        t.control().unbang();
        t.process_state_requests();
        assert_eq!(t.state(), State::Stopped);
    }

    #[test]
    fn test_unbang_ignored_for_toggle_and_oneshot() {
        for style in [LaunchStyle::Toggle, LaunchStyle::OneShot] {
            let mut t = make_trigger(0);
            t.set_launch_style(style);
            t.jump_start();
            t.control().unbang();
            t.process_state_requests();
            assert_eq!(t.state(), State::Running, "style {:?}", style);
        }
    }

    #[test]
    fn test_transition_waits_for_beat_boundary() {
        // 120 BPM at 48 kHz: beat at sample 24000. Block [1024, 2048) is
        // well before it.
        let map = tempo();
        let mut t = make_loaded_trigger(0, 48000);
        t.startup();

        let rt = t.maybe_compute_next_transition(map.beats_at(1024), map.beats_at(2048));
        assert_eq!(rt, RunType::RunNone);
        assert_eq!(t.state(), State::WaitingToStart);

        // Block [23552, 24576) contains the boundary.
        let rt = t.maybe_compute_next_transition(map.beats_at(23552), map.beats_at(24576));
        assert_eq!(rt, RunType::RunStart);
        assert_eq!(t.state(), State::Running);
        assert_eq!(t.bang_samples, 24000);
    }

    #[test]
    fn test_transition_stop_at_boundary() {
        let map = tempo();
        let mut t = make_loaded_trigger(0, 96000);
        t.jump_start();
        t.control().stop(-1);
        t.process_state_requests();

        // Before the boundary the trigger keeps playing.
        let rt = t.maybe_compute_next_transition(map.beats_at(1024), map.beats_at(2048));
        assert_eq!(rt, RunType::RunAll);
        assert_eq!(t.state(), State::WaitingToStop);

        let rt = t.maybe_compute_next_transition(map.beats_at(23552), map.beats_at(24576));
        assert_eq!(rt, RunType::RunEnd);
        assert_eq!(t.state(), State::Stopping);
    }

    #[test]
    fn test_retrigger_boundary_returns_run_all() {
        let map = tempo();
        let mut t = make_loaded_trigger(0, 96000);
        t.set_launch_style(LaunchStyle::OneShot);
        t.jump_start();
        t.clip_mut().advance(50000);

        t.control().bang();
        t.process_state_requests();
        assert_eq!(t.state(), State::WaitingForRetrigger);

        // Keeps playing before the boundary.
        let rt = t.maybe_compute_next_transition(map.beats_at(1024), map.beats_at(2048));
        assert_eq!(rt, RunType::RunAll);

        // At the boundary it restarts from the top, still filling the
        // whole block.
        let rt = t.maybe_compute_next_transition(map.beats_at(23552), map.beats_at(24576));
        assert_eq!(rt, RunType::RunAll);
        assert_eq!(t.state(), State::Running);
        assert_eq!(t.current_pos(), 0);
    }

    #[test]
    fn test_run_renders_and_advances() {
        let mut t = make_loaded_trigger(0, 48000);
        t.jump_start();

        let mut bufs = BufferSet::new(2, 512);
        t.run(&mut bufs, 512, 0, true, false);

        assert_eq!(t.current_pos(), 512);
        assert_eq!(t.state(), State::Running);
        // Mono source replicated onto both output channels.
        assert_eq!(bufs.audio(0)[0], 0.0);
        assert_eq!(bufs.audio(0)[100], bufs.audio(1)[100]);
        assert!(bufs.audio(0)[100] != 0.0);
    }

    #[test]
    fn test_run_end_of_clip_silences_and_stops() {
        let mut t = make_loaded_trigger(0, 300);
        t.jump_start();

        let mut bufs = BufferSet::new(1, 512);
        bufs.audio_mut(0).fill(9.0);
        t.run(&mut bufs, 512, 0, true, false);

        assert_eq!(t.state(), State::Stopped);
        // Tail beyond the clip is silence, not stale data.
        for &s in &bufs.audio(0)[300..] {
            assert_eq!(s, 0.0);
        }
    }

    #[test]
    fn test_run_repeat_wraps_seamlessly() {
        // Clip of 300 samples, repeat style: a 512-frame block wraps once
        // with no gap.
        let mut t = make_loaded_trigger(0, 300);
        t.set_launch_style(LaunchStyle::Repeat);
        t.jump_start();

        let mut bufs = BufferSet::new(1, 512);
        t.run(&mut bufs, 512, 0, true, false);

        assert_eq!(t.state(), State::Running);
        assert_eq!(t.current_pos(), 212);
        // Sample 300 of the output is sample 0 of the clip again.
        assert_eq!(bufs.audio(0)[300], bufs.audio(0)[0]);
        assert_eq!(bufs.audio(0)[301], bufs.audio(0)[1]);
    }

    #[test]
    fn test_run_self_queued_wraps_like_repeat() {
        let mut t = make_loaded_trigger(0, 300);
        t.jump_start();

        let mut bufs = BufferSet::new(1, 512);
        t.run(&mut bufs, 512, 0, true, true);

        assert_eq!(t.state(), State::Running);
        assert_eq!(t.current_pos(), 212);
    }

    #[test]
    fn test_stopping_fades_out_in_long_block() {
        let mut t = make_loaded_trigger(0, 48000);
        t.jump_start();
        t.state = State::Stopping;

        let mut bufs = BufferSet::new(1, 512);
        t.run(&mut bufs, 512, 0, true, false);

        assert_eq!(t.state(), State::Stopped);
        // The very last rendered sample is fully faded.
        assert_eq!(bufs.audio(0)[511], 0.0);
    }

    #[test]
    fn test_stopping_holds_in_short_block() {
        let mut t = make_loaded_trigger(0, 48000);
        t.jump_start();
        t.state = State::Stopping;

        let mut bufs = BufferSet::new(1, 32);
        t.run(&mut bufs, 32, 0, true, false);
        assert_eq!(t.state(), State::Stopping);

        // The next long block releases it.
        let mut bufs = BufferSet::new(1, 128);
        t.run(&mut bufs, 128, 0, true, false);
        assert_eq!(t.state(), State::Stopped);
    }

    #[test]
    fn test_run_accumulates_when_not_first() {
        let mut t = make_loaded_trigger(0, 48000);
        t.jump_start();
        t.clip_mut().advance(100);
        let expected_base = 1.0f32;

        let mut bufs = BufferSet::new(1, 64);
        bufs.audio_mut(0).fill(expected_base);
        t.run(&mut bufs, 64, 0, false, false);

        let direct = (100 % 97) as f32 / 97.0;
        assert!((bufs.audio(0)[0] - (expected_base + direct)).abs() < 1e-6);
    }

    #[test]
    fn test_run_without_region_is_silent_noop() {
        let mut t = make_trigger(0);
        t.jump_start();
        let mut bufs = BufferSet::new(1, 64);
        t.run(&mut bufs, 64, 0, true, false);
        assert!(bufs.audio(0).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_ui_handle_round_trip() {
        let mut t = make_trigger(0);
        assert!(t.ui().is_none());

        t.set_ui(Some(Box::new(42u32)));
        let handle = t.ui().unwrap();
        assert_eq!(handle.downcast_ref::<u32>(), Some(&42));

        t.set_ui(None);
        assert!(t.ui().is_none());
    }

    #[test]
    fn test_bar_level_quantization_degrades_to_unquantized() {
        let map = tempo();
        let mut t = make_loaded_trigger(0, 48000);
        t.set_quantization(BbtOffset::new(1, 0, 0));
        t.startup();

        let rt = t.maybe_compute_next_transition(map.beats_at(1024), map.beats_at(2048));
        assert_eq!(rt, RunType::RunStart);
        assert_eq!(t.bang_samples, 1024);
    }
}
