//! PlaybackController - event log, step cursor and playback state machine.
//!
//! ```text
//!                 begin_run                first step
//!   ┌──────┐ ───────────────▶ ┌─────────┐ ───────────▶ ┌───────────┐  done   ┌──────────┐
//!   │ Idle │                  │ Loading │              │ Streaming │ ──────▶ │ Finished │
//!   └──────┘ ◀─── stop ────── └─────────┘              └───────────┘         └──────────┘
//!                                               pause │      ▲ head reached,       ▲
//!                                                     ▼      │ source open         │ head reached,
//!                                               ┌────────┐ play ┌───────────┐      │ source closed
//!                                               │ Paused │ ───▶ │ Replaying │ ─────┘
//!                                               └────────┘ ◀─── └───────────┘
//!                                                         pause
//!   malformed event / stream error from any live state ──▶ Errored
//! ```
//!
//! The log is append-only and never throttled. The world is always the fold
//! of `log[0..=cursor]`; only the history notification to observers is
//! rate-limited.

use crate::epiview_world::WorldState;
use crate::error::CoreError;
use crate::event::{StepEvent, StreamMessage};
use crate::graph::EntityId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// ============================================================================
// CONFIG & STATE
// ============================================================================

/// Playback tuning. Durations are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Minimum gap between history notifications (default: 250)
    pub publish_window_ms: u64,
    /// Pending events that force a notification regardless of the window (default: 32)
    pub publish_batch: usize,
    /// Events between world checkpoints used by backward scrubs (default: 64)
    pub snapshot_interval: usize,
    /// Replay interval per step at 1x (default: 1000)
    pub base_step_interval_ms: u64,
    /// Display frame interval; replay never ticks faster (default: 16)
    pub min_frame_interval_ms: u64,
    pub min_speed: f64,
    pub max_speed: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            publish_window_ms: 250,
            publish_batch: 32,
            snapshot_interval: 64,
            base_step_interval_ms: 1000,
            min_frame_interval_ms: 16,
            min_speed: 0.25,
            max_speed: 64.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlaybackState {
    Idle,
    Loading,
    Streaming,
    Paused,
    Replaying,
    Finished,
    Errored,
}

impl PlaybackState {
    pub fn name(&self) -> &'static str {
        match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Loading => "loading",
            PlaybackState::Streaming => "streaming",
            PlaybackState::Paused => "paused",
            PlaybackState::Replaying => "replaying",
            PlaybackState::Finished => "finished",
            PlaybackState::Errored => "errored",
        }
    }

    /// States in which live messages are still accepted.
    pub fn accepts_live(&self) -> bool {
        matches!(
            self,
            PlaybackState::Loading
                | PlaybackState::Streaming
                | PlaybackState::Paused
                | PlaybackState::Replaying
        )
    }
}

// ============================================================================
// EVENT LOG
// ============================================================================

/// Append-only step log. An event's index is its position.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<StepEvent>,
    last_wire_step: Option<u64>,
}

impl EventLog {
    /// Validates and appends, returning the new event's index.
    pub fn append(&mut self, event: StepEvent) -> Result<usize, CoreError> {
        event.validate(self.last_wire_step)?;
        if event.step.is_some() {
            self.last_wire_step = event.step;
        }
        self.events.push(event);
        Ok(self.events.len() - 1)
    }

    pub fn get(&self, index: usize) -> Option<&StepEvent> {
        self.events.get(index)
    }

    pub fn events(&self) -> &[StepEvent] {
        &self.events
    }

    /// Index of the newest event.
    pub fn head(&self) -> Option<usize> {
        self.events.len().checked_sub(1)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.last_wire_step = None;
    }
}

// ============================================================================
// HISTORY NOTIFICATION
// ============================================================================

/// Receives the event history in throttled batches.
///
/// Batches are contiguous and arrive in log order: `first_index` of each
/// batch is one past the last index of the previous one.
pub trait HistoryObserver {
    fn on_steps(&mut self, first_index: usize, events: &[StepEvent]);

    /// The log was discarded; a new run over `entity_ids` starts.
    fn on_reset(&mut self, entity_ids: &[EntityId]);

    fn on_terminal(&mut self, _state: PlaybackState) {}
}

impl HistoryObserver for () {
    fn on_steps(&mut self, _first_index: usize, _events: &[StepEvent]) {}
    fn on_reset(&mut self, _entity_ids: &[EntityId]) {}
}

impl<A: HistoryObserver, B: HistoryObserver> HistoryObserver for (A, B) {
    fn on_steps(&mut self, first_index: usize, events: &[StepEvent]) {
        self.0.on_steps(first_index, events);
        self.1.on_steps(first_index, events);
    }

    fn on_reset(&mut self, entity_ids: &[EntityId]) {
        self.0.on_reset(entity_ids);
        self.1.on_reset(entity_ids);
    }

    fn on_terminal(&mut self, state: PlaybackState) {
        self.0.on_terminal(state);
        self.1.on_terminal(state);
    }
}

/// Decides when pending log entries are handed to the observer.
#[derive(Debug, Clone)]
pub struct HistoryThrottle {
    window: Duration,
    batch: usize,
    published: usize,
    last_publish: Option<Duration>,
}

impl HistoryThrottle {
    pub fn new(window: Duration, batch: usize) -> Self {
        Self {
            window,
            batch: batch.max(1),
            published: 0,
            last_publish: None,
        }
    }

    /// Whether the entries past the published mark should go out now.
    pub fn is_due(&self, log_len: usize, now: Duration) -> bool {
        let pending = log_len.saturating_sub(self.published);
        if pending == 0 {
            return false;
        }
        pending >= self.batch
            || self
                .last_publish
                .map_or(true, |at| now.saturating_sub(at) >= self.window)
    }

    fn mark(&mut self, log_len: usize, now: Duration) {
        self.published = log_len;
        self.last_publish = Some(now);
    }

    pub fn published(&self) -> usize {
        self.published
    }

    fn reset(&mut self) {
        self.published = 0;
        self.last_publish = None;
    }
}

// ============================================================================
// CONTROLLER
// ============================================================================

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackStats {
    pub received: u64,
    pub folded: u64,
    pub discarded: u64,
    pub ignored: u64,
    pub publishes: u64,
    pub restores: u64,
}

/// Owns the log, the world and the cursor. Single writer for both.
pub struct PlaybackController<O: HistoryObserver = ()> {
    config: PlaybackConfig,
    state: PlaybackState,
    entity_ids: Vec<EntityId>,
    world: WorldState,
    log: EventLog,
    snapshots: BTreeMap<usize, WorldState>,
    speed: f64,
    replay_debt: Duration,
    source_open: bool,
    throttle: HistoryThrottle,
    observer: O,
    error: Option<String>,
    stats: PlaybackStats,
}

impl PlaybackController<()> {
    pub fn without_observer(config: PlaybackConfig) -> Self {
        Self::new(config, ())
    }
}

impl<O: HistoryObserver> PlaybackController<O> {
    pub fn new(mut config: PlaybackConfig, observer: O) -> Self {
        if !(config.min_speed > 0.0 && config.min_speed <= config.max_speed) {
            let defaults = PlaybackConfig::default();
            warn!(
                min = config.min_speed,
                max = config.max_speed,
                "unusable speed range, using defaults"
            );
            config.min_speed = defaults.min_speed;
            config.max_speed = defaults.max_speed;
        }
        let throttle = HistoryThrottle::new(
            Duration::from_millis(config.publish_window_ms),
            config.publish_batch,
        );
        Self {
            config,
            state: PlaybackState::Idle,
            entity_ids: Vec::new(),
            world: WorldState::default(),
            log: EventLog::default(),
            snapshots: BTreeMap::new(),
            speed: 1.0,
            replay_debt: Duration::ZERO,
            source_open: false,
            throttle,
            observer,
            error: None,
            stats: PlaybackStats::default(),
        }
    }

    fn transition(&mut self, to: PlaybackState) {
        if self.state != to {
            info!(from = self.state.name(), to = to.name(), "playback state");
            self.state = to;
        }
    }

    fn invalid(&self, op: &'static str) -> CoreError {
        CoreError::InvalidState {
            op,
            state: self.state.name(),
        }
    }

    /// Starts a new run over `entity_ids`, discarding any previous one.
    pub fn begin_run(&mut self, entity_ids: &[EntityId]) {
        self.entity_ids = entity_ids.to_vec();
        self.clear_run();
        self.source_open = true;
        self.transition(PlaybackState::Loading);
    }

    fn clear_run(&mut self) {
        self.world.reset(&self.entity_ids);
        self.log.clear();
        self.snapshots.clear();
        self.replay_debt = Duration::ZERO;
        self.throttle.reset();
        self.error = None;
        self.stats = PlaybackStats::default();
        self.observer.on_reset(&self.entity_ids);
    }

    /// Handles one live message from the ingestion path.
    ///
    /// Messages outside a live run are ignored. A malformed step or an
    /// error message moves the controller to `Errored` and is returned.
    pub fn append(&mut self, message: StreamMessage, now: Duration) -> Result<(), CoreError> {
        if !self.state.accepts_live() {
            self.stats.ignored += 1;
            debug!(state = self.state.name(), "live message ignored");
            return Ok(());
        }

        match message {
            StreamMessage::Step(event) => {
                self.stats.received += 1;
                if let Err(e) = self.log.append(event) {
                    self.stats.discarded += 1;
                    warn!(error = %e, "malformed step discarded");
                    self.fail(e.to_string(), now);
                    return Err(e);
                }
                match self.state {
                    PlaybackState::Loading => {
                        self.transition(PlaybackState::Streaming);
                        self.fold_to_head()?;
                    }
                    PlaybackState::Streaming => self.fold_to_head()?,
                    // Paused or replaying: logged now, folded when the cursor gets here.
                    _ => {}
                }
                self.publish(now, false);
            }
            StreamMessage::Done => {
                self.source_open = false;
                if matches!(self.state, PlaybackState::Loading | PlaybackState::Streaming) {
                    self.transition(PlaybackState::Finished);
                }
                self.publish(now, true);
                self.observer.on_terminal(self.state);
                info!(events = self.log.len(), "stream finished");
            }
            StreamMessage::Error(text) => {
                self.fail(text.clone(), now);
                return Err(CoreError::Remote(text));
            }
        }
        Ok(())
    }

    /// Moves to `Errored`, keeping the world at its last valid fold.
    pub fn fail(&mut self, reason: impl Into<String>, now: Duration) {
        let reason = reason.into();
        error!(reason = %reason, "playback failed");
        self.source_open = false;
        self.error = Some(reason);
        self.transition(PlaybackState::Errored);
        self.publish(now, true);
        self.observer.on_terminal(self.state);
    }

    /// Delivers pending history if the throttle allows (or `force`).
    pub fn publish(&mut self, now: Duration, force: bool) {
        let len = self.log.len();
        let from = self.throttle.published();
        if from >= len {
            return;
        }
        if force || self.throttle.is_due(len, now) {
            self.observer.on_steps(from, &self.log.events()[from..]);
            self.throttle.mark(len, now);
            self.stats.publishes += 1;
        }
    }

    /// Whole-run batch response: everything appended and folded, then `Finished`.
    pub fn load_batch(&mut self, messages: Vec<StreamMessage>, now: Duration) -> Result<(), CoreError> {
        if self.state != PlaybackState::Loading {
            return Err(self.invalid("load a batch"));
        }
        info!(messages = messages.len(), "loading batch response");
        for message in messages {
            match message {
                StreamMessage::Done => break,
                other => self.append(other, now)?,
            }
        }
        self.source_open = false;
        self.fold_to_head()?;
        self.transition(PlaybackState::Finished);
        self.publish(now, true);
        self.observer.on_terminal(self.state);
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), CoreError> {
        match self.state {
            PlaybackState::Streaming | PlaybackState::Replaying => {
                self.transition(PlaybackState::Paused);
                Ok(())
            }
            PlaybackState::Paused => Ok(()),
            _ => Err(self.invalid("pause")),
        }
    }

    /// Resumes from `Paused`. From `Finished` at the head this is a no-op.
    pub fn play(&mut self) -> Result<(), CoreError> {
        match self.state {
            PlaybackState::Paused | PlaybackState::Finished => {
                self.replay_debt = Duration::ZERO;
                if self.at_head() {
                    self.settle_at_head();
                } else {
                    self.transition(PlaybackState::Replaying);
                }
                Ok(())
            }
            PlaybackState::Streaming | PlaybackState::Replaying => Ok(()),
            _ => Err(self.invalid("play")),
        }
    }

    /// Sets the replay speed multiplier, clamped to the configured range.
    pub fn set_speed(&mut self, multiplier: f64) {
        if !multiplier.is_finite() {
            return;
        }
        self.speed = multiplier.clamp(self.config.min_speed, self.config.max_speed);
        debug!(speed = self.speed, "playback speed");
    }

    /// Replay interval per step at the current speed.
    pub fn step_interval(&self) -> Duration {
        Duration::from_secs_f64(self.config.base_step_interval_ms as f64 / 1000.0 / self.speed)
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.config.min_frame_interval_ms)
    }

    /// Most events one tick may fold.
    pub fn per_tick_cap(&self) -> usize {
        let interval = self.step_interval().as_secs_f64();
        if interval <= 0.0 {
            return 1;
        }
        ((self.frame_interval().as_secs_f64() / interval).ceil() as usize).max(1)
    }

    /// Advances replay by `elapsed`. Returns the number of events folded.
    pub fn tick(&mut self, elapsed: Duration) -> Result<usize, CoreError> {
        if self.state != PlaybackState::Replaying {
            return Ok(0);
        }
        let interval = self.step_interval();
        self.replay_debt += elapsed;
        let due = (self.replay_debt.as_secs_f64() / interval.as_secs_f64()).floor() as usize;
        let cap = self.per_tick_cap();
        let count = due.min(cap);

        let mut folded = 0;
        while folded < count && !self.at_head() {
            self.fold_next()?;
            folded += 1;
        }

        self.replay_debt = if due > cap {
            // Behind schedule: drop the backlog instead of bursting later.
            Duration::ZERO
        } else {
            self.replay_debt.saturating_sub(interval * folded as u32)
        };

        if self.at_head() {
            self.settle_at_head();
        }
        Ok(folded)
    }

    /// Delay until the next replay tick is due, never below one frame.
    pub fn next_tick_delay(&self) -> Option<Duration> {
        if self.state != PlaybackState::Replaying {
            return None;
        }
        let remaining = self.step_interval().saturating_sub(self.replay_debt);
        Some(remaining.max(self.frame_interval()))
    }

    /// Jumps the cursor to `step`, clamped to the logged range. Returns the
    /// step landed on.
    pub fn scrub_to(&mut self, step: usize) -> Result<usize, CoreError> {
        let Some(head) = self.log.head() else {
            return Err(self.invalid("scrub"));
        };
        if matches!(self.state, PlaybackState::Idle | PlaybackState::Loading) {
            return Err(self.invalid("scrub"));
        }
        let target = step.min(head);

        let forward = self.world.last_applied().map_or(false, |c| target >= c);
        if !forward {
            self.restore_before(target);
        }
        while self.world.last_applied() != Some(target) {
            self.fold_next()?;
        }
        self.replay_debt = Duration::ZERO;

        match self.state {
            PlaybackState::Streaming | PlaybackState::Replaying => self.transition(PlaybackState::Paused),
            PlaybackState::Finished if target < head => self.transition(PlaybackState::Paused),
            _ => {}
        }
        debug!(target, head, "scrubbed");
        Ok(target)
    }

    /// Rewinds the world to the nearest checkpoint at or before `target`.
    fn restore_before(&mut self, target: usize) {
        match self.snapshots.range(..=target).next_back() {
            Some((_, snapshot)) => self.world = snapshot.clone(),
            None => self.world.reset(&self.entity_ids),
        }
        self.stats.restores += 1;
    }

    /// Ends the run: closes the source, forgets everything, back to `Idle`.
    ///
    /// Returns whether a live source was open and must be closed.
    pub fn stop(&mut self) -> bool {
        let was_open = self.source_open;
        self.source_open = false;
        self.clear_run();
        self.transition(PlaybackState::Idle);
        was_open
    }

    fn at_head(&self) -> bool {
        self.world.last_applied() == self.log.head()
    }

    fn settle_at_head(&mut self) {
        if self.source_open {
            self.transition(PlaybackState::Streaming);
        } else {
            self.transition(PlaybackState::Finished);
        }
    }

    fn fold_to_head(&mut self) -> Result<(), CoreError> {
        while !self.at_head() {
            self.fold_next()?;
        }
        Ok(())
    }

    fn fold_next(&mut self) -> Result<(), CoreError> {
        let index = self.world.next_index();
        let event = self
            .log
            .get(index)
            .ok_or_else(|| self.invalid("fold past the log head"))?;
        self.world.apply_event(index, event)?;
        self.stats.folded += 1;

        let interval = self.config.snapshot_interval.max(1);
        if (index + 1) % interval == 0 && !self.snapshots.contains_key(&index) {
            self.snapshots.insert(index, self.world.clone());
        }
        Ok(())
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn world(&self) -> &WorldState {
        &self.world
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Last folded step.
    pub fn cursor(&self) -> Option<usize> {
        self.world.last_applied()
    }

    pub fn head(&self) -> Option<usize> {
        self.log.head()
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn is_source_open(&self) -> bool {
        self.source_open
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats
    }

    pub fn entity_ids(&self) -> &[EntityId] {
        &self.entity_ids
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }
}
