//! Scenario runner - drives a full viewer session on the virtual clock.
//!
//! ```text
//!   tick:  advance clock 16ms
//!            │
//!            ├─ SimStream.drain_due(now) ──▶ session.handle_frame / errors
//!            ├─ scenario hook (scrub, hide, zoom, ...)
//!            ├─ session.animation_frame(now)
//!            └─ checks: world == fold(log[0..=cursor]),
//!                       aggregate == oracle truth at cursor
//! ```
//!
//! Everything is seeded, so a failing seed replays exactly.

use crate::context::SimContext;
use crate::error::SimError;
use crate::exporter::{SimExport, SimFrame};
use crate::network::{SimFetcher, SimStream, StreamFaults, StreamItem, StreamTiming};
use crate::oracle::{Oracle, OutbreakConfig};
use crate::scenarios::ScenarioId;
use crate::visualizer::RerunLogger;

use epiview_core::render::FrameStats;
use epiview_core::{IngestMode, PlaybackState, Summary, ViewerConfig, ViewerSession, WorldState};
use epiview_env::{EpiViewContext, RunId, RunRequest};
use image::RgbaImage;
use nalgebra::Vector2;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// RNG stream ids (see `SimContext::fork_rng`)
const JITTER_STREAM: u64 = 1;
const DRIVER_STREAM: u64 = 2;

/// Ticks between full replay checks outside of scrubs.
const REPLAY_CHECK_EVERY: u64 = 25;

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Ticks executed
    pub total_ticks: u64,

    /// Final virtual time in seconds
    pub final_time_secs: f64,

    pub final_state: PlaybackState,

    /// Steps in the event log at the end
    pub steps_logged: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,

    pub summary: Summary,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioMetrics {
    /// Frames the stream handed over
    pub frames_delivered: usize,

    /// Animation frames actually drawn
    pub frames_drawn: u64,

    pub base_redraws: u64,
    pub heat_redraws: u64,

    /// Times the world was compared against a fresh fold
    pub replay_checks: u64,

    /// Times the aggregate was compared against the oracle
    pub truth_checks: u64,

    pub scrubs: u64,
    pub restores: u64,
    pub fallbacks: u64,
    pub decode_errors: u64,

    /// Largest visible set seen in one frame
    pub max_visible: usize,
}

/// A run together with what it produced for export.
pub struct RecordedRun {
    pub result: ScenarioResult,
    pub export: SimExport,
    /// Final composited canvas
    pub image: Option<RgbaImage>,
}

/// Runs viewer scenarios.
#[derive(Debug, Clone)]
pub struct ScenarioRunner {
    seed: u64,
    outbreak: OutbreakConfig,
    viewer: ViewerConfig,
    timing: StreamTiming,
    max_duration_secs: f64,
    speed: f64,
    export_every: u64,
}

impl ScenarioRunner {
    /// Creates a new scenario runner over `entities` entities.
    pub fn new(seed: u64, entities: usize) -> Self {
        Self {
            seed,
            outbreak: OutbreakConfig {
                entities,
                ..OutbreakConfig::default()
            },
            viewer: ViewerConfig::default(),
            timing: StreamTiming::default(),
            max_duration_secs: 30.0,
            speed: 1.0,
            export_every: 10,
        }
    }

    /// Sets the maximum virtual duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    /// Sets the initial playback speed multiplier.
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_viewer_config(mut self, config: ViewerConfig) -> Self {
        self.viewer = config;
        self
    }

    pub fn with_canvas(mut self, width: u32, height: u32) -> Self {
        self.viewer.canvas_width = width;
        self.viewer.canvas_height = height;
        self
    }

    pub fn with_outbreak(mut self, config: OutbreakConfig) -> Self {
        self.outbreak = config;
        self
    }

    pub fn with_timing(mut self, timing: StreamTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.execute(scenario, &RerunLogger::disabled(), false).result
    }

    /// Runs a scenario, sampling frames for export and logging to Rerun.
    pub fn run_recorded(&self, scenario: ScenarioId, logger: &RerunLogger) -> RecordedRun {
        self.execute(scenario, logger, true)
    }

    fn execute(&self, scenario: ScenarioId, logger: &RerunLogger, record: bool) -> RecordedRun {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        let mut export = SimExport::new(scenario.name(), self.seed, self.outbreak.entities);

        let mut harness = match Harness::new(self, scenario) {
            Ok(harness) => harness,
            Err(e) => {
                warn!(error = %e, "scenario setup failed");
                let result = ScenarioResult {
                    scenario: scenario.name().to_string(),
                    seed: self.seed,
                    passed: false,
                    total_ticks: 0,
                    final_time_secs: 0.0,
                    final_state: PlaybackState::Idle,
                    steps_logged: 0,
                    failure_reason: Some(format!("setup failed: {}", e)),
                    metrics: ScenarioMetrics::default(),
                    summary: Summary::default(),
                };
                return RecordedRun {
                    result,
                    export,
                    image: None,
                };
            }
        };

        let outcome = harness.drive(logger, record.then_some(&mut export));
        let result = harness.finish(outcome);

        if result.passed {
            info!(
                "✓ {} complete: {} steps, {} frames drawn, {} truth checks",
                scenario.name(),
                result.steps_logged,
                result.metrics.frames_drawn,
                result.metrics.truth_checks
            );
        }
        export.finalize(result.passed, result.failure_reason.clone(), result.summary.clone());
        let image = record.then(|| harness.session.pipeline().composite());
        RecordedRun {
            result,
            export,
            image,
        }
    }
}

type SimSession = ViewerSession<SimStream, SimFetcher>;

/// One scenario's live objects.
struct Harness {
    scenario: ScenarioId,
    seed: u64,
    ctx: SimContext,
    rt: tokio::runtime::Runtime,
    oracle: Oracle,
    stream: Arc<SimStream>,
    fetcher: Arc<SimFetcher>,
    session: SimSession,
    driver_rng: ChaCha8Rng,
    frame_interval: Duration,
    max_ticks: u64,
    export_every: u64,
    metrics: ScenarioMetrics,
    ticks: u64,
    /// Index of the frame a fault was injected at
    fault_at: Option<usize>,
    /// FastForward: the rewind has happened
    replay_started: bool,
    /// TabSwitch: head when hidden, head when shown
    hidden_heads: Option<(Option<usize>, Option<usize>)>,
    hidden_while_open: bool,
}

impl Harness {
    fn new(runner: &ScenarioRunner, scenario: ScenarioId) -> Result<Self, SimError> {
        let ctx = SimContext::new(runner.seed);
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .map_err(|e| SimError::Runtime(e.to_string()))?;

        let mut oracle = Oracle::new(runner.seed.wrapping_mul(0x9e3779b97f4a7c15), runner.outbreak.clone())?;
        let mut script = oracle.script()?;
        let steps = oracle.steps_emitted();

        let mut faults = StreamFaults::default();
        let mut fault_at = None;
        match scenario {
            ScenarioId::BatchFallback => faults.refuse_open = true,
            ScenarioId::EarlyDrop => {
                faults.fail_at = Some(0);
                fault_at = Some(0);
            }
            ScenarioId::MidStreamOutage => {
                let k = (steps / 2).max(1);
                faults.fail_at = Some(k);
                fault_at = Some(k);
            }
            ScenarioId::CorruptFrame => {
                let k = (steps / 3).max(1);
                faults.corrupt_at = Some(k);
                fault_at = Some(k);
            }
            ScenarioId::SilentClose => faults.drop_terminal = true,
            ScenarioId::ServiceError => {
                if let Some(last) = script.last_mut() {
                    *last = serde_json::to_vec(&serde_json::json!({
                        "error": format!("model diverged after step {}", steps)
                    }))?;
                }
            }
            _ => {}
        }

        let fetcher = Arc::new(SimFetcher::new(oracle.snapshot_json()?, &script));
        let stream = Arc::new(SimStream::new(
            ctx.clone(),
            &script,
            runner.timing,
            faults,
            &mut ctx.fork_rng(JITTER_STREAM),
        ));

        let frame_interval = Duration::from_millis(runner.viewer.playback.min_frame_interval_ms.max(1));
        let max_ticks = (runner.max_duration_secs / frame_interval.as_secs_f64()).ceil() as u64;

        let mut session = SimSession::new(runner.viewer.clone(), stream.clone(), fetcher.clone())?;
        rt.block_on(session.load_graph())?;
        session.controller_mut().set_speed(runner.speed);

        let request = RunRequest {
            run_id: RunId::from_seed(runner.seed),
            params: serde_json::json!({ "scenario": scenario.name(), "seed": runner.seed }),
        };
        match rt.block_on(session.start_run(request, ctx.now())) {
            Ok(mode) => debug!(mode = ?mode, "run opened"),
            Err(e) => debug!(error = %e, "run failed to open"),
        }

        Ok(Self {
            scenario,
            seed: runner.seed,
            driver_rng: ctx.fork_rng(DRIVER_STREAM),
            ctx,
            rt,
            oracle,
            stream,
            fetcher,
            session,
            frame_interval,
            max_ticks,
            export_every: runner.export_every.max(1),
            metrics: ScenarioMetrics::default(),
            ticks: 0,
            fault_at,
            replay_started: false,
            hidden_heads: None,
            hidden_while_open: false,
        })
    }

    /// Runs ticks until the scenario completes or time runs out.
    fn drive(&mut self, logger: &RerunLogger, mut export: Option<&mut SimExport>) -> Result<(), String> {
        while self.ticks < self.max_ticks {
            self.ctx.advance_time(self.frame_interval);
            let now = self.ctx.now();
            self.ticks += 1;

            self.ingest(now);
            self.hook()?;
            let drawn = self.session.animation_frame(now);
            if let Some(stats) = drawn {
                self.metrics.max_visible = self.metrics.max_visible.max(stats.visible);
            }

            self.check_truth()?;
            if self.ticks % REPLAY_CHECK_EVERY == 0 {
                self.check_fold()?;
            }

            if logger.is_enabled() && drawn.is_some() {
                self.log_frame(logger);
            }
            if let Some(export) = export.as_deref_mut() {
                if self.ticks % self.export_every == 0 || self.complete() {
                    export.add_frame(self.sample(drawn));
                }
            }
            if self.ticks % 60 == 0 {
                let c = self.session.controller();
                debug!(
                    "  t={:.2}s | state={} | cursor={:?} | head={:?}",
                    now.as_secs_f64(),
                    c.state().name(),
                    c.cursor(),
                    c.head()
                );
            }
            if self.complete() {
                break;
            }
        }
        self.check_fold()
    }

    fn ingest(&mut self, now: Duration) {
        for item in self.stream.drain_due(now) {
            let outcome = match item {
                StreamItem::Frame(frame) => {
                    self.metrics.frames_delivered += 1;
                    self.session.handle_frame(&frame, now)
                }
                StreamItem::Failed(e) => self
                    .rt
                    .block_on(self.session.handle_transport_error(e, now))
                    .map(|_| ()),
                StreamItem::Closed => self
                    .rt
                    .block_on(self.session.handle_closed(now))
                    .map(|_| ()),
            };
            if let Err(e) = outcome {
                debug!(error = %e, "ingestion error");
            }
        }
    }

    /// Scenario-specific interaction before each frame.
    fn hook(&mut self) -> Result<(), String> {
        match self.scenario {
            ScenarioId::ScrubStorm => self.scrub_storm(),
            ScenarioId::FastForward => {
                let c = self.session.controller();
                if !self.replay_started && c.state() == PlaybackState::Finished {
                    let controller = self.session.controller_mut();
                    controller.scrub_to(0).map_err(|e| e.to_string())?;
                    controller.set_speed(f64::MAX);
                    controller.play().map_err(|e| e.to_string())?;
                    self.metrics.scrubs += 1;
                    self.replay_started = true;
                    info!("  ⏩ replaying from step 0 at {}x", self.session.controller().speed());
                    self.check_fold()?;
                }
                Ok(())
            }
            ScenarioId::TabSwitch => {
                if self.ticks == 10 {
                    self.hidden_while_open = self.session.controller().is_source_open();
                    self.hidden_heads = Some((self.session.controller().head(), None));
                    self.session.set_visible(false);
                    info!("  ⏸ view hidden");
                }
                if self.ticks == 40 {
                    if let Some((at_hide, _)) = self.hidden_heads {
                        self.hidden_heads = Some((at_hide, self.session.controller().head()));
                    }
                    self.session.set_visible(true);
                    info!("  ▶ view visible");
                }
                Ok(())
            }
            ScenarioId::ViewportChurn => {
                if self.ticks % 15 == 0 {
                    self.churn();
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn scrub_storm(&mut self) -> Result<(), String> {
        let open = self.session.controller().is_source_open();
        if !open {
            // Stream over: let replay run out to the head.
            let c = self.session.controller();
            let behind = c.cursor() != c.head();
            if c.state() == PlaybackState::Paused || (c.state() == PlaybackState::Finished && behind) {
                let controller = self.session.controller_mut();
                controller.set_speed(f64::MAX);
                controller.play().map_err(|e| e.to_string())?;
            }
            return Ok(());
        }
        if self.ticks % 20 != 0 {
            return Ok(());
        }
        let Some(head) = self.session.controller().head() else {
            return Ok(());
        };
        let action = self.driver_rng.gen_range(0..4u8);
        let controller = self.session.controller_mut();
        match action {
            0 | 1 => {
                let target = self.driver_rng.gen_range(0..=head + 2);
                let landed = controller.scrub_to(target).map_err(|e| e.to_string())?;
                if landed != target.min(head) {
                    return Err(format!("scrub to {} landed on {}", target, landed));
                }
                self.metrics.scrubs += 1;
                self.check_fold()?;
            }
            2 => {
                let speed = [0.5, 1.0, 4.0, 16.0][self.driver_rng.gen_range(0..4)];
                controller.set_speed(speed);
                controller.play().map_err(|e| e.to_string())?;
            }
            _ => {
                let _ = controller.pause();
            }
        }
        Ok(())
    }

    fn churn(&mut self) {
        let round = self.ticks / 15;
        let config = self.session.config().clone();
        let size = Vector2::new(config.canvas_width as f64, config.canvas_height as f64);
        match round % 5 {
            0 => {
                let anchor = Vector2::new(
                    self.driver_rng.gen_range(0.0..size.x),
                    self.driver_rng.gen_range(0.0..size.y),
                );
                let delta = if self.driver_rng.gen_bool(0.5) { -120.0 } else { 120.0 };
                self.session.scene_mut().wheel(anchor, delta);
            }
            1 => {
                let dx = self.driver_rng.gen_range(-80.0..80.0);
                let dy = self.driver_rng.gen_range(-80.0..80.0);
                self.session.scene_mut().drag(dx, dy);
            }
            2 => {
                let grow = if round % 2 == 0 { 40 } else { 0 };
                let _ = self
                    .session
                    .resize(config.canvas_width + grow, config.canvas_height + grow / 2);
            }
            3 => self.session.scene_mut().viewport_mut().zoom_in(),
            _ => {
                if let Some(id) = self.session.go_to_hotspot() {
                    debug!(entity = id, "jumped to hotspot");
                }
            }
        }
    }

    fn complete(&self) -> bool {
        let c = self.session.controller();
        let at_head = c.cursor() == c.head();
        match c.state() {
            PlaybackState::Errored => true,
            PlaybackState::Finished if at_head => match self.scenario {
                ScenarioId::FastForward => self.replay_started,
                ScenarioId::TabSwitch => self.ticks > 40,
                ScenarioId::ViewportChurn => self.ticks >= 75,
                _ => true,
            },
            _ => false,
        }
    }

    /// The world must equal a fresh fold of the log up to the cursor.
    fn check_fold(&mut self) -> Result<(), String> {
        let controller = self.session.controller();
        let mut replay = WorldState::new(controller.entity_ids());
        if let Some(cursor) = controller.cursor() {
            for (index, event) in controller.log().events()[..=cursor].iter().enumerate() {
                replay.apply_event(index, event).map_err(|e| e.to_string())?;
            }
        }
        self.metrics.replay_checks += 1;
        if &replay != controller.world() {
            return Err(format!(
                "world at step {:?} differs from a replay of its prefix",
                controller.cursor()
            ));
        }
        Ok(())
    }

    /// The shown aggregate must match what the oracle recorded for that step.
    fn check_truth(&mut self) -> Result<(), String> {
        let controller = self.session.controller();
        let Some(cursor) = controller.cursor() else {
            return Ok(());
        };
        let shown = controller.world().aggregate();
        match self.oracle.truth_at(cursor) {
            Some(truth) if truth == shown => {
                self.metrics.truth_checks += 1;
                Ok(())
            }
            Some(truth) => Err(format!(
                "step {}: viewer shows {:?}, oracle has {:?}",
                cursor, shown, truth
            )),
            None => Err(format!("step {} is beyond the oracle script", cursor)),
        }
    }

    /// End-of-run assertions for the scenario.
    fn verify(&self) -> Result<(), String> {
        let c = self.session.controller();
        let report = self.session.report();
        let steps = self.oracle.steps_emitted();
        let logged = c.log().len();

        let expected = if self.scenario.expects_error() {
            PlaybackState::Errored
        } else {
            PlaybackState::Finished
        };
        if !self.complete() || c.state() != expected {
            return Err(format!(
                "ended in {} after {} ticks, expected {} at the head",
                c.state().name(),
                self.ticks,
                expected.name()
            ));
        }

        match self.scenario {
            ScenarioId::LiveStream => {
                ensure(report.mode == IngestMode::Stream, "live run left stream mode")?;
                ensure(logged == steps, format!("logged {} of {} steps", logged, steps))?;
                ensure(self.fetcher.batch_fetches() == 0, "batch endpoint used on a healthy stream")?;
                let skipped = self.session.scene().network().skipped_edges();
                let dangling = self.oracle.config().dangling_links;
                ensure(
                    skipped == dangling,
                    format!("skipped {} edges, {} were dangling", skipped, dangling),
                )?;
                for entity in self.oracle.entities() {
                    if c.world().status(entity.id) != self.oracle.status(entity.id) {
                        return Err(format!("entity {} disagrees with the oracle", entity.id));
                    }
                }
                Ok(())
            }
            ScenarioId::BatchFallback | ScenarioId::EarlyDrop => {
                ensure(report.mode == IngestMode::Batch, "run did not fall back to batch")?;
                ensure(report.ingest.fallbacks == 1, "expected exactly one fallback")?;
                ensure(logged == steps, format!("batch logged {} of {} steps", logged, steps))
            }
            ScenarioId::MidStreamOutage | ScenarioId::CorruptFrame => {
                let fault = self.fault_at.unwrap_or_default();
                ensure(
                    logged == fault,
                    format!("logged {} steps, fault was at frame {}", logged, fault),
                )?;
                if self.scenario == ScenarioId::CorruptFrame {
                    ensure(report.ingest.decode_errors == 1, "corrupt frame not counted")?;
                }
                ensure(self.stream.is_closed(), "stream left open after failure")
            }
            ScenarioId::ServiceError => {
                let error = report.error.unwrap_or_default();
                ensure(error.contains("diverged"), format!("unexpected error text: {}", error))?;
                ensure(logged == steps, format!("logged {} of {} steps", logged, steps))
            }
            ScenarioId::SilentClose => {
                ensure(logged == steps, format!("logged {} of {} steps", logged, steps))
            }
            ScenarioId::ScrubStorm => {
                ensure(self.metrics.scrubs > 0 || steps < 3, "no scrubs happened")?;
                ensure(logged == steps, format!("logged {} of {} steps", logged, steps))
            }
            ScenarioId::FastForward => {
                ensure(self.replay_started, "replay never started")?;
                ensure(
                    report.playback.folded as usize >= 2 * logged,
                    "replay did not refold the log",
                )
            }
            ScenarioId::TabSwitch => {
                ensure(
                    self.metrics.frames_drawn < self.ticks,
                    "frames were drawn while hidden",
                )?;
                if let Some((at_hide, at_show)) = self.hidden_heads {
                    if self.hidden_while_open && at_show.is_some() {
                        ensure(at_show > at_hide, "ingestion stalled while hidden")?;
                    }
                }
                Ok(())
            }
            ScenarioId::ViewportChurn => ensure(
                self.metrics.base_redraws > 2,
                format!("only {} base redraws under churn", self.metrics.base_redraws),
            ),
        }
    }

    /// Collects the session counters, runs the assertions, builds the result.
    fn finish(&mut self, outcome: Result<(), String>) -> ScenarioResult {
        let report = self.session.report();
        self.metrics.frames_drawn = report.render.frames;
        self.metrics.base_redraws = report.render.base_redraws;
        self.metrics.heat_redraws = report.render.heat_redraws;
        self.metrics.restores = report.playback.restores;
        self.metrics.fallbacks = report.ingest.fallbacks;
        self.metrics.decode_errors = report.ingest.decode_errors;

        let verdict = outcome.and_then(|()| self.verify());

        ScenarioResult {
            scenario: self.scenario.name().to_string(),
            seed: self.seed,
            passed: verdict.is_ok(),
            total_ticks: self.ticks,
            final_time_secs: self.ctx.now().as_secs_f64(),
            final_state: report.state,
            steps_logged: report.head.map_or(0, |h| h + 1),
            failure_reason: verdict.err(),
            metrics: self.metrics.clone(),
            summary: report.summary,
        }
    }

    fn sample(&self, drawn: Option<FrameStats>) -> SimFrame {
        let c = self.session.controller();
        SimFrame {
            time_sec: self.ctx.now().as_secs_f64(),
            state: c.state(),
            cursor: c.cursor(),
            head: c.head(),
            counts: c.world().aggregate(),
            render: drawn,
        }
    }

    fn log_frame(&self, logger: &RerunLogger) {
        let scene = self.session.scene();
        let world = self.session.controller().world();
        let style = self.session.pipeline().style();
        let points: Vec<_> = scene
            .network()
            .entities()
            .iter()
            .enumerate()
            .filter_map(|(idx, entity)| {
                let status = world.status(entity.id)?;
                Some((scene.screen_position(idx)?, style.color(status)))
            })
            .collect();
        logger.set_time(self.session.pipeline().frame(), self.ctx.now().as_secs_f64());
        logger.log_entities(&points);
        logger.log_counts(&world.aggregate());
    }
}

fn ensure(condition: bool, message: impl Into<String>) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(seed: u64) -> ScenarioRunner {
        ScenarioRunner::new(seed, 150)
            .with_canvas(160, 120)
            .with_duration(40.0)
    }

    #[test]
    fn test_live_stream_scenario() {
        let result = runner(42).run(ScenarioId::LiveStream);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.final_state, PlaybackState::Finished);
        assert!(result.metrics.truth_checks > 0);
        assert!(result.metrics.replay_checks > 0);
        assert_eq!(result.summary.population, 150);
    }

    #[test]
    fn test_fallback_scenarios() {
        for scenario in [ScenarioId::BatchFallback, ScenarioId::EarlyDrop] {
            let result = runner(7).run(scenario);
            assert!(result.passed, "{}: {:?}", scenario, result.failure_reason);
            assert_eq!(result.metrics.fallbacks, 1);
        }
    }

    #[test]
    fn test_failure_scenarios_end_errored() {
        for scenario in [
            ScenarioId::MidStreamOutage,
            ScenarioId::CorruptFrame,
            ScenarioId::ServiceError,
            ScenarioId::SilentClose,
        ] {
            let result = runner(9).run(scenario);
            assert!(result.passed, "{}: {:?}", scenario, result.failure_reason);
            assert_eq!(result.final_state, PlaybackState::Errored);
        }
    }

    #[test]
    fn test_scrub_storm_scenario() {
        let result = runner(3).run(ScenarioId::ScrubStorm);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.replay_checks > result.metrics.scrubs);
    }

    #[test]
    fn test_fast_forward_scenario() {
        let result = runner(5).run(ScenarioId::FastForward);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.scrubs >= 1);
    }

    #[test]
    fn test_tab_switch_and_churn() {
        let result = runner(11).run(ScenarioId::TabSwitch);
        assert!(result.passed, "{:?}", result.failure_reason);

        let result = runner(11).run(ScenarioId::ViewportChurn);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.max_visible > 0);
    }

    #[test]
    fn test_runs_are_deterministic() {
        let a = runner(21).run(ScenarioId::ScrubStorm);
        let b = runner(21).run(ScenarioId::ScrubStorm);
        assert_eq!(a.metrics, b.metrics);
        assert_eq!(a.total_ticks, b.total_ticks);
        assert_eq!(a.summary, b.summary);
    }

    #[test]
    fn test_recorded_run_exports_frames_and_image() {
        let run = runner(42)
            .run_recorded(ScenarioId::LiveStream, &RerunLogger::disabled());
        assert!(run.result.passed);
        assert!(!run.export.frames.is_empty());
        let image = run.image.unwrap();
        assert_eq!((image.width(), image.height()), (160, 120));
    }

    #[test]
    fn test_bad_outbreak_config_fails_cleanly() {
        let result = runner(1)
            .with_outbreak(OutbreakConfig {
                entities: 0,
                ..OutbreakConfig::default()
            })
            .run(ScenarioId::LiveStream);
        assert!(!result.passed);
        assert!(result.failure_reason.unwrap().contains("setup failed"));
    }

    #[tokio::test]
    async fn test_async_loop_on_virtual_clock() {
        let ctx = SimContext::new(8);
        let config = OutbreakConfig {
            entities: 80,
            ..OutbreakConfig::default()
        };
        let mut oracle = Oracle::new(8, config).unwrap();
        let script = oracle.script().unwrap();
        let fetcher = Arc::new(SimFetcher::new(oracle.snapshot_json().unwrap(), &script));
        let stream = Arc::new(SimStream::new(
            ctx.clone(),
            &script,
            StreamTiming::default(),
            StreamFaults::default(),
            &mut ctx.fork_rng(JITTER_STREAM),
        ));

        let viewer = ViewerConfig {
            canvas_width: 120,
            canvas_height: 90,
            ..ViewerConfig::default()
        };
        let mut session = SimSession::new(viewer, stream.clone(), fetcher).unwrap();
        session.load_graph().await.unwrap();
        session
            .start_run(RunRequest::new(serde_json::Value::Null), ctx.now())
            .await
            .unwrap();

        let report = session.run(&ctx, Duration::from_secs(120)).await;
        assert_eq!(report.state, PlaybackState::Finished);
        assert_eq!(report.head, Some(oracle.steps_emitted() - 1));
        assert_eq!(
            Some(report.counts),
            oracle.truth_at(oracle.steps_emitted() - 1)
        );
        assert!(ctx.now() > Duration::ZERO);
    }
}
