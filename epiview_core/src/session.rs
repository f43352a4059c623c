//! ViewerSession - one cooperative loop around the whole engine.
//!
//! ```text
//!             ┌──────────────── tokio::select! ────────────────┐
//!             │                                                │
//!   transport.recv() ──▶ IngestionAdapter ──▶ PlaybackController ──▶ WorldState
//!             │                                                │        │
//!   frame deadline ──▶ tick (replay) + publish ──▶ RenderPipeline.draw ◀┘
//!             └────────────────────────────────────────────────┘
//! ```
//!
//! Both arms run on the same task. Receiving never waits for a draw and a
//! draw always reads the latest fold; nothing is shared across threads.

use crate::config::ViewerConfig;
use crate::epiview_world::StatusCounts;
use crate::error::CoreError;
use crate::graph::EntityId;
use crate::ingest::{IngestMode, IngestStats, IngestionAdapter};
use crate::playback::{PlaybackController, PlaybackState, PlaybackStats};
use crate::render::{FrameStats, RasterSurface, RenderPipeline, RenderStats, Surface};
use crate::scene::Scene;
use crate::stats::{StatisticsTracker, Summary};
use epiview_env::{BatchFetcher, EnvError, EpiViewContext, Frame, RunRequest, StreamTransport};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// End-of-run snapshot of every counter in the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub state: PlaybackState,
    pub cursor: Option<usize>,
    pub head: Option<usize>,
    pub counts: StatusCounts,
    pub summary: Summary,
    pub playback: PlaybackStats,
    pub ingest: IngestStats,
    pub render: RenderStats,
    pub mode: IngestMode,
    pub error: Option<String>,
}

/// The viewer: scene, renderer, playback and ingestion wired together.
pub struct ViewerSession<T: StreamTransport, F: BatchFetcher, S: Surface = RasterSurface> {
    config: ViewerConfig,
    scene: Scene,
    pipeline: RenderPipeline<S>,
    controller: PlaybackController<StatisticsTracker>,
    ingest: IngestionAdapter<T, F>,
    request: Option<RunRequest>,
    last_frame: Option<Duration>,
}

impl<T: StreamTransport, F: BatchFetcher, S: Surface> ViewerSession<T, F, S> {
    /// Fails when `config` does not pass [`ViewerConfig::validate`].
    pub fn new(config: ViewerConfig, transport: Arc<T>, fetcher: Arc<F>) -> Result<Self, CoreError> {
        config.validate()?;
        let scene = Scene::new(config.canvas_size(), config.viewport.clone(), config.index);
        let pipeline = RenderPipeline::new(config.render.clone(), config.canvas_width, config.canvas_height);
        let controller = PlaybackController::new(config.playback.clone(), StatisticsTracker::default());
        Ok(Self {
            config,
            scene,
            pipeline,
            controller,
            ingest: IngestionAdapter::new(transport, fetcher),
            request: None,
            last_frame: None,
        })
    }

    /// Fetches the graph snapshot and lays it out. Any previous run is stopped.
    pub async fn load_graph(&mut self) -> Result<(), CoreError> {
        let snapshot = self.ingest.load_graph().await?;
        self.stop();
        self.scene.load(&snapshot)?;
        Ok(())
    }

    /// Starts a run: resets the world and opens the stream (or the batch fallback).
    pub async fn start_run(&mut self, request: RunRequest, now: Duration) -> Result<IngestMode, CoreError> {
        if self.controller.is_source_open() {
            self.ingest.close();
        }
        let ids: Vec<EntityId> = self.scene.network().entity_ids();
        self.controller.begin_run(&ids);
        info!(run = %request.run_id, entities = ids.len(), "run started");
        let result = self.ingest.open(&request, &mut self.controller, now).await;
        self.request = Some(request);
        result
    }

    pub fn handle_frame(&mut self, frame: &Frame, now: Duration) -> Result<(), CoreError> {
        self.ingest.handle_frame(frame, &mut self.controller, now)
    }

    pub async fn handle_transport_error(&mut self, error: EnvError, now: Duration) -> Result<IngestMode, CoreError> {
        let Some(request) = self.request.clone() else {
            self.controller.fail(error.to_string(), now);
            return Err(error.into());
        };
        self.ingest
            .handle_transport_error(error, &request, &mut self.controller, now)
            .await
    }

    pub async fn handle_closed(&mut self, now: Duration) -> Result<IngestMode, CoreError> {
        let Some(request) = self.request.clone() else {
            return Ok(self.ingest.mode());
        };
        self.ingest
            .handle_closed(&request, &mut self.controller, now)
            .await
    }

    /// One display frame: advance replay, flush due history, draw.
    pub fn animation_frame(&mut self, now: Duration) -> Option<FrameStats> {
        if !self.pipeline.is_active() {
            return None;
        }
        let elapsed = self
            .last_frame
            .map_or(Duration::ZERO, |at| now.saturating_sub(at));
        self.last_frame = Some(now);

        if let Err(e) = self.controller.tick(elapsed) {
            warn!(error = %e, "replay tick failed");
        }
        self.controller.publish(now, false);
        self.pipeline.draw(&self.scene, self.controller.world())
    }

    /// Tab visibility. Hidden views stop drawing; on return the replay clock
    /// restarts from the next frame instead of catching up.
    pub fn set_visible(&mut self, visible: bool) {
        if visible && !self.pipeline.is_active() {
            self.last_frame = None;
        }
        self.pipeline.set_active(visible);
    }

    /// Stops the run and closes the live source.
    pub fn stop(&mut self) {
        if self.controller.stop() {
            self.ingest.close();
        }
        self.request = None;
    }

    pub fn resize(&mut self, width: u32, height: u32) -> bool {
        self.config.canvas_width = width;
        self.config.canvas_height = height;
        self.scene
            .resize(Vector2::new(f64::from(width), f64::from(height)))
    }

    pub fn go_to_hotspot(&mut self) -> Option<EntityId> {
        self.pipeline
            .go_to_hotspot(&mut self.scene, self.controller.world())
    }

    /// Runs the receive/draw loop until the run ends or `max_duration` passes.
    ///
    /// Frames are paced by a deadline that only moves when a frame is drawn.
    /// Missed deadlines are skipped, not replayed.
    ///
    /// Errors inside the loop are logged and reflected in the playback state;
    /// the loop itself keeps drawing.
    pub async fn run<C: EpiViewContext>(&mut self, ctx: &C, max_duration: Duration) -> SessionReport {
        let frame_interval = Duration::from_millis(self.config.playback.min_frame_interval_ms.max(1));
        let transport = self.ingest.transport().clone();
        let start = ctx.now();
        let mut next_frame = start;
        let mut live = self.is_live();

        loop {
            let now = ctx.now();
            if now.saturating_sub(start) >= max_duration {
                debug!("session time budget spent");
                break;
            }
            if !live && self.is_settled() {
                self.animation_frame(now);
                break;
            }
            if now >= next_frame {
                self.animation_frame(now);
                next_frame = now + frame_interval;
            }

            let wait = next_frame.saturating_sub(ctx.now());
            tokio::select! {
                biased;
                received = transport.recv(), if live => {
                    let now = ctx.now();
                    let outcome = match received {
                        Some(Ok(frame)) => self.handle_frame(&frame, now),
                        Some(Err(e)) => self.handle_transport_error(e, now).await.map(|_| ()),
                        None => self.handle_closed(now).await.map(|_| ()),
                    };
                    if let Err(e) = outcome {
                        warn!(error = %e, "ingestion error");
                    }
                    live = self.is_live();
                }
                _ = ctx.sleep(wait) => {}
            }
        }

        let report = self.report();
        info!(
            state = report.state.name(),
            steps = report.head.map_or(0, |h| h + 1),
            frames = report.render.frames,
            "session loop finished"
        );
        report
    }

    fn is_live(&self) -> bool {
        self.ingest.mode() == IngestMode::Stream && self.controller.is_source_open()
    }

    fn is_settled(&self) -> bool {
        matches!(
            self.controller.state(),
            PlaybackState::Finished | PlaybackState::Errored | PlaybackState::Idle
        )
    }

    pub fn report(&self) -> SessionReport {
        SessionReport {
            state: self.controller.state(),
            cursor: self.controller.cursor(),
            head: self.controller.head(),
            counts: self.controller.world().aggregate(),
            summary: self.controller.observer().summary(),
            playback: self.controller.stats(),
            ingest: self.ingest.stats(),
            render: self.pipeline.stats(),
            mode: self.ingest.mode(),
            error: self.controller.error().map(str::to_string),
        }
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn pipeline(&self) -> &RenderPipeline<S> {
        &self.pipeline
    }

    pub fn controller(&self) -> &PlaybackController<StatisticsTracker> {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut PlaybackController<StatisticsTracker> {
        &mut self.controller
    }

    pub fn statistics(&self) -> &StatisticsTracker {
        self.controller.observer()
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RecordingSurface;
    use async_trait::async_trait;
    use epiview_env::{ChannelTransport, TokioContext};

    struct GridFetcher;

    #[async_trait]
    impl BatchFetcher for GridFetcher {
        async fn fetch_graph(&self) -> Result<Vec<u8>, EnvError> {
            let nodes: Vec<_> = (0..9u32)
                .map(|id| serde_json::json!({"id": id, "x": id % 3, "y": id / 3, "zone": id % 2}))
                .collect();
            let links: Vec<_> = (0..8u32)
                .map(|id| serde_json::json!({"source": id, "target": id + 1}))
                .collect();
            Ok(serde_json::to_vec(&serde_json::json!({"nodes": nodes, "links": links})).unwrap_or_default())
        }

        async fn fetch_batch(&self, _request: &RunRequest) -> Result<Vec<u8>, EnvError> {
            Ok(br#"[{"new_infected":[4]},{"new_recovered":[4]},{"done":true}]"#.to_vec())
        }
    }

    type TestSession = ViewerSession<ChannelTransport, GridFetcher, RecordingSurface>;

    fn config() -> ViewerConfig {
        ViewerConfig {
            canvas_width: 300,
            canvas_height: 300,
            ..ViewerConfig::default()
        }
    }

    async fn session() -> (TestSession, epiview_env::StreamFeed) {
        let (transport, feed) = ChannelTransport::new();
        let mut session = TestSession::new(config(), Arc::new(transport), Arc::new(GridFetcher)).unwrap();
        session.load_graph().await.unwrap();
        (session, feed)
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut bad = config();
        bad.viewport.min_scale = 4.0;
        bad.viewport.max_scale = 1.0;
        let (transport, _feed) = ChannelTransport::new();
        let result = TestSession::new(bad, Arc::new(transport), Arc::new(GridFetcher));
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[tokio::test]
    async fn test_frames_and_animation() {
        let (mut session, _feed) = session().await;
        let mode = session
            .start_run(RunRequest::new(serde_json::Value::Null), ms(0))
            .await
            .unwrap();
        assert_eq!(mode, IngestMode::Stream);

        session
            .handle_frame(&Frame::new(br#"{"infected":[4]}"#.to_vec(), 0), ms(1))
            .unwrap();
        let stats = session.animation_frame(ms(16)).unwrap();
        assert_eq!(stats.visible, 9);
        assert_eq!(stats.active_edges, 2);
        assert_eq!(session.go_to_hotspot(), Some(4));

        session
            .handle_frame(&Frame::new(br#"{"done":true}"#.to_vec(), 1), ms(20))
            .unwrap();
        let report = session.report();
        assert_eq!(report.state, PlaybackState::Finished);
        assert_eq!(report.summary.peak_infected, 1);
    }

    #[tokio::test]
    async fn test_hidden_view_does_not_draw() {
        let (mut session, _feed) = session().await;
        session
            .start_run(RunRequest::new(serde_json::Value::Null), ms(0))
            .await
            .unwrap();
        session.animation_frame(ms(0)).unwrap();

        session.set_visible(false);
        assert!(session.animation_frame(ms(16)).is_none());
        session.set_visible(true);
        let stats = session.animation_frame(ms(5000)).unwrap();
        assert_eq!(stats.frame, 1);
    }

    #[tokio::test]
    async fn test_stop_closes_stream() {
        let (mut session, feed) = session().await;
        session
            .start_run(RunRequest::new(serde_json::Value::Null), ms(0))
            .await
            .unwrap();
        session.stop();
        assert_eq!(session.controller().state(), PlaybackState::Idle);
        assert!(feed.send("{}").is_err());
    }

    #[tokio::test]
    async fn test_run_loop_with_live_stream() {
        let (mut session, feed) = session().await;
        session
            .start_run(RunRequest::new(serde_json::Value::Null), ms(0))
            .await
            .unwrap();

        tokio::spawn(async move {
            for id in 0..9u32 {
                let _ = feed.send(format!(r#"{{"new_infected":[{}]}}"#, id));
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            let _ = feed.send(r#"{"done":true}"#);
        });

        let ctx = TokioContext::new();
        let report = session.run(&ctx, Duration::from_secs(5)).await;

        assert_eq!(report.state, PlaybackState::Finished);
        assert_eq!(report.head, Some(8));
        assert_eq!(report.cursor, Some(8));
        assert_eq!(report.counts.infected, 9);
        assert_eq!(report.summary.steps, 9);
        assert!(report.render.frames >= 1);
    }

    #[tokio::test]
    async fn test_steady_stream_keeps_frame_rate() {
        let (mut session, feed) = session().await;
        session
            .start_run(RunRequest::new(serde_json::Value::Null), ms(0))
            .await
            .unwrap();

        // One event every 5 ms, well inside the 16 ms frame interval.
        tokio::spawn(async move {
            for k in 0..60u32 {
                let _ = feed.send(format!(r#"{{"new_infected":[{}]}}"#, k % 9));
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let _ = feed.send(r#"{"done":true}"#);
        });

        let started = tokio::time::Instant::now();
        let report = session.run(&TokioContext::new(), Duration::from_secs(10)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        assert_eq!(report.state, PlaybackState::Finished);
        assert_eq!(report.head, Some(59));
        // At least half the frames a 16 ms cadence allows.
        let expected = elapsed_ms / 16;
        assert!(
            report.render.frames * 2 >= expected,
            "{} frames in {} ms",
            report.render.frames,
            elapsed_ms
        );
        assert!(report.render.frames > 5);
    }

    #[tokio::test]
    async fn test_run_loop_batch_fallback() {
        let (transport, _feed) = ChannelTransport::new();
        transport.close();
        let mut session = TestSession::new(config(), Arc::new(transport), Arc::new(GridFetcher)).unwrap();
        session.load_graph().await.unwrap();
        let mode = session
            .start_run(RunRequest::new(serde_json::Value::Null), ms(0))
            .await
            .unwrap();
        assert_eq!(mode, IngestMode::Batch);

        let report = session.run(&TokioContext::new(), Duration::from_secs(1)).await;
        assert_eq!(report.state, PlaybackState::Finished);
        assert_eq!(report.counts.recovered, 1);
        assert_eq!(report.render.frames, 1);
    }
}
