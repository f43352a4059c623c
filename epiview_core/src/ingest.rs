//! IngestionAdapter - transport frames in, playback messages out.
//!
//! ```text
//!   StreamTransport ──frame──▶ decode_message ──▶ PlaybackController::append
//!         │
//!         └─ open fails, or fails before the first event
//!                │
//!                ▼
//!   BatchFetcher::fetch_batch ──▶ decode_batch ──▶ PlaybackController::load_batch
//! ```

use crate::error::CoreError;
use crate::event::{decode_batch, decode_message, StreamMessage};
use crate::graph::GraphSnapshot;
use crate::playback::{HistoryObserver, PlaybackController};
use epiview_env::{BatchFetcher, EnvError, Frame, RunRequest, StreamTransport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How the current run is being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestMode {
    /// Nothing opened yet
    Idle,
    /// Server push, frame by frame
    Stream,
    /// One batch response holding the whole run
    Batch,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub frames: u64,
    pub bytes: u64,
    pub decode_errors: u64,
    pub transport_errors: u64,
    pub fallbacks: u64,
}

/// Decodes transport traffic and feeds the playback controller.
pub struct IngestionAdapter<T: StreamTransport, F: BatchFetcher> {
    transport: Arc<T>,
    fetcher: Arc<F>,
    mode: IngestMode,
    stats: IngestStats,
}

impl<T: StreamTransport, F: BatchFetcher> IngestionAdapter<T, F> {
    pub fn new(transport: Arc<T>, fetcher: Arc<F>) -> Self {
        Self {
            transport,
            fetcher,
            mode: IngestMode::Idle,
            stats: IngestStats::default(),
        }
    }

    /// Fetches and decodes the graph snapshot.
    pub async fn load_graph(&self) -> Result<GraphSnapshot, CoreError> {
        let bytes = self.fetcher.fetch_graph().await?;
        GraphSnapshot::from_json(&bytes)
    }

    /// Opens the push channel, falling back to the batch endpoint when it
    /// cannot be established.
    pub async fn open<O: HistoryObserver>(
        &mut self,
        request: &RunRequest,
        controller: &mut PlaybackController<O>,
        now: Duration,
    ) -> Result<IngestMode, CoreError> {
        match self.transport.open(request).await {
            Ok(()) => {
                info!(run = %request.run_id, "stream opened");
                self.mode = IngestMode::Stream;
                Ok(self.mode)
            }
            Err(e) => {
                self.stats.transport_errors += 1;
                warn!(run = %request.run_id, error = %e, "stream unavailable, using batch");
                self.fallback(request, controller, now).await
            }
        }
    }

    async fn fallback<O: HistoryObserver>(
        &mut self,
        request: &RunRequest,
        controller: &mut PlaybackController<O>,
        now: Duration,
    ) -> Result<IngestMode, CoreError> {
        self.stats.fallbacks += 1;
        self.mode = IngestMode::Batch;

        let messages = match self.fetch_batch(request).await {
            Ok(messages) => messages,
            Err(e) => {
                controller.fail(e.to_string(), now);
                return Err(e);
            }
        };
        controller.load_batch(messages, now)?;
        Ok(self.mode)
    }

    async fn fetch_batch(&mut self, request: &RunRequest) -> Result<Vec<StreamMessage>, CoreError> {
        let bytes = self.fetcher.fetch_batch(request).await?;
        self.stats.bytes += bytes.len() as u64;
        decode_batch(&bytes).map_err(|e| {
            self.stats.decode_errors += 1;
            e
        })
    }

    /// Decodes one frame and hands it to the controller.
    pub fn handle_frame<O: HistoryObserver>(
        &mut self,
        frame: &Frame,
        controller: &mut PlaybackController<O>,
        now: Duration,
    ) -> Result<(), CoreError> {
        self.stats.frames += 1;
        self.stats.bytes += frame.size() as u64;
        let message = match decode_message(&frame.payload) {
            Ok(message) => message,
            Err(e) => {
                self.stats.decode_errors += 1;
                warn!(seq = frame.seq, error = %e, "undecodable frame discarded");
                controller.fail(e.to_string(), now);
                self.transport.close();
                return Err(e);
            }
        };
        let terminal = message.is_terminal();
        let result = controller.append(message, now);
        if terminal || result.is_err() {
            self.transport.close();
        }
        result
    }

    /// Transport failure. Before the first event this falls back to the
    /// batch endpoint; afterwards the run is failed.
    pub async fn handle_transport_error<O: HistoryObserver>(
        &mut self,
        error: EnvError,
        request: &RunRequest,
        controller: &mut PlaybackController<O>,
        now: Duration,
    ) -> Result<IngestMode, CoreError> {
        self.stats.transport_errors += 1;
        self.transport.close();
        if controller.log().is_empty() && controller.is_source_open() {
            warn!(error = %error, "stream failed before the first event, using batch");
            return self.fallback(request, controller, now).await;
        }
        controller.fail(error.to_string(), now);
        Err(error.into())
    }

    /// The channel closed without a terminal message.
    pub async fn handle_closed<O: HistoryObserver>(
        &mut self,
        request: &RunRequest,
        controller: &mut PlaybackController<O>,
        now: Duration,
    ) -> Result<IngestMode, CoreError> {
        if !controller.is_source_open() {
            return Ok(self.mode);
        }
        self.handle_transport_error(
            EnvError::transport("stream closed without a terminal message"),
            request,
            controller,
            now,
        )
        .await
    }

    /// Closes the push channel.
    pub fn close(&self) {
        self.transport.close();
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn mode(&self) -> IngestMode {
        self.mode
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::{PlaybackConfig, PlaybackState};
    use async_trait::async_trait;
    use epiview_env::ChannelTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fetcher serving fixed bodies.
    struct FixedFetcher {
        graph: Vec<u8>,
        batch: Result<Vec<u8>, String>,
        batch_calls: AtomicUsize,
    }

    impl FixedFetcher {
        fn new(batch: Result<&str, &str>) -> Self {
            Self {
                graph: br#"{"nodes":[{"id":0,"x":0,"y":0},{"id":1,"x":1,"y":1}],"links":[{"source":0,"target":1}]}"#
                    .to_vec(),
                batch: batch.map(|b| b.as_bytes().to_vec()).map_err(String::from),
                batch_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BatchFetcher for FixedFetcher {
        async fn fetch_graph(&self) -> Result<Vec<u8>, EnvError> {
            Ok(self.graph.clone())
        }

        async fn fetch_batch(&self, _request: &RunRequest) -> Result<Vec<u8>, EnvError> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            self.batch.clone().map_err(EnvError::fetch)
        }
    }

    fn controller() -> PlaybackController {
        let mut c = PlaybackController::without_observer(PlaybackConfig::default());
        c.begin_run(&[0, 1]);
        c
    }

    const BATCH: &str = r#"[{"new_infected":[0]},{"new_infected":[1],"new_recovered":[0]},{"done":true}]"#;

    #[tokio::test]
    async fn test_load_graph() {
        let (transport, _feed) = ChannelTransport::new();
        let adapter = IngestionAdapter::new(Arc::new(transport), Arc::new(FixedFetcher::new(Ok(BATCH))));
        let snapshot = adapter.load_graph().await.unwrap();
        assert_eq!(snapshot.nodes.len(), 2);
    }

    #[tokio::test]
    async fn test_stream_frames_reach_controller() {
        let (transport, feed) = ChannelTransport::new();
        let transport = Arc::new(transport);
        let mut adapter = IngestionAdapter::new(transport.clone(), Arc::new(FixedFetcher::new(Ok(BATCH))));
        let mut c = controller();
        let request = RunRequest::new(serde_json::Value::Null);

        assert_eq!(adapter.open(&request, &mut c, Duration::ZERO).await.unwrap(), IngestMode::Stream);
        feed.send(r#"{"infected":[0]}"#).unwrap();
        feed.send(r#"{"done":true}"#).unwrap();

        while let Some(frame) = transport.recv().await {
            adapter.handle_frame(&frame.unwrap(), &mut c, Duration::ZERO).unwrap();
        }
        assert_eq!(c.state(), PlaybackState::Finished);
        assert_eq!(c.cursor(), Some(0));
        assert!(!transport.is_open());
        assert_eq!(adapter.stats().frames, 2);
    }

    #[tokio::test]
    async fn test_open_failure_falls_back_to_batch() {
        let (transport, _feed) = ChannelTransport::new();
        transport.close();
        let fetcher = Arc::new(FixedFetcher::new(Ok(BATCH)));
        let mut adapter = IngestionAdapter::new(Arc::new(transport), fetcher.clone());
        let mut c = controller();
        let request = RunRequest::new(serde_json::Value::Null);

        let mode = adapter.open(&request, &mut c, Duration::ZERO).await.unwrap();
        assert_eq!(mode, IngestMode::Batch);
        assert_eq!(c.state(), PlaybackState::Finished);
        assert_eq!(c.cursor(), Some(1));
        assert_eq!(fetcher.batch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_before_first_event_falls_back() {
        let (transport, _feed) = ChannelTransport::new();
        let mut adapter = IngestionAdapter::new(Arc::new(transport), Arc::new(FixedFetcher::new(Ok(BATCH))));
        let mut c = controller();
        let request = RunRequest::new(serde_json::Value::Null);
        adapter.open(&request, &mut c, Duration::ZERO).await.unwrap();

        let mode = adapter
            .handle_transport_error(EnvError::transport("reset"), &request, &mut c, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(mode, IngestMode::Batch);
        assert_eq!(c.state(), PlaybackState::Finished);
        assert_eq!(adapter.stats().fallbacks, 1);
    }

    #[tokio::test]
    async fn test_failure_after_events_errors() {
        let (transport, _feed) = ChannelTransport::new();
        let mut adapter = IngestionAdapter::new(Arc::new(transport), Arc::new(FixedFetcher::new(Ok(BATCH))));
        let mut c = controller();
        let request = RunRequest::new(serde_json::Value::Null);
        adapter.open(&request, &mut c, Duration::ZERO).await.unwrap();
        adapter
            .handle_frame(&Frame::new(br#"{"new_infected":[0]}"#.to_vec(), 0), &mut c, Duration::ZERO)
            .unwrap();

        let result = adapter
            .handle_transport_error(EnvError::transport("reset"), &request, &mut c, Duration::ZERO)
            .await;
        assert!(result.is_err());
        assert_eq!(c.state(), PlaybackState::Errored);
        assert_eq!(c.cursor(), Some(0));
    }

    #[tokio::test]
    async fn test_both_paths_failing_leaves_world_reset() {
        let (transport, _feed) = ChannelTransport::new();
        transport.close();
        let mut adapter =
            IngestionAdapter::new(Arc::new(transport), Arc::new(FixedFetcher::new(Err("503"))));
        let mut c = controller();
        let request = RunRequest::new(serde_json::Value::Null);

        assert!(adapter.open(&request, &mut c, Duration::ZERO).await.is_err());
        assert_eq!(c.state(), PlaybackState::Errored);
        assert_eq!(c.cursor(), None);
        assert_eq!(c.world().aggregate().susceptible, 2);
    }

    #[tokio::test]
    async fn test_undecodable_frame_errors() {
        let (transport, _feed) = ChannelTransport::new();
        let mut adapter = IngestionAdapter::new(Arc::new(transport), Arc::new(FixedFetcher::new(Ok(BATCH))));
        let mut c = controller();
        let request = RunRequest::new(serde_json::Value::Null);
        adapter.open(&request, &mut c, Duration::ZERO).await.unwrap();

        let result = adapter.handle_frame(&Frame::new(b"{oops".to_vec(), 0), &mut c, Duration::ZERO);
        assert!(matches!(result, Err(CoreError::Decode(_))));
        assert_eq!(c.state(), PlaybackState::Errored);
        assert_eq!(adapter.stats().decode_errors, 1);
    }
}
