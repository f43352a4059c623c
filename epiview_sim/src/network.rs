//! Simulated service endpoints with fault injection.
//!
//! `SimStream` replays an oracle script as a push channel on the virtual
//! clock; `SimFetcher` serves the graph and batch endpoints. Faults are fixed
//! up front so a seed always produces the same failure at the same frame.

use crate::context::SimContext;
use async_trait::async_trait;
use epiview_env::{BatchFetcher, EnvError, EpiViewContext, Frame, RunRequest, StreamTransport};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Payload delivered in place of a frame chosen for corruption.
const CORRUPT_PAYLOAD: &[u8] = b"{\"new_infected\": [1, 2";

/// Failures to inject into one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFaults {
    /// `open` fails; the viewer must use the batch endpoint
    pub refuse_open: bool,
    /// Transport error in place of frame `k` (0-based)
    pub fail_at: Option<usize>,
    /// Frame `k` arrives as truncated JSON
    pub corrupt_at: Option<usize>,
    /// The channel closes without sending the terminal message
    pub drop_terminal: bool,
}

/// Frame pacing on the virtual clock.
#[derive(Debug, Clone, Copy)]
pub struct StreamTiming {
    /// Mean gap between frames
    pub interval: Duration,
    /// Extra uniform delay per frame, up to this many milliseconds
    pub jitter_ms: f64,
}

impl Default for StreamTiming {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(40),
            jitter_ms: 20.0,
        }
    }
}

/// What the channel yields next.
#[derive(Debug)]
pub enum StreamItem {
    Frame(Frame),
    Failed(EnvError),
    Closed,
}

#[derive(Debug)]
enum Scheduled {
    Payload(Vec<u8>),
    Failure(String),
    End,
}

#[derive(Debug, Default)]
struct StreamState {
    /// Offsets from the moment `open` succeeded
    schedule: VecDeque<(Duration, Scheduled)>,
    opened_at: Option<Duration>,
    closed: bool,
    delivered: usize,
    opens: usize,
}

/// Scripted push channel driven by the virtual clock.
pub struct SimStream {
    ctx: SimContext,
    faults: StreamFaults,
    state: Mutex<StreamState>,
}

impl SimStream {
    /// Schedules `messages` (an oracle script) with the given pacing.
    pub fn new<R: Rng>(
        ctx: SimContext,
        messages: &[Vec<u8>],
        timing: StreamTiming,
        faults: StreamFaults,
        rng: &mut R,
    ) -> Self {
        let mut schedule = VecDeque::with_capacity(messages.len() + 1);
        let mut at = Duration::ZERO;
        let last = messages.len().saturating_sub(1);

        for (k, message) in messages.iter().enumerate() {
            let jitter = if timing.jitter_ms > 0.0 {
                rng.gen_range(0.0..timing.jitter_ms)
            } else {
                0.0
            };
            at += timing.interval + Duration::from_secs_f64(jitter / 1000.0);

            if faults.fail_at == Some(k) {
                schedule.push_back((at, Scheduled::Failure(format!("connection reset at frame {}", k))));
                break;
            }
            if faults.drop_terminal && k == last {
                break;
            }
            let payload = if faults.corrupt_at == Some(k) {
                CORRUPT_PAYLOAD.to_vec()
            } else {
                message.clone()
            };
            schedule.push_back((at, Scheduled::Payload(payload)));
        }
        schedule.push_back((at + timing.interval, Scheduled::End));

        Self {
            ctx,
            faults,
            state: Mutex::new(StreamState {
                schedule,
                ..StreamState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Everything due by `now`, in order. Stops at a failure or the end.
    pub fn drain_due(&self, now: Duration) -> Vec<StreamItem> {
        let mut state = self.lock();
        let mut items = Vec::new();
        let Some(opened_at) = state.opened_at else {
            return items;
        };
        while !state.closed {
            match state.schedule.front() {
                Some((offset, _)) if opened_at + *offset <= now => {}
                _ => break,
            }
            let Some((_, next)) = state.schedule.pop_front() else {
                break;
            };
            items.push(Self::deliver(&mut state, next));
        }
        items
    }

    fn deliver(state: &mut StreamState, next: Scheduled) -> StreamItem {
        match next {
            Scheduled::Payload(payload) => {
                let seq = state.delivered as u64;
                state.delivered += 1;
                StreamItem::Frame(Frame::new(payload, seq))
            }
            Scheduled::Failure(reason) => {
                state.closed = true;
                StreamItem::Failed(EnvError::transport(reason))
            }
            Scheduled::End => {
                state.closed = true;
                StreamItem::Closed
            }
        }
    }

    /// Frames handed to the viewer so far.
    pub fn delivered(&self) -> usize {
        self.lock().delivered
    }

    /// Successful `open` calls.
    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Scheduled items not yet delivered.
    pub fn pending(&self) -> usize {
        self.lock().schedule.len()
    }

    pub fn faults(&self) -> &StreamFaults {
        &self.faults
    }
}

#[async_trait]
impl StreamTransport for SimStream {
    async fn open(&self, request: &RunRequest) -> Result<(), EnvError> {
        if self.faults.refuse_open {
            return Err(EnvError::transport("push channel refused"));
        }
        let mut state = self.lock();
        if state.closed {
            return Err(EnvError::transport("channel already closed"));
        }
        state.opened_at = Some(self.ctx.now());
        state.opens += 1;
        debug!(run = %request.run_id, scheduled = state.schedule.len(), "sim stream opened");
        Ok(())
    }

    async fn recv(&self) -> Option<Result<Frame, EnvError>> {
        let mut state = self.lock();
        let opened_at = state.opened_at?;
        if state.closed {
            return None;
        }
        let (offset, next) = state.schedule.pop_front()?;
        // Waiting for a frame is time passing on the virtual clock.
        self.ctx.advance_to(opened_at + offset);
        match Self::deliver(&mut state, next) {
            StreamItem::Frame(frame) => Some(Ok(frame)),
            StreamItem::Failed(e) => Some(Err(e)),
            StreamItem::Closed => None,
        }
    }

    fn close(&self) {
        self.lock().closed = true;
    }
}

/// Graph and batch endpoints of the simulated service.
pub struct SimFetcher {
    graph: Vec<u8>,
    batch: Vec<u8>,
    fail_batch: bool,
    graph_fetches: AtomicUsize,
    batch_fetches: AtomicUsize,
}

impl SimFetcher {
    /// `messages` are individual JSON messages; the batch endpoint serves
    /// them as one array.
    pub fn new(graph: Vec<u8>, messages: &[Vec<u8>]) -> Self {
        let mut batch = Vec::with_capacity(messages.iter().map(Vec::len).sum::<usize>() + messages.len() + 2);
        batch.push(b'[');
        for (k, message) in messages.iter().enumerate() {
            if k > 0 {
                batch.push(b',');
            }
            batch.extend_from_slice(message);
        }
        batch.push(b']');
        Self {
            graph,
            batch,
            fail_batch: false,
            graph_fetches: AtomicUsize::new(0),
            batch_fetches: AtomicUsize::new(0),
        }
    }

    /// Makes the batch endpoint fail too.
    pub fn with_failing_batch(mut self) -> Self {
        self.fail_batch = true;
        self
    }

    pub fn graph_fetches(&self) -> usize {
        self.graph_fetches.load(Ordering::SeqCst)
    }

    pub fn batch_fetches(&self) -> usize {
        self.batch_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchFetcher for SimFetcher {
    async fn fetch_graph(&self) -> Result<Vec<u8>, EnvError> {
        self.graph_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.graph.clone())
    }

    async fn fetch_batch(&self, _request: &RunRequest) -> Result<Vec<u8>, EnvError> {
        self.batch_fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_batch {
            return Err(EnvError::fetch("batch endpoint returned 503"));
        }
        Ok(self.batch.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn script() -> Vec<Vec<u8>> {
        vec![
            br#"{"infected":[0]}"#.to_vec(),
            br#"{"new_exposed":[1]}"#.to_vec(),
            br#"{"new_infected":[1]}"#.to_vec(),
            br#"{"done":true}"#.to_vec(),
        ]
    }

    fn stream(faults: StreamFaults) -> (SimContext, SimStream) {
        let ctx = SimContext::new(1);
        let timing = StreamTiming {
            interval: Duration::from_millis(100),
            jitter_ms: 0.0,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let stream = SimStream::new(ctx.clone(), &script(), timing, faults, &mut rng);
        (ctx, stream)
    }

    fn frames(items: &[StreamItem]) -> usize {
        items.iter().filter(|i| matches!(i, StreamItem::Frame(_))).count()
    }

    #[tokio::test]
    async fn test_drain_due_follows_virtual_time() {
        let (ctx, stream) = stream(StreamFaults::default());
        assert!(stream.drain_due(Duration::from_secs(10)).is_empty());

        stream.open(&RunRequest::new(serde_json::Value::Null)).await.unwrap();
        assert!(stream.drain_due(ctx.now()).is_empty());

        ctx.advance_time(Duration::from_millis(250));
        assert_eq!(frames(&stream.drain_due(ctx.now())), 2);

        ctx.advance_time(Duration::from_secs(1));
        let rest = stream.drain_due(ctx.now());
        assert_eq!(frames(&rest), 2);
        assert!(matches!(rest.last(), Some(StreamItem::Closed)));
        assert!(stream.is_closed());
        assert_eq!(stream.delivered(), 4);
    }

    #[tokio::test]
    async fn test_recv_advances_clock() {
        let (ctx, stream) = stream(StreamFaults::default());
        stream.open(&RunRequest::new(serde_json::Value::Null)).await.unwrap();

        let first = stream.recv().await.unwrap().unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(ctx.now(), Duration::from_millis(100));

        stream.close();
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_refused_open() {
        let (_ctx, stream) = stream(StreamFaults {
            refuse_open: true,
            ..StreamFaults::default()
        });
        assert!(stream.open(&RunRequest::new(serde_json::Value::Null)).await.is_err());
        assert_eq!(stream.opens(), 0);
    }

    #[tokio::test]
    async fn test_fail_and_corrupt_injection() {
        let (ctx, stream) = stream(StreamFaults {
            fail_at: Some(2),
            corrupt_at: Some(1),
            ..StreamFaults::default()
        });
        stream.open(&RunRequest::new(serde_json::Value::Null)).await.unwrap();
        ctx.advance_time(Duration::from_secs(5));
        let items = stream.drain_due(ctx.now());

        assert_eq!(items.len(), 3);
        match &items[1] {
            StreamItem::Frame(frame) => assert_eq!(frame.payload, CORRUPT_PAYLOAD),
            other => panic!("expected frame, got {:?}", other),
        }
        assert!(matches!(items[2], StreamItem::Failed(_)));
    }

    #[tokio::test]
    async fn test_drop_terminal() {
        let (ctx, stream) = stream(StreamFaults {
            drop_terminal: true,
            ..StreamFaults::default()
        });
        stream.open(&RunRequest::new(serde_json::Value::Null)).await.unwrap();
        ctx.advance_time(Duration::from_secs(5));
        let items = stream.drain_due(ctx.now());
        assert_eq!(frames(&items), 3);
        assert!(matches!(items.last(), Some(StreamItem::Closed)));
    }

    #[tokio::test]
    async fn test_fetcher_serves_array() {
        let fetcher = SimFetcher::new(b"{}".to_vec(), &script());
        let batch = fetcher
            .fetch_batch(&RunRequest::new(serde_json::Value::Null))
            .await
            .unwrap();
        let values: Vec<serde_json::Value> = serde_json::from_slice(&batch).unwrap();
        assert_eq!(values.len(), 4);
        assert_eq!(fetcher.batch_fetches(), 1);

        let failing = SimFetcher::new(b"{}".to_vec(), &script()).with_failing_batch();
        assert!(failing
            .fetch_batch(&RunRequest::new(serde_json::Value::Null))
            .await
            .is_err());
    }
}
