//! Production implementations backed by Tokio.

use crate::error::EnvError;
use crate::transport::StreamTransport;
use crate::types::{Frame, RunRequest};
use crate::EpiViewContext;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Production context backed by Tokio and the system clock.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,
}

impl TokioContext {
    /// Creates a new TokioContext.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EpiViewContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, _name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }

    fn seed(&self) -> u64 {
        // Production is not seeded
        0
    }
}

type FrameResult = Result<Frame, EnvError>;

/// Push-channel transport over an unbounded tokio channel.
///
/// The channel is unbounded; frames are never throttled at the transport.
/// Whatever task owns the real socket writes into the paired
/// [`StreamFeed`].
pub struct ChannelTransport {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FrameResult>>,
    opened: AtomicBool,
    closed: Arc<AtomicBool>,
}

/// Producer half of a [`ChannelTransport`].
#[derive(Clone)]
pub struct StreamFeed {
    tx: mpsc::UnboundedSender<FrameResult>,
    seq: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl ChannelTransport {
    /// Creates a transport and its producer handle.
    pub fn new() -> (Self, StreamFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let transport = Self {
            rx: tokio::sync::Mutex::new(rx),
            opened: AtomicBool::new(false),
            closed: closed.clone(),
        };
        let feed = StreamFeed {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
            closed,
        };
        (transport, feed)
    }

    /// Returns whether `open` has succeeded.
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }
}

impl StreamFeed {
    /// Pushes one message. Fails only once the viewer side is closed.
    pub fn send(&self, payload: impl Into<Vec<u8>>) -> Result<(), EnvError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EnvError::Closed);
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send(Ok(Frame::new(payload.into(), seq)))
            .map_err(|_| EnvError::Closed)
    }

    /// Signals a transport failure to the receiving side.
    pub fn fail(&self, reason: impl Into<String>) -> Result<(), EnvError> {
        self.tx
            .send(Err(EnvError::transport(reason)))
            .map_err(|_| EnvError::Closed)
    }

    /// Number of frames pushed so far.
    pub fn sent(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamTransport for ChannelTransport {
    async fn open(&self, _request: &RunRequest) -> Result<(), EnvError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EnvError::transport("channel already closed"));
        }
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn recv(&self) -> Option<Result<Frame, EnvError>> {
        if !self.is_open() {
            return None;
        }
        let mut rx = self.rx.lock().await;
        let next = rx.recv().await;
        // A close() that raced the receive wins.
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        next
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
