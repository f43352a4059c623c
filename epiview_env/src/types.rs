//! Common types for the EpiView environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one simulation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Creates a new random RunId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic RunId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A run request. The epidemic-model parameters are forwarded opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub run_id: RunId,

    /// Model parameters (beta, recovery days, ...), never interpreted here
    #[serde(default)]
    pub params: serde_json::Value,
}

impl RunRequest {
    pub fn new(params: serde_json::Value) -> Self {
        Self {
            run_id: RunId::new(),
            params,
        }
    }
}

/// One framed message from the push channel.
///
/// The payload is opaque bytes; decoding into step-events happens in the
/// viewer's ingestion adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// The raw message bytes (JSON text)
    pub payload: Vec<u8>,

    /// Arrival sequence number assigned by the transport
    pub seq: u64,
}

impl Frame {
    /// Creates a new frame from payload bytes.
    pub fn new(payload: Vec<u8>, seq: u64) -> Self {
        Self { payload, seq }
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
