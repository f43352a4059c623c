//! Step-events and stream message decoding.
//!
//! Every framed message on the stream is one of three shapes:
//!
//! ```text
//! {"new_infected":[3,7], "new_recovered":[1], "zone_updates":{"2":0.4}, ...}   step
//! {"done": true}                                                               terminal
//! {"error": "simulation diverged"}                                             terminal
//! ```
//!
//! The first message of a run may use the seed names `infected`, `exposed`
//! and `recovered`; they decode into the same fields.

use crate::error::CoreError;
use crate::graph::{EntityId, ZoneId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregate environment statistics reported alongside a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepStats {
    pub avg_aqi: f64,
    pub total_aqi: f64,
    pub contaminated_zones: u32,
}

/// One discrete simulation step: the identities that changed status plus
/// optional zone and aggregate information.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepEvent {
    /// Wire step index. Optional; the log position is canonical.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<u64>,

    /// Simulation time reported by the service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,

    #[serde(alias = "exposed")]
    pub new_exposed: Vec<EntityId>,

    #[serde(alias = "infected")]
    pub new_infected: Vec<EntityId>,

    #[serde(alias = "recovered")]
    pub new_recovered: Vec<EntityId>,

    #[serde(alias = "dead")]
    pub new_dead: Vec<EntityId>,

    /// Zone loads replacing the previous value for each listed zone
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub zone_updates: BTreeMap<ZoneId, f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<StepStats>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_exposed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_infected: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_recovered: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_dead: Option<u64>,
}

impl StepEvent {
    /// Number of status changes carried by this event.
    pub fn change_count(&self) -> usize {
        self.new_exposed.len() + self.new_infected.len() + self.new_recovered.len() + self.new_dead.len()
    }

    /// Checks the parts of an event that serde cannot.
    ///
    /// `previous_step` is the wire step of the last accepted event, if any.
    pub fn validate(&self, previous_step: Option<u64>) -> Result<(), CoreError> {
        if let (Some(step), Some(prev)) = (self.step, previous_step) {
            if step <= prev {
                return Err(CoreError::malformed(format!(
                    "step {} does not follow step {}",
                    step, prev
                )));
            }
        }
        if let Some(time) = self.time {
            if !time.is_finite() {
                return Err(CoreError::malformed("non-finite time"));
            }
        }
        if let Some((zone, _)) = self.zone_updates.iter().find(|(_, load)| !load.is_finite()) {
            return Err(CoreError::malformed(format!(
                "non-finite load for zone {}",
                zone
            )));
        }
        Ok(())
    }
}

/// A decoded stream message.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Step(StepEvent),
    Done,
    Error(String),
}

impl StreamMessage {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamMessage::Step(_))
    }
}

/// Decodes one framed message.
///
/// Invalid JSON is a [`CoreError::Decode`]; valid JSON of the wrong shape is
/// a [`CoreError::MalformedEvent`].
pub fn decode_message(bytes: &[u8]) -> Result<StreamMessage, CoreError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| CoreError::Decode(e.to_string()))?;
    message_from_value(value)
}

/// Decodes a batch response: a JSON array of messages.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<StreamMessage>, CoreError> {
    let values: Vec<serde_json::Value> =
        serde_json::from_slice(bytes).map_err(|e| CoreError::Decode(e.to_string()))?;
    values.into_iter().map(message_from_value).collect()
}

fn message_from_value(value: serde_json::Value) -> Result<StreamMessage, CoreError> {
    let object = value
        .as_object()
        .ok_or_else(|| CoreError::malformed("message is not an object"))?;

    if let Some(error) = object.get("error") {
        let text = match error {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Ok(StreamMessage::Error(text));
    }
    if object.get("done").and_then(serde_json::Value::as_bool) == Some(true) {
        return Ok(StreamMessage::Done);
    }

    serde_json::from_value(value)
        .map(StreamMessage::Step)
        .map_err(|e| CoreError::malformed(e.to_string()))
}

/// Serializes a message back into its wire form.
pub fn encode_message(message: &StreamMessage) -> Result<Vec<u8>, CoreError> {
    let bytes = match message {
        StreamMessage::Step(event) => serde_json::to_vec(event)?,
        StreamMessage::Done => serde_json::to_vec(&serde_json::json!({ "done": true }))?,
        StreamMessage::Error(text) => serde_json::to_vec(&serde_json::json!({ "error": text }))?,
    };
    Ok(bytes)
}
