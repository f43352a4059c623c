//! WorldState - the folded per-entity status of the epidemic.
//!
//! The world is a pure fold over the event log:
//!
//! ```text
//!   all-susceptible ──apply(0)──▶ S0 ──apply(1)──▶ S1 ── ... ──apply(N)──▶ SN
//! ```
//!
//! Whether step N is reached by live streaming, replay, scrubbing or
//! fast-forward, the result is the same value. `apply_event` and `reset`
//! are the only mutation paths.

use crate::error::CoreError;
use crate::event::StepEvent;
use crate::graph::{EntityId, ZoneId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Source of world generations. Process-wide so that a world restored from
/// a checkpoint never shares a generation with a later reset.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Epidemic status of one entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Susceptible,
    Exposed,
    Infected,
    Recovered,
    Dead,
}

impl Status {
    pub fn all() -> [Status; 5] {
        [
            Status::Susceptible,
            Status::Exposed,
            Status::Infected,
            Status::Recovered,
            Status::Dead,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Status::Susceptible => "susceptible",
            Status::Exposed => "exposed",
            Status::Infected => "infected",
            Status::Recovered => "recovered",
            Status::Dead => "dead",
        }
    }
}

/// Population count per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub susceptible: usize,
    pub exposed: usize,
    pub infected: usize,
    pub recovered: usize,
    pub dead: usize,
}

impl StatusCounts {
    pub fn get(&self, status: Status) -> usize {
        match status {
            Status::Susceptible => self.susceptible,
            Status::Exposed => self.exposed,
            Status::Infected => self.infected,
            Status::Recovered => self.recovered,
            Status::Dead => self.dead,
        }
    }

    fn slot_mut(&mut self, status: Status) -> &mut usize {
        match status {
            Status::Susceptible => &mut self.susceptible,
            Status::Exposed => &mut self.exposed,
            Status::Infected => &mut self.infected,
            Status::Recovered => &mut self.recovered,
            Status::Dead => &mut self.dead,
        }
    }

    pub fn bump(&mut self, status: Status) {
        *self.slot_mut(status) += 1;
    }

    /// Saturates at zero.
    pub fn dec(&mut self, status: Status) {
        let slot = self.slot_mut(status);
        *slot = slot.saturating_sub(1);
    }

    pub fn total(&self) -> usize {
        self.susceptible + self.exposed + self.infected + self.recovered + self.dead
    }
}

/// What a single `apply_event` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Status assignments to known entities
    pub changed: usize,
    /// Identities not present in the world
    pub skipped: usize,
}

/// Current status of every entity plus zone loads.
///
/// Equality compares the folded state only, not the generation.
#[derive(Debug, Clone, Default)]
pub struct WorldState {
    statuses: HashMap<EntityId, Status>,
    zone_loads: BTreeMap<ZoneId, f64>,
    last_applied: Option<usize>,
    skipped_total: usize,
    generation: u64,
}

impl PartialEq for WorldState {
    fn eq(&self, other: &Self) -> bool {
        self.statuses == other.statuses
            && self.zone_loads == other.zone_loads
            && self.last_applied == other.last_applied
            && self.skipped_total == other.skipped_total
    }
}

impl WorldState {
    /// Creates an all-susceptible world over the given identities.
    pub fn new(entity_ids: &[EntityId]) -> Self {
        let mut world = Self::default();
        world.reset(entity_ids);
        world
    }

    /// Returns every entity to susceptible and forgets all applied steps.
    pub fn reset(&mut self, entity_ids: &[EntityId]) {
        self.statuses.clear();
        self.statuses
            .extend(entity_ids.iter().map(|&id| (id, Status::Susceptible)));
        self.zone_loads.clear();
        self.last_applied = None;
        self.skipped_total = 0;
        self.generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
    }

    /// Folds one step-event into the world.
    ///
    /// `index` must be exactly one past the last applied step. Categories are
    /// applied exposed, infected, recovered, dead, so the later category wins
    /// when an identity appears in more than one.
    pub fn apply_event(&mut self, index: usize, event: &StepEvent) -> Result<ApplyOutcome, CoreError> {
        let expected = self.next_index();
        if index != expected {
            return Err(CoreError::OutOfOrder {
                expected,
                got: index,
            });
        }

        let mut outcome = ApplyOutcome::default();
        let categories = [
            (&event.new_exposed, Status::Exposed),
            (&event.new_infected, Status::Infected),
            (&event.new_recovered, Status::Recovered),
            (&event.new_dead, Status::Dead),
        ];
        for (ids, status) in categories {
            for id in ids {
                match self.statuses.get_mut(id) {
                    Some(slot) => {
                        *slot = status;
                        outcome.changed += 1;
                    }
                    None => outcome.skipped += 1,
                }
            }
        }

        for (&zone, &load) in &event.zone_updates {
            self.zone_loads.insert(zone, load);
        }

        if outcome.skipped > 0 {
            debug!(step = index, skipped = outcome.skipped, "unknown entities in step");
        }
        self.skipped_total += outcome.skipped;
        self.last_applied = Some(index);
        Ok(outcome)
    }

    /// Index the next `apply_event` must carry.
    pub fn next_index(&self) -> usize {
        self.last_applied.map_or(0, |i| i + 1)
    }

    /// Counts entities per status. Uncached.
    pub fn aggregate(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for status in self.statuses.values() {
            counts.bump(*status);
        }
        counts
    }

    pub fn status(&self, id: EntityId) -> Option<Status> {
        self.statuses.get(&id).copied()
    }

    /// Load of a zone; zones never updated read as zero.
    pub fn zone_load(&self, zone: ZoneId) -> f64 {
        self.zone_loads.get(&zone).copied().unwrap_or(0.0)
    }

    pub fn zone_loads(&self) -> &BTreeMap<ZoneId, f64> {
        &self.zone_loads
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, Status)> + '_ {
        self.statuses.iter().map(|(&id, &status)| (id, status))
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn last_applied(&self) -> Option<usize> {
        self.last_applied
    }

    /// Changes on every reset. Two worlds with the same generation and the
    /// same last applied step hold the same fold.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Unknown identities skipped since the last reset.
    pub fn skipped_total(&self) -> usize {
        self.skipped_total
    }
}
