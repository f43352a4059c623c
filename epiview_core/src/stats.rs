//! Run statistics built from the published event history.
//!
//! [`StatisticsTracker`] is a [`HistoryObserver`]: it folds each published
//! batch into its own status table and records one [`StepSample`] per step,
//! so charts and summaries never touch the controller's world.

use crate::epiview_world::{Status, StatusCounts};
use crate::event::StepEvent;
use crate::graph::EntityId;
use crate::playback::{HistoryObserver, PlaybackState};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Distinct entities that have ever held a status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CumulativeCounts {
    pub exposed: usize,
    pub infected: usize,
    pub recovered: usize,
    pub dead: usize,
}

/// Population picture after one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSample {
    pub step: usize,
    pub time: Option<f64>,
    pub counts: StatusCounts,
    pub cumulative: CumulativeCounts,
    pub new_exposed: usize,
    pub new_infected: usize,
    pub new_recovered: usize,
    pub new_dead: usize,
    /// New infections as a percentage of those susceptible before the step
    pub infection_rate: f64,
}

/// Per-step classification for the timeline view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Infections,
    Recoveries,
    Mixed,
    Quiet,
}

impl StepKind {
    pub fn classify(new_infected: usize, new_recovered: usize) -> Self {
        match (new_infected > 0, new_recovered > 0) {
            (true, true) => StepKind::Mixed,
            (true, false) => StepKind::Infections,
            (false, true) => StepKind::Recoveries,
            (false, false) => StepKind::Quiet,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub step: usize,
    pub time: Option<f64>,
    pub kind: StepKind,
    pub new_infected: usize,
    pub new_recovered: usize,
    pub infected: usize,
}

/// Headline numbers for a run, up to some step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub population: usize,
    pub steps: usize,
    pub peak_exposed: usize,
    pub peak_exposed_step: Option<usize>,
    pub peak_infected: usize,
    pub peak_infected_step: Option<usize>,
    pub final_recovered: usize,
    pub final_dead: usize,
    /// Percentage of the population recovered or dead
    pub attack_rate: f64,
    /// Distinct ever-infected over initially infected
    pub reproduction_ratio: f64,
}

/// Incremental statistics over the run history.
#[derive(Debug, Clone, Default)]
pub struct StatisticsTracker {
    statuses: HashMap<EntityId, Status>,
    counts: StatusCounts,
    ever: [HashSet<EntityId>; 4],
    initial_infected: usize,
    samples: Vec<StepSample>,
    terminal: Option<PlaybackState>,
}

impl StatisticsTracker {
    pub fn new(entity_ids: &[EntityId]) -> Self {
        let mut tracker = Self::default();
        tracker.on_reset(entity_ids);
        tracker
    }

    fn record(&mut self, step: usize, event: &StepEvent) {
        let susceptible_before = self.counts.susceptible;
        let categories = [
            (&event.new_exposed, Status::Exposed, 0),
            (&event.new_infected, Status::Infected, 1),
            (&event.new_recovered, Status::Recovered, 2),
            (&event.new_dead, Status::Dead, 3),
        ];
        for (ids, status, bucket) in categories {
            for id in ids {
                let Some(current) = self.statuses.get_mut(id) else {
                    continue;
                };
                self.counts.dec(*current);
                self.counts.bump(status);
                *current = status;
                self.ever[bucket].insert(*id);
            }
        }

        if step == 0 {
            self.initial_infected = event.new_infected.len();
        }

        let infection_rate = if susceptible_before > 0 {
            event.new_infected.len() as f64 / susceptible_before as f64 * 100.0
        } else {
            0.0
        };
        self.samples.push(StepSample {
            step,
            time: event.time,
            counts: self.counts,
            cumulative: CumulativeCounts {
                exposed: self.ever[0].len(),
                infected: self.ever[1].len(),
                recovered: self.ever[2].len(),
                dead: self.ever[3].len(),
            },
            new_exposed: event.new_exposed.len(),
            new_infected: event.new_infected.len(),
            new_recovered: event.new_recovered.len(),
            new_dead: event.new_dead.len(),
            infection_rate,
        });
    }

    pub fn samples(&self) -> &[StepSample] {
        &self.samples
    }

    pub fn population(&self) -> usize {
        self.statuses.len()
    }

    /// How the run ended, once it has.
    pub fn terminal(&self) -> Option<PlaybackState> {
        self.terminal
    }

    /// Summary over every recorded step.
    pub fn summary(&self) -> Summary {
        self.summary_upto(usize::MAX)
    }

    /// Summary over steps `0..=step`.
    pub fn summary_upto(&self, step: usize) -> Summary {
        let population = self.population();
        let window = &self.samples[..self.samples.len().min(step.saturating_add(1))];

        let mut summary = Summary {
            population,
            steps: window.len(),
            ..Summary::default()
        };
        for sample in window {
            if sample.counts.exposed > summary.peak_exposed {
                summary.peak_exposed = sample.counts.exposed;
                summary.peak_exposed_step = Some(sample.step);
            }
            if sample.counts.infected > summary.peak_infected {
                summary.peak_infected = sample.counts.infected;
                summary.peak_infected_step = Some(sample.step);
            }
        }
        if let Some(last) = window.last() {
            summary.final_recovered = last.counts.recovered;
            summary.final_dead = last.counts.dead;
            if population > 0 {
                summary.attack_rate =
                    (last.counts.recovered + last.counts.dead) as f64 / population as f64 * 100.0;
            }
            summary.reproduction_ratio =
                last.cumulative.infected as f64 / self.initial_infected.max(1) as f64;
        }
        summary
    }

    /// Timeline entries for steps `0..=step`, newest first.
    pub fn timeline(&self, step: usize) -> Vec<TimelineEntry> {
        self.samples
            .iter()
            .take(step.saturating_add(1))
            .rev()
            .map(|s| TimelineEntry {
                step: s.step,
                time: s.time,
                kind: StepKind::classify(s.new_infected, s.new_recovered),
                new_infected: s.new_infected,
                new_recovered: s.new_recovered,
                infected: s.counts.infected,
            })
            .collect()
    }
}

impl HistoryObserver for StatisticsTracker {
    fn on_steps(&mut self, first_index: usize, events: &[StepEvent]) {
        for (offset, event) in events.iter().enumerate() {
            self.record(first_index + offset, event);
        }
        debug!(steps = self.samples.len(), "statistics updated");
    }

    fn on_reset(&mut self, entity_ids: &[EntityId]) {
        self.statuses = entity_ids
            .iter()
            .map(|&id| (id, Status::Susceptible))
            .collect();
        self.counts = StatusCounts {
            susceptible: self.statuses.len(),
            ..StatusCounts::default()
        };
        for set in &mut self.ever {
            set.clear();
        }
        self.initial_infected = 0;
        self.samples.clear();
        self.terminal = None;
    }

    fn on_terminal(&mut self, state: PlaybackState) {
        self.terminal = Some(state);
    }
}
