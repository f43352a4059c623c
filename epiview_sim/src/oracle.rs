//! Ground truth oracle for simulation.
//!
//! The Oracle stands in for the external simulation service:
//! - A seeded contact network (clustered zones plus a few cross-zone links)
//! - A stochastic S→E→I→R/D process over that network
//! - The exact wire messages the service would push for each step
//!
//! It keeps the true population counts after every emitted step so the
//! runner can check what the viewer shows against what actually happened.
//! The process only has to look like an outbreak; it is not a model.

use crate::error::SimError;
use epiview_core::event::{encode_message, StepStats};
use epiview_core::graph::{LinkRecord, NodeRecord};
use epiview_core::{EntityId, GraphSnapshot, Status, StatusCounts, StepEvent, StreamMessage, ZoneId};
use nalgebra::Vector2;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

/// Outbreak generator parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutbreakConfig {
    pub entities: usize,
    pub zones: usize,
    /// Spread of entities around their zone centre (data units)
    pub zone_spread: f64,
    /// Within-zone contacts drawn per entity
    pub contacts_per_entity: usize,
    /// Chance that an entity also gets one contact in another zone
    pub cross_zone_rate: f64,
    /// Links pointing at ids that do not exist
    pub dangling_links: usize,
    pub initial_infected: usize,
    /// Per contact, per step: infected → susceptible neighbour exposed
    pub transmission: f64,
    /// Per step: exposed → infected
    pub incubation: f64,
    /// Per step: infected → removed
    pub removal: f64,
    /// Share of removals that are deaths
    pub fatality: f64,
    pub max_steps: u64,
    /// Simulated days per step
    pub step_days: f64,
}

impl Default for OutbreakConfig {
    fn default() -> Self {
        Self {
            entities: 500,
            zones: 6,
            zone_spread: 60.0,
            contacts_per_entity: 3,
            cross_zone_rate: 0.05,
            dangling_links: 2,
            initial_infected: 3,
            transmission: 0.08,
            incubation: 0.3,
            removal: 0.12,
            fatality: 0.1,
            max_steps: 200,
            step_days: 1.0,
        }
    }
}

impl OutbreakConfig {
    fn validate(&self) -> Result<(), SimError> {
        if self.entities == 0 || self.zones == 0 {
            return Err(SimError::invalid("need at least one entity and one zone"));
        }
        if self.initial_infected == 0 || self.initial_infected > self.entities {
            return Err(SimError::invalid(format!(
                "initial_infected must be in 1..={}",
                self.entities
            )));
        }
        let rates = [
            self.cross_zone_rate,
            self.transmission,
            self.incubation,
            self.removal,
            self.fatality,
        ];
        if rates.iter().any(|p| !(0.0..=1.0).contains(p)) {
            return Err(SimError::invalid("rates must be probabilities"));
        }
        if !(self.zone_spread.is_finite() && self.zone_spread > 0.0) {
            return Err(SimError::invalid("zone_spread must be positive"));
        }
        Ok(())
    }
}

/// A ground truth entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthEntity {
    pub id: EntityId,
    pub position: Vector2<f64>,
    pub zone: ZoneId,
}

/// The Oracle - owns the true outbreak and produces its wire messages.
pub struct Oracle {
    config: OutbreakConfig,
    rng: ChaCha8Rng,
    entities: Vec<GroundTruthEntity>,
    links: Vec<(EntityId, EntityId)>,
    adjacency: Vec<Vec<usize>>,
    statuses: Vec<Status>,
    zone_members: Vec<Vec<usize>>,
    load_noise: Normal<f64>,
    /// True counts after each emitted step
    truth: Vec<StatusCounts>,
    step: u64,
    finished: bool,
}

impl Oracle {
    /// Builds the contact network. The outbreak starts with [`Oracle::seed_message`].
    pub fn new(seed: u64, config: OutbreakConfig) -> Result<Self, SimError> {
        config.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let spread = Normal::new(0.0, config.zone_spread)
            .map_err(|e| SimError::invalid(e.to_string()))?;
        let load_noise = Normal::new(0.0, 0.2).map_err(|e| SimError::invalid(e.to_string()))?;

        // Zone centres on a ring, entities scattered around them.
        let ring = config.zone_spread * 4.0 * (config.zones as f64).sqrt();
        let centres: Vec<Vector2<f64>> = (0..config.zones)
            .map(|z| {
                let angle = z as f64 / config.zones as f64 * std::f64::consts::TAU;
                Vector2::new(ring * angle.cos(), ring * angle.sin())
            })
            .collect();

        let mut zone_members = vec![Vec::new(); config.zones];
        let entities: Vec<GroundTruthEntity> = (0..config.entities)
            .map(|i| {
                let zone = rng.gen_range(0..config.zones);
                zone_members[zone].push(i);
                let offset = Vector2::new(spread.sample(&mut rng), spread.sample(&mut rng));
                GroundTruthEntity {
                    id: i as EntityId,
                    position: centres[zone] + offset,
                    zone: zone as ZoneId,
                }
            })
            .collect();

        let mut seen: HashSet<(usize, usize)> = HashSet::new();
        let mut adjacency = vec![Vec::new(); config.entities];
        let mut links = Vec::new();
        let mut connect = |a: usize, b: usize, links: &mut Vec<(EntityId, EntityId)>| {
            if a == b || !seen.insert((a.min(b), a.max(b))) {
                return;
            }
            adjacency[a].push(b);
            adjacency[b].push(a);
            links.push((a as EntityId, b as EntityId));
        };

        for entity in &entities {
            let a = entity.id as usize;
            let members = &zone_members[entity.zone as usize];
            for _ in 0..config.contacts_per_entity {
                if let Some(&b) = members.choose(&mut rng) {
                    connect(a, b, &mut links);
                }
            }
            if rng.gen_bool(config.cross_zone_rate) {
                let b = rng.gen_range(0..config.entities);
                connect(a, b, &mut links);
            }
        }

        for k in 0..config.dangling_links {
            let a = rng.gen_range(0..config.entities) as EntityId;
            links.push((a, (config.entities + k + 1) as EntityId));
        }

        info!(
            entities = entities.len(),
            links = links.len(),
            zones = config.zones,
            "oracle network built"
        );

        let statuses = vec![Status::Susceptible; config.entities];
        Ok(Self {
            config,
            rng,
            entities,
            links,
            adjacency,
            statuses,
            zone_members,
            load_noise,
            truth: Vec::new(),
            step: 0,
            finished: false,
        })
    }

    /// The graph snapshot as the service's graph endpoint returns it.
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self
                .entities
                .iter()
                .map(|e| NodeRecord {
                    id: e.id,
                    x: e.position.x,
                    y: e.position.y,
                    zone: e.zone,
                })
                .collect(),
            links: self
                .links
                .iter()
                .map(|&(source, target)| LinkRecord { source, target })
                .collect(),
        }
    }

    pub fn snapshot_json(&self) -> Result<Vec<u8>, SimError> {
        Ok(serde_json::to_vec(&self.snapshot())?)
    }

    /// First message of a run: the initially infected, under the seed names.
    pub fn seed_message(&mut self) -> Result<Vec<u8>, SimError> {
        let mut ids: Vec<usize> = (0..self.entities.len()).collect();
        ids.shuffle(&mut self.rng);
        ids.truncate(self.config.initial_infected);
        ids.sort_unstable();
        for &i in &ids {
            self.statuses[i] = Status::Infected;
        }
        self.step = 0;
        let counts = self.counts();
        self.truth.push(counts);

        let message = serde_json::json!({
            "step": 0,
            "time": 0.0,
            "infected": ids,
            "total_infected": counts.infected,
        });
        Ok(serde_json::to_vec(&message)?)
    }

    /// Advances the outbreak one step and returns its message, the terminal
    /// `done` once nobody is exposed or infected, then `None`.
    pub fn next_message(&mut self) -> Result<Option<Vec<u8>>, SimError> {
        if self.finished {
            return Ok(None);
        }
        if self.truth.is_empty() {
            return self.seed_message().map(Some);
        }
        let counts = self.counts();
        if counts.exposed + counts.infected == 0 || self.step >= self.config.max_steps {
            self.finished = true;
            debug!(step = self.step, "outbreak over");
            return Ok(Some(encode_message(&StreamMessage::Done)?));
        }

        let event = self.advance();
        Ok(Some(encode_message(&StreamMessage::Step(event))?))
    }

    /// Runs the outbreak to the end and returns every message in order.
    pub fn script(&mut self) -> Result<Vec<Vec<u8>>, SimError> {
        let mut messages = Vec::new();
        while let Some(message) = self.next_message()? {
            messages.push(message);
        }
        Ok(messages)
    }

    fn advance(&mut self) -> StepEvent {
        self.step += 1;
        let before = self.statuses.clone();
        let mut event = StepEvent {
            step: Some(self.step),
            time: Some(self.step as f64 * self.config.step_days),
            ..StepEvent::default()
        };

        let mut exposed_now = vec![false; before.len()];
        for (i, status) in before.iter().enumerate() {
            match status {
                Status::Infected => {
                    for &j in &self.adjacency[i] {
                        if before[j] == Status::Susceptible
                            && !exposed_now[j]
                            && self.rng.gen_bool(self.config.transmission)
                        {
                            exposed_now[j] = true;
                            event.new_exposed.push(j as EntityId);
                        }
                    }
                    if self.rng.gen_bool(self.config.removal) {
                        if self.rng.gen_bool(self.config.fatality) {
                            event.new_dead.push(i as EntityId);
                        } else {
                            event.new_recovered.push(i as EntityId);
                        }
                    }
                }
                Status::Exposed if self.rng.gen_bool(self.config.incubation) => {
                    event.new_infected.push(i as EntityId);
                }
                _ => {}
            }
        }
        event.new_exposed.sort_unstable();

        for (ids, status) in [
            (&event.new_exposed, Status::Exposed),
            (&event.new_infected, Status::Infected),
            (&event.new_recovered, Status::Recovered),
            (&event.new_dead, Status::Dead),
        ] {
            for &id in ids {
                self.statuses[id as usize] = status;
            }
        }

        event.zone_updates = self.zone_loads();
        let total: f64 = event.zone_updates.values().sum();
        event.stats = Some(StepStats {
            avg_aqi: total / self.config.zones as f64,
            total_aqi: total,
            contaminated_zones: event.zone_updates.values().filter(|&&l| l > 1.0).count() as u32,
        });

        let counts = self.counts();
        event.total_exposed = Some(counts.exposed as u64);
        event.total_infected = Some(counts.infected as u64);
        event.total_recovered = Some(counts.recovered as u64);
        event.total_dead = Some(counts.dead as u64);
        self.truth.push(counts);
        event
    }

    /// Share of each zone currently infected, scaled to 0..10, with noise.
    fn zone_loads(&mut self) -> BTreeMap<ZoneId, f64> {
        let mut loads = BTreeMap::new();
        for (zone, members) in self.zone_members.iter().enumerate() {
            if members.is_empty() {
                continue;
            }
            let infected = members
                .iter()
                .filter(|&&i| self.statuses[i] == Status::Infected)
                .count();
            let base = infected as f64 / members.len() as f64 * 10.0;
            let noise = if infected > 0 { self.load_noise.sample(&mut self.rng) } else { 0.0 };
            loads.insert(zone as ZoneId, (base + noise).max(0.0));
        }
        loads
    }

    fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for status in &self.statuses {
            match status {
                Status::Susceptible => counts.susceptible += 1,
                Status::Exposed => counts.exposed += 1,
                Status::Infected => counts.infected += 1,
                Status::Recovered => counts.recovered += 1,
                Status::Dead => counts.dead += 1,
            }
        }
        counts
    }

    /// True counts after log step `step`.
    pub fn truth_at(&self, step: usize) -> Option<StatusCounts> {
        self.truth.get(step).copied()
    }

    /// Number of step messages emitted so far.
    pub fn steps_emitted(&self) -> usize {
        self.truth.len()
    }

    pub fn status(&self, id: EntityId) -> Option<Status> {
        self.statuses.get(id as usize).copied()
    }

    pub fn entities(&self) -> &[GroundTruthEntity] {
        &self.entities
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn config(&self) -> &OutbreakConfig {
        &self.config
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epiview_core::event::decode_message;
    use proptest::prelude::*;

    fn small() -> OutbreakConfig {
        OutbreakConfig {
            entities: 120,
            zones: 4,
            ..OutbreakConfig::default()
        }
    }

    #[test]
    fn test_oracle_rejects_bad_config() {
        let config = OutbreakConfig {
            transmission: 1.5,
            ..small()
        };
        assert!(Oracle::new(1, config).is_err());

        let config = OutbreakConfig {
            initial_infected: 0,
            ..small()
        };
        assert!(Oracle::new(1, config).is_err());
    }

    #[test]
    fn test_snapshot_contains_every_entity_and_dangling_links() {
        let oracle = Oracle::new(42, small()).unwrap();
        let snapshot = oracle.snapshot();
        assert_eq!(snapshot.nodes.len(), 120);
        let dangling = snapshot
            .links
            .iter()
            .filter(|l| l.target as usize >= 120)
            .count();
        assert_eq!(dangling, 2);

        let round = GraphSnapshot::from_json(&oracle.snapshot_json().unwrap()).unwrap();
        assert_eq!(round, snapshot);
    }

    #[test]
    fn test_oracle_deterministic_script() {
        let a = Oracle::new(42, small()).unwrap().script().unwrap();
        let b = Oracle::new(42, small()).unwrap().script().unwrap();
        assert_eq!(a, b);

        let c = Oracle::new(43, small()).unwrap().script().unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_script_shape() {
        let mut oracle = Oracle::new(7, small()).unwrap();
        let script = oracle.script().unwrap();

        let first = String::from_utf8(script[0].clone()).unwrap();
        assert!(first.contains("\"infected\""));

        let messages: Vec<StreamMessage> = script.iter().map(|m| decode_message(m).unwrap()).collect();
        assert_eq!(messages.last(), Some(&StreamMessage::Done));
        assert_eq!(messages.len(), oracle.steps_emitted() + 1);
        assert!(oracle.is_finished());
        assert!(oracle.next_message().unwrap().is_none());

        match &messages[0] {
            StreamMessage::Step(event) => assert_eq!(event.new_infected.len(), 3),
            other => panic!("expected seed step, got {:?}", other),
        }
    }

    #[test]
    fn test_truth_conserves_population() {
        let mut oracle = Oracle::new(11, small()).unwrap();
        oracle.script().unwrap();
        for step in 0..oracle.steps_emitted() {
            assert_eq!(oracle.truth_at(step).unwrap().total(), 120);
        }
        let last = oracle.truth_at(oracle.steps_emitted() - 1).unwrap();
        assert!(last.exposed + last.infected == 0 || oracle.steps_emitted() as u64 > oracle.config().max_steps);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn test_script_replays_per_seed(seed in any::<u64>(), entities in 20usize..120, zones in 1usize..6) {
            let config = OutbreakConfig {
                entities,
                zones,
                initial_infected: 2,
                ..OutbreakConfig::default()
            };
            let mut first = Oracle::new(seed, config.clone()).unwrap();
            let mut second = Oracle::new(seed, config).unwrap();
            let script = first.script().unwrap();
            prop_assert_eq!(&script, &second.script().unwrap());
            prop_assert_eq!(first.snapshot(), second.snapshot());

            // One step message per truth entry plus the terminal message.
            prop_assert_eq!(script.len(), first.steps_emitted() + 1);
            for step in 0..first.steps_emitted() {
                prop_assert_eq!(first.truth_at(step).unwrap().total(), entities);
            }
        }
    }
}
