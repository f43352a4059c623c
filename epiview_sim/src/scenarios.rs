//! Viewer scenarios for deterministic simulation runs.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// Clean push stream from seed message to `done`
    LiveStream,

    /// Push channel refused; everything arrives from the batch endpoint
    BatchFallback,

    /// Channel fails before the first frame; batch takes over
    EarlyDrop,

    /// Channel fails mid-run; world must stay at the last valid fold
    MidStreamOutage,

    /// One frame is truncated JSON
    CorruptFrame,

    /// Service ends the run with an error message
    ServiceError,

    /// Channel closes without a terminal message
    SilentClose,

    /// Random pause/scrub/play while frames keep arriving
    ScrubStorm,

    /// Full run replayed from step 0 at maximum speed
    FastForward,

    /// View hidden for part of the run; ingestion must not stall
    TabSwitch,

    /// Pan, zoom, resize and hotspot jumps during the run
    ViewportChurn,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::LiveStream,
            ScenarioId::BatchFallback,
            ScenarioId::EarlyDrop,
            ScenarioId::MidStreamOutage,
            ScenarioId::CorruptFrame,
            ScenarioId::ServiceError,
            ScenarioId::SilentClose,
            ScenarioId::ScrubStorm,
            ScenarioId::FastForward,
            ScenarioId::TabSwitch,
            ScenarioId::ViewportChurn,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::LiveStream => "live_stream",
            ScenarioId::BatchFallback => "batch_fallback",
            ScenarioId::EarlyDrop => "early_drop",
            ScenarioId::MidStreamOutage => "mid_stream_outage",
            ScenarioId::CorruptFrame => "corrupt_frame",
            ScenarioId::ServiceError => "service_error",
            ScenarioId::SilentClose => "silent_close",
            ScenarioId::ScrubStorm => "scrub_storm",
            ScenarioId::FastForward => "fast_forward",
            ScenarioId::TabSwitch => "tab_switch",
            ScenarioId::ViewportChurn => "viewport_churn",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::LiveStream => "push stream end to end, world tracks the oracle every step",
            ScenarioId::BatchFallback => "open refused, batch endpoint delivers the whole run",
            ScenarioId::EarlyDrop => "transport error before any event, batch fallback",
            ScenarioId::MidStreamOutage => "transport error after events, run errors at last valid fold",
            ScenarioId::CorruptFrame => "truncated JSON frame, run errors without crashing the loop",
            ScenarioId::ServiceError => "service pushes an error message instead of done",
            ScenarioId::SilentClose => "channel closes with no terminal message",
            ScenarioId::ScrubStorm => "random scrubs while streaming, fold equals replay at every stop",
            ScenarioId::FastForward => "finished run replayed from step 0 at top speed",
            ScenarioId::TabSwitch => "rendering halted and resumed while ingestion continues",
            ScenarioId::ViewportChurn => "pan, zoom, resize and hotspot jumps between frames",
        }
    }

    /// Returns true if the run is expected to end in `Errored`.
    pub fn expects_error(&self) -> bool {
        matches!(
            self,
            ScenarioId::MidStreamOutage
                | ScenarioId::CorruptFrame
                | ScenarioId::ServiceError
                | ScenarioId::SilentClose
        )
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_lowercase().replace('-', "_");
        ScenarioId::all()
            .into_iter()
            .find(|id| id.name() == wanted || id.name().replace('_', "") == wanted)
            .ok_or_else(|| format!("Unknown scenario: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for id in ScenarioId::all() {
            assert_eq!(id.name().parse::<ScenarioId>(), Ok(id));
        }
        assert_eq!("fastforward".parse::<ScenarioId>(), Ok(ScenarioId::FastForward));
        assert_eq!("Tab-Switch".parse::<ScenarioId>(), Ok(ScenarioId::TabSwitch));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}
