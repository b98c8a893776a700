//! Timing values produced by the dependency graph engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ids::StepId;

/// Setup, cycle and teardown seconds for one step or process segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentTiming {
    /// Setup seconds.
    pub setup_secs: u64,
    /// Cycle seconds.
    pub cycle_secs: u64,
    /// Teardown seconds.
    pub teardown_secs: u64,
}

impl SegmentTiming {
    /// Create a timing triple.
    pub fn new(setup_secs: u64, cycle_secs: u64, teardown_secs: u64) -> Self {
        Self {
            setup_secs,
            cycle_secs,
            teardown_secs,
        }
    }

    /// Setup + cycle + teardown, saturating at `u64::MAX`.
    pub fn total(&self) -> u64 {
        self.setup_secs
            .saturating_add(self.cycle_secs)
            .saturating_add(self.teardown_secs)
    }

    /// Setup + cycle + teardown, `None` on overflow.
    pub fn checked_total(&self) -> Option<u64> {
        self.setup_secs
            .checked_add(self.cycle_secs)?
            .checked_add(self.teardown_secs)
    }
}

/// Earliest start/finish of a step from the forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSchedule {
    /// Effective timing used for the step.
    pub timing: SegmentTiming,
    /// Earliest start offset in seconds.
    pub earliest_start: u64,
    /// Earliest finish offset in seconds.
    pub earliest_finish: u64,
}

/// Aggregate timing of a routing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTiming {
    /// Sum of effective setup times.
    pub total_setup_secs: u64,
    /// Sum of effective cycle times.
    pub total_cycle_secs: u64,
    /// Sum of effective teardown times.
    pub total_teardown_secs: u64,
    /// Sum of every step's setup + cycle + teardown.
    pub total_secs: u64,
    /// Length of the longest timing-weighted path through the dependency DAG.
    pub critical_path_secs: u64,
    /// Steps on the critical path, first to last.
    pub critical_path: Vec<StepId>,
    /// Forward-pass schedule per step.
    pub schedule: BTreeMap<StepId, StepSchedule>,
}
