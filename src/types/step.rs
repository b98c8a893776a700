//! Routing steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ProcessSegmentId, RoutingId, StepId};
use super::timing::SegmentTiming;

/// Largest accepted override component, in seconds (about 31 years).
///
/// Keeps routing sums far from `u64` overflow and every value within a
/// Postgres `BIGINT`.
pub const MAX_TIMING_SECS: u64 = 1_000_000_000;

/// Per-step timing overrides in seconds. Absent components fall back to the
/// process segment's defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimingOverride {
    /// Setup time override.
    pub setup_secs: Option<u64>,
    /// Cycle time override.
    pub cycle_secs: Option<u64>,
    /// Teardown time override.
    pub teardown_secs: Option<u64>,
}

impl TimingOverride {
    /// Override all three components.
    pub fn full(setup_secs: u64, cycle_secs: u64, teardown_secs: u64) -> Self {
        Self {
            setup_secs: Some(setup_secs),
            cycle_secs: Some(cycle_secs),
            teardown_secs: Some(teardown_secs),
        }
    }

    /// True when every component is overridden, so no segment lookup is needed.
    pub fn is_complete(&self) -> bool {
        self.setup_secs.is_some() && self.cycle_secs.is_some() && self.teardown_secs.is_some()
    }

    /// True when nothing is overridden.
    pub fn is_empty(&self) -> bool {
        self.setup_secs.is_none() && self.cycle_secs.is_none() && self.teardown_secs.is_none()
    }

    /// First component above [`MAX_TIMING_SECS`], as (name, seconds).
    pub fn out_of_range(&self) -> Option<(&'static str, u64)> {
        [
            ("setup", self.setup_secs),
            ("cycle", self.cycle_secs),
            ("teardown", self.teardown_secs),
        ]
        .into_iter()
        .find_map(|(name, secs)| secs.filter(|s| *s > MAX_TIMING_SECS).map(|s| (name, s)))
    }

    /// Merge with segment defaults.
    pub fn resolve(&self, defaults: SegmentTiming) -> SegmentTiming {
        SegmentTiming {
            setup_secs: self.setup_secs.unwrap_or(defaults.setup_secs),
            cycle_secs: self.cycle_secs.unwrap_or(defaults.cycle_secs),
            teardown_secs: self.teardown_secs.unwrap_or(defaults.teardown_secs),
        }
    }
}

/// Informational step flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepFlags {
    /// Planner hint that the step sits on the critical path. Not used by timing.
    pub is_critical_path: bool,
    /// Step is a quality inspection point.
    pub is_quality_inspection: bool,
}

/// One operation within a routing's sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingStep {
    /// Row identifier.
    pub id: StepId,
    /// Owning routing.
    pub routing_id: RoutingId,
    /// Positive, unique within the routing; gaps allowed.
    pub step_number: u32,
    /// Process segment executed by this step.
    pub process_segment: ProcessSegmentId,
    /// Step flags.
    pub flags: StepFlags,
    /// Timing overrides.
    pub timing: TimingOverride,
    /// Optional operator-facing description.
    pub description: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Input for adding a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewStep {
    /// Requested step number.
    pub step_number: u32,
    /// Process segment reference.
    pub process_segment: ProcessSegmentId,
    /// Step flags.
    pub flags: StepFlags,
    /// Timing overrides.
    pub timing: TimingOverride,
    /// Optional description.
    pub description: Option<String>,
}

impl NewStep {
    /// Step with default flags and no overrides.
    pub fn new(step_number: u32, process_segment: impl Into<ProcessSegmentId>) -> Self {
        Self {
            step_number,
            process_segment: process_segment.into(),
            flags: StepFlags::default(),
            timing: TimingOverride::default(),
            description: None,
        }
    }

    /// Set timing overrides.
    pub fn with_timing(mut self, timing: TimingOverride) -> Self {
        self.timing = timing;
        self
    }

    /// Set flags.
    pub fn with_flags(mut self, flags: StepFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Partial step update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPatch {
    /// New step number.
    pub step_number: Option<u32>,
    /// New process segment.
    pub process_segment: Option<ProcessSegmentId>,
    /// New flags.
    pub flags: Option<StepFlags>,
    /// New timing overrides (replaces all three components).
    pub timing: Option<TimingOverride>,
    /// New description (`Some(None)` clears it).
    pub description: Option<Option<String>>,
}

impl StepPatch {
    /// Apply onto a step, returning the updated copy.
    pub fn apply_to(&self, step: &RoutingStep, now: DateTime<Utc>) -> RoutingStep {
        let mut updated = step.clone();
        if let Some(number) = self.step_number {
            updated.step_number = number;
        }
        if let Some(segment) = &self.process_segment {
            updated.process_segment = segment.clone();
        }
        if let Some(flags) = self.flags {
            updated.flags = flags;
        }
        if let Some(timing) = self.timing {
            updated.timing = timing;
        }
        if let Some(description) = &self.description {
            updated.description = description.clone();
        }
        updated.updated_at = now;
        updated
    }
}
