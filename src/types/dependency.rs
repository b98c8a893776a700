//! Precedence edges between steps of one routing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{DependencyId, RoutingId, StepId};

/// How the successor's timing relates to the predecessor's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyType {
    /// Successor starts after predecessor finishes.
    FinishToStart,
    /// Successor starts after predecessor starts.
    StartToStart,
    /// Successor finishes after predecessor finishes.
    FinishToFinish,
    /// Successor finishes after predecessor starts.
    StartToFinish,
}

impl DependencyType {
    /// Parse from the stored name.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "FINISH_TO_START" | "FS" => Some(Self::FinishToStart),
            "START_TO_START" | "SS" => Some(Self::StartToStart),
            "FINISH_TO_FINISH" | "FF" => Some(Self::FinishToFinish),
            "START_TO_FINISH" | "SF" => Some(Self::StartToFinish),
            _ => None,
        }
    }

    /// Stored name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FinishToStart => "FINISH_TO_START",
            Self::StartToStart => "START_TO_START",
            Self::FinishToFinish => "FINISH_TO_FINISH",
            Self::StartToFinish => "START_TO_FINISH",
        }
    }
}

impl Default for DependencyType {
    fn default() -> Self {
        Self::FinishToStart
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling constraint attached to a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstraintKind {
    /// Schedule as early as precedence allows.
    AsSoonAsPossible,
    /// Schedule as late as precedence allows.
    AsLateAsPossible,
    /// Pin the successor's start.
    MustStartOn,
    /// Pin the successor's finish.
    MustFinishOn,
}

impl ConstraintKind {
    /// Pinning constraints need a date value.
    pub fn requires_value(&self) -> bool {
        matches!(self, Self::MustStartOn | Self::MustFinishOn)
    }

    /// Parse from the stored name.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "AS_SOON_AS_POSSIBLE" => Some(Self::AsSoonAsPossible),
            "AS_LATE_AS_POSSIBLE" => Some(Self::AsLateAsPossible),
            "MUST_START_ON" => Some(Self::MustStartOn),
            "MUST_FINISH_ON" => Some(Self::MustFinishOn),
            _ => None,
        }
    }

    /// Stored name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AsSoonAsPossible => "AS_SOON_AS_POSSIBLE",
            Self::AsLateAsPossible => "AS_LATE_AS_POSSIBLE",
            Self::MustStartOn => "MUST_START_ON",
            Self::MustFinishOn => "MUST_FINISH_ON",
        }
    }
}

impl Default for ConstraintKind {
    fn default() -> Self {
        Self::AsSoonAsPossible
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Constraint kind plus optional value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimingConstraint {
    /// Kind of constraint.
    pub kind: ConstraintKind,
    /// Date for pinning constraints.
    pub value: Option<DateTime<Utc>>,
}

impl TimingConstraint {
    /// As soon as possible, no value.
    pub fn asap() -> Self {
        Self::default()
    }

    /// Constraint with a value.
    pub fn pinned(kind: ConstraintKind, value: DateTime<Utc>) -> Self {
        Self {
            kind,
            value: Some(value),
        }
    }
}

/// Directed precedence edge `predecessor -> successor`.
///
/// Ordered canonically by (predecessor, successor, dependency_type).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepDependency {
    /// Row identifier.
    pub id: DependencyId,
    /// Routing both steps belong to.
    pub routing_id: RoutingId,
    /// Step that must come first.
    pub predecessor: StepId,
    /// Step that depends on the predecessor.
    pub successor: StepId,
    /// Precedence type.
    pub dependency_type: DependencyType,
    /// Timing constraint.
    pub constraint: TimingConstraint,
}

impl StepDependency {
    /// Create a new edge with a fresh id.
    pub fn new(
        routing_id: RoutingId,
        predecessor: StepId,
        successor: StepId,
        dependency_type: DependencyType,
        constraint: TimingConstraint,
    ) -> Self {
        Self {
            id: DependencyId::generate(),
            routing_id,
            predecessor,
            successor,
            dependency_type,
            constraint,
        }
    }

    /// Whether the edge touches `step` at either end.
    pub fn touches(&self, step: &StepId) -> bool {
        &self.predecessor == step || &self.successor == step
    }
}

impl PartialOrd for StepDependency {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StepDependency {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.predecessor
            .cmp(&other.predecessor)
            .then_with(|| self.successor.cmp(&other.successor))
            .then_with(|| self.dependency_type.cmp(&other.dependency_type))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Input for adding a dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDependency {
    /// Step that must come first.
    pub predecessor: StepId,
    /// Step that depends on the predecessor.
    pub successor: StepId,
    /// Precedence type.
    pub dependency_type: DependencyType,
    /// Timing constraint.
    pub constraint: TimingConstraint,
}

impl NewDependency {
    /// Finish-to-start, as soon as possible.
    pub fn finish_to_start(predecessor: StepId, successor: StepId) -> Self {
        Self {
            predecessor,
            successor,
            dependency_type: DependencyType::FinishToStart,
            constraint: TimingConstraint::asap(),
        }
    }

    /// Set the dependency type.
    pub fn with_type(mut self, dependency_type: DependencyType) -> Self {
        self.dependency_type = dependency_type;
        self
    }

    /// Set the timing constraint.
    pub fn with_constraint(mut self, constraint: TimingConstraint) -> Self {
        self.constraint = constraint;
        self
    }
}
