//! Error types for routing engine operations.
//!
//! Every failure is reported synchronously and names the offending entity or
//! field. Nothing is persisted on any error path.
//!
//! ## Taxonomy
//!
//! | Kind | Examples | Caller action |
//! |------|----------|---------------|
//! | `Validation` | bad version string, step number 0, cross-routing edge | fix input, retry |
//! | `Conflict` | duplicate step number, cycle, invalid transition | change the request |
//! | `StatePrecondition` | structural edit outside Draft, routing in use | change the request |
//! | `NotFound` | unknown routing, step, dependency, segment | fix reference |
//! | `Internal` | storage or collaborator failure | retry later |

use thiserror::Error;

use crate::store::StoreError;
use crate::types::{
    AvailabilityId, DependencyId, LifecycleState, PartId, ProcessSegmentId, RoutingId, SiteId,
    StepId,
};

/// Result alias for engine operations.
pub type RoutingResult<T> = Result<T, RoutingError>;

/// Classification of a [`RoutingError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input rejected before any write.
    Validation,
    /// Uniqueness violation, cycle, or invalid lifecycle transition.
    Conflict,
    /// Operation not permitted in the routing's current state.
    StatePrecondition,
    /// Referenced entity does not exist.
    NotFound,
    /// Storage or collaborator failure.
    Internal,
}

impl ErrorKind {
    /// Only infrastructure failures are worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Internal)
    }
}

/// Errors returned by the routing engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// Version string is not dotted numeric.
    #[error("Invalid version format '{version}': expected dotted numeric like \"1.0\"")]
    VersionFormat {
        /// The rejected input.
        version: String,
    },

    /// Step number must be positive.
    #[error("Invalid step number {step_number}: step numbers must be positive")]
    InvalidStepNumber {
        /// The rejected number.
        step_number: u32,
    },

    /// Timing override component above the accepted maximum.
    #[error("Invalid {component} time {secs}s: overrides are limited to {max}s")]
    InvalidTiming {
        /// Offending component (setup, cycle or teardown).
        component: &'static str,
        /// The rejected value.
        secs: u64,
        /// Accepted maximum.
        max: u64,
    },

    /// Site code cannot be embedded in a routing number.
    #[error("Invalid site code '{site}': must be non-empty and must not contain '-'")]
    InvalidSiteCode {
        /// The rejected site.
        site: SiteId,
    },

    /// Summed timings do not fit in 64 bits.
    #[error("Timing of step {step} overflows")]
    TimingOverflow {
        /// Step at which the sum overflowed.
        step: StepId,
    },

    /// Edge endpoints belong to different routings.
    #[error("Dependency {predecessor} -> {successor} crosses routings ({predecessor_routing} vs {successor_routing})")]
    CrossRoutingDependency {
        /// Predecessor step.
        predecessor: StepId,
        /// Successor step.
        successor: StepId,
        /// Routing owning the predecessor.
        predecessor_routing: RoutingId,
        /// Routing owning the successor.
        successor_routing: RoutingId,
    },

    /// A step cannot depend on itself.
    #[error("Step {step} cannot depend on itself")]
    SelfDependency {
        /// The step.
        step: StepId,
    },

    /// Pinning constraint given without a value.
    #[error("Timing constraint {kind} requires a value")]
    MissingConstraintValue {
        /// Constraint kind name.
        kind: String,
    },

    /// Approval without an approver identity.
    #[error("Approval of routing {routing} requires an approver identity")]
    MissingApprover {
        /// Routing being approved.
        routing: RoutingId,
    },

    /// Resequence request does not list exactly the routing's steps.
    #[error("Invalid resequence for routing {routing}: {reason}")]
    InvalidResequence {
        /// Routing being resequenced.
        routing: RoutingId,
        /// What was wrong with the ordering.
        reason: String,
    },

    /// (part, site, version) already used.
    #[error("Routing version {version} already exists for part {part} at site {site}")]
    DuplicateRoutingVersion {
        /// Part.
        part: PartId,
        /// Site.
        site: SiteId,
        /// Version.
        version: String,
    },

    /// Routing number already used.
    #[error("Routing number {routing_number} already exists")]
    DuplicateRoutingNumber {
        /// The colliding number.
        routing_number: String,
    },

    /// Step number already used in the routing.
    #[error("Step number {step_number} already exists in routing {routing}")]
    DuplicateStepNumber {
        /// Routing.
        routing: RoutingId,
        /// Colliding number.
        step_number: u32,
    },

    /// Identical edge already present.
    #[error("Dependency {predecessor} -> {successor} already exists")]
    DuplicateDependency {
        /// Predecessor step.
        predecessor: StepId,
        /// Successor step.
        successor: StepId,
    },

    /// Availability already declared for (part, site).
    #[error("Availability already declared for part {part} at site {site}")]
    DuplicateAvailability {
        /// Part.
        part: PartId,
        /// Site.
        site: SiteId,
    },

    /// Inserting the edge would close a cycle.
    #[error("Circular dependency: adding {predecessor} -> {successor} closes cycle {}", format_path(.cycle))]
    CircularDependency {
        /// Predecessor of the rejected edge.
        predecessor: StepId,
        /// Successor of the rejected edge.
        successor: StepId,
        /// Existing path from successor back to predecessor.
        cycle: Vec<StepId>,
    },

    /// Transition not listed for the current state.
    #[error("Invalid lifecycle transition for routing {routing}: {from} -> {to}")]
    InvalidLifecycleTransition {
        /// Routing.
        routing: RoutingId,
        /// Current state.
        from: LifecycleState,
        /// Attempted target.
        to: LifecycleState,
    },

    /// Structural edit attempted outside Draft.
    #[error("Routing {routing} is {state}: steps and dependencies can only change in DRAFT")]
    StructureLocked {
        /// Routing.
        routing: RoutingId,
        /// Current state.
        state: LifecycleState,
    },

    /// Metadata edit attempted after review.
    #[error("Routing {routing} is {state}: metadata can only change in DRAFT or REVIEW")]
    MetadataLocked {
        /// Routing.
        routing: RoutingId,
        /// Current state.
        state: LifecycleState,
    },

    /// Primary flag requested outside Production.
    #[error("Routing {routing} is {state}: only PRODUCTION routings can be primary")]
    PrimaryRouteNotAllowed {
        /// Routing.
        routing: RoutingId,
        /// Current state.
        state: LifecycleState,
    },

    /// Work orders still reference the routing.
    #[error("Routing {routing} is referenced by {active_work_orders} active work order(s)")]
    RoutingInUse {
        /// Routing.
        routing: RoutingId,
        /// Count reported by the work-order collaborator.
        active_work_orders: u32,
    },

    /// Unknown routing.
    #[error("Routing not found: {0}")]
    RoutingNotFound(RoutingId),

    /// Unknown step.
    #[error("Step not found: {0}")]
    StepNotFound(StepId),

    /// Unknown dependency.
    #[error("Dependency not found: {0}")]
    DependencyNotFound(DependencyId),

    /// Unknown availability record.
    #[error("Availability not found: {0}")]
    AvailabilityNotFound(AvailabilityId),

    /// Process segment not in master data.
    #[error("Process segment not found: {0}")]
    ProcessSegmentNotFound(ProcessSegmentId),

    /// Optimistic commit kept losing to concurrent writers.
    #[error("Routing {routing} was modified concurrently; gave up after {attempts} attempt(s)")]
    ConcurrentModification {
        /// Routing.
        routing: RoutingId,
        /// Attempts made.
        attempts: u32,
    },

    /// Storage backend failure.
    #[error("Store error: {0}")]
    Store(String),

    /// External collaborator failure.
    #[error("Collaborator error: {0}")]
    Collaborator(String),
}

fn format_path(path: &[StepId]) -> String {
    path.iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl RoutingError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::VersionFormat { .. }
            | Self::InvalidStepNumber { .. }
            | Self::InvalidTiming { .. }
            | Self::InvalidSiteCode { .. }
            | Self::TimingOverflow { .. }
            | Self::CrossRoutingDependency { .. }
            | Self::SelfDependency { .. }
            | Self::MissingConstraintValue { .. }
            | Self::MissingApprover { .. }
            | Self::InvalidResequence { .. } => ErrorKind::Validation,

            Self::DuplicateRoutingVersion { .. }
            | Self::DuplicateRoutingNumber { .. }
            | Self::DuplicateStepNumber { .. }
            | Self::DuplicateDependency { .. }
            | Self::DuplicateAvailability { .. }
            | Self::CircularDependency { .. }
            | Self::InvalidLifecycleTransition { .. } => ErrorKind::Conflict,

            Self::StructureLocked { .. }
            | Self::MetadataLocked { .. }
            | Self::PrimaryRouteNotAllowed { .. }
            | Self::RoutingInUse { .. } => ErrorKind::StatePrecondition,

            Self::RoutingNotFound(_)
            | Self::StepNotFound(_)
            | Self::DependencyNotFound(_)
            | Self::AvailabilityNotFound(_)
            | Self::ProcessSegmentNotFound(_) => ErrorKind::NotFound,

            Self::ConcurrentModification { .. } | Self::Store(_) | Self::Collaborator(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Wrap a collaborator failure.
    pub fn from_collaborator<E: std::error::Error>(e: E) -> Self {
        Self::Collaborator(e.to_string())
    }
}

impl From<StoreError> for RoutingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RoutingNotFound(id) => Self::RoutingNotFound(id),
            StoreError::AvailabilityNotFound(id) => Self::AvailabilityNotFound(id),
            StoreError::DuplicateRoutingVersion { part, site, version } => {
                Self::DuplicateRoutingVersion { part, site, version }
            }
            StoreError::DuplicateRoutingNumber(routing_number) => {
                Self::DuplicateRoutingNumber { routing_number }
            }
            StoreError::DuplicateStepNumber { routing, step_number } => {
                Self::DuplicateStepNumber { routing, step_number }
            }
            StoreError::DuplicateAvailability { part, site } => {
                Self::DuplicateAvailability { part, site }
            }
            StoreError::RevisionConflict { routing, .. } => Self::ConcurrentModification {
                routing,
                attempts: 1,
            },
            StoreError::Backend(msg) => Self::Store(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_kind_classification() {
        let routing = RoutingId::new(Uuid::from_u128(1));
        assert_eq!(
            RoutingError::VersionFormat { version: "x".into() }.kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            RoutingError::InvalidLifecycleTransition {
                routing,
                from: LifecycleState::Obsolete,
                to: LifecycleState::Production,
            }
            .kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            RoutingError::RoutingInUse { routing, active_work_orders: 2 }.kind(),
            ErrorKind::StatePrecondition
        );
        assert_eq!(RoutingError::RoutingNotFound(routing).kind(), ErrorKind::NotFound);
        assert!(RoutingError::Store("down".into()).kind().is_retryable());
        assert!(!ErrorKind::Conflict.is_retryable());
    }

    #[test]
    fn test_cycle_message_names_edge_and_path() {
        let a = StepId::new(Uuid::from_u128(1));
        let b = StepId::new(Uuid::from_u128(2));
        let err = RoutingError::CircularDependency {
            predecessor: b,
            successor: a,
            cycle: vec![a, b],
        };
        let msg = err.to_string();
        assert!(msg.contains(&format!("{} -> {}", b, a)));
        assert!(msg.contains(&format!("{} -> {}", a, b)));
    }
}
