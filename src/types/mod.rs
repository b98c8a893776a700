//! Core types for the routing engine.

pub mod ids;
pub mod routing;
pub mod step;
pub mod dependency;
pub mod availability;
pub mod timing;

pub use ids::{AvailabilityId, DependencyId, PartId, ProcessSegmentId, RoutingId, SiteId, StepId};
pub use routing::{ApprovalRecord, LifecycleState, NewRouting, Routing, RoutingAggregate, RoutingPatch};
pub use step::{NewStep, RoutingStep, StepFlags, StepPatch, TimingOverride, MAX_TIMING_SECS};
pub use dependency::{
    ConstraintKind, DependencyType, NewDependency, StepDependency, TimingConstraint,
};
pub use availability::{AvailabilityPatch, NewAvailability, PartSiteAvailability};
pub use timing::{RoutingTiming, SegmentTiming, StepSchedule};
