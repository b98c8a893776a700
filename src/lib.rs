//! # routing-engine
//!
//! Versioned manufacturing routings for parts at sites.
//!
//! A routing is the ordered set of process steps a part follows at one site.
//! The engine answers one question consistently under concurrent edits:
//!
//! > Is this routing's structure valid, and may it change right now?
//!
//! ## Core Contract
//!
//! 1. Step numbers are unique within a routing at every observable point
//! 2. The dependency graph between steps is acyclic at all times
//! 3. Lifecycle state only moves along DRAFT → REVIEW → RELEASED → PRODUCTION → OBSOLETE
//!    (plus reject REVIEW → DRAFT), and structure is frozen outside DRAFT
//! 4. No error path leaves partial state behind
//!
//! ## Architecture
//!
//! ```text
//! RoutingComposer ─┐
//! LifecycleManager ┼→ mutate (load → validate → commit@revision) → RoutingStore (Memory or Postgres)
//! StepSequencer ───┘            ↓
//!                        DependencyGraph (cycle check, forward pass)
//! ```
//!
//! ## Determinism Guarantees
//!
//! - Steps are ordered by step number, edges canonically by (predecessor, successor)
//! - Topological ties break by step number
//! - Structure fingerprints ignore row identities

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod error;
pub mod identifiers;
pub mod graph;
pub mod timing;
pub mod canonical;
pub mod store;
pub mod collaborators;
pub mod config;
pub mod telemetry;
pub mod lifecycle;
pub mod sequencer;
pub mod composer;
pub mod engine;

mod mutation;

// Re-exports
pub use types::{
    ApprovalRecord, AvailabilityId, AvailabilityPatch, ConstraintKind, DependencyId,
    DependencyType, LifecycleState, NewAvailability, NewDependency, NewRouting, NewStep, PartId,
    PartSiteAvailability, ProcessSegmentId, Routing, RoutingAggregate, RoutingId, RoutingPatch,
    RoutingStep, RoutingTiming, SegmentTiming, SiteId, StepDependency, StepFlags, StepId,
    StepPatch, StepSchedule, TimingConstraint, TimingOverride, MAX_TIMING_SECS,
};
pub use error::{ErrorKind, RoutingError, RoutingResult};
pub use identifiers::{
    compare_versions, generate_routing_number, increment_version, parse_version, validate_site_code,
    RoutingNumberFormat, INITIAL_VERSION,
};
pub use graph::{DependencyGraph, ForwardPass};
pub use canonical::{canonical_hash, canonical_hash_hex, structure_fingerprint, to_canonical_bytes};
pub use store::{InMemoryRoutingStore, RoutingChangeSet, RoutingDraft, RoutingStore, StoreError};
#[cfg(feature = "postgres")]
pub use store::{PostgresConfig, PostgresRoutingStore, ROUTING_SCHEMA};
pub use collaborators::{
    ProcessSegmentCatalog, StaticSegmentCatalog, StaticWorkOrders, WorkOrderGateway,
};
pub use config::EngineConfig;
pub use telemetry::{init_tracing, LogFormat};
pub use lifecycle::{LifecycleAction, RoutingLifecycleManager};
pub use sequencer::{StepRemoval, StepSequencer};
pub use composer::{
    CopyOptions, CopyOutcome, CopyWarning, RoutingComposer, ValidationIssue, ValidationReport,
};
pub use engine::{InMemoryRoutingEngine, RoutingEngine};

/// Schema version of the routing data model.
/// Increment on breaking changes to any persisted type.
pub const ROUTING_SCHEMA_VERSION: &str = "1.0.0";
