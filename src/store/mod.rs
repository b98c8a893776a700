//! Routing storage backends.
//!
//! The store is the only component touching persistence. Every method is one
//! transaction: it either applies completely or not at all, and readers only
//! ever observe committed states.
//!
//! ## Optimistic concurrency
//!
//! Each routing row carries a `revision`. Engine components load a
//! [`RoutingAggregate`], validate the requested change against it, and
//! [`commit`](RoutingStore::commit) a [`RoutingChangeSet`] tagged with the
//! revision they read. A backend applies the change set only if the stored
//! revision still matches, so a read-validate-write cycle behaves as if it
//! held the routing exclusively.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;

use crate::types::{
    AvailabilityId, DependencyId, PartId, PartSiteAvailability, Routing, RoutingAggregate,
    RoutingId, RoutingStep, SiteId, StepDependency, StepId,
};

/// Errors reported by storage backends.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Routing row does not exist.
    #[error("Routing not found: {0}")]
    RoutingNotFound(RoutingId),

    /// Availability row does not exist.
    #[error("Availability not found: {0}")]
    AvailabilityNotFound(AvailabilityId),

    /// The routing changed since it was read.
    #[error("Revision conflict on routing {routing}: expected {expected}, found {actual}")]
    RevisionConflict {
        /// Routing.
        routing: RoutingId,
        /// Revision the caller read.
        expected: u64,
        /// Revision currently stored.
        actual: u64,
    },

    /// Unique (part, site, version) violated.
    #[error("Duplicate routing version {version} for part {part} at site {site}")]
    DuplicateRoutingVersion {
        /// Part.
        part: PartId,
        /// Site.
        site: SiteId,
        /// Version.
        version: String,
    },

    /// Unique routing number violated.
    #[error("Duplicate routing number {0}")]
    DuplicateRoutingNumber(String),

    /// Unique (routing, step number) violated.
    #[error("Duplicate step number {step_number} in routing {routing}")]
    DuplicateStepNumber {
        /// Routing.
        routing: RoutingId,
        /// Step number.
        step_number: u32,
    },

    /// Unique (part, site) availability violated.
    #[error("Duplicate availability for part {part} at site {site}")]
    DuplicateAvailability {
        /// Part.
        part: PartId,
        /// Site.
        site: SiteId,
    },

    /// Any other backend failure.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// A routing row to insert together with its initial contents.
///
/// The backend assigns `routing_number` inside the insert transaction; the
/// value carried here is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDraft {
    /// Routing row (number assigned by the store).
    pub routing: Routing,
    /// Initial steps.
    pub steps: Vec<RoutingStep>,
    /// Initial dependency edges.
    pub dependencies: Vec<StepDependency>,
}

impl RoutingDraft {
    /// Draft without contents.
    pub fn empty(routing: Routing) -> Self {
        Self {
            routing,
            steps: Vec::new(),
            dependencies: Vec::new(),
        }
    }
}

/// Atomic change to one routing and the rows it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingChangeSet {
    /// Routing being changed.
    pub routing_id: RoutingId,
    /// Revision the change was validated against.
    pub expected_revision: u64,
    /// Replacement routing row (lifecycle state, metadata, flags).
    pub routing: Option<Routing>,
    /// Steps to insert or replace.
    pub upsert_steps: Vec<RoutingStep>,
    /// Steps to delete; their edges are removed with them.
    pub delete_steps: Vec<StepId>,
    /// Edges to insert.
    pub insert_dependencies: Vec<StepDependency>,
    /// Edges to delete.
    pub delete_dependencies: Vec<DependencyId>,
    /// Clear the primary flag on every other routing of the same (part, site).
    pub demote_other_primaries: bool,
}

impl RoutingChangeSet {
    /// Empty change set against a known revision.
    pub fn new(routing_id: RoutingId, expected_revision: u64) -> Self {
        Self {
            routing_id,
            expected_revision,
            routing: None,
            upsert_steps: Vec::new(),
            delete_steps: Vec::new(),
            insert_dependencies: Vec::new(),
            delete_dependencies: Vec::new(),
            demote_other_primaries: false,
        }
    }

    /// Change set against the aggregate's current revision.
    pub fn for_aggregate(aggregate: &RoutingAggregate) -> Self {
        Self::new(aggregate.routing.id, aggregate.routing.revision)
    }

    /// Replace the routing row.
    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.routing = Some(routing);
        self
    }
}

/// Trait for routing storage backends.
///
/// Implementations must return steps ordered by step number, dependencies in
/// canonical order, and routing lists ordered by creation time.
#[async_trait]
pub trait RoutingStore: Send + Sync {
    /// Insert a routing with its initial steps and edges, assigning the next
    /// routing number for its (site, part) in the same transaction.
    ///
    /// Fails with `DuplicateRoutingVersion` if (part, site, version) is taken.
    async fn insert_routing(&self, draft: RoutingDraft) -> Result<Routing, StoreError>;

    /// Fetch a routing row.
    async fn get_routing(&self, id: &RoutingId) -> Result<Option<Routing>, StoreError>;

    /// Fetch a routing with its steps and edges from one snapshot.
    async fn load_aggregate(&self, id: &RoutingId) -> Result<Option<RoutingAggregate>, StoreError>;

    /// Fetch the routing owning a step.
    async fn routing_of_step(&self, step: &StepId) -> Result<Option<RoutingId>, StoreError>;

    /// Fetch the routing owning a dependency edge.
    async fn routing_of_dependency(
        &self,
        dependency: &DependencyId,
    ) -> Result<Option<RoutingId>, StoreError>;

    /// All routings for a (part, site) pair.
    async fn list_routings(&self, part: &PartId, site: &SiteId) -> Result<Vec<Routing>, StoreError>;

    /// Apply a change set atomically if the routing is still at
    /// `expected_revision`. Returns the updated routing row.
    ///
    /// Step-number uniqueness is checked against the final state, so a change
    /// set may swap numbers between steps.
    async fn commit(&self, changes: RoutingChangeSet) -> Result<Routing, StoreError>;

    /// Delete a routing and everything it owns if it is still at
    /// `expected_revision`.
    async fn delete_routing(&self, id: &RoutingId, expected_revision: u64) -> Result<(), StoreError>;

    /// Insert an availability record; (part, site) must be unused.
    async fn insert_availability(
        &self,
        record: PartSiteAvailability,
    ) -> Result<PartSiteAvailability, StoreError>;

    /// Availability for a (part, site) pair.
    async fn get_availability(
        &self,
        part: &PartId,
        site: &SiteId,
    ) -> Result<Option<PartSiteAvailability>, StoreError>;

    /// Availability by id.
    async fn get_availability_by_id(
        &self,
        id: &AvailabilityId,
    ) -> Result<Option<PartSiteAvailability>, StoreError>;

    /// All availability records of a part, ordered by (rank, site).
    async fn list_availability_for_part(
        &self,
        part: &PartId,
    ) -> Result<Vec<PartSiteAvailability>, StoreError>;

    /// Replace an availability record.
    async fn update_availability(
        &self,
        record: PartSiteAvailability,
    ) -> Result<PartSiteAvailability, StoreError>;

    /// Delete an availability record.
    async fn delete_availability(&self, id: &AvailabilityId) -> Result<(), StoreError>;
}

pub use memory::InMemoryRoutingStore;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresConfig, PostgresRoutingStore, ROUTING_SCHEMA};
