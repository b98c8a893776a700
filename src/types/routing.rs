//! Routing rows and the lifecycle state they move through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{PartId, RoutingId, SiteId};
use super::step::RoutingStep;
use super::dependency::StepDependency;

/// Lifecycle state of a routing.
///
/// ```text
/// Draft --submit--> Review --approve--> Released --activate--> Production --obsolete--> Obsolete
///   ^                  |
///   +------reject------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// Being authored; structure and metadata fully editable.
    Draft,
    /// Submitted for review; only metadata is editable.
    Review,
    /// Approved; structure frozen, not yet consumable by work orders.
    Released,
    /// Eligible for work-order consumption.
    Production,
    /// Retired. Terminal and read-only.
    Obsolete,
}

impl LifecycleState {
    /// All states in lifecycle order.
    pub const ALL: [LifecycleState; 5] = [
        Self::Draft,
        Self::Review,
        Self::Released,
        Self::Production,
        Self::Obsolete,
    ];

    /// States reachable from this one in a single transition.
    pub fn successors(&self) -> &'static [LifecycleState] {
        match self {
            Self::Draft => &[Self::Review],
            Self::Review => &[Self::Released, Self::Draft],
            Self::Released => &[Self::Production],
            Self::Production => &[Self::Obsolete],
            Self::Obsolete => &[],
        }
    }

    /// Whether `target` is a valid successor of this state.
    pub fn can_transition_to(&self, target: LifecycleState) -> bool {
        self.successors().contains(&target)
    }

    /// Steps and dependency edges may only change while in Draft.
    pub fn allows_structural_edits(&self) -> bool {
        matches!(self, Self::Draft)
    }

    /// Description, notes and effective dates may change in Draft and Review.
    pub fn allows_metadata_edits(&self) -> bool {
        matches!(self, Self::Draft | Self::Review)
    }

    /// No transition leaves this state.
    pub fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }

    /// Parse from the stored SCREAMING_SNAKE_CASE name.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "DRAFT" => Some(Self::Draft),
            "REVIEW" => Some(Self::Review),
            "RELEASED" => Some(Self::Released),
            "PRODUCTION" => Some(Self::Production),
            "OBSOLETE" => Some(Self::Obsolete),
            _ => None,
        }
    }

    /// Stored name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Review => "REVIEW",
            Self::Released => "RELEASED",
            Self::Production => "PRODUCTION",
            Self::Obsolete => "OBSOLETE",
        }
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::Draft
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who approved a routing, when, and against which structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// Identity of the approver.
    pub approved_by: String,
    /// Approval timestamp.
    pub approved_at: DateTime<Utc>,
    /// Free-form approval notes.
    pub notes: Option<String>,
    /// Structure fingerprint at the moment of approval.
    pub structure_fingerprint: String,
}

/// A versioned manufacturing route for one part at one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    /// Row identifier.
    pub id: RoutingId,
    /// Human-readable number, `RTG-{SITE}-{PART}-{SEQ}`.
    pub routing_number: String,
    /// Part this routing manufactures.
    pub part: PartId,
    /// Site the routing runs at.
    pub site: SiteId,
    /// Dotted numeric version, e.g. "1.0".
    pub version: String,
    /// Current lifecycle state.
    pub state: LifecycleState,
    /// Human description.
    pub description: Option<String>,
    /// Preferred routing among Production routings of the same (part, site).
    pub is_primary_route: bool,
    /// Approval metadata, present once approved.
    pub approval: Option<ApprovalRecord>,
    /// Notes left by the last reviewer who rejected the routing.
    pub review_notes: Option<String>,
    /// Start of the effective window.
    pub effective_from: Option<DateTime<Utc>>,
    /// End of the effective window.
    pub effective_to: Option<DateTime<Utc>>,
    /// Routing this one was copied from.
    pub derived_from: Option<RoutingId>,
    /// Optimistic concurrency counter, bumped on every committed change.
    pub revision: u64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Routing {
    /// (part, site) pair this routing belongs to.
    pub fn part_site(&self) -> (&PartId, &SiteId) {
        (&self.part, &self.site)
    }
}

/// Input for creating a routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRouting {
    /// Part reference.
    pub part: PartId,
    /// Site reference.
    pub site: SiteId,
    /// Version string; defaults to "1.0" when absent.
    pub version: Option<String>,
    /// Human description.
    pub description: Option<String>,
    /// Start of the effective window.
    pub effective_from: Option<DateTime<Utc>>,
    /// End of the effective window.
    pub effective_to: Option<DateTime<Utc>>,
}

impl NewRouting {
    /// Minimal input for a (part, site) pair.
    pub fn new(part: impl Into<PartId>, site: impl Into<SiteId>) -> Self {
        Self {
            part: part.into(),
            site: site.into(),
            version: None,
            description: None,
            effective_from: None,
            effective_to: None,
        }
    }

    /// Set an explicit version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Partial metadata update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPatch {
    /// New description (`Some(None)` clears it).
    pub description: Option<Option<String>>,
    /// New effective start (`Some(None)` clears it).
    pub effective_from: Option<Option<DateTime<Utc>>>,
    /// New effective end (`Some(None)` clears it).
    pub effective_to: Option<Option<DateTime<Utc>>>,
}

impl RoutingPatch {
    /// True when the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.description.is_none() && self.effective_from.is_none() && self.effective_to.is_none()
    }
}

/// A routing together with everything it owns, read from one consistent snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingAggregate {
    /// The routing row.
    pub routing: Routing,
    /// Steps ordered by step number.
    pub steps: Vec<RoutingStep>,
    /// Dependency edges ordered by (predecessor, successor).
    pub dependencies: Vec<StepDependency>,
}

impl RoutingAggregate {
    /// Find a step by id.
    pub fn step(&self, id: &super::ids::StepId) -> Option<&RoutingStep> {
        self.steps.iter().find(|s| &s.id == id)
    }

    /// Find a step by number.
    pub fn step_by_number(&self, number: u32) -> Option<&RoutingStep> {
        self.steps.iter().find(|s| s.step_number == number)
    }

    /// Find a dependency edge by id.
    pub fn dependency(&self, id: &super::ids::DependencyId) -> Option<&StepDependency> {
        self.dependencies.iter().find(|d| &d.id == id)
    }
}
