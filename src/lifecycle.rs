//! Routing lifecycle manager.
//!
//! Enforces the lifecycle state machine, metadata edit windows, the primary
//! route rule and deletion guarding. Every transition is a read-validate-
//! commit against the routing's revision, so two concurrent approvals cannot
//! both succeed: the second one replans against RELEASED and fails.
//!
//! ## Transitions
//!
//! | Action | From | To | Side effect |
//! |--------|------|----|-------------|
//! | submit | DRAFT | REVIEW | |
//! | approve | REVIEW | RELEASED | records approver, time, notes, structure fingerprint |
//! | reject | REVIEW | DRAFT | records reviewer notes |
//! | activate | RELEASED | PRODUCTION | |
//! | obsolete | PRODUCTION | OBSOLETE | clears the primary flag |

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;

use crate::canonical::structure_fingerprint;
use crate::collaborators::WorkOrderGateway;
use crate::config::EngineConfig;
use crate::error::{RoutingError, RoutingResult};
use crate::identifiers::{parse_version, validate_site_code, INITIAL_VERSION};
use crate::mutation::mutate_routing;
use crate::store::{RoutingChangeSet, RoutingDraft, RoutingStore, StoreError};
use crate::types::{
    ApprovalRecord, LifecycleState, NewRouting, Routing, RoutingAggregate, RoutingId, RoutingPatch,
};

/// A requested lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleAction {
    /// DRAFT -> REVIEW.
    Submit,
    /// REVIEW -> RELEASED.
    Approve {
        /// Approver identity.
        approved_by: String,
        /// Approval notes.
        notes: Option<String>,
    },
    /// REVIEW -> DRAFT.
    Reject {
        /// Reviewer notes explaining the rejection.
        notes: Option<String>,
    },
    /// RELEASED -> PRODUCTION.
    Activate,
    /// PRODUCTION -> OBSOLETE.
    Obsolete,
}

impl LifecycleAction {
    /// State the action moves a routing into.
    pub fn target(&self) -> LifecycleState {
        match self {
            Self::Submit => LifecycleState::Review,
            Self::Approve { .. } => LifecycleState::Released,
            Self::Reject { .. } => LifecycleState::Draft,
            Self::Activate => LifecycleState::Production,
            Self::Obsolete => LifecycleState::Obsolete,
        }
    }

    /// Action name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Approve { .. } => "approve",
            Self::Reject { .. } => "reject",
            Self::Activate => "activate",
            Self::Obsolete => "obsolete",
        }
    }

    /// Routing row after applying the action, or the transition error.
    fn apply(&self, aggregate: &RoutingAggregate) -> RoutingResult<Routing> {
        let current = &aggregate.routing;
        let target = self.target();
        if !current.state.can_transition_to(target) {
            return Err(RoutingError::InvalidLifecycleTransition {
                routing: current.id,
                from: current.state,
                to: target,
            });
        }

        let mut next = current.clone();
        next.state = target;
        match self {
            Self::Approve { approved_by, notes } => {
                next.approval = Some(ApprovalRecord {
                    approved_by: approved_by.clone(),
                    approved_at: Utc::now(),
                    notes: notes.clone(),
                    structure_fingerprint: structure_fingerprint(aggregate),
                });
            }
            Self::Reject { notes } => {
                next.review_notes = notes.clone();
            }
            Self::Obsolete => {
                next.is_primary_route = false;
            }
            Self::Submit | Self::Activate => {}
        }
        Ok(next)
    }
}

/// Lifecycle manager over a routing store and the work-order collaborator.
pub struct RoutingLifecycleManager<S, W> {
    store: Arc<S>,
    work_orders: Arc<W>,
    config: EngineConfig,
}

impl<S, W> Clone for RoutingLifecycleManager<S, W> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            work_orders: Arc::clone(&self.work_orders),
            config: self.config.clone(),
        }
    }
}

impl<S: RoutingStore, W: WorkOrderGateway> RoutingLifecycleManager<S, W> {
    /// Create a manager.
    pub fn new(store: Arc<S>, work_orders: Arc<W>, config: EngineConfig) -> Self {
        Self {
            store,
            work_orders,
            config,
        }
    }

    /// Create a routing in DRAFT with a store-assigned routing number.
    ///
    /// The version defaults to "1.0" and must be dotted numeric. The site
    /// code must be non-empty and free of `-`.
    pub async fn create_routing(&self, input: NewRouting) -> RoutingResult<Routing> {
        validate_site_code(&input.site)?;
        let version = input.version.unwrap_or_else(|| INITIAL_VERSION.to_string());
        parse_version(&version)?;

        let now = Utc::now();
        let routing = Routing {
            id: RoutingId::generate(),
            routing_number: String::new(),
            part: input.part,
            site: input.site,
            version,
            state: LifecycleState::Draft,
            description: input.description,
            is_primary_route: false,
            approval: None,
            review_notes: None,
            effective_from: input.effective_from,
            effective_to: input.effective_to,
            derived_from: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        };

        let created = self.store.insert_routing(RoutingDraft::empty(routing)).await?;
        tracing::info!(
            routing_id = %created.id,
            routing_number = %created.routing_number,
            part = %created.part,
            site = %created.site,
            version = %created.version,
            "Routing created"
        );
        Ok(created)
    }

    /// Fetch a routing.
    pub async fn get_routing(&self, id: &RoutingId) -> RoutingResult<Routing> {
        self.store
            .get_routing(id)
            .await?
            .ok_or(RoutingError::RoutingNotFound(*id))
    }

    /// Change description or effective dates; DRAFT and REVIEW only.
    pub async fn update_routing(&self, id: &RoutingId, patch: RoutingPatch) -> RoutingResult<Routing> {
        let (updated, ()) = mutate_routing(&*self.store, *id, self.config.max_commit_retries, |agg| {
            let current = &agg.routing;
            if !current.state.allows_metadata_edits() {
                return Err(RoutingError::MetadataLocked {
                    routing: current.id,
                    state: current.state,
                });
            }
            let mut next = current.clone();
            if let Some(description) = &patch.description {
                next.description = description.clone();
            }
            if let Some(from) = patch.effective_from {
                next.effective_from = from;
            }
            if let Some(to) = patch.effective_to {
                next.effective_to = to;
            }
            Ok((RoutingChangeSet::for_aggregate(agg).with_routing(next), ()))
        })
        .await?;

        tracing::info!(routing_id = %updated.id, revision = updated.revision, "Routing metadata updated");
        Ok(updated)
    }

    /// Apply a lifecycle action atomically.
    pub async fn transition(&self, id: &RoutingId, action: LifecycleAction) -> RoutingResult<Routing> {
        if let LifecycleAction::Approve { approved_by, .. } = &action {
            if approved_by.trim().is_empty() {
                return Err(RoutingError::MissingApprover { routing: *id });
            }
        }

        let result = mutate_routing(&*self.store, *id, self.config.max_commit_retries, |agg| {
            let next = action.apply(agg)?;
            let from = agg.routing.state;
            Ok((RoutingChangeSet::for_aggregate(agg).with_routing(next), from))
        })
        .await;

        match result {
            Ok((routing, from)) => {
                tracing::info!(
                    routing_id = %routing.id,
                    routing_number = %routing.routing_number,
                    action = action.name(),
                    from = %from,
                    to = %routing.state,
                    "Lifecycle transition"
                );
                Ok(routing)
            }
            Err(err) => {
                if let RoutingError::InvalidLifecycleTransition { from, to, .. } = &err {
                    tracing::warn!(
                        routing_id = %id,
                        action = action.name(),
                        from = %from,
                        to = %to,
                        "Lifecycle transition rejected"
                    );
                }
                Err(err)
            }
        }
    }

    /// DRAFT -> REVIEW.
    pub async fn submit(&self, id: &RoutingId) -> RoutingResult<Routing> {
        self.transition(id, LifecycleAction::Submit).await
    }

    /// REVIEW -> RELEASED, recording approver identity and time.
    pub async fn approve(
        &self,
        id: &RoutingId,
        approved_by: impl Into<String>,
        notes: Option<String>,
    ) -> RoutingResult<Routing> {
        self.transition(
            id,
            LifecycleAction::Approve {
                approved_by: approved_by.into(),
                notes,
            },
        )
        .await
    }

    /// REVIEW -> DRAFT, recording reviewer notes.
    pub async fn reject(&self, id: &RoutingId, notes: Option<String>) -> RoutingResult<Routing> {
        self.transition(id, LifecycleAction::Reject { notes }).await
    }

    /// RELEASED -> PRODUCTION.
    pub async fn activate(&self, id: &RoutingId) -> RoutingResult<Routing> {
        self.transition(id, LifecycleAction::Activate).await
    }

    /// PRODUCTION -> OBSOLETE.
    pub async fn obsolete(&self, id: &RoutingId) -> RoutingResult<Routing> {
        self.transition(id, LifecycleAction::Obsolete).await
    }

    /// Make a PRODUCTION routing the primary route of its (part, site),
    /// demoting the previous primary in the same commit.
    pub async fn set_primary_route(&self, id: &RoutingId) -> RoutingResult<Routing> {
        let (routing, ()) = mutate_routing(&*self.store, *id, self.config.max_commit_retries, |agg| {
            let current = &agg.routing;
            if current.state != LifecycleState::Production {
                return Err(RoutingError::PrimaryRouteNotAllowed {
                    routing: current.id,
                    state: current.state,
                });
            }
            let mut next = current.clone();
            next.is_primary_route = true;
            let mut changes = RoutingChangeSet::for_aggregate(agg).with_routing(next);
            changes.demote_other_primaries = true;
            Ok((changes, ()))
        })
        .await?;

        tracing::info!(
            routing_id = %routing.id,
            part = %routing.part,
            site = %routing.site,
            "Primary route set"
        );
        Ok(routing)
    }

    /// Delete a routing with its steps and dependencies.
    ///
    /// Refused with `RoutingInUse` while the work-order collaborator reports
    /// active work orders for it.
    pub async fn delete_routing(&self, id: &RoutingId) -> RoutingResult<()> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let routing = self.get_routing(id).await?;
            let active = self
                .work_orders
                .count_active_work_orders_using_routing(id)
                .await
                .map_err(RoutingError::from_collaborator)?;
            if active > 0 {
                tracing::warn!(
                    routing_id = %id,
                    active_work_orders = active,
                    "Deletion refused, routing in use"
                );
                return Err(RoutingError::RoutingInUse {
                    routing: *id,
                    active_work_orders: active,
                });
            }

            match self.store.delete_routing(id, routing.revision).await {
                Ok(()) => {
                    tracing::info!(
                        routing_id = %id,
                        routing_number = %routing.routing_number,
                        "Routing deleted"
                    );
                    return Ok(());
                }
                Err(StoreError::RevisionConflict { .. }) if attempts <= self.config.max_commit_retries => {
                    tracing::debug!(routing_id = %id, attempt = attempts, "Revision conflict, retrying delete");
                }
                Err(StoreError::RevisionConflict { .. }) => {
                    return Err(RoutingError::ConcurrentModification {
                        routing: *id,
                        attempts,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// The routing followed by the routings it was copied from, newest first.
    ///
    /// Stops at the first ancestor that no longer exists.
    pub async fn version_history(&self, id: &RoutingId) -> RoutingResult<Vec<Routing>> {
        let mut history = vec![self.get_routing(id).await?];
        let mut seen: BTreeSet<RoutingId> = BTreeSet::from([*id]);

        while let Some(parent) = history.last().and_then(|r| r.derived_from) {
            if !seen.insert(parent) {
                break;
            }
            match self.store.get_routing(&parent).await? {
                Some(routing) => history.push(routing),
                None => break,
            }
        }
        Ok(history)
    }
}
