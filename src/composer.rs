//! Routing composer: copy, version listing, release validation, timing and
//! part/site availability.
//!
//! ## Copy
//!
//! A copy is a new routing row inserted together with its copied steps and
//! remapped edges in one store transaction. Steps keep their step numbers.
//! Edges whose endpoints were not copied are dropped and counted, never an
//! error. A cross-site copy without an active availability record for the
//! target site succeeds with a warning; availability is reference data and
//! is never created as a side effect.
//!
//! ## Version selection
//!
//! | Request | Target has routings | Version |
//! |---------|---------------------|---------|
//! | explicit | any | as given (must be dotted numeric) |
//! | none, same site | yes | highest existing + minor bump |
//! | none, other site | no | source version |
//! | none, other site | yes | highest existing + minor bump |

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::canonical::structure_fingerprint;
use crate::collaborators::ProcessSegmentCatalog;
use crate::config::EngineConfig;
use crate::error::{RoutingError, RoutingResult};
use crate::identifiers::{
    compare_versions, increment_version, max_version, parse_version, validate_site_code,
};
use crate::store::{RoutingDraft, RoutingStore, StoreError};
use crate::timing::{compute_timing, resolve_step_timings};
use crate::types::{
    AvailabilityId, AvailabilityPatch, LifecycleState, NewAvailability, PartId,
    PartSiteAvailability, ProcessSegmentId, Routing, RoutingAggregate, RoutingId, RoutingStep,
    RoutingTiming, SiteId, StepDependency, StepId,
};

/// What to copy and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyOptions {
    /// Version of the copy; chosen automatically when absent.
    pub new_version: Option<String>,
    /// Target site; the source site when absent.
    pub new_site: Option<SiteId>,
    /// Deep-copy steps.
    pub include_steps: bool,
    /// Remap dependency edges onto the copied steps.
    pub include_dependencies: bool,
    /// Restrict the copy to these steps of the source.
    pub only_steps: Option<Vec<StepId>>,
    /// Initial state of the copy; DRAFT when absent.
    pub new_state: Option<LifecycleState>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            new_version: None,
            new_site: None,
            include_steps: true,
            include_dependencies: true,
            only_steps: None,
            new_state: None,
        }
    }
}

impl CopyOptions {
    /// Copy the routing row only.
    pub fn header_only() -> Self {
        Self {
            include_steps: false,
            include_dependencies: false,
            ..Self::default()
        }
    }

    /// Copy to another site.
    pub fn to_site(mut self, site: impl Into<SiteId>) -> Self {
        self.new_site = Some(site.into());
        self
    }

    /// Use an explicit version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.new_version = Some(version.into());
        self
    }

    /// Start the copy in another state.
    pub fn with_state(mut self, state: LifecycleState) -> Self {
        self.new_state = Some(state);
        self
    }

    /// Copy only the given steps.
    pub fn only(mut self, steps: impl IntoIterator<Item = StepId>) -> Self {
        self.only_steps = Some(steps.into_iter().collect());
        self
    }
}

/// Non-blocking findings of a copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyWarning {
    /// No availability record for (part, target site).
    MissingSiteAvailability {
        /// Part.
        part: PartId,
        /// Target site.
        site: SiteId,
    },
    /// Availability record exists but is inactive.
    InactiveSiteAvailability {
        /// Part.
        part: PartId,
        /// Target site.
        site: SiteId,
    },
}

impl fmt::Display for CopyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSiteAvailability { part, site } => {
                write!(f, "part {part} has no availability record for site {site}")
            }
            Self::InactiveSiteAvailability { part, site } => {
                write!(f, "availability of part {part} at site {site} is inactive")
            }
        }
    }
}

/// Result of a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    /// The new routing.
    pub routing: Routing,
    /// Steps copied.
    pub steps_copied: usize,
    /// Edges copied.
    pub dependencies_copied: usize,
    /// Edges dropped because an endpoint was not copied.
    pub dependencies_dropped: usize,
    /// Non-blocking findings.
    pub warnings: Vec<CopyWarning>,
    /// Structure fingerprint of the source.
    pub source_fingerprint: String,
    /// Structure fingerprint of the copy.
    pub copy_fingerprint: String,
}

/// One release-readiness violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationIssue {
    /// The routing has no steps.
    NoSteps,
    /// No availability record for the routing's (part, site).
    NoSiteAvailability {
        /// Part.
        part: PartId,
        /// Site.
        site: SiteId,
    },
    /// Availability record exists but is inactive.
    InactiveSiteAvailability {
        /// Part.
        part: PartId,
        /// Site.
        site: SiteId,
    },
    /// Effective start is not before effective end.
    InvalidEffectiveRange {
        /// Start.
        from: DateTime<Utc>,
        /// End.
        to: DateTime<Utc>,
    },
    /// A step can be timed neither from master data nor from its override.
    UnresolvedProcessSegment {
        /// Step.
        step: StepId,
        /// Its step number.
        step_number: u32,
        /// The unknown segment.
        segment: ProcessSegmentId,
    },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSteps => f.write_str("routing has no steps"),
            Self::NoSiteAvailability { part, site } => {
                write!(f, "part {part} is not declared available at site {site}")
            }
            Self::InactiveSiteAvailability { part, site } => {
                write!(f, "availability of part {part} at site {site} is inactive")
            }
            Self::InvalidEffectiveRange { from, to } => {
                write!(f, "effective range start {from} is not before end {to}")
            }
            Self::UnresolvedProcessSegment {
                step_number,
                segment,
                ..
            } => write!(f, "step {step_number} references unknown process segment {segment}"),
        }
    }
}

/// Complete pre-release checklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Routing validated.
    pub routing_id: RoutingId,
    /// True when `errors` is empty.
    pub valid: bool,
    /// Every violation found.
    pub errors: Vec<ValidationIssue>,
}

/// Higher-level routing workflows.
pub struct RoutingComposer<S, C> {
    store: Arc<S>,
    catalog: Arc<C>,
    config: EngineConfig,
}

impl<S, C> Clone for RoutingComposer<S, C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            catalog: Arc::clone(&self.catalog),
            config: self.config.clone(),
        }
    }
}

impl<S: RoutingStore, C: ProcessSegmentCatalog> RoutingComposer<S, C> {
    /// Create a composer.
    pub fn new(store: Arc<S>, catalog: Arc<C>, config: EngineConfig) -> Self {
        Self {
            store,
            catalog,
            config,
        }
    }

    async fn load(&self, id: &RoutingId) -> RoutingResult<RoutingAggregate> {
        self.store
            .load_aggregate(id)
            .await?
            .ok_or(RoutingError::RoutingNotFound(*id))
    }

    /// Copy a routing, optionally to another site or version.
    pub async fn copy_routing(&self, source_id: &RoutingId, options: CopyOptions) -> RoutingResult<CopyOutcome> {
        let source = self.load(source_id).await?;
        let src = &source.routing;

        let state = options.new_state.unwrap_or(LifecycleState::Draft);
        if state != LifecycleState::Draft && !LifecycleState::Draft.can_transition_to(state) {
            return Err(RoutingError::InvalidLifecycleTransition {
                routing: src.id,
                from: LifecycleState::Draft,
                to: state,
            });
        }
        if let Some(version) = &options.new_version {
            parse_version(version)?;
        }
        if let Some(site) = &options.new_site {
            validate_site_code(site)?;
        }

        let site = options.new_site.clone().unwrap_or_else(|| src.site.clone());
        let cross_site = site != src.site;

        let mut warnings = Vec::new();
        if cross_site {
            match self.store.get_availability(&src.part, &site).await? {
                None => warnings.push(CopyWarning::MissingSiteAvailability {
                    part: src.part.clone(),
                    site: site.clone(),
                }),
                Some(record) if !record.is_active => warnings.push(CopyWarning::InactiveSiteAvailability {
                    part: src.part.clone(),
                    site: site.clone(),
                }),
                Some(_) => {}
            }
            for warning in &warnings {
                tracing::warn!(
                    source_id = %src.id,
                    part = %src.part,
                    site = %site,
                    warning = %warning,
                    "Cross-site copy without usable availability"
                );
            }
        }

        let selected: Vec<&RoutingStep> = if options.include_steps {
            match &options.only_steps {
                Some(only) => {
                    let wanted: BTreeSet<StepId> = only.iter().copied().collect();
                    if let Some(unknown) = wanted.iter().find(|id| source.step(id).is_none()) {
                        return Err(RoutingError::StepNotFound(*unknown));
                    }
                    source.steps.iter().filter(|s| wanted.contains(&s.id)).collect()
                }
                None => source.steps.iter().collect(),
            }
        } else {
            Vec::new()
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let version = match &options.new_version {
                Some(version) => version.clone(),
                None => self.next_copy_version(src, &site, cross_site).await?,
            };

            let now = Utc::now();
            let routing = Routing {
                id: RoutingId::generate(),
                routing_number: String::new(),
                part: src.part.clone(),
                site: site.clone(),
                version,
                state,
                description: src.description.clone(),
                is_primary_route: false,
                approval: None,
                review_notes: None,
                effective_from: src.effective_from,
                effective_to: src.effective_to,
                derived_from: Some(src.id),
                revision: 0,
                created_at: now,
                updated_at: now,
            };

            let mut id_map: BTreeMap<StepId, StepId> = BTreeMap::new();
            let steps: Vec<RoutingStep> = selected
                .iter()
                .map(|s| {
                    let id = StepId::generate();
                    id_map.insert(s.id, id);
                    RoutingStep {
                        id,
                        routing_id: routing.id,
                        created_at: now,
                        updated_at: now,
                        ..(*s).clone()
                    }
                })
                .collect();

            let mut dependencies_dropped = 0;
            let dependencies: Vec<StepDependency> = if options.include_dependencies {
                source
                    .dependencies
                    .iter()
                    .filter_map(|d| {
                        let remapped = id_map
                            .get(&d.predecessor)
                            .zip(id_map.get(&d.successor))
                            .map(|(p, s)| {
                                StepDependency::new(routing.id, *p, *s, d.dependency_type, d.constraint)
                            });
                        if remapped.is_none() {
                            dependencies_dropped += 1;
                        }
                        remapped
                    })
                    .collect()
            } else {
                Vec::new()
            };

            let copy = RoutingAggregate {
                routing: routing.clone(),
                steps: steps.clone(),
                dependencies: dependencies.clone(),
            };
            let draft = RoutingDraft {
                routing,
                steps,
                dependencies,
            };

            match self.store.insert_routing(draft).await {
                Ok(created) => {
                    let outcome = CopyOutcome {
                        steps_copied: copy.steps.len(),
                        dependencies_copied: copy.dependencies.len(),
                        dependencies_dropped,
                        warnings,
                        source_fingerprint: structure_fingerprint(&source),
                        copy_fingerprint: structure_fingerprint(&copy),
                        routing: created,
                    };
                    tracing::info!(
                        source_id = %src.id,
                        routing_id = %outcome.routing.id,
                        routing_number = %outcome.routing.routing_number,
                        site = %outcome.routing.site,
                        version = %outcome.routing.version,
                        state = %outcome.routing.state,
                        steps_copied = outcome.steps_copied,
                        dependencies_copied = outcome.dependencies_copied,
                        dependencies_dropped = outcome.dependencies_dropped,
                        "Routing copied"
                    );
                    return Ok(outcome);
                }
                Err(StoreError::DuplicateRoutingVersion { .. })
                    if options.new_version.is_none() && attempts <= self.config.max_commit_retries =>
                {
                    tracing::debug!(source_id = %src.id, attempt = attempts, "Copy version taken, recomputing");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn next_copy_version(&self, source: &Routing, site: &SiteId, cross_site: bool) -> RoutingResult<String> {
        let existing = self.store.list_routings(&source.part, site).await?;
        match max_version(existing.iter().map(|r| r.version.as_str())) {
            Some(highest) => increment_version(highest),
            None if cross_site => Ok(source.version.clone()),
            None => increment_version(&source.version),
        }
    }

    /// All versions for a (part, site), highest version first.
    pub async fn get_routing_versions(&self, part: &PartId, site: &SiteId) -> RoutingResult<Vec<Routing>> {
        let mut routings = self.store.list_routings(part, site).await?;
        routings.sort_by(|a, b| match compare_versions(&b.version, &a.version) {
            Ordering::Equal => b.created_at.cmp(&a.created_at),
            ord => ord,
        });
        Ok(routings)
    }

    /// Check a routing for release and report every violation at once.
    ///
    /// A deactivated availability record counts as a violation, not only a
    /// missing one: the site is not producing the part.
    pub async fn validate_routing(&self, id: &RoutingId) -> RoutingResult<ValidationReport> {
        let aggregate = self.load(id).await?;
        let routing = &aggregate.routing;
        let mut errors = Vec::new();

        if aggregate.steps.is_empty() {
            errors.push(ValidationIssue::NoSteps);
        }

        match self.store.get_availability(&routing.part, &routing.site).await? {
            None => errors.push(ValidationIssue::NoSiteAvailability {
                part: routing.part.clone(),
                site: routing.site.clone(),
            }),
            Some(record) if !record.is_active => errors.push(ValidationIssue::InactiveSiteAvailability {
                part: routing.part.clone(),
                site: routing.site.clone(),
            }),
            Some(_) => {}
        }

        if let (Some(from), Some(to)) = (routing.effective_from, routing.effective_to) {
            if from >= to {
                errors.push(ValidationIssue::InvalidEffectiveRange { from, to });
            }
        }

        let resolved = resolve_step_timings(&*self.catalog, &aggregate.steps).await?;
        for (step, segment) in resolved.unresolved {
            let step_number = aggregate.step(&step).map(|s| s.step_number).unwrap_or_default();
            errors.push(ValidationIssue::UnresolvedProcessSegment {
                step,
                step_number,
                segment,
            });
        }

        tracing::info!(
            routing_id = %id,
            valid = errors.is_empty(),
            issues = errors.len(),
            "Routing validated"
        );
        Ok(ValidationReport {
            routing_id: *id,
            valid: errors.is_empty(),
            errors,
        })
    }

    /// Totals, critical path and per-step schedule of a routing.
    pub async fn compute_timing(&self, id: &RoutingId) -> RoutingResult<RoutingTiming> {
        let aggregate = self.load(id).await?;
        compute_timing(&*self.catalog, &aggregate).await
    }

    /// Sites where a part may be built, most preferred first.
    pub async fn list_available_sites(&self, part: &PartId) -> RoutingResult<Vec<PartSiteAvailability>> {
        let mut records = self.store.list_availability_for_part(part).await?;
        records.retain(|r| r.is_active);
        Ok(records)
    }

    /// Every availability record of a part, active or not.
    pub async fn list_availability(&self, part: &PartId) -> RoutingResult<Vec<PartSiteAvailability>> {
        Ok(self.store.list_availability_for_part(part).await?)
    }

    /// Availability record for a (part, site).
    pub async fn get_availability(&self, part: &PartId, site: &SiteId) -> RoutingResult<Option<PartSiteAvailability>> {
        Ok(self.store.get_availability(part, site).await?)
    }

    /// Declare a part available at a site.
    pub async fn create_availability(&self, input: NewAvailability) -> RoutingResult<PartSiteAvailability> {
        let now = Utc::now();
        let record = PartSiteAvailability {
            id: AvailabilityId::generate(),
            part: input.part,
            site: input.site,
            preference_rank: input.preference_rank,
            is_active: true,
            notes: input.notes,
            created_at: now,
            updated_at: now,
        };
        let created = self.store.insert_availability(record).await?;
        tracing::info!(
            availability_id = %created.id,
            part = %created.part,
            site = %created.site,
            preference_rank = created.preference_rank,
            "Availability declared"
        );
        Ok(created)
    }

    /// Change rank, active flag or notes of an availability record.
    pub async fn update_availability(
        &self,
        id: &AvailabilityId,
        patch: AvailabilityPatch,
    ) -> RoutingResult<PartSiteAvailability> {
        let current = self
            .store
            .get_availability_by_id(id)
            .await?
            .ok_or(RoutingError::AvailabilityNotFound(*id))?;
        let updated = self
            .store
            .update_availability(patch.apply_to(&current, Utc::now()))
            .await?;
        tracing::info!(
            availability_id = %updated.id,
            preference_rank = updated.preference_rank,
            is_active = updated.is_active,
            "Availability updated"
        );
        Ok(updated)
    }

    /// Remove an availability record.
    pub async fn delete_availability(&self, id: &AvailabilityId) -> RoutingResult<()> {
        self.store.delete_availability(id).await?;
        tracing::info!(availability_id = %id, "Availability deleted");
        Ok(())
    }
}
