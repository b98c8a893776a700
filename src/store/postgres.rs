//! PostgreSQL routing store for production use.
//!
//! ## Configuration
//!
//! All settings can be configured via environment variables:
//! - `DATABASE_URL`: PostgreSQL connection string (required)
//! - `DB_MAX_CONNECTIONS`: Maximum pool size (default: 10)
//! - `DB_MIN_CONNECTIONS`: Minimum idle connections (default: 2)
//! - `DB_CONNECT_TIMEOUT_SECS`: Connection timeout (default: 10)
//! - `DB_IDLE_TIMEOUT_SECS`: Idle connection timeout (default: 300)
//! - `DB_MAX_LIFETIME_SECS`: Max connection lifetime (default: 1800)
//!
//! ## Transactions
//!
//! - `commit` locks the routing row with `SELECT ... FOR UPDATE`, compares
//!   revisions, applies every statement and verifies step-number uniqueness
//!   before committing.
//! - `insert_routing` takes a transaction-scoped advisory lock on
//!   `(site, part)` so routing-number generation and the insert cannot
//!   interleave with another creator of the same pair.
//! - `(routing_id, step_number)` is unique `DEFERRABLE INITIALLY DEFERRED`,
//!   so a resequence may swap numbers inside one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Executor, Row};
use std::time::Duration;
use uuid::Uuid;

use crate::identifiers::RoutingNumberFormat;
use crate::types::{
    ApprovalRecord, AvailabilityId, ConstraintKind, DependencyId, DependencyType, LifecycleState,
    PartId, PartSiteAvailability, ProcessSegmentId, Routing, RoutingAggregate, RoutingId,
    RoutingStep, SiteId, StepDependency, StepFlags, StepId, TimingConstraint, TimingOverride,
};
use super::{RoutingChangeSet, RoutingDraft, RoutingStore, StoreError};

/// DDL for the routing tables.
pub const ROUTING_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS routings (
    id                   UUID PRIMARY KEY,
    routing_number       TEXT NOT NULL,
    part_id              TEXT NOT NULL,
    site_id              TEXT NOT NULL,
    version              TEXT NOT NULL,
    state                TEXT NOT NULL,
    description          TEXT,
    is_primary_route     BOOLEAN NOT NULL DEFAULT FALSE,
    approved_by          TEXT,
    approved_at          TIMESTAMPTZ,
    approval_notes       TEXT,
    approval_fingerprint TEXT,
    review_notes         TEXT,
    effective_from       TIMESTAMPTZ,
    effective_to         TIMESTAMPTZ,
    derived_from         UUID REFERENCES routings(id) ON DELETE SET NULL,
    revision             BIGINT NOT NULL DEFAULT 0,
    created_at           TIMESTAMPTZ NOT NULL,
    updated_at           TIMESTAMPTZ NOT NULL,
    CONSTRAINT routings_routing_number_key UNIQUE (routing_number),
    CONSTRAINT routings_part_site_version_key UNIQUE (part_id, site_id, version)
);

CREATE UNIQUE INDEX IF NOT EXISTS routings_single_primary
    ON routings (part_id, site_id)
    WHERE is_primary_route AND state = 'PRODUCTION';

CREATE TABLE IF NOT EXISTS routing_steps (
    id                    UUID PRIMARY KEY,
    routing_id            UUID NOT NULL REFERENCES routings(id) ON DELETE CASCADE,
    step_number           INTEGER NOT NULL CHECK (step_number > 0),
    process_segment_id    TEXT NOT NULL,
    is_critical_path      BOOLEAN NOT NULL DEFAULT FALSE,
    is_quality_inspection BOOLEAN NOT NULL DEFAULT FALSE,
    setup_secs            BIGINT CHECK (setup_secs BETWEEN 0 AND 1000000000),
    cycle_secs            BIGINT CHECK (cycle_secs BETWEEN 0 AND 1000000000),
    teardown_secs         BIGINT CHECK (teardown_secs BETWEEN 0 AND 1000000000),
    description           TEXT,
    created_at            TIMESTAMPTZ NOT NULL,
    updated_at            TIMESTAMPTZ NOT NULL,
    CONSTRAINT routing_steps_number_key UNIQUE (routing_id, step_number)
        DEFERRABLE INITIALLY DEFERRED
);

CREATE TABLE IF NOT EXISTS routing_step_dependencies (
    id                  UUID PRIMARY KEY,
    routing_id          UUID NOT NULL REFERENCES routings(id) ON DELETE CASCADE,
    predecessor_step_id UUID NOT NULL REFERENCES routing_steps(id) ON DELETE CASCADE,
    successor_step_id   UUID NOT NULL REFERENCES routing_steps(id) ON DELETE CASCADE,
    dependency_type     TEXT NOT NULL,
    constraint_kind     TEXT NOT NULL,
    constraint_value    TIMESTAMPTZ,
    CONSTRAINT routing_step_dependencies_edge_key UNIQUE (predecessor_step_id, successor_step_id)
);

CREATE TABLE IF NOT EXISTS part_site_availability (
    id              UUID PRIMARY KEY,
    part_id         TEXT NOT NULL,
    site_id         TEXT NOT NULL,
    preference_rank INTEGER NOT NULL,
    is_active       BOOLEAN NOT NULL DEFAULT TRUE,
    notes           TEXT,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL,
    CONSTRAINT part_site_availability_part_site_key UNIQUE (part_id, site_id)
);
"#;

const ROUTING_COLUMNS: &str = r#"
    id, routing_number, part_id, site_id, version, state, description, is_primary_route,
    approved_by, approved_at, approval_notes, approval_fingerprint, review_notes,
    effective_from, effective_to, derived_from, revision, created_at, updated_at
"#;

const STEP_COLUMNS: &str = r#"
    id, routing_id, step_number, process_segment_id, is_critical_path, is_quality_inspection,
    setup_secs, cycle_secs, teardown_secs, description, created_at, updated_at
"#;

const DEPENDENCY_COLUMNS: &str = r#"
    id, routing_id, predecessor_step_id, successor_step_id, dependency_type,
    constraint_kind, constraint_value
"#;

const AVAILABILITY_COLUMNS: &str = r#"
    id, part_id, site_id, preference_rank, is_active, notes, created_at, updated_at
"#;

/// Configuration for PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Database connection URL.
    pub database_url: String,
    /// Maximum connections in pool (default: 10).
    pub max_connections: u32,
    /// Minimum idle connections to keep warm (default: 2).
    pub min_connections: u32,
    /// Connection acquire timeout in seconds (default: 10).
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds (default: 300 = 5 min).
    pub idle_timeout_secs: u64,
    /// Maximum connection lifetime in seconds (default: 1800 = 30 min).
    pub max_lifetime_secs: u64,
}

impl PostgresConfig {
    /// Load configuration from environment variables with production defaults.
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/routing".to_string()),
            max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            min_connections: std::env::var("DB_MIN_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
            connect_timeout_secs: std::env::var("DB_CONNECT_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            idle_timeout_secs: std::env::var("DB_IDLE_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),
            max_lifetime_secs: std::env::var("DB_MAX_LIFETIME_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1800),
        }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Error type for PostgreSQL store.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A stored value could not be decoded into a domain type.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl From<PostgresError> for StoreError {
    fn from(err: PostgresError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        PostgresError::from(err).into()
    }
}

/// Name of the violated constraint, if the error is a constraint violation.
fn violated_constraint(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|db| db.constraint())
        .map(str::to_string)
}

/// PostgreSQL routing store.
pub struct PostgresRoutingStore {
    pool: PgPool,
    numbering: RoutingNumberFormat,
}

impl PostgresRoutingStore {
    /// Create a new store with the given configuration.
    pub async fn new(config: PostgresConfig) -> Result<Self, sqlx::Error> {
        tracing::info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            connect_timeout_secs = config.connect_timeout_secs,
            idle_timeout_secs = config.idle_timeout_secs,
            max_lifetime_secs = config.max_lifetime_secs,
            "Initializing PostgreSQL connection pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .test_before_acquire(true)
            .connect(&config.database_url)
            .await?;

        Ok(Self {
            pool,
            numbering: RoutingNumberFormat::default(),
        })
    }

    /// Create a store from environment variables.
    pub async fn from_env() -> Result<Self, sqlx::Error> {
        Self::new(PostgresConfig::from_env()).await
    }

    /// Use a custom routing-number layout.
    pub fn with_numbering(mut self, numbering: RoutingNumberFormat) -> Self {
        self.numbering = numbering;
        self
    }

    /// Get the connection pool for health checks.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the database is reachable.
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }

    /// Create the routing tables if they do not exist.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        (&self.pool).execute(ROUTING_SCHEMA).await?;
        tracing::info!("Routing schema ensured");
        Ok(())
    }

    fn parse_routing_row(row: &PgRow) -> Result<Routing, PostgresError> {
        let state_str: String = row.try_get("state")?;
        let state = LifecycleState::from_str(&state_str)
            .ok_or_else(|| PostgresError::Corrupt(format!("unknown lifecycle state '{state_str}'")))?;

        let approved_by: Option<String> = row.try_get("approved_by")?;
        let approved_at: Option<DateTime<Utc>> = row.try_get("approved_at")?;
        let approval = match (approved_by, approved_at) {
            (Some(approved_by), Some(approved_at)) => Some(ApprovalRecord {
                approved_by,
                approved_at,
                notes: row.try_get("approval_notes")?,
                structure_fingerprint: row
                    .try_get::<Option<String>, _>("approval_fingerprint")?
                    .unwrap_or_default(),
            }),
            _ => None,
        };

        let id: Uuid = row.try_get("id")?;
        let derived_from: Option<Uuid> = row.try_get("derived_from")?;
        let revision: i64 = row.try_get("revision")?;

        Ok(Routing {
            id: RoutingId::new(id),
            routing_number: row.try_get("routing_number")?,
            part: PartId::new(row.try_get::<String, _>("part_id")?),
            site: SiteId::new(row.try_get::<String, _>("site_id")?),
            version: row.try_get("version")?,
            state,
            description: row.try_get("description")?,
            is_primary_route: row.try_get("is_primary_route")?,
            approval,
            review_notes: row.try_get("review_notes")?,
            effective_from: row.try_get("effective_from")?,
            effective_to: row.try_get("effective_to")?,
            derived_from: derived_from.map(RoutingId::new),
            revision: revision.max(0) as u64,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn parse_step_row(row: &PgRow) -> Result<RoutingStep, PostgresError> {
        let id: Uuid = row.try_get("id")?;
        let routing_id: Uuid = row.try_get("routing_id")?;
        let step_number: i32 = row.try_get("step_number")?;
        let secs = |column: &str| -> Result<Option<u64>, PostgresError> {
            row.try_get::<Option<i64>, _>(column)?
                .map(|v| {
                    u64::try_from(v)
                        .map_err(|_| PostgresError::Corrupt(format!("negative {column} {v} on step {id}")))
                })
                .transpose()
        };

        Ok(RoutingStep {
            id: StepId::new(id),
            routing_id: RoutingId::new(routing_id),
            step_number: step_number.max(0) as u32,
            process_segment: ProcessSegmentId::new(row.try_get::<String, _>("process_segment_id")?),
            flags: StepFlags {
                is_critical_path: row.try_get("is_critical_path")?,
                is_quality_inspection: row.try_get("is_quality_inspection")?,
            },
            timing: TimingOverride {
                setup_secs: secs("setup_secs")?,
                cycle_secs: secs("cycle_secs")?,
                teardown_secs: secs("teardown_secs")?,
            },
            description: row.try_get("description")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn parse_dependency_row(row: &PgRow) -> Result<StepDependency, PostgresError> {
        let type_str: String = row.try_get("dependency_type")?;
        let kind_str: String = row.try_get("constraint_kind")?;
        let dependency_type = DependencyType::from_str(&type_str)
            .ok_or_else(|| PostgresError::Corrupt(format!("unknown dependency type '{type_str}'")))?;
        let kind = ConstraintKind::from_str(&kind_str)
            .ok_or_else(|| PostgresError::Corrupt(format!("unknown constraint kind '{kind_str}'")))?;

        Ok(StepDependency {
            id: DependencyId::new(row.try_get("id")?),
            routing_id: RoutingId::new(row.try_get("routing_id")?),
            predecessor: StepId::new(row.try_get("predecessor_step_id")?),
            successor: StepId::new(row.try_get("successor_step_id")?),
            dependency_type,
            constraint: TimingConstraint {
                kind,
                value: row.try_get("constraint_value")?,
            },
        })
    }

    fn parse_availability_row(row: &PgRow) -> Result<PartSiteAvailability, PostgresError> {
        Ok(PartSiteAvailability {
            id: AvailabilityId::new(row.try_get("id")?),
            part: PartId::new(row.try_get::<String, _>("part_id")?),
            site: SiteId::new(row.try_get::<String, _>("site_id")?),
            preference_rank: row.try_get("preference_rank")?,
            is_active: row.try_get("is_active")?,
            notes: row.try_get("notes")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn write_routing_row(
        conn: &mut PgConnection,
        routing: &Routing,
        insert: bool,
    ) -> Result<(), sqlx::Error> {
        let sql = if insert {
            format!(
                "INSERT INTO routings ({ROUTING_COLUMNS}) VALUES \
                 ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)"
            )
        } else {
            r#"
            UPDATE routings SET
                routing_number = $2, part_id = $3, site_id = $4, version = $5, state = $6,
                description = $7, is_primary_route = $8, approved_by = $9, approved_at = $10,
                approval_notes = $11, approval_fingerprint = $12, review_notes = $13,
                effective_from = $14, effective_to = $15, derived_from = $16, revision = $17,
                created_at = $18, updated_at = $19
            WHERE id = $1
            "#
            .to_string()
        };
        let approval = routing.approval.as_ref();
        sqlx::query(&sql)
            .bind(routing.id.as_uuid())
            .bind(&routing.routing_number)
            .bind(routing.part.as_str())
            .bind(routing.site.as_str())
            .bind(&routing.version)
            .bind(routing.state.as_str())
            .bind(&routing.description)
            .bind(routing.is_primary_route)
            .bind(approval.map(|a| a.approved_by.clone()))
            .bind(approval.map(|a| a.approved_at))
            .bind(approval.and_then(|a| a.notes.clone()))
            .bind(approval.map(|a| a.structure_fingerprint.clone()))
            .bind(&routing.review_notes)
            .bind(routing.effective_from)
            .bind(routing.effective_to)
            .bind(routing.derived_from.map(|id| id.as_uuid()))
            .bind(routing.revision as i64)
            .bind(routing.created_at)
            .bind(routing.updated_at)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn upsert_step(conn: &mut PgConnection, step: &RoutingStep) -> Result<u64, sqlx::Error> {
        // Out-of-range values saturate and are then refused by the column CHECK.
        let secs = |v: Option<u64>| v.map(|s| i64::try_from(s).unwrap_or(i64::MAX));
        let done = sqlx::query(&format!(
            r#"
            INSERT INTO routing_steps ({STEP_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                step_number = EXCLUDED.step_number,
                process_segment_id = EXCLUDED.process_segment_id,
                is_critical_path = EXCLUDED.is_critical_path,
                is_quality_inspection = EXCLUDED.is_quality_inspection,
                setup_secs = EXCLUDED.setup_secs,
                cycle_secs = EXCLUDED.cycle_secs,
                teardown_secs = EXCLUDED.teardown_secs,
                description = EXCLUDED.description,
                updated_at = EXCLUDED.updated_at
            WHERE routing_steps.routing_id = EXCLUDED.routing_id
            "#
        ))
        .bind(step.id.as_uuid())
        .bind(step.routing_id.as_uuid())
        .bind(step.step_number as i32)
        .bind(step.process_segment.as_str())
        .bind(step.flags.is_critical_path)
        .bind(step.flags.is_quality_inspection)
        .bind(secs(step.timing.setup_secs))
        .bind(secs(step.timing.cycle_secs))
        .bind(secs(step.timing.teardown_secs))
        .bind(&step.description)
        .bind(step.created_at)
        .bind(step.updated_at)
        .execute(&mut *conn)
        .await?;
        Ok(done.rows_affected())
    }

    async fn insert_dependency(
        conn: &mut PgConnection,
        dep: &StepDependency,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(&format!(
            "INSERT INTO routing_step_dependencies ({DEPENDENCY_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)"
        ))
        .bind(dep.id.as_uuid())
        .bind(dep.routing_id.as_uuid())
        .bind(dep.predecessor.as_uuid())
        .bind(dep.successor.as_uuid())
        .bind(dep.dependency_type.as_str())
        .bind(dep.constraint.kind.as_str())
        .bind(dep.constraint.value)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// First step number used more than once in the routing, if any.
    async fn duplicate_step_number(
        conn: &mut PgConnection,
        routing: &RoutingId,
    ) -> Result<Option<u32>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT step_number
            FROM routing_steps
            WHERE routing_id = $1
            GROUP BY step_number
            HAVING COUNT(*) > 1
            ORDER BY step_number
            LIMIT 1
            "#,
        )
        .bind(routing.as_uuid())
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.map(|r| r.get::<i32, _>("step_number").max(0) as u32))
    }

    async fn fetch_routing(
        conn: &mut PgConnection,
        id: &RoutingId,
        for_update: bool,
    ) -> Result<Option<Routing>, PostgresError> {
        let lock = if for_update { "FOR UPDATE" } else { "" };
        let row = sqlx::query(&format!(
            "SELECT {ROUTING_COLUMNS} FROM routings WHERE id = $1 {lock}"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(Self::parse_routing_row).transpose()
    }
}

#[async_trait]
impl RoutingStore for PostgresRoutingStore {
    async fn insert_routing(&self, draft: RoutingDraft) -> Result<Routing, StoreError> {
        let RoutingDraft {
            mut routing,
            steps,
            dependencies,
        } = draft;
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("routing-number/{}/{}", routing.site, routing.part))
            .execute(&mut *tx)
            .await?;

        let taken = sqlx::query(
            "SELECT 1 FROM routings WHERE part_id = $1 AND site_id = $2 AND version = $3",
        )
        .bind(routing.part.as_str())
        .bind(routing.site.as_str())
        .bind(&routing.version)
        .fetch_optional(&mut *tx)
        .await?;
        if taken.is_some() {
            return Err(StoreError::DuplicateRoutingVersion {
                part: routing.part,
                site: routing.site,
                version: routing.version,
            });
        }

        let existing: Vec<String> = sqlx::query(
            "SELECT routing_number FROM routings WHERE part_id = $1 AND site_id = $2",
        )
        .bind(routing.part.as_str())
        .bind(routing.site.as_str())
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| row.get("routing_number"))
        .collect();
        routing.routing_number = self.numbering.next_number(
            &routing.site,
            &routing.part,
            existing.iter().map(String::as_str),
        );

        if let Err(err) = Self::write_routing_row(&mut tx, &routing, true).await {
            return Err(match violated_constraint(&err).as_deref() {
                Some("routings_routing_number_key") => {
                    StoreError::DuplicateRoutingNumber(routing.routing_number)
                }
                Some("routings_part_site_version_key") => StoreError::DuplicateRoutingVersion {
                    part: routing.part,
                    site: routing.site,
                    version: routing.version,
                },
                _ => err.into(),
            });
        }
        for step in &steps {
            let mut step = step.clone();
            step.routing_id = routing.id;
            Self::upsert_step(&mut tx, &step).await?;
        }
        for dep in &dependencies {
            let mut dep = dep.clone();
            dep.routing_id = routing.id;
            Self::insert_dependency(&mut tx, &dep).await?;
        }
        if let Some(step_number) = Self::duplicate_step_number(&mut tx, &routing.id).await? {
            return Err(StoreError::DuplicateStepNumber {
                routing: routing.id,
                step_number,
            });
        }

        tx.commit().await?;
        Ok(routing)
    }

    async fn get_routing(&self, id: &RoutingId) -> Result<Option<Routing>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(Self::fetch_routing(&mut conn, id, false).await?)
    }

    async fn load_aggregate(&self, id: &RoutingId) -> Result<Option<RoutingAggregate>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let Some(routing) = Self::fetch_routing(&mut tx, id, false).await? else {
            return Ok(None);
        };

        let steps = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM routing_steps WHERE routing_id = $1 ORDER BY step_number, id"
        ))
        .bind(id.as_uuid())
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(Self::parse_step_row)
        .collect::<Result<Vec<_>, _>>()?;

        let mut dependencies = sqlx::query(&format!(
            "SELECT {DEPENDENCY_COLUMNS} FROM routing_step_dependencies WHERE routing_id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(Self::parse_dependency_row)
        .collect::<Result<Vec<_>, _>>()?;
        dependencies.sort();

        tx.commit().await?;
        Ok(Some(RoutingAggregate {
            routing,
            steps,
            dependencies,
        }))
    }

    async fn routing_of_step(&self, step: &StepId) -> Result<Option<RoutingId>, StoreError> {
        let row = sqlx::query("SELECT routing_id FROM routing_steps WHERE id = $1")
            .bind(step.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| RoutingId::new(r.get("routing_id"))))
    }

    async fn routing_of_dependency(
        &self,
        dependency: &DependencyId,
    ) -> Result<Option<RoutingId>, StoreError> {
        let row = sqlx::query("SELECT routing_id FROM routing_step_dependencies WHERE id = $1")
            .bind(dependency.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| RoutingId::new(r.get("routing_id"))))
    }

    async fn list_routings(&self, part: &PartId, site: &SiteId) -> Result<Vec<Routing>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ROUTING_COLUMNS} FROM routings \
             WHERE part_id = $1 AND site_id = $2 ORDER BY created_at, id"
        ))
        .bind(part.as_str())
        .bind(site.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(Self::parse_routing_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn commit(&self, changes: RoutingChangeSet) -> Result<Routing, StoreError> {
        let routing_id = changes.routing_id;
        let mut tx = self.pool.begin().await?;

        let current = Self::fetch_routing(&mut tx, &routing_id, true)
            .await?
            .ok_or(StoreError::RoutingNotFound(routing_id))?;
        if current.revision != changes.expected_revision {
            return Err(StoreError::RevisionConflict {
                routing: routing_id,
                expected: changes.expected_revision,
                actual: current.revision,
            });
        }

        let now = Utc::now();
        let mut updated = changes.routing.unwrap_or_else(|| current.clone());
        if updated.id != routing_id {
            return Err(StoreError::Backend(format!(
                "change set for {} carries routing row {}",
                routing_id, updated.id
            )));
        }

        if !changes.delete_dependencies.is_empty() {
            let ids: Vec<Uuid> = changes.delete_dependencies.iter().map(|d| d.as_uuid()).collect();
            sqlx::query("DELETE FROM routing_step_dependencies WHERE routing_id = $1 AND id = ANY($2)")
                .bind(routing_id.as_uuid())
                .bind(&ids)
                .execute(&mut *tx)
                .await?;
        }
        if !changes.delete_steps.is_empty() {
            let ids: Vec<Uuid> = changes.delete_steps.iter().map(|s| s.as_uuid()).collect();
            sqlx::query("DELETE FROM routing_steps WHERE routing_id = $1 AND id = ANY($2)")
                .bind(routing_id.as_uuid())
                .bind(&ids)
                .execute(&mut *tx)
                .await?;
        }
        for step in &changes.upsert_steps {
            if step.routing_id != routing_id || Self::upsert_step(&mut tx, step).await? == 0 {
                return Err(StoreError::Backend(format!(
                    "step {} does not belong to routing {}",
                    step.id, routing_id
                )));
            }
        }
        for dep in &changes.insert_dependencies {
            Self::insert_dependency(&mut tx, dep).await?;
        }
        if let Some(step_number) = Self::duplicate_step_number(&mut tx, &routing_id).await? {
            return Err(StoreError::DuplicateStepNumber {
                routing: routing_id,
                step_number,
            });
        }

        if changes.demote_other_primaries {
            sqlx::query(
                r#"
                UPDATE routings
                SET is_primary_route = FALSE, revision = revision + 1, updated_at = $4
                WHERE part_id = $1 AND site_id = $2 AND id <> $3 AND is_primary_route
                "#,
            )
            .bind(updated.part.as_str())
            .bind(updated.site.as_str())
            .bind(routing_id.as_uuid())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        updated.revision = current.revision + 1;
        updated.updated_at = now;
        if let Err(err) = Self::write_routing_row(&mut tx, &updated, false).await {
            return Err(match violated_constraint(&err).as_deref() {
                Some("routings_part_site_version_key") => StoreError::DuplicateRoutingVersion {
                    part: updated.part,
                    site: updated.site,
                    version: updated.version,
                },
                _ => err.into(),
            });
        }

        tx.commit().await?;
        Ok(updated)
    }

    async fn delete_routing(&self, id: &RoutingId, expected_revision: u64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let current = Self::fetch_routing(&mut tx, id, true)
            .await?
            .ok_or(StoreError::RoutingNotFound(*id))?;
        if current.revision != expected_revision {
            return Err(StoreError::RevisionConflict {
                routing: *id,
                expected: expected_revision,
                actual: current.revision,
            });
        }
        sqlx::query("DELETE FROM routings WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_availability(
        &self,
        record: PartSiteAvailability,
    ) -> Result<PartSiteAvailability, StoreError> {
        let result = sqlx::query(&format!(
            "INSERT INTO part_site_availability ({AVAILABILITY_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(record.id.as_uuid())
        .bind(record.part.as_str())
        .bind(record.site.as_str())
        .bind(record.preference_rank)
        .bind(record.is_active)
        .bind(&record.notes)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(record),
            Err(err)
                if violated_constraint(&err).as_deref()
                    == Some("part_site_availability_part_site_key") =>
            {
                Err(StoreError::DuplicateAvailability {
                    part: record.part,
                    site: record.site,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_availability(
        &self,
        part: &PartId,
        site: &SiteId,
    ) -> Result<Option<PartSiteAvailability>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {AVAILABILITY_COLUMNS} FROM part_site_availability \
             WHERE part_id = $1 AND site_id = $2"
        ))
        .bind(part.as_str())
        .bind(site.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::parse_availability_row).transpose()?)
    }

    async fn get_availability_by_id(
        &self,
        id: &AvailabilityId,
    ) -> Result<Option<PartSiteAvailability>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {AVAILABILITY_COLUMNS} FROM part_site_availability WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::parse_availability_row).transpose()?)
    }

    async fn list_availability_for_part(
        &self,
        part: &PartId,
    ) -> Result<Vec<PartSiteAvailability>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {AVAILABILITY_COLUMNS} FROM part_site_availability \
             WHERE part_id = $1 ORDER BY preference_rank, site_id"
        ))
        .bind(part.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(Self::parse_availability_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn update_availability(
        &self,
        record: PartSiteAvailability,
    ) -> Result<PartSiteAvailability, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE part_site_availability
            SET part_id = $2, site_id = $3, preference_rank = $4, is_active = $5,
                notes = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.part.as_str())
        .bind(record.site.as_str())
        .bind(record.preference_rank)
        .bind(record.is_active)
        .bind(&record.notes)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Err(StoreError::AvailabilityNotFound(record.id)),
            Ok(_) => Ok(record),
            Err(err)
                if violated_constraint(&err).as_deref()
                    == Some("part_site_availability_part_site_key") =>
            {
                Err(StoreError::DuplicateAvailability {
                    part: record.part,
                    site: record.site,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_availability(&self, id: &AvailabilityId) -> Result<(), StoreError> {
        let done = sqlx::query("DELETE FROM part_site_availability WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::AvailabilityNotFound(*id));
        }
        Ok(())
    }
}
