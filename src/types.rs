//! Shared types for the sync pipeline.
//!
//! Entity selectors, raw pages, checkpoints, per-run reporting and the
//! error taxonomy live here so the fetcher, normalizer, store and
//! coordinator can depend on them without circular references.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Entity types
// ---------------------------------------------------------------------------

/// An entity type synchronised from the remote API.
///
/// Declaration order is dependency order: a type never references a type
/// declared after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Teams,
    Players,
    Games,
    SeasonAverages,
    BoxScores,
}

impl EntityKind {
    /// All entity types, in dependency order.
    pub const ALL: &'static [EntityKind] = &[
        EntityKind::Teams,
        EntityKind::Players,
        EntityKind::Games,
        EntityKind::SeasonAverages,
        EntityKind::BoxScores,
    ];

    /// Dependency stages. Types within a stage write disjoint tables and
    /// may run concurrently; a stage only starts once the previous one
    /// has finished.
    pub const STAGES: &'static [&'static [EntityKind]] = &[
        &[EntityKind::Teams],
        &[EntityKind::Players, EntityKind::Games],
        &[EntityKind::SeasonAverages, EntityKind::BoxScores],
    ];

    /// API path segment for this entity type.
    pub fn endpoint(&self) -> &'static str {
        match self {
            EntityKind::Teams => "teams",
            EntityKind::Players => "players",
            EntityKind::Games => "games",
            EntityKind::SeasonAverages => "season_averages",
            EntityKind::BoxScores => "box_scores",
        }
    }

    /// Whether the endpoint accepts season/date filters.
    pub fn accepts_filters(&self) -> bool {
        matches!(
            self,
            EntityKind::Games | EntityKind::SeasonAverages | EntityKind::BoxScores
        )
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.endpoint())
    }
}

/// Parse an entity type name (case-insensitive, `-` and `_` interchangeable).
impl std::str::FromStr for EntityKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "teams" | "team" => Ok(EntityKind::Teams),
            "players" | "player" => Ok(EntityKind::Players),
            "games" | "game" => Ok(EntityKind::Games),
            "season_averages" | "averages" => Ok(EntityKind::SeasonAverages),
            "box_scores" | "boxscores" => Ok(EntityKind::BoxScores),
            other => anyhow::bail!("Unknown entity type: {other}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Filters and requests
// ---------------------------------------------------------------------------

/// Query filters applied to the endpoints that accept them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFilters {
    pub season: Option<i32>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl SyncFilters {
    /// Query parameters for `kind`. Empty for endpoints without filters.
    pub fn query_params(&self, kind: EntityKind) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if !kind.accepts_filters() {
            return params;
        }
        if let Some(season) = self.season {
            params.push(("season", season.to_string()));
        }
        if let Some(start) = self.start_date {
            params.push(("start_date", start.format("%Y-%m-%d").to_string()));
        }
        if let Some(end) = self.end_date {
            params.push(("end_date", end.format("%Y-%m-%d").to_string()));
        }
        params
    }

    /// Stable description of the query a checkpoint was taken under.
    /// A checkpoint is only resumable under an identical fingerprint.
    pub fn fingerprint(&self, kind: EntityKind) -> String {
        let params = self.query_params(kind);
        if params.is_empty() {
            return format!("{kind}:all");
        }
        let parts: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{kind}:{}", parts.join("&"))
    }
}

/// One page request against the remote API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub entity: EntityKind,
    /// Cursor of the page to fetch; `None` for the first page.
    pub cursor: Option<String>,
    pub per_page: u32,
    pub filters: SyncFilters,
}

// ---------------------------------------------------------------------------
// Raw payloads
// ---------------------------------------------------------------------------

/// The exact JSON document returned by the API for one entity instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawPayload(serde_json::Value);

impl RawPayload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Canonical archival form: compact JSON with object keys sorted.
    pub fn canonical(&self) -> String {
        self.0.to_string()
    }
}

/// One page of payloads as returned by the API.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub entity: EntityKind,
    /// Cursor this page was requested with.
    pub cursor: Option<String>,
    /// Cursor of the following page, `None` on the last page.
    pub next_cursor: Option<String>,
    pub payloads: Vec<RawPayload>,
}

// ---------------------------------------------------------------------------
// Column values
// ---------------------------------------------------------------------------

/// A typed column value produced by the normalizer.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Integer(i) => write!(f, "{i}"),
            SqlValue::Real(r) => write!(f, "{r}"),
            SqlValue::Text(s) => write!(f, "{s:?}"),
            SqlValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// Durable progress marker for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub entity: EntityKind,
    /// Cursor of the next page to fetch. `None` means the first page.
    pub next_cursor: Option<String>,
    pub pages_completed: u64,
    /// Index of the batch that failed within the page at `next_cursor`.
    pub failed_batch: Option<usize>,
    pub fingerprint: String,
}

// ---------------------------------------------------------------------------
// Run state machine
// ---------------------------------------------------------------------------

/// Per-entity-type phase of a coordinator pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Fetching,
    Normalizing,
    Writing,
    Done,
    Failed,
}

impl Phase {
    /// Whether `self → next` is a legal transition.
    pub fn can_advance(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Idle, Fetching)
                | (Idle, Failed)
                | (Fetching, Normalizing)
                | (Fetching, Done)
                | (Fetching, Failed)
                | (Normalizing, Writing)
                | (Normalizing, Failed)
                | (Writing, Fetching)
                | (Writing, Failed)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Fetching => "fetching",
            Phase::Normalizing => "normalizing",
            Phase::Writing => "writing",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Run results
// ---------------------------------------------------------------------------

/// Failure classification carried in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    FetchExhausted,
    FetchRejected,
    SchemaMismatch,
    IntegrityViolation,
    StoreTimeout,
    Store,
    Cancelled,
    InvalidTransition,
}

impl FailureKind {
    /// Whether a later pass can pick up from the stored checkpoint
    /// without operator intervention.
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            FailureKind::FetchExhausted
                | FailureKind::StoreTimeout
                | FailureKind::Store
                | FailureKind::Cancelled
        )
    }
}

/// Terminal status of one entity type within a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntityStatus {
    Done,
    Failed {
        /// Phase the failure happened in.
        phase: Phase,
        reason: FailureKind,
        detail: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub pages: u64,
    /// Payloads received from the API.
    pub fetched: u64,
    /// Records produced by the normalizer (roots plus children).
    pub normalized: u64,
    /// Records inserted or changed in the store.
    pub written: u64,
    /// Records whose stored row already matched.
    pub unchanged: u64,
    /// Stale child rows removed.
    pub pruned: u64,
    /// Payloads that were fetched but not committed.
    pub failed: u64,
    /// Batch writes repeated after a retryable store error.
    #[serde(default)]
    pub write_retries: u64,
}

/// Outcome of one entity type in a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityOutcome {
    pub entity: EntityKind,
    pub status: EntityStatus,
    pub counts: EntityCounts,
    /// Page index (0-based, across runs) the failure happened on.
    pub failed_page: Option<u64>,
    pub failed_batch: Option<usize>,
    /// Checkpoint left in the store, if any.
    pub checkpoint: Option<Checkpoint>,
    pub resumed_from: Option<Checkpoint>,
}

impl EntityOutcome {
    pub fn is_done(&self) -> bool {
        self.status == EntityStatus::Done
    }
}

/// Summary of one coordinator pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: uuid::Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub entities: Vec<EntityOutcome>,
}

impl RunResult {
    pub fn start() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            entities: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.entities.sort_by_key(|o| o.entity);
        self.finished_at = Some(Utc::now());
    }

    /// Success only if every entity type reached `Done`.
    pub fn is_success(&self) -> bool {
        self.entities.iter().all(EntityOutcome::is_done)
    }

    pub fn outcome(&self, entity: EntityKind) -> Option<&EntityOutcome> {
        self.entities.iter().find(|o| o.entity == entity)
    }

    /// Every failure encountered in the pass, by entity type.
    pub fn errors(&self) -> Vec<(EntityKind, &str)> {
        self.entities
            .iter()
            .filter_map(|o| match &o.status {
                EntityStatus::Failed { detail, .. } => Some((o.entity, detail.as_str())),
                EntityStatus::Done => None,
            })
            .collect()
    }

    pub fn totals(&self) -> EntityCounts {
        self.entities.iter().fold(EntityCounts::default(), |mut acc, o| {
            acc.pages += o.counts.pages;
            acc.fetched += o.counts.fetched;
            acc.normalized += o.counts.normalized;
            acc.written += o.counts.written;
            acc.unchanged += o.counts.unchanged;
            acc.pruned += o.counts.pruned;
            acc.failed += o.counts.failed;
            acc.write_retries += o.counts.write_retries;
            acc
        })
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let totals = self.totals();
        let failed = self.entities.iter().filter(|o| !o.is_done()).count();
        write!(
            f,
            "Run {}: {} entity types ({} failed) fetched={} written={} unchanged={} failed={}",
            self.run_id,
            self.entities.len(),
            failed,
            totals.fetched,
            totals.written,
            totals.unchanged,
            totals.failed,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors raised by the sync pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(
        "Fetch exhausted for {entity} at cursor {} after {attempts} attempts: {last_error}",
        .cursor.as_deref().unwrap_or("<first page>")
    )]
    FetchExhausted {
        entity: EntityKind,
        cursor: Option<String>,
        attempts: u32,
        last_error: String,
    },

    #[error(
        "Fetch rejected for {entity} at cursor {}: {reason}",
        .cursor.as_deref().unwrap_or("<first page>")
    )]
    FetchRejected {
        entity: EntityKind,
        cursor: Option<String>,
        reason: String,
    },

    #[error("Schema mismatch in {entity} at `{field}`: expected {expected}, found {found}")]
    SchemaMismatch {
        entity: EntityKind,
        field: String,
        expected: &'static str,
        found: String,
    },

    #[error("Integrity violation in {entity} batch {batch} ({table} {key}): {reason}")]
    IntegrityViolation {
        entity: EntityKind,
        table: &'static str,
        batch: usize,
        key: String,
        reason: String,
    },

    #[error("Write timed out for {entity} batch {batch} after {secs}s")]
    StoreTimeout {
        entity: EntityKind,
        batch: usize,
        secs: u64,
    },

    #[error("Store error for {entity}: {message}")]
    Store {
        entity: EntityKind,
        message: String,
        retryable: bool,
    },

    #[error("Sync of {entity} cancelled")]
    Cancelled { entity: EntityKind },

    #[error("Invalid phase transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: EntityKind,
        from: Phase,
        to: Phase,
    },
}

impl SyncError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SyncError::FetchExhausted { .. } => FailureKind::FetchExhausted,
            SyncError::FetchRejected { .. } => FailureKind::FetchRejected,
            SyncError::SchemaMismatch { .. } => FailureKind::SchemaMismatch,
            SyncError::IntegrityViolation { .. } => FailureKind::IntegrityViolation,
            SyncError::StoreTimeout { .. } => FailureKind::StoreTimeout,
            SyncError::Store { .. } => FailureKind::Store,
            SyncError::Cancelled { .. } => FailureKind::Cancelled,
            SyncError::InvalidTransition { .. } => FailureKind::InvalidTransition,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::StoreTimeout { .. } => true,
            SyncError::Store { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn is_resumable(&self) -> bool {
        self.kind().is_resumable()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
