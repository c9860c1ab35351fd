//! Run coordinator: fetch → normalize → upsert for every entity type.
//!
//! Each entity type walks its own state machine
//! (`Idle → Fetching → Normalizing → Writing → … → Done | Failed`).
//! Types in one dependency stage run concurrently; a failure only ends
//! its own type.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::api::{Pager, StatsSource};
use crate::config::AppConfig;
use crate::normalize::{normalize_page, NormalizedPayload};
use crate::retry::BackoffPolicy;
use crate::stop::StopSignal;
use crate::storage::{BatchOutcome, CheckpointUpdate, Store, WriteBatch};
use crate::types::{
    Checkpoint, EntityCounts, EntityKind, EntityOutcome, EntityStatus, Phase, RawPage, RunResult,
    SyncError, SyncFilters,
};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// The parts of [`AppConfig`] the coordinator needs.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub entities: Vec<EntityKind>,
    pub filters: SyncFilters,
    pub per_page: u32,
    pub batch_size: usize,
    pub workers: usize,
    pub resume: bool,
    /// Retry schedule for retryable write failures.
    pub write_backoff: BackoffPolicy,
}

impl SyncSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            entities: config.sync.entities.clone(),
            filters: config.sync.filters(),
            per_page: config.api.per_page,
            batch_size: config.store.batch_size.max(1),
            workers: config.sync.workers.max(1),
            resume: config.sync.resume,
            write_backoff: BackoffPolicy::new(
                config.store.max_retries,
                config.api.base_backoff_ms,
                config.api.max_backoff_ms,
            ),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Per-entity bookkeeping
// ---------------------------------------------------------------------------

struct EntityRun {
    entity: EntityKind,
    phase: Phase,
    fingerprint: String,
    counts: EntityCounts,
    /// Pages committed, including those from earlier passes.
    pages_completed: u64,
    /// Cursor the current page was requested with.
    page_cursor: Option<String>,
    /// Batch in flight when the run stopped, if any.
    failed_batch: Option<usize>,
    committed_payloads: u64,
    resumed_from: Option<Checkpoint>,
}

impl EntityRun {
    fn new(entity: EntityKind, fingerprint: String) -> Self {
        Self {
            entity,
            phase: Phase::Idle,
            fingerprint,
            counts: EntityCounts::default(),
            pages_completed: 0,
            page_cursor: None,
            failed_batch: None,
            committed_payloads: 0,
            resumed_from: None,
        }
    }

    fn advance(&mut self, next: Phase) -> Result<(), SyncError> {
        if !self.phase.can_advance(next) {
            return Err(SyncError::InvalidTransition {
                entity: self.entity,
                from: self.phase,
                to: next,
            });
        }
        debug!(entity = %self.entity, from = %self.phase, to = %next, "Phase transition");
        self.phase = next;
        Ok(())
    }

    fn record(&mut self, outcome: BatchOutcome, payloads: usize) {
        self.counts.written += outcome.written;
        self.counts.unchanged += outcome.unchanged;
        self.counts.pruned += outcome.pruned;
        self.committed_payloads += payloads as u64;
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator {
    source: Arc<dyn StatsSource>,
    store: Store,
    settings: SyncSettings,
    stop: StopSignal,
}

impl Coordinator {
    pub fn new(source: Arc<dyn StatsSource>, store: Store, settings: SyncSettings) -> Self {
        Self {
            source,
            store,
            settings,
            stop: StopSignal::never(),
        }
    }

    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Run one full pass over the configured entity types.
    pub async fn run(&self) -> RunResult {
        let mut result = RunResult::start();
        info!(
            run_id = %result.run_id,
            entities = ?self.settings.entities,
            resume = self.settings.resume,
            "Sync pass started"
        );

        for stage in EntityKind::STAGES {
            let kinds: Vec<EntityKind> = stage
                .iter()
                .copied()
                .filter(|k| self.settings.entities.contains(k))
                .collect();
            if kinds.is_empty() {
                continue;
            }

            let outcomes: Vec<EntityOutcome> = stream::iter(kinds)
                .map(|kind| self.sync_entity(kind))
                .buffer_unordered(self.settings.workers)
                .collect()
                .await;
            result.entities.extend(outcomes);
        }

        result.finish();
        self.log_summary(&result).await;
        result
    }

    /// Drive one entity type to a terminal phase.
    pub async fn sync_entity(&self, entity: EntityKind) -> EntityOutcome {
        let mut run = EntityRun::new(entity, self.settings.filters.fingerprint(entity));

        let status = match self.drive(&mut run).await {
            Ok(()) => EntityStatus::Done,
            Err(err) => {
                let phase = run.phase;
                if run.advance(Phase::Failed).is_err() {
                    run.phase = Phase::Failed;
                }
                error!(
                    %entity,
                    %phase,
                    resumable = err.is_resumable(),
                    error = %err,
                    "Entity sync failed"
                );
                self.record_failed_batch(&run).await;
                EntityStatus::Failed {
                    phase,
                    reason: err.kind(),
                    detail: err.to_string(),
                }
            }
        };

        let failed = matches!(status, EntityStatus::Failed { .. });
        let checkpoint = if failed {
            self.store.load_checkpoint(entity).await.unwrap_or_else(|e| {
                warn!(%entity, error = %e, "Could not read checkpoint after failure");
                None
            })
        } else {
            None
        };

        let mut counts = run.counts;
        counts.failed = counts.fetched.saturating_sub(run.committed_payloads);

        EntityOutcome {
            entity,
            failed_page: failed.then_some(run.pages_completed),
            failed_batch: run.failed_batch,
            status,
            counts,
            checkpoint,
            resumed_from: run.resumed_from,
        }
    }

    async fn drive(&self, run: &mut EntityRun) -> Result<(), SyncError> {
        let entity = run.entity;
        if self.stop.is_stopped() {
            return Err(SyncError::Cancelled { entity });
        }

        let start = self.resume_point(run).await?;
        run.advance(Phase::Fetching)?;

        let mut pager = Pager::new(
            Arc::clone(&self.source),
            entity,
            self.settings.filters.clone(),
            self.settings.per_page,
            start,
        );

        loop {
            run.page_cursor = pager.cursor().map(str::to_string);
            let Some(page) = pager.next_page(&self.stop).await? else {
                run.advance(Phase::Done)?;
                info!(
                    %entity,
                    pages = run.counts.pages,
                    fetched = run.counts.fetched,
                    written = run.counts.written,
                    unchanged = run.counts.unchanged,
                    "Entity sync complete"
                );
                return Ok(());
            };
            run.counts.pages += 1;
            run.counts.fetched += page.payloads.len() as u64;

            run.advance(Phase::Normalizing)?;
            let normalized = normalize_page(entity, &page.payloads)?;
            run.counts.normalized += normalized
                .iter()
                .map(|p| p.record_count() as u64)
                .sum::<u64>();

            run.advance(Phase::Writing)?;
            self.write_page(run, &page, &normalized).await?;
            run.pages_completed += 1;

            info!(
                %entity,
                page = run.pages_completed,
                payloads = page.payloads.len(),
                next = page.next_cursor.as_deref().unwrap_or("<end>"),
                "Page committed"
            );
            run.advance(Phase::Fetching)?;
        }
    }

    /// Where to start fetching, honouring or discarding a stored checkpoint.
    async fn resume_point(&self, run: &mut EntityRun) -> Result<Option<String>, SyncError> {
        let entity = run.entity;
        let Some(checkpoint) = self.store.load_checkpoint(entity).await? else {
            return Ok(None);
        };

        if !self.settings.resume {
            info!(%entity, "Resume disabled, discarding checkpoint");
            self.store.clear_checkpoint(entity).await?;
            return Ok(None);
        }
        if checkpoint.fingerprint != run.fingerprint {
            warn!(
                %entity,
                stored = %checkpoint.fingerprint,
                current = %run.fingerprint,
                "Checkpoint taken under different filters, discarding"
            );
            self.store.clear_checkpoint(entity).await?;
            return Ok(None);
        }

        info!(
            %entity,
            cursor = checkpoint.next_cursor.as_deref().unwrap_or("<first page>"),
            pages_completed = checkpoint.pages_completed,
            failed_batch = ?checkpoint.failed_batch,
            "Resuming from checkpoint"
        );
        run.pages_completed = checkpoint.pages_completed;
        let cursor = checkpoint.next_cursor.clone();
        run.resumed_from = Some(checkpoint);
        Ok(cursor)
    }

    /// Write a normalized page in batches. The last batch carries the
    /// checkpoint so the page and its progress marker commit together.
    async fn write_page(
        &self,
        run: &mut EntityRun,
        page: &RawPage,
        normalized: &[NormalizedPayload],
    ) -> Result<(), SyncError> {
        let entity = run.entity;
        let next = Checkpoint {
            entity,
            next_cursor: page.next_cursor.clone(),
            pages_completed: run.pages_completed + 1,
            failed_batch: None,
            fingerprint: run.fingerprint.clone(),
        };
        let page_done = match page.next_cursor {
            Some(_) => CheckpointUpdate::Advance(&next),
            None => CheckpointUpdate::Complete,
        };

        if normalized.is_empty() {
            match page_done {
                CheckpointUpdate::Advance(cp) => self.store.save_checkpoint(cp).await?,
                _ => self.store.clear_checkpoint(entity).await?,
            }
            return Ok(());
        }

        let batches: Vec<&[NormalizedPayload]> =
            normalized.chunks(self.settings.batch_size).collect();
        let last = batches.len() - 1;

        for (index, payloads) in batches.into_iter().enumerate() {
            run.failed_batch = Some(index);
            if self.stop.is_stopped() {
                return Err(SyncError::Cancelled { entity });
            }

            let batch = WriteBatch {
                entity,
                batch_index: index,
                payloads,
                checkpoint: if index == last {
                    page_done
                } else {
                    CheckpointUpdate::Keep
                },
            };
            let outcome = self.write_with_retry(run, batch).await?;
            run.record(outcome, payloads.len());
        }
        run.failed_batch = None;
        Ok(())
    }

    async fn write_with_retry(
        &self,
        run: &mut EntityRun,
        batch: WriteBatch<'_>,
    ) -> Result<BatchOutcome, SyncError> {
        let policy = self.settings.write_backoff;
        let mut attempt = 0;
        loop {
            match self.store.upsert_batch(batch).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                    attempt += 1;
                    run.counts.write_retries += 1;
                    let delay = policy.delay(attempt);
                    warn!(
                        entity = %batch.entity,
                        batch = batch.batch_index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retryable write failure"
                    );
                    if !self.stop.sleep(delay).await {
                        return Err(SyncError::Cancelled {
                            entity: batch.entity,
                        });
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Note the failed batch on the checkpoint so the next pass can
    /// report where the previous one stopped.
    async fn record_failed_batch(&self, run: &EntityRun) {
        let Some(batch) = run.failed_batch else {
            return;
        };
        let checkpoint = Checkpoint {
            entity: run.entity,
            next_cursor: run.page_cursor.clone(),
            pages_completed: run.pages_completed,
            failed_batch: Some(batch),
            fingerprint: run.fingerprint.clone(),
        };
        if let Err(e) = self.store.save_checkpoint(&checkpoint).await {
            warn!(entity = %run.entity, error = %e, "Could not record failed batch");
        }
    }

    async fn log_summary(&self, result: &RunResult) {
        for outcome in &result.entities {
            let c = &outcome.counts;
            match &outcome.status {
                EntityStatus::Done => info!(
                    entity = %outcome.entity,
                    status = "done",
                    pages = c.pages,
                    fetched = c.fetched,
                    normalized = c.normalized,
                    written = c.written,
                    unchanged = c.unchanged,
                    pruned = c.pruned,
                    write_retries = c.write_retries,
                    "Entity summary"
                ),
                EntityStatus::Failed {
                    phase,
                    reason,
                    detail,
                } => error!(
                    entity = %outcome.entity,
                    status = "failed",
                    %phase,
                    reason = ?reason,
                    resumable = reason.is_resumable(),
                    detail = %detail,
                    pages = c.pages,
                    fetched = c.fetched,
                    written = c.written,
                    failed = c.failed,
                    failed_page = ?outcome.failed_page,
                    failed_batch = ?outcome.failed_batch,
                    checkpoint = ?outcome
                        .checkpoint
                        .as_ref()
                        .and_then(|cp| cp.next_cursor.as_deref()),
                    "Entity summary"
                ),
            }
        }

        match self.store.table_counts().await {
            Ok(counts) => {
                for (table, rows) in counts {
                    info!(table, rows, "Table record count");
                }
            }
            Err(e) => warn!(error = %e, "Could not read table counts"),
        }

        info!(
            run_id = %result.run_id,
            success = result.is_success(),
            "{result}"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
