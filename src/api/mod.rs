//! Fetcher: the remote stats API and cursor pagination over it.
//!
//! [`StatsSource`] is the seam between the pipeline and the network. The
//! production implementation is [`client::ApiClient`]; tests substitute
//! scripted sources.

pub mod client;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::stop::StopSignal;
use crate::types::{EntityKind, PageRequest, RawPage, SyncError, SyncFilters};

/// A source of raw pages.
///
/// Implementors handle their own transient-failure retries. An `Err`
/// is final for that request: `FetchExhausted` after retries ran out,
/// `FetchRejected` when retrying cannot help.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<RawPage, SyncError>;
}

/// Walks the pages of one entity type from a starting cursor.
///
/// Finite: yields `None` once a page arrives without a next cursor.
/// Not restartable; after a failure open a new pager at the last
/// checkpointed cursor.
pub struct Pager {
    source: Arc<dyn StatsSource>,
    entity: EntityKind,
    filters: SyncFilters,
    per_page: u32,
    cursor: Option<String>,
    finished: bool,
}

impl Pager {
    pub fn new(
        source: Arc<dyn StatsSource>,
        entity: EntityKind,
        filters: SyncFilters,
        per_page: u32,
        start: Option<String>,
    ) -> Self {
        Self {
            source,
            entity,
            filters,
            per_page,
            cursor: start,
            finished: false,
        }
    }

    /// Cursor of the next page to be requested.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Fetch the next page. Stopping abandons an in-flight request,
    /// including any backoff the source is sleeping through.
    pub async fn next_page(&mut self, stop: &StopSignal) -> Result<Option<RawPage>, SyncError> {
        if self.finished {
            return Ok(None);
        }
        if stop.is_stopped() {
            return Err(SyncError::Cancelled {
                entity: self.entity,
            });
        }

        let request = PageRequest {
            entity: self.entity,
            cursor: self.cursor.clone(),
            per_page: self.per_page,
            filters: self.filters.clone(),
        };

        let page = tokio::select! {
            biased;
            _ = stop.stopped() => {
                return Err(SyncError::Cancelled { entity: self.entity });
            }
            result = self.source.fetch_page(&request) => result?,
        };

        if page.next_cursor.is_some() && page.next_cursor == request.cursor {
            self.finished = true;
            return Err(SyncError::FetchRejected {
                entity: self.entity,
                cursor: request.cursor,
                reason: "next cursor did not advance".to_string(),
            });
        }

        debug!(
            entity = %self.entity,
            cursor = request.cursor.as_deref().unwrap_or("<first page>"),
            next = page.next_cursor.as_deref().unwrap_or("<end>"),
            payloads = page.payloads.len(),
            "Page fetched"
        );

        self.cursor = page.next_cursor.clone();
        self.finished = self.cursor.is_none();
        Ok(Some(page))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
