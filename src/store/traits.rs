//! `AuditStore`: the async interface for all persistence.
//!
//! The audit log is the only source of truth for "has this message already
//! been processed". Watermarks, action items, digests and drafts live in the
//! same store so one backend covers the whole service.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, TryStreamExt};
use uuid::Uuid;

use crate::error::{AuditError, DatabaseError};
use crate::model::{
    ActionItem, ActionItemStatus, AuditEntry, AuditStatus, DeliveryResult, Digest, DigestStatus,
    Draft, DraftStatus, Relevance,
};

/// Lazy, finite stream of audit entries. Calling `query` again restarts it.
pub type AuditStream = Pin<Box<dyn Stream<Item = Result<AuditEntry, DatabaseError>> + Send>>;

/// Filter for [`AuditStore::query`]. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub account: Option<String>,
    pub status: Option<AuditStatus>,
    /// Inclusive lower bound on `processed_at`.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `processed_at`.
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub newest_first: bool,
}

impl AuditFilter {
    /// Processed entries inside the digest window `[start, end)`.
    pub fn window(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            status: Some(AuditStatus::Processed),
            since: Some(start),
            until: Some(end),
            ..Default::default()
        }
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn with_status(mut self, status: AuditStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.newest_first = true;
        self
    }
}

/// One entry in the per-message history (every `record` call appends one).
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub message_id: String,
    pub status: AuditStatus,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ActionItemFilter {
    pub status: Option<ActionItemStatus>,
    pub relevance: Option<Relevance>,
    /// Restrict to items extracted from these messages.
    pub message_ids: Option<Vec<String>>,
    pub limit: Option<usize>,
}

/// Backend-agnostic persistence for the automation service.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Audit log ───────────────────────────────────────────────────

    /// True if a `processed` entry exists for this fingerprint.
    async fn has_processed(&self, message_id: &str) -> Result<bool, DatabaseError>;

    /// Fetch the current entry for a fingerprint.
    async fn get(&self, message_id: &str) -> Result<Option<AuditEntry>, DatabaseError>;

    /// Atomic upsert keyed by `message_id`.
    ///
    /// An existing `processed` row is never overwritten: the write fails
    /// with [`AuditError::Duplicate`]. `SkippedDuplicate` entries only
    /// append to the history and leave the row untouched.
    async fn record(&self, entry: &AuditEntry) -> Result<(), AuditError>;

    /// Stream entries matching `filter`, ordered by `processed_at`.
    fn query(&self, filter: AuditFilter) -> AuditStream;

    /// Convenience: collect a whole query.
    async fn query_all(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>, DatabaseError> {
        self.query(filter).try_collect().await
    }

    /// Every recorded event for one message, oldest first.
    async fn history(&self, message_id: &str) -> Result<Vec<AuditEvent>, DatabaseError>;

    /// Entry counts per status.
    async fn count_by_status(&self) -> Result<Vec<(AuditStatus, u64)>, DatabaseError>;

    /// Delete audit entries and history older than the cutoff.
    /// Returns the number of entries removed.
    async fn prune(&self, older_than: DateTime<Utc>) -> Result<usize, DatabaseError>;

    // ── Watermarks ──────────────────────────────────────────────────

    async fn watermark(&self, account: &str, folder: &str) -> Result<Option<String>, DatabaseError>;

    async fn set_watermark(
        &self,
        account: &str,
        folder: &str,
        value: &str,
    ) -> Result<(), DatabaseError>;

    /// All watermarks as `(account, folder, value, updated_at)`.
    async fn list_watermarks(
        &self,
    ) -> Result<Vec<(String, String, String, DateTime<Utc>)>, DatabaseError>;

    // ── Action items ────────────────────────────────────────────────

    async fn insert_action_items(&self, items: &[ActionItem]) -> Result<(), DatabaseError>;

    async fn list_action_items(
        &self,
        filter: &ActionItemFilter,
    ) -> Result<Vec<ActionItem>, DatabaseError>;

    /// Returns false if no item has this id.
    async fn update_action_item_status(
        &self,
        id: Uuid,
        status: ActionItemStatus,
    ) -> Result<bool, DatabaseError>;

    // ── Digests ─────────────────────────────────────────────────────

    async fn insert_digest(&self, digest: &Digest) -> Result<(), DatabaseError>;

    async fn update_digest_delivery(
        &self,
        id: Uuid,
        status: DigestStatus,
        results: &[DeliveryResult],
    ) -> Result<(), DatabaseError>;

    async fn list_digests(&self, limit: usize) -> Result<Vec<Digest>, DatabaseError>;

    // ── Drafts ──────────────────────────────────────────────────────

    async fn insert_draft(&self, draft: &Draft) -> Result<(), DatabaseError>;

    async fn list_drafts(&self, status: Option<DraftStatus>) -> Result<Vec<Draft>, DatabaseError>;

    /// Returns false if no draft has this id.
    async fn update_draft_status(&self, id: Uuid, status: DraftStatus)
    -> Result<bool, DatabaseError>;
}
