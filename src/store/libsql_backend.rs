//! libSQL backend for `AuditStore`.
//!
//! Supports local file and in-memory databases. A single connection is
//! shared by all pollers; each upsert is one SQL statement, which SQLite
//! executes atomically.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AuditError, DatabaseError};
use crate::model::{
    ActionItem, ActionItemStatus, AuditEntry, AuditStatus, DeliveryResult, Digest, DigestFormat,
    DigestStatus, Draft, DraftStatus, Priority, Relevance, StepStatus,
};
use crate::store::migrations;
use crate::store::traits::{
    ActionItemFilter, AuditEvent, AuditFilter, AuditStore, AuditStream,
};

/// Rows fetched per page by [`AuditStore::query`].
const QUERY_PAGE_SIZE: usize = 200;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn append_event(
        &self,
        message_id: &str,
        status: AuditStatus,
        detail: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO audit_events (message_id, status, detail, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![message_id, status.as_str(), opt_text(detail), fmt_ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_event: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width, so string order is time order.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

const AUDIT_COLUMNS: &str = "message_id, account, folder, sender, subject, processed_at, classification, classification_status, actions_applied, status, error, attempts";

/// Map a libsql Row to an AuditEntry.
///
/// Column order matches AUDIT_COLUMNS.
fn row_to_entry(row: &libsql::Row) -> Result<AuditEntry, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("audit row parse: {e}"));

    let processed_str: String = row.get(5).map_err(get_err)?;
    let classification_json: Option<String> = row.get::<String>(6).ok();
    let step_str: String = row.get(7).map_err(get_err)?;
    let actions_json: String = row.get(8).map_err(get_err)?;
    let status_str: String = row.get(9).map_err(get_err)?;
    let attempts: i64 = row.get(11).unwrap_or(1);

    let classification = match classification_json {
        Some(json) => Some(
            serde_json::from_str(&json)
                .map_err(|e| DatabaseError::Serialization(format!("classification: {e}")))?,
        ),
        None => None,
    };

    Ok(AuditEntry {
        message_id: row.get(0).map_err(get_err)?,
        account: row.get(1).map_err(get_err)?,
        folder: row.get(2).map_err(get_err)?,
        sender: row.get(3).map_err(get_err)?,
        subject: row.get(4).map_err(get_err)?,
        processed_at: parse_datetime(&processed_str),
        classification,
        classification_status: step_str.parse().unwrap_or(StepStatus::Skipped),
        actions_applied: serde_json::from_str(&actions_json)
            .map_err(|e| DatabaseError::Serialization(format!("actions_applied: {e}")))?,
        status: status_str
            .parse()
            .map_err(|e: String| DatabaseError::Serialization(e))?,
        error: row.get::<String>(10).ok(),
        attempts: u32::try_from(attempts).unwrap_or(1),
    })
}

const ACTION_ITEM_COLUMNS: &str = "id, source_message_id, title, description, due_hint, priority, confidence, relevance, status, created_at";

fn row_to_action_item(row: &libsql::Row) -> Result<ActionItem, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("action item row parse: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let priority_str: String = row.get(5).map_err(get_err)?;
    let confidence: f64 = row.get(6).unwrap_or(1.0);
    let relevance_str: String = row.get(7).map_err(get_err)?;
    let status_str: String = row.get(8).map_err(get_err)?;
    let created_str: String = row.get(9).map_err(get_err)?;

    Ok(ActionItem {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("action item id: {e}")))?,
        source_message_id: row.get(1).map_err(get_err)?,
        title: row.get(2).map_err(get_err)?,
        description: row.get(3).map_err(get_err)?,
        due_hint: row.get::<String>(4).ok(),
        priority: priority_str.parse().unwrap_or(Priority::Normal),
        confidence: confidence as f32,
        relevance: relevance_str.parse().unwrap_or(Relevance::Direct),
        status: status_str.parse().unwrap_or(ActionItemStatus::Pending),
        created_at: parse_datetime(&created_str),
    })
}

const DIGEST_COLUMNS: &str = "id, period_start, period_end, included_message_ids, summary_text, content, format, delivery_results, status, created_at";

fn row_to_digest(row: &libsql::Row) -> Result<Digest, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("digest row parse: {e}"));
    let ser_err = |e: serde_json::Error| DatabaseError::Serialization(format!("digest: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let start_str: String = row.get(1).map_err(get_err)?;
    let end_str: String = row.get(2).map_err(get_err)?;
    let ids_json: String = row.get(3).map_err(get_err)?;
    let format_str: String = row.get(6).map_err(get_err)?;
    let results_json: String = row.get(7).map_err(get_err)?;
    let status_str: String = row.get(8).map_err(get_err)?;
    let created_str: String = row.get(9).map_err(get_err)?;

    Ok(Digest {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("digest id: {e}")))?,
        period_start: parse_datetime(&start_str),
        period_end: parse_datetime(&end_str),
        included_message_ids: serde_json::from_str(&ids_json).map_err(ser_err)?,
        summary_text: row.get(4).map_err(get_err)?,
        content: row.get(5).map_err(get_err)?,
        format: format_str.parse().unwrap_or(DigestFormat::Markdown),
        delivery_results: serde_json::from_str(&results_json).map_err(ser_err)?,
        status: status_str.parse().unwrap_or(DigestStatus::Pending),
        created_at: parse_datetime(&created_str),
    })
}

const DRAFT_COLUMNS: &str = "id, message_id, account, to_addr, subject, body, status, created_at";

fn row_to_draft(row: &libsql::Row) -> Result<Draft, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("draft row parse: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let status_str: String = row.get(6).map_err(get_err)?;
    let created_str: String = row.get(7).map_err(get_err)?;

    Ok(Draft {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("draft id: {e}")))?,
        message_id: row.get(1).map_err(get_err)?,
        account: row.get(2).map_err(get_err)?,
        to: row.get(3).map_err(get_err)?,
        subject: row.get(4).map_err(get_err)?,
        body: row.get(5).map_err(get_err)?,
        status: status_str.parse().unwrap_or(DraftStatus::Pending),
        created_at: parse_datetime(&created_str),
    })
}

// ── Query paging ────────────────────────────────────────────────────

/// Keyset-pagination state for a streaming audit query.
struct QueryPager {
    conn: Connection,
    filter: AuditFilter,
    /// Sort key of the last row handed out: `(processed_at, message_id)`,
    /// or `(recorded_at, event id)` when listing duplicates.
    cursor: Option<(String, String)>,
    buffer: VecDeque<AuditEntry>,
    emitted: usize,
    exhausted: bool,
}

impl QueryPager {
    async fn next_entry(mut self) -> Result<Option<(AuditEntry, Self)>, DatabaseError> {
        if self.filter.limit.is_some_and(|limit| self.emitted >= limit) {
            return Ok(None);
        }
        if self.buffer.is_empty() && !self.exhausted {
            self.fill().await?;
        }
        match self.buffer.pop_front() {
            Some(entry) => {
                self.emitted += 1;
                Ok(Some((entry, self)))
            }
            None => Ok(None),
        }
    }

    async fn fill(&mut self) -> Result<(), DatabaseError> {
        // Duplicates only live in the event history, so that listing reads
        // events joined to their entry instead of the entry table.
        let duplicates = self.filter.status == Some(AuditStatus::SkippedDuplicate);
        let (account_col, ts_col, key_col) = if duplicates {
            ("e.account", "ev.recorded_at", "ev.id")
        } else {
            ("account", "processed_at", "message_id")
        };

        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();

        if let Some(ref account) = self.filter.account {
            values.push(libsql::Value::Text(account.clone()));
            clauses.push(format!("{account_col} = ?{}", values.len()));
        }
        if let Some(status) = self.filter.status
            && !duplicates
        {
            values.push(libsql::Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        if duplicates {
            clauses.push("ev.status = 'skipped-duplicate'".to_string());
        }
        if let Some(since) = self.filter.since {
            values.push(libsql::Value::Text(fmt_ts(since)));
            clauses.push(format!("{ts_col} >= ?{}", values.len()));
        }
        if let Some(until) = self.filter.until {
            values.push(libsql::Value::Text(fmt_ts(until)));
            clauses.push(format!("{ts_col} < ?{}", values.len()));
        }
        let cmp = if self.filter.newest_first { "<" } else { ">" };
        if let Some((ref ts, ref key)) = self.cursor {
            values.push(libsql::Value::Text(ts.clone()));
            let ts_idx = values.len();
            if duplicates {
                let id = key.parse::<i64>().unwrap_or(0);
                values.push(libsql::Value::Integer(id));
            } else {
                values.push(libsql::Value::Text(key.clone()));
            }
            let key_idx = values.len();
            clauses.push(format!(
                "({ts_col} {cmp} ?{ts_idx} OR ({ts_col} = ?{ts_idx} AND {key_col} {cmp} ?{key_idx}))"
            ));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let order = if self.filter.newest_first { "DESC" } else { "ASC" };
        let sql = if duplicates {
            format!(
                "SELECT e.message_id, e.account, e.folder, e.sender, e.subject, ev.recorded_at,
                        e.classification, e.classification_status, '[]', ev.status, ev.detail,
                        e.attempts, ev.id
                 FROM audit_events ev JOIN audit_entries e ON e.message_id = ev.message_id
                 {where_sql}
                 ORDER BY ev.recorded_at {order}, ev.id {order} LIMIT {QUERY_PAGE_SIZE}"
            )
        } else {
            format!(
                "SELECT {AUDIT_COLUMNS} FROM audit_entries {where_sql}
                 ORDER BY processed_at {order}, message_id {order} LIMIT {QUERY_PAGE_SIZE}"
            )
        };

        let mut rows = self
            .conn
            .query(&sql, libsql::params::Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("query audit: {e}")))?;

        let mut fetched = 0;
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    fetched += 1;
                    match row_to_entry(&row) {
                        Ok(entry) => {
                            let key = if duplicates {
                                row.get::<i64>(12).unwrap_or_default().to_string()
                            } else {
                                entry.message_id.clone()
                            };
                            self.cursor = Some((fmt_ts(entry.processed_at), key));
                            self.buffer.push_back(entry);
                        }
                        Err(e) => warn!("Skipping audit row: {e}"),
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("query audit: {e}"))),
            }
        }
        if fetched < QUERY_PAGE_SIZE {
            self.exhausted = true;
        }
        Ok(())
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl AuditStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Audit log ───────────────────────────────────────────────────

    async fn has_processed(&self, message_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM audit_entries WHERE message_id = ?1 AND status = 'processed'",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("has_processed: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("has_processed: {e}"))),
        }
    }

    async fn get(&self, message_id: &str) -> Result<Option<AuditEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {AUDIT_COLUMNS} FROM audit_entries WHERE message_id = ?1"),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get audit entry: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_entry(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get audit entry: {e}"))),
        }
    }

    async fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        if entry.status == AuditStatus::SkippedDuplicate {
            self.append_event(&entry.message_id, entry.status, Some("duplicate submission"))
                .await?;
            debug!(message_id = %entry.message_id, "Duplicate submission logged");
            return Ok(());
        }

        let classification_json = match entry.classification {
            Some(ref c) => Some(to_json(c)?),
            None => None,
        };
        let category = entry.classification.as_ref().map(|c| c.category.as_str());
        let priority = entry.classification.as_ref().map(|c| c.priority.as_str());
        let now = fmt_ts(Utc::now());

        // The WHERE clause makes a processed row immutable: the upsert then
        // touches zero rows and the caller sees a duplicate.
        let changed = self
            .conn()
            .execute(
                "INSERT INTO audit_entries (message_id, account, folder, sender, subject,
                    processed_at, classification, category, priority, classification_status,
                    actions_applied, status, error, attempts, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)
                 ON CONFLICT(message_id) DO UPDATE SET
                    account = excluded.account,
                    folder = excluded.folder,
                    sender = excluded.sender,
                    subject = excluded.subject,
                    processed_at = excluded.processed_at,
                    classification = excluded.classification,
                    category = excluded.category,
                    priority = excluded.priority,
                    classification_status = excluded.classification_status,
                    actions_applied = excluded.actions_applied,
                    status = excluded.status,
                    error = excluded.error,
                    attempts = excluded.attempts,
                    updated_at = excluded.updated_at
                 WHERE audit_entries.status <> 'processed'",
                params![
                    entry.message_id.as_str(),
                    entry.account.as_str(),
                    entry.folder.as_str(),
                    entry.sender.as_str(),
                    entry.subject.as_str(),
                    fmt_ts(entry.processed_at),
                    opt_text(classification_json.as_deref()),
                    opt_text(category),
                    opt_text(priority),
                    entry.classification_status.as_str(),
                    to_json(&entry.actions_applied)?,
                    entry.status.as_str(),
                    opt_text(entry.error.as_deref()),
                    i64::from(entry.attempts),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record audit entry: {e}")))?;

        if changed == 0 {
            return Err(AuditError::Duplicate {
                message_id: entry.message_id.clone(),
            });
        }

        self.append_event(&entry.message_id, entry.status, entry.error.as_deref())
            .await?;
        debug!(
            message_id = %entry.message_id,
            status = entry.status.as_str(),
            "Audit entry recorded"
        );
        Ok(())
    }

    fn query(&self, filter: AuditFilter) -> AuditStream {
        let pager = QueryPager {
            conn: self.conn.clone(),
            filter,
            cursor: None,
            buffer: VecDeque::new(),
            emitted: 0,
            exhausted: false,
        };
        Box::pin(futures::stream::try_unfold(pager, QueryPager::next_entry))
    }

    async fn history(&self, message_id: &str) -> Result<Vec<AuditEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT message_id, status, detail, recorded_at FROM audit_events
                 WHERE message_id = ?1 ORDER BY id ASC",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("history: {e}")))?;

        let mut events = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let status_str: String = row.get(1).unwrap_or_default();
            let recorded_str: String = row.get(3).unwrap_or_default();
            let Ok(status) = status_str.parse() else {
                warn!(status = %status_str, "Skipping audit event with unknown status");
                continue;
            };
            events.push(AuditEvent {
                message_id: row.get(0).unwrap_or_default(),
                status,
                detail: row.get::<String>(2).ok(),
                recorded_at: parse_datetime(&recorded_str),
            });
        }
        Ok(events)
    }

    async fn count_by_status(&self) -> Result<Vec<(AuditStatus, u64)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status, COUNT(*) FROM audit_entries GROUP BY status ORDER BY status",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_by_status: {e}")))?;

        let mut counts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let status_str: String = row.get(0).unwrap_or_default();
            let count: i64 = row.get(1).unwrap_or(0);
            if let Ok(status) = status_str.parse() {
                counts.push((status, u64::try_from(count).unwrap_or(0)));
            }
        }

        // Duplicates never land in the entry table; count them from history.
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM audit_events WHERE status = 'skipped-duplicate'",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_by_status: {e}")))?;
        if let Ok(Some(row)) = rows.next().await {
            let count: i64 = row.get(0).unwrap_or(0);
            if count > 0 {
                counts.push((AuditStatus::SkippedDuplicate, u64::try_from(count).unwrap_or(0)));
            }
        }
        Ok(counts)
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let cutoff = fmt_ts(older_than);
        let conn = self.conn();

        conn.execute(
            "DELETE FROM action_items WHERE source_message_id IN
                (SELECT message_id FROM audit_entries WHERE processed_at < ?1)
             AND status IN ('completed', 'dismissed')",
            params![cutoff.as_str()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("prune action items: {e}")))?;

        conn.execute(
            "DELETE FROM audit_events WHERE recorded_at < ?1",
            params![cutoff.as_str()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("prune events: {e}")))?;

        let count = conn
            .execute(
                "DELETE FROM audit_entries WHERE processed_at < ?1",
                params![cutoff.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune entries: {e}")))?;

        if count > 0 {
            info!(count, cutoff = %cutoff, "Pruned old audit entries");
        }
        Ok(count as usize)
    }

    // ── Watermarks ──────────────────────────────────────────────────

    async fn watermark(&self, account: &str, folder: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT value FROM watermarks WHERE account = ?1 AND folder = ?2",
                params![account, folder],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("watermark: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<String>(0).ok()),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("watermark: {e}"))),
        }
    }

    async fn set_watermark(
        &self,
        account: &str,
        folder: &str,
        value: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO watermarks (account, folder, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(account, folder) DO UPDATE SET
                    value = excluded.value, updated_at = excluded.updated_at",
                params![account, folder, value, fmt_ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_watermark: {e}")))?;
        debug!(account, folder, value, "Watermark advanced");
        Ok(())
    }

    async fn list_watermarks(
        &self,
    ) -> Result<Vec<(String, String, String, DateTime<Utc>)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT account, folder, value, updated_at FROM watermarks ORDER BY account, folder",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_watermarks: {e}")))?;

        let mut marks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let updated: String = row.get(3).unwrap_or_default();
            marks.push((
                row.get(0).unwrap_or_default(),
                row.get(1).unwrap_or_default(),
                row.get(2).unwrap_or_default(),
                parse_datetime(&updated),
            ));
        }
        Ok(marks)
    }

    // ── Action items ────────────────────────────────────────────────

    async fn insert_action_items(&self, items: &[ActionItem]) -> Result<(), DatabaseError> {
        let conn = self.conn();
        for item in items {
            let created = fmt_ts(item.created_at);
            conn.execute(
                "INSERT OR IGNORE INTO action_items (id, source_message_id, title, description,
                    due_hint, priority, confidence, relevance, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    item.id.to_string(),
                    item.source_message_id.as_str(),
                    item.title.as_str(),
                    item.description.as_str(),
                    opt_text(item.due_hint.as_deref()),
                    item.priority.as_str(),
                    f64::from(item.confidence),
                    item.relevance.as_str(),
                    item.status.as_str(),
                    created,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_action_items: {e}")))?;
        }
        if !items.is_empty() {
            debug!(count = items.len(), "Action items stored");
        }
        Ok(())
    }

    async fn list_action_items(
        &self,
        filter: &ActionItemFilter,
    ) -> Result<Vec<ActionItem>, DatabaseError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();

        if let Some(status) = filter.status {
            values.push(libsql::Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(relevance) = filter.relevance {
            values.push(libsql::Value::Text(relevance.as_str().to_string()));
            clauses.push(format!("relevance = ?{}", values.len()));
        }
        if let Some(ref ids) = filter.message_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let mut placeholders = Vec::with_capacity(ids.len());
            for id in ids {
                values.push(libsql::Value::Text(id.clone()));
                placeholders.push(format!("?{}", values.len()));
            }
            clauses.push(format!("source_message_id IN ({})", placeholders.join(", ")));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let limit = filter.limit.unwrap_or(500);
        let sql = format!(
            "SELECT {ACTION_ITEM_COLUMNS} FROM action_items {where_sql}
             ORDER BY created_at DESC LIMIT {limit}"
        );

        let mut rows = self
            .conn()
            .query(&sql, libsql::params::Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("list_action_items: {e}")))?;

        let mut items = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_action_item(&row) {
                Ok(item) => items.push(item),
                Err(e) => warn!("Skipping action item row: {e}"),
            }
        }
        Ok(items)
    }

    async fn update_action_item_status(
        &self,
        id: Uuid,
        status: ActionItemStatus,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE action_items SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), fmt_ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_action_item_status: {e}")))?;
        Ok(changed > 0)
    }

    // ── Digests ─────────────────────────────────────────────────────

    async fn insert_digest(&self, digest: &Digest) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO digests ({DIGEST_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    digest.id.to_string(),
                    fmt_ts(digest.period_start),
                    fmt_ts(digest.period_end),
                    to_json(&digest.included_message_ids)?,
                    digest.summary_text.as_str(),
                    digest.content.as_str(),
                    digest.format.as_str(),
                    to_json(&digest.delivery_results)?,
                    digest.status.as_str(),
                    fmt_ts(digest.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_digest: {e}")))?;
        debug!(digest_id = %digest.id, "Digest inserted into DB");
        Ok(())
    }

    async fn update_digest_delivery(
        &self,
        id: Uuid,
        status: DigestStatus,
        results: &[DeliveryResult],
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE digests SET status = ?1, delivery_results = ?2 WHERE id = ?3",
                params![status.as_str(), to_json(&results)?, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_digest_delivery: {e}")))?;
        Ok(())
    }

    async fn list_digests(&self, limit: usize) -> Result<Vec<Digest>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {DIGEST_COLUMNS} FROM digests ORDER BY created_at DESC LIMIT ?1"
                ),
                params![i64::try_from(limit).unwrap_or(i64::MAX)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_digests: {e}")))?;

        let mut digests = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_digest(&row) {
                Ok(d) => digests.push(d),
                Err(e) => warn!("Skipping digest row: {e}"),
            }
        }
        Ok(digests)
    }

    // ── Drafts ──────────────────────────────────────────────────────

    async fn insert_draft(&self, draft: &Draft) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO drafts ({DRAFT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    draft.id.to_string(),
                    draft.message_id.as_str(),
                    draft.account.as_str(),
                    draft.to.as_str(),
                    draft.subject.as_str(),
                    draft.body.as_str(),
                    draft.status.as_str(),
                    fmt_ts(draft.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_draft: {e}")))?;
        Ok(())
    }

    async fn list_drafts(&self, status: Option<DraftStatus>) -> Result<Vec<Draft>, DatabaseError> {
        let mut rows = match status {
            Some(status) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {DRAFT_COLUMNS} FROM drafts WHERE status = ?1 ORDER BY created_at DESC"
                        ),
                        params![status.as_str()],
                    )
                    .await
            }
            None => {
                self.conn()
                    .query(
                        &format!("SELECT {DRAFT_COLUMNS} FROM drafts ORDER BY created_at DESC"),
                        (),
                    )
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("list_drafts: {e}")))?;

        let mut drafts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_draft(&row) {
                Ok(d) => drafts.push(d),
                Err(e) => warn!("Skipping draft row: {e}"),
            }
        }
        Ok(drafts)
    }

    async fn update_draft_status(
        &self,
        id: Uuid,
        status: DraftStatus,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE drafts SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_draft_status: {e}")))?;
        Ok(changed > 0)
    }
}
