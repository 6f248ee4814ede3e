//! Core data model shared by sources, the pipeline, the audit store and digests.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use uuid::Uuid;

// ── Message ─────────────────────────────────────────────────────────

/// Immutable snapshot of one email at ingestion time.
///
/// Built by a `MailSource`, then shared read-only by every downstream stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Stable fingerprint, the audit store key. See [`fingerprint`].
    pub id: String,
    pub account: String,
    pub folder: String,
    /// Source-native locator (IMAP UID, Maildir unique name). Also the
    /// watermark cursor for the folder.
    pub source_ref: String,
    /// `Message-ID` header, if the message had one.
    pub message_id_header: Option<String>,
    pub sender: String,
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    pub body: MessageBody,
    /// Header map with lowercased names.
    pub headers: BTreeMap<String, String>,
    /// Attachment file names.
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    pub text: Option<String>,
    pub html: Option<String>,
}

impl MessageBody {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            html: None,
        }
    }

    /// Best plain-text view of the body: the text part, else the HTML part
    /// converted to text.
    pub fn to_text(&self) -> String {
        match (&self.text, &self.html) {
            (Some(text), _) if !text.trim().is_empty() => text.clone(),
            (_, Some(html)) => crate::pipeline::text::html_to_text(html),
            (Some(text), None) => text.clone(),
            (None, None) => String::new(),
        }
    }
}

impl Message {
    /// Header lookup, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Domain part of the sender address.
    pub fn sender_domain(&self) -> Option<&str> {
        let (_, domain) = self.sender.rsplit_once('@')?;
        let domain = domain.trim_end_matches('>').trim();
        if domain.is_empty() { None } else { Some(domain) }
    }
}

/// Derive the audit key for a message.
///
/// Hashes the account together with the protocol-level `Message-ID` when
/// present, otherwise the source coordinates (`account:folder:source_ref`).
/// The folder is left out of the first form so a message keeps its key
/// after a move. Hex-encoded SHA-256.
pub fn fingerprint(
    account: &str,
    folder: &str,
    message_id_header: Option<&str>,
    source_ref: &str,
) -> String {
    let mut hasher = Sha256::new();
    match message_id_header.map(str::trim).filter(|s| !s.is_empty()) {
        Some(mid) => hasher.update(format!("{account}\n{mid}").as_bytes()),
        None => hasher.update(format!("{account}:{folder}:{source_ref}").as_bytes()),
    }
    hex::encode(hasher.finalize())
}

// ── Classification ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Personal,
    WorkClients,
    WorkAdmin,
    Newsletter,
    Promotional,
    Spam,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::WorkClients => "work_clients",
            Self::WorkAdmin => "work_admin",
            Self::Newsletter => "newsletter",
            Self::Promotional => "promotional",
            Self::Spam => "spam",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    /// Accepts the canonical names plus a few labels models tend to emit.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "personal" | "transactional" => Ok(Self::Personal),
            "work_clients" => Ok(Self::WorkClients),
            "work_admin" | "work" => Ok(Self::WorkAdmin),
            "newsletter" => Ok(Self::Newsletter),
            "promotional" => Ok(Self::Promotional),
            "spam" => Ok(Self::Spam),
            "other" | "miscellaneous" | "unknown" => Ok(Self::Other),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

/// Message priority, ordered low → urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" | "medium" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Structured output of the classification pipeline for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub message_id: String,
    pub category: Category,
    pub priority: Priority,
    pub action_items: Vec<ActionItem>,
    pub confidence: f32,
    pub provider: String,
    pub model: String,
    pub raw_response: String,
}

// ── Action items ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relevance {
    /// Someone is asking the recipient to do something.
    Direct,
    /// Announcements, newsletter calls to action, FYI.
    Informational,
}

impl Relevance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Informational => "informational",
        }
    }
}

impl FromStr for Relevance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "informational" | "info" | "fyi" => Ok(Self::Informational),
            other => Err(format!("unknown relevance: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionItemStatus {
    Pending,
    InProgress,
    Completed,
    Dismissed,
}

impl ActionItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Dismissed => "dismissed",
        }
    }
}

impl FromStr for ActionItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" | "done" => Ok(Self::Completed),
            "dismissed" => Ok(Self::Dismissed),
            other => Err(format!("unknown action item status: {other}")),
        }
    }
}

/// A task extracted from a message during classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    pub id: Uuid,
    pub source_message_id: String,
    pub title: String,
    pub description: String,
    pub due_hint: Option<String>,
    pub priority: Priority,
    pub confidence: f32,
    pub relevance: Relevance,
    pub status: ActionItemStatus,
    pub created_at: DateTime<Utc>,
}

impl ActionItem {
    pub fn new(source_message_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_message_id: source_message_id.into(),
            title: title.into(),
            description: String::new(),
            due_hint: None,
            priority: Priority::Normal,
            confidence: 1.0,
            relevance: Relevance::Direct,
            status: ActionItemStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

// ── Rule actions ────────────────────────────────────────────────────

/// A rule-driven mutation or side effect. Closed set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Tag {
        tag: String,
    },
    Move {
        folder: String,
    },
    Delete,
    Forward {
        to: String,
        /// SMTP account used to send; defaults to the first configured one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        smtp_account: Option<String>,
    },
    ExtractActionItem,
    Notify {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Action {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tag { .. } => "tag",
            Self::Move { .. } => "move",
            Self::Delete => "delete",
            Self::Forward { .. } => "forward",
            Self::ExtractActionItem => "extract_action_item",
            Self::Notify { .. } => "notify",
        }
    }

    /// Human-readable description, used by dry runs and listings.
    pub fn describe(&self) -> String {
        match self {
            Self::Tag { tag } => format!("add tag '{tag}'"),
            Self::Move { folder } => format!("move to {folder}"),
            Self::Delete => "delete (move to Trash)".into(),
            Self::Forward { to, .. } => format!("forward to {to}"),
            Self::ExtractActionItem => "extract action items".into(),
            Self::Notify { message } => match message {
                Some(m) => format!("notify: {m}"),
                None => "notify".into(),
            },
        }
    }

    /// Move and delete decide where a message ends up; only one can win.
    pub fn is_placement(&self) -> bool {
        matches!(self, Self::Move { .. } | Self::Delete)
    }

    /// Whether the action mutates mail state through the source adapter.
    pub fn touches_source(&self) -> bool {
        matches!(
            self,
            Self::Tag { .. } | Self::Move { .. } | Self::Delete | Self::Forward { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Applied,
    /// Dry run: evaluated but not executed.
    Planned,
    Failed { reason: String },
}

/// An action taken (or attempted) on a message, as recorded in the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedAction {
    pub rule_id: String,
    pub action: Action,
    pub outcome: ActionOutcome,
}

// ── Audit ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditStatus {
    Processed,
    SkippedDuplicate,
    Failed,
    Retried,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::SkippedDuplicate => "skipped-duplicate",
            Self::Failed => "failed",
            Self::Retried => "retried",
        }
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processed" => Ok(Self::Processed),
            "skipped-duplicate" | "skipped_duplicate" => Ok(Self::SkippedDuplicate),
            "failed" => Ok(Self::Failed),
            "retried" => Ok(Self::Retried),
            other => Err(format!("unknown audit status: {other}")),
        }
    }
}

/// Outcome of an individual pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

/// One row of the audit log, keyed by `message_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub message_id: String,
    pub account: String,
    pub folder: String,
    pub sender: String,
    pub subject: String,
    pub processed_at: DateTime<Utc>,
    pub classification: Option<ClassificationResult>,
    /// Status of the classification step, distinct from `status`.
    pub classification_status: StepStatus,
    pub actions_applied: Vec<AppliedAction>,
    pub status: AuditStatus,
    pub error: Option<String>,
    pub attempts: u32,
}

impl AuditEntry {
    /// Start an entry for `message` with no classification and no actions.
    pub fn for_message(message: &Message, status: AuditStatus) -> Self {
        Self {
            message_id: message.id.clone(),
            account: message.account.clone(),
            folder: message.folder.clone(),
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            processed_at: Utc::now(),
            classification: None,
            classification_status: StepStatus::Skipped,
            actions_applied: Vec::new(),
            status,
            error: None,
            attempts: 1,
        }
    }

    pub fn category(&self) -> Category {
        self.classification
            .as_ref()
            .map_or(Category::Other, |c| c.category)
    }

    pub fn priority(&self) -> Priority {
        self.classification
            .as_ref()
            .map_or(Priority::Normal, |c| c.priority)
    }
}

// ── Digest ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestFormat {
    #[default]
    Markdown,
    Html,
    Text,
}

impl DigestFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Markdown => "markdown",
            Self::Html => "html",
            Self::Text => "text",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Markdown => "md",
            Self::Html => "html",
            Self::Text => "txt",
        }
    }
}

impl FromStr for DigestFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "markdown" | "md" => Ok(Self::Markdown),
            "html" => Ok(Self::Html),
            "text" | "txt" => Ok(Self::Text),
            other => Err(format!("unknown digest format: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestStatus {
    Pending,
    Delivered,
    Failed,
}

impl DigestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for DigestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown digest status: {other}")),
        }
    }
}

/// Result of handing a digest to one sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub sink: String,
    pub ok: bool,
    /// Output location on success, error text on failure.
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    pub id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub included_message_ids: BTreeSet<String>,
    pub summary_text: String,
    /// Canonical markdown rendering; sinks convert to their own format.
    pub content: String,
    pub format: DigestFormat,
    pub delivery_results: Vec<DeliveryResult>,
    pub status: DigestStatus,
    pub created_at: DateTime<Utc>,
}

// ── Drafts ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Pending,
    Discarded,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Discarded => "discarded",
        }
    }
}

impl FromStr for DraftStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "discarded" => Ok(Self::Discarded),
            other => Err(format!("unknown draft status: {other}")),
        }
    }
}

/// LLM-drafted reply awaiting human review. Never sent automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub id: Uuid,
    pub message_id: String,
    pub account: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub status: DraftStatus,
    pub created_at: DateTime<Utc>,
}
