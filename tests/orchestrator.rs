//! End-to-end tests for the ingestion pipeline and service loop.
//!
//! Sources and the LLM are in-memory stubs; the audit store is a real
//! in-memory libSQL database.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use inbox_pilot::config::{Settings, SourceKind};
use inbox_pilot::error::{DigestError, LlmError, SourceError};
use inbox_pilot::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use inbox_pilot::model::{
    Action, ActionOutcome, AuditEntry, AuditStatus, Message, MessageBody, StepStatus, fingerprint,
};
use inbox_pilot::pipeline::RuleEngine;
use inbox_pilot::service::{Orchestrator, RunOptions, Snapshot};
use inbox_pilot::sources::{MailSource, is_after};
use inbox_pilot::store::{AuditFilter, AuditStore, LibSqlBackend};

// ── Stubs ───────────────────────────────────────────────────────────

/// In-memory mailbox with one folder. Records every fetch and action.
struct MemorySource {
    account: String,
    folders: Vec<String>,
    messages: Vec<Message>,
    fetched: Mutex<Vec<String>>,
    applied: Mutex<Vec<(String, Action)>>,
}

impl MemorySource {
    fn new(account: &str, messages: Vec<Message>) -> Self {
        Self {
            account: account.into(),
            folders: vec!["INBOX".into()],
            messages,
            fetched: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
        }
    }

    fn applied(&self) -> Vec<(String, Action)> {
        self.applied.lock().unwrap().clone()
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailSource for MemorySource {
    fn account(&self) -> &str {
        &self.account
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Maildir
    }

    fn folders(&self) -> &[String] {
        &self.folders
    }

    async fn list_new(
        &self,
        folder: &str,
        since: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>, SourceError> {
        let batch: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.folder == folder)
            .filter(|m| since.is_none_or(|s| is_after(&m.source_ref, s)))
            .take(limit)
            .cloned()
            .collect();
        self.fetched
            .lock()
            .unwrap()
            .extend(batch.iter().map(|m| m.id.clone()));
        Ok(batch)
    }

    async fn fetch(&self, _folder: &str, source_ref: &str) -> Result<Message, SourceError> {
        self.messages
            .iter()
            .find(|m| m.source_ref == source_ref)
            .cloned()
            .ok_or_else(|| SourceError::NotFound {
                account: self.account.clone(),
                folder: "INBOX".into(),
                source_ref: source_ref.into(),
            })
    }

    async fn apply(&self, message: &Message, action: &Action) -> Result<(), SourceError> {
        self.applied
            .lock()
            .unwrap()
            .push((message.id.clone(), action.clone()));
        Ok(())
    }

    async fn check(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// A source whose server is always down.
struct DownSource {
    folders: Vec<String>,
}

#[async_trait]
impl MailSource for DownSource {
    fn account(&self) -> &str {
        "down"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Imap
    }

    fn folders(&self) -> &[String] {
        &self.folders
    }

    async fn list_new(&self, _: &str, _: Option<&str>, _: usize) -> Result<Vec<Message>, SourceError> {
        Err(SourceError::Unavailable {
            account: "down".into(),
            reason: "connection refused".into(),
        })
    }

    async fn fetch(&self, _: &str, _: &str) -> Result<Message, SourceError> {
        Err(SourceError::Unavailable {
            account: "down".into(),
            reason: "connection refused".into(),
        })
    }

    async fn apply(&self, _: &Message, _: &Action) -> Result<(), SourceError> {
        Ok(())
    }

    async fn check(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Answers by subject keyword: "outage" is urgent, "garbled" fails.
struct KeywordLlm;

#[async_trait]
impl LlmProvider for KeywordLlm {
    fn name(&self) -> &str {
        "keyword"
    }

    fn model_name(&self) -> &str {
        "keyword-1"
    }

    fn context_length(&self) -> usize {
        24_576
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let prompt: String = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let content = if prompt.contains("Subject: garbled") {
            return Err(LlmError::RequestFailed {
                provider: "keyword".into(),
                reason: "connection reset".into(),
            });
        } else if prompt.contains("outage") {
            r#"{"category": "work_clients", "priority": "urgent", "confidence": 0.95}"#
        } else {
            r#"{"category": "personal", "priority": "normal", "confidence": 0.8}"#
        };
        Ok(CompletionResponse {
            content: content.to_string(),
            input_tokens: 50,
            output_tokens: 20,
            finish_reason: FinishReason::Stop,
        })
    }
}

/// Classifies everything as personal after a delay, so concurrent
/// ingests overlap.
struct SlowLlm;

#[async_trait]
impl LlmProvider for SlowLlm {
    fn name(&self) -> &str {
        "slow"
    }

    fn model_name(&self) -> &str {
        "slow-1"
    }

    fn context_length(&self) -> usize {
        24_576
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        Ok(CompletionResponse {
            content: r#"{"category": "personal", "priority": "normal", "confidence": 0.8}"#.into(),
            input_tokens: 50,
            output_tokens: 20,
            finish_reason: FinishReason::Stop,
        })
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

const RULES: &str = r#"
batch_size: 50
classification_attempts: 1
rules:
  - id: urgent-to-priority
    priority: 1
    terminal: true
    conditions:
      - field: classification.priority
        operator: equals
        value: urgent
    actions:
      - type: move
        folder: Priority
  - id: tag-invoices
    priority: 5
    conditions:
      - field: subject
        operator: contains
        value: invoice
    actions:
      - type: tag
        tag: billing
"#;

fn settings(data_dir: &Path) -> Settings {
    let mut settings = Settings::from_yaml(RULES).unwrap();
    settings.data_dir = data_dir.to_path_buf();
    settings.service.action_items.auto_extract = false;
    settings
}

fn message(account: &str, n: usize, subject: &str) -> Message {
    let header = format!("<msg-{n}@{account}.example.com>");
    let source_ref = n.to_string();
    Message {
        id: fingerprint(account, "INBOX", Some(&header), &source_ref),
        account: account.into(),
        folder: "INBOX".into(),
        source_ref,
        message_id_header: Some(header),
        sender: "Client <client@example.com>".into(),
        recipients: vec!["me@example.com".into()],
        cc: vec![],
        subject: subject.into(),
        timestamp: Utc::now(),
        body: MessageBody::plain("Hello, see subject."),
        headers: BTreeMap::new(),
        attachments: vec![],
    }
}

async fn store() -> Arc<dyn AuditStore> {
    Arc::new(LibSqlBackend::new_memory().await.unwrap())
}

fn orchestrator(
    settings: Settings,
    store: Arc<dyn AuditStore>,
    sources: Vec<Arc<dyn MailSource>>,
    llm: Option<Arc<dyn LlmProvider>>,
) -> Orchestrator {
    let snapshot = Snapshot::new(settings, llm.clone(), Arc::clone(&store)).unwrap();
    Orchestrator::new(snapshot, store, sources, llm)
}

fn monitor_only() -> RunOptions {
    RunOptions {
        monitor: true,
        digest: false,
        dry_run: false,
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn ingesting_twice_records_one_processed_entry() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let msg = message("work", 1, "Quarterly invoice");
    let source = Arc::new(MemorySource::new("work", vec![msg.clone()]));
    let orch = orchestrator(
        settings(dir.path()),
        Arc::clone(&store),
        vec![source.clone()],
        None,
    );

    let first = orch.ingest(&msg, false).await.unwrap();
    assert_eq!(first.entry.status, AuditStatus::Processed);
    assert_eq!(first.entry.actions_applied.len(), 1);

    let second = orch.ingest(&msg, false).await.unwrap();
    assert_eq!(second.entry.status, AuditStatus::SkippedDuplicate);
    assert!(second.entry.actions_applied.is_empty());

    // The tag was applied once, by the first submission only.
    assert_eq!(source.applied().len(), 1);

    let all = store.query_all(AuditFilter::default()).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, AuditStatus::Processed);

    let history = store.history(&msg.id).await.unwrap();
    let statuses: Vec<AuditStatus> = history.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![AuditStatus::Processed, AuditStatus::SkippedDuplicate]
    );
}

#[test]
fn rule_evaluation_is_repeatable() {
    let settings = settings(Path::new("."));
    let engine = RuleEngine::compile(&settings.rules).unwrap();
    let msg = message("work", 1, "Invoice reminder");

    let first = engine.evaluate(&msg, None);
    let second = engine.evaluate(&msg, None);
    assert_eq!(first, second);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].rule_id, "tag-invoices");
}

#[tokio::test]
async fn empty_window_is_insufficient_even_when_forced() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let snapshot = Snapshot::new(settings(dir.path()), None, Arc::clone(&store)).unwrap();
    let (start, end) = snapshot.digest.window(None);

    for force in [false, true] {
        let err = snapshot.digest.generate(start, end, force).await.unwrap_err();
        assert!(matches!(
            err,
            DigestError::InsufficientData { found: 0, required: 1 }
        ));
    }
}

#[tokio::test]
async fn classification_failure_still_applies_message_rules() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let msg = message("work", 1, "garbled");
    let source = Arc::new(MemorySource::new("work", vec![msg.clone()]));
    let llm: Arc<dyn LlmProvider> = Arc::new(KeywordLlm);
    let mut settings = settings(dir.path());
    // Subject "garbled" fails classification; match it by subject too.
    settings.rules[1].conditions[0].value = Some(serde_yaml::Value::from("garbled"));
    let orch = orchestrator(settings, Arc::clone(&store), vec![source.clone()], Some(llm));

    let report = orch.ingest(&msg, false).await.unwrap();
    let entry = report.entry;
    assert_eq!(entry.status, AuditStatus::Processed);
    assert_eq!(entry.classification_status, StepStatus::Failed);
    assert!(entry.classification.is_none());
    assert!(entry.error.as_deref().unwrap_or_default().contains("classification"));

    // Only the message-field rule fired; the classification rule could not.
    assert_eq!(entry.actions_applied.len(), 1);
    assert_eq!(entry.actions_applied[0].rule_id, "tag-invoices");
    assert_eq!(entry.actions_applied[0].outcome, ActionOutcome::Applied);
    assert_eq!(
        source.applied(),
        vec![(msg.id.clone(), Action::Tag { tag: "billing".into() })]
    );
}

#[tokio::test]
async fn urgent_messages_move_and_digest_includes_all() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let messages = vec![
        message("work", 1, "Production outage"),
        message("work", 2, "Second outage report"),
        message("work", 3, "garbled"),
    ];
    let source = Arc::new(MemorySource::new("work", messages.clone()));
    let llm: Arc<dyn LlmProvider> = Arc::new(KeywordLlm);
    let orch = orchestrator(
        settings(dir.path()),
        Arc::clone(&store),
        vec![source.clone()],
        Some(llm),
    );

    let stats = orch.run_once(RunOptions::default()).await.unwrap();
    assert_eq!(stats.emails_found, 3);
    assert_eq!(stats.emails_processed, 3);
    assert_eq!(stats.classification_failures, 1);
    assert!(stats.digest.is_some());

    let entries = store.query_all(AuditFilter::default()).await.unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.status == AuditStatus::Processed));

    let moved: Vec<&AuditEntry> = entries
        .iter()
        .filter(|e| {
            e.actions_applied
                .iter()
                .any(|a| matches!(a.action, Action::Move { ref folder } if folder == "Priority"))
        })
        .collect();
    assert_eq!(moved.len(), 2);

    let unclassified = entries
        .iter()
        .find(|e| e.message_id == messages[2].id)
        .unwrap();
    assert_eq!(unclassified.classification_status, StepStatus::Failed);
    assert!(unclassified.actions_applied.is_empty());

    let digests = store.list_digests(5).await.unwrap();
    assert_eq!(digests.len(), 1);
    for m in &messages {
        assert!(digests[0].included_message_ids.contains(&m.id));
    }
    assert!(dir.path().join("digests").read_dir().unwrap().next().is_some());
}

#[tokio::test]
async fn resubmission_after_crash_applies_no_actions() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let msg = message("work", 7, "Production outage");
    let source = Arc::new(MemorySource::new("work", vec![msg.clone()]));
    let llm: Arc<dyn LlmProvider> = Arc::new(KeywordLlm);
    let orch = orchestrator(
        settings(dir.path()),
        Arc::clone(&store),
        vec![source.clone()],
        Some(llm),
    );

    orch.run_once(monitor_only()).await.unwrap();
    assert_eq!(source.applied().len(), 1);

    // Crash before the watermark moved: the source redelivers.
    store.set_watermark("work", "INBOX", "0").await.unwrap();
    let stats = orch.run_once(monitor_only()).await.unwrap();
    assert_eq!(stats.emails_found, 1);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.emails_processed, 0);
    assert_eq!(source.applied().len(), 1);
}

#[tokio::test]
async fn batch_size_bounds_each_cycle_without_refetching() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let messages: Vec<Message> = (1..=120)
        .map(|n| message("work", n, &format!("Note {n}")))
        .collect();
    let source = Arc::new(MemorySource::new("work", messages));
    let orch = orchestrator(
        settings(dir.path()),
        Arc::clone(&store),
        vec![source.clone()],
        None,
    );

    let mut found = Vec::new();
    for _ in 0..4 {
        let stats = orch.run_once(monitor_only()).await.unwrap();
        found.push(stats.emails_found);
    }
    assert_eq!(found, vec![50, 50, 20, 0]);

    let fetched = source.fetched();
    assert_eq!(fetched.len(), 120);
    let mut unique = fetched.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 120);

    assert_eq!(
        store.watermark("work", "INBOX").await.unwrap().as_deref(),
        Some("120")
    );
    let processed = store
        .query_all(AuditFilter::default().with_status(AuditStatus::Processed))
        .await
        .unwrap();
    assert_eq!(processed.len(), 120);
}

#[tokio::test]
async fn failed_message_is_retried_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let msg = message("work", 1, "Hello");
    let mut failed = AuditEntry::for_message(&msg, AuditStatus::Failed);
    failed.error = Some("storage hiccup".into());
    store.record(&failed).await.unwrap();

    let source = Arc::new(MemorySource::new("work", vec![msg.clone()]));
    let orch = orchestrator(settings(dir.path()), Arc::clone(&store), vec![source], None);

    let report = orch.ingest(&msg, false).await.unwrap();
    assert_eq!(report.entry.status, AuditStatus::Processed);
    assert_eq!(report.entry.attempts, 2);

    let statuses: Vec<AuditStatus> = store
        .history(&msg.id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.status)
        .collect();
    assert_eq!(
        statuses,
        vec![AuditStatus::Failed, AuditStatus::Retried, AuditStatus::Processed]
    );
}

#[tokio::test]
async fn unavailable_source_does_not_block_other_accounts() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let work = Arc::new(MemorySource::new("work", vec![message("work", 1, "Hi")]));
    let down = Arc::new(DownSource {
        folders: vec!["INBOX".into()],
    });
    let orch = orchestrator(
        settings(dir.path()),
        Arc::clone(&store),
        vec![down, work],
        None,
    );

    let stats = orch.run_once(monitor_only()).await.unwrap();
    assert_eq!(stats.emails_processed, 1);
    assert_eq!(stats.errors, 1);
}

#[tokio::test]
async fn dry_run_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let source = Arc::new(MemorySource::new(
        "work",
        vec![message("work", 1, "Overdue invoice")],
    ));
    let orch = orchestrator(
        settings(dir.path()),
        Arc::clone(&store),
        vec![source.clone()],
        None,
    );

    let stats = orch
        .run_once(RunOptions {
            monitor: true,
            digest: true,
            dry_run: true,
        })
        .await
        .unwrap();
    assert_eq!(stats.emails_processed, 1);
    assert!(stats.digest.is_none());
    assert!(source.applied().is_empty());
    assert!(store.query_all(AuditFilter::default()).await.unwrap().is_empty());
    assert_eq!(store.watermark("work", "INBOX").await.unwrap(), None);
}

#[tokio::test]
async fn notify_action_reaches_subscriber() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let mut settings = settings(dir.path());
    settings.rules = Settings::from_yaml(
        r#"
rules:
  - id: ping
    actions:
      - type: notify
        message: New mail
"#,
    )
    .unwrap()
    .rules;
    let msg = message("work", 1, "Anything");
    let source = Arc::new(MemorySource::new("work", vec![msg.clone()]));
    let orch = orchestrator(settings, Arc::clone(&store), vec![source], None);
    let mut rx = orch.take_notifications().await.unwrap();

    orch.ingest(&msg, false).await.unwrap();
    let note = rx.try_recv().unwrap();
    assert_eq!(note.rule_id, "ping");
    assert_eq!(note.message_id, msg.id);
    assert_eq!(note.text.as_deref(), Some("New mail"));
}

#[tokio::test]
async fn stop_ends_a_running_service() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let source = Arc::new(MemorySource::new("work", vec![message("work", 1, "Hi")]));
    let orch = Arc::new(orchestrator(
        settings(dir.path()),
        Arc::clone(&store),
        vec![source],
        None,
    ));

    let running = Arc::clone(&orch);
    let handle = tokio::spawn(async move { running.start().await });

    // Wait for the first poll to land.
    let deadline = Utc::now() + Duration::seconds(5);
    while !store.has_processed(&message("work", 1, "Hi").id).await.unwrap() {
        assert!(Utc::now() < deadline, "first poll never completed");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(orch.status().await.running);

    orch.stop();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!orch.status().await.running);
}

#[tokio::test]
async fn reload_swaps_rules_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let orch = orchestrator(settings(dir.path()), Arc::clone(&store), vec![], None);
    assert_eq!(orch.snapshot().await.rules.len(), 2);

    let mut next = settings(dir.path());
    next.rules.truncate(1);
    orch.reload(next).await.unwrap();

    let snap = orch.snapshot().await;
    assert_eq!(snap.rules.len(), 1);
    assert_eq!(snap.generation(), 2);
}

#[tokio::test]
async fn redelivered_copy_in_one_batch_is_applied_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let original = message("work", 1, "Invoice attached");
    let mut copy = original.clone();
    copy.source_ref = "2".into();
    assert_eq!(original.id, copy.id);

    let source = Arc::new(MemorySource::new("work", vec![original.clone(), copy]));
    let llm: Arc<dyn LlmProvider> = Arc::new(SlowLlm);
    let orch = orchestrator(
        settings(dir.path()),
        Arc::clone(&store),
        vec![source.clone()],
        Some(llm),
    );

    let stats = orch.run_once(monitor_only()).await.unwrap();
    assert_eq!(stats.emails_found, 2);
    assert_eq!(stats.emails_processed, 1);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(
        source.applied(),
        vec![(original.id.clone(), Action::Tag { tag: "billing".into() })]
    );

    let skipped = store
        .query_all(AuditFilter::default().with_status(AuditStatus::SkippedDuplicate))
        .await
        .unwrap();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].message_id, original.id);
}

#[tokio::test]
async fn same_message_in_two_accounts_is_processed_in_each() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let header = "<shared@example.com>".to_string();
    let for_account = |account: &str| {
        let mut m = message(account, 1, "Invoice for both");
        m.message_id_header = Some(header.clone());
        m.id = fingerprint(account, "INBOX", Some(&header), &m.source_ref);
        m
    };
    let work = Arc::new(MemorySource::new("work", vec![for_account("work")]));
    let home = Arc::new(MemorySource::new("home", vec![for_account("home")]));
    let orch = orchestrator(
        settings(dir.path()),
        Arc::clone(&store),
        vec![work.clone(), home.clone()],
        None,
    );

    let stats = orch.run_once(monitor_only()).await.unwrap();
    assert_eq!(stats.emails_processed, 2);
    assert_eq!(stats.duplicates, 0);
    assert_eq!(work.applied().len(), 1);
    assert_eq!(home.applied().len(), 1);
}
