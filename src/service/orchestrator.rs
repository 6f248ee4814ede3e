//! The service loop.
//!
//! One task per monitored account polls its source on an interval, one task
//! fires digests on the configured times of day, and one prunes the audit
//! log nightly. All of them share a single [`Snapshot`] of configuration
//! that `reload` swaps as a whole.
//!
//! Per message the order is fixed: claim, dedup check, classification, rule
//! evaluation, action application, audit record. A claim is held in memory
//! from before the dedup check until the record lands, so two copies of one
//! message (same batch or two pollers) never both reach the source. A folder's watermark only
//! moves once every message before it in the batch has been recorded.
//!
//! Digest windows are read from the audit store when the tick fires. An
//! entry whose write completes concurrently with the tick may land in
//! either this digest or none; that boundary race is accepted.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, Utc};
use futures::StreamExt;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::schedule::{DailySchedule, TimeOfDay};
use crate::config::Settings;
use crate::digest::{DigestGenerator, build_sinks};
use crate::error::{AuditError, ConfigError, DigestError, Error, SourceError};
use crate::llm::LlmProvider;
use crate::model::{
    Action, ActionItem, ActionOutcome, AppliedAction, AuditEntry, AuditStatus,
    ClassificationResult, Digest, Message, StepStatus,
};
use crate::pipeline::rules::resolve;
use crate::pipeline::{Classifier, ClassifierConfig, PlannedAction, RuleEngine};
use crate::sources::MailSource;
use crate::store::AuditStore;

/// First wait after a source connection failure.
const BACKOFF_START: Duration = Duration::from_secs(30);
const NOTIFY_BUFFER: usize = 256;

/// Immutable configuration generation shared by every task.
pub struct Snapshot {
    pub settings: Settings,
    pub rules: RuleEngine,
    pub classifier: Option<Arc<Classifier>>,
    pub digest: Arc<DigestGenerator>,
    pub digest_schedule: DailySchedule,
    generation: u64,
}

impl Snapshot {
    /// Compile rules and schedules from `settings`.
    pub fn new(
        settings: Settings,
        llm: Option<Arc<dyn LlmProvider>>,
        store: Arc<dyn AuditStore>,
    ) -> Result<Self, ConfigError> {
        let rules = RuleEngine::compile(&settings.rules)?;
        let digest_schedule = DailySchedule::parse(&settings.service.digest.schedule).map_err(
            |message| ConfigError::InvalidValue {
                key: "service.digest.schedule".into(),
                message,
            },
        )?;
        let classifier = llm.map(|llm| {
            Arc::new(Classifier::new(
                llm,
                ClassifierConfig::from_settings(&settings),
            ))
        });
        let digest = Arc::new(DigestGenerator::new(
            store,
            classifier.clone(),
            settings.service.digest.clone(),
            build_sinks(&settings),
        ));
        Ok(Self {
            settings,
            rules,
            classifier,
            digest,
            digest_schedule,
            generation: 1,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// What a `run_once` pass does.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub monitor: bool,
    pub digest: bool,
    /// Evaluate and log actions without applying or recording anything.
    pub dry_run: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            monitor: true,
            digest: true,
            dry_run: false,
        }
    }
}

/// Counters for one polling pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleStats {
    pub emails_found: usize,
    pub emails_processed: usize,
    pub duplicates: usize,
    /// Messages recorded `failed` plus accounts that could not be polled.
    pub errors: usize,
    /// Processed messages whose classification step failed.
    pub classification_failures: usize,
    pub action_items_created: usize,
    pub digest: Option<uuid::Uuid>,
    pub duration: Duration,
}

impl CycleStats {
    fn merge(&mut self, other: &CycleStats) {
        self.emails_found += other.emails_found;
        self.emails_processed += other.emails_processed;
        self.duplicates += other.duplicates;
        self.errors += other.errors;
        self.classification_failures += other.classification_failures;
        self.action_items_created += other.action_items_created;
    }

    fn tally(&mut self, report: &IngestReport) {
        match report.entry.status {
            AuditStatus::Processed => {
                self.emails_processed += 1;
                self.action_items_created += report.action_items;
                if report.entry.classification_status == StepStatus::Failed {
                    self.classification_failures += 1;
                }
            }
            AuditStatus::SkippedDuplicate => self.duplicates += 1,
            AuditStatus::Failed | AuditStatus::Retried => self.errors += 1,
        }
    }
}

/// Outcome of ingesting one message. In a dry run the entry is what would
/// have been recorded.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub entry: AuditEntry,
    pub action_items: usize,
}

/// Raised by a rule's `notify` action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub rule_id: String,
    pub message_id: String,
    pub account: String,
    pub sender: String,
    pub subject: String,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountStatus {
    pub account: String,
    pub last_poll: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Current retry delay while the source is unreachable.
    pub backoff_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub generation: u64,
    pub rules: usize,
    pub digest_schedule: Vec<String>,
    pub next_digest: Option<DateTime<Local>>,
    pub last_digest: Option<DateTime<Utc>>,
    pub accounts: Vec<AccountStatus>,
}

#[derive(Default)]
struct RuntimeState {
    running: bool,
    started_at: Option<DateTime<Utc>>,
    last_digest: Option<DateTime<Utc>>,
    accounts: BTreeMap<String, AccountStatus>,
    fatal: Option<String>,
}

pub struct Orchestrator {
    snapshot: RwLock<Arc<Snapshot>>,
    store: Arc<dyn AuditStore>,
    sources: Vec<Arc<dyn MailSource>>,
    llm: Option<Arc<dyn LlmProvider>>,
    /// Bounds LLM calls across all accounts.
    permits: Semaphore,
    shutdown: watch::Sender<bool>,
    reloaded: watch::Sender<u64>,
    notify_tx: mpsc::Sender<Notification>,
    notify_rx: Mutex<Option<mpsc::Receiver<Notification>>>,
    state: Mutex<RuntimeState>,
    /// Fingerprints currently between claim and audit record.
    in_flight: std::sync::Mutex<HashSet<String>>,
}

/// Exclusive hold on one fingerprint; released on drop.
struct Claim<'a> {
    held: &'a std::sync::Mutex<HashSet<String>>,
    id: String,
}

impl<'a> Claim<'a> {
    fn try_take(held: &'a std::sync::Mutex<HashSet<String>>, id: &str) -> Option<Self> {
        let mut set = held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        set.insert(id.to_string()).then(|| Self {
            held,
            id: id.to_string(),
        })
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut set = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        set.remove(&self.id);
    }
}

impl Orchestrator {
    pub fn new(
        snapshot: Snapshot,
        store: Arc<dyn AuditStore>,
        sources: Vec<Arc<dyn MailSource>>,
        llm: Option<Arc<dyn LlmProvider>>,
    ) -> Self {
        let permits = Semaphore::new(snapshot.settings.max_in_flight.max(1));
        let (shutdown, _) = watch::channel(false);
        let (reloaded, _) = watch::channel(snapshot.generation);
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_BUFFER);
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            store,
            sources,
            llm,
            permits,
            shutdown,
            reloaded,
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
            state: Mutex::new(RuntimeState::default()),
            in_flight: std::sync::Mutex::new(HashSet::new()),
        }
    }

    pub async fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().await.clone()
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    pub fn sources(&self) -> &[Arc<dyn MailSource>] {
        &self.sources
    }

    fn source(&self, account: &str) -> Option<&Arc<dyn MailSource>> {
        self.sources.iter().find(|s| s.account() == account)
    }

    /// Take the notification stream. When nobody takes it, `start` logs
    /// notifications instead.
    pub async fn take_notifications(&self) -> Option<mpsc::Receiver<Notification>> {
        self.notify_rx.lock().await.take()
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Run the service until `stop` is called, Ctrl+C arrives, or the audit
    /// store becomes unreachable.
    pub async fn start(self: &Arc<Self>) -> Result<(), Error> {
        let snap = self.snapshot().await;
        {
            let mut state = self.state.lock().await;
            state.running = true;
            state.started_at = Some(Utc::now());
            state.fatal = None;
        }
        self.shutdown.send_replace(false);

        let mut tasks = JoinSet::new();

        if let Some(mut rx) = self.take_notifications().await {
            let mut shutdown = self.shutdown.subscribe();
            tasks.spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        n = rx.recv() => match n {
                            Some(n) => info!(
                                rule = %n.rule_id,
                                account = %n.account,
                                from = %n.sender,
                                subject = %n.subject,
                                "{}",
                                n.text.as_deref().unwrap_or("Rule notification")
                            ),
                            None => break,
                        },
                    }
                }
            });
        }

        if snap.settings.service.monitor.enabled {
            for source in &self.sources {
                if !snap.settings.monitors(source.account()) {
                    debug!(account = source.account(), "Account not monitored");
                    continue;
                }
                let this = Arc::clone(self);
                let source = Arc::clone(source);
                tasks.spawn(async move { this.account_loop(source).await });
            }
        } else {
            info!("Monitoring disabled");
        }

        let this = Arc::clone(self);
        tasks.spawn(async move { this.digest_loop().await });
        let this = Arc::clone(self);
        tasks.spawn(async move { this.cleanup_loop().await });

        info!(
            accounts = self.sources.len(),
            rules = snap.rules.len(),
            "Service started"
        );

        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
                self.stop();
            }
            _ = shutdown.wait_for(|stop| *stop) => {}
        }

        // Pollers finish the message they are on before exiting.
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Service task panicked: {e}");
            }
        }

        let mut state = self.state.lock().await;
        state.running = false;
        info!("Service stopped");
        match state.fatal.take() {
            Some(reason) => Err(Error::Database(crate::error::DatabaseError::Pool(reason))),
            None => Ok(()),
        }
    }

    /// Signal every task to stop. Timers are cancelled at once; in-flight
    /// messages finish.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Swap in a new configuration generation.
    ///
    /// Accounts are bound at startup; adding or removing one needs a restart.
    pub async fn reload(&self, settings: Settings) -> Result<(), ConfigError> {
        let mut next = Snapshot::new(settings, self.llm.clone(), Arc::clone(&self.store))?;
        let generation = {
            let mut guard = self.snapshot.write().await;
            next.generation = guard.generation + 1;
            let known: Vec<&str> = self.sources.iter().map(|s| s.account()).collect();
            for account in next.settings.accounts() {
                if account.kind != crate::config::SourceKind::Smtp
                    && !known.contains(&account.name.as_str())
                {
                    warn!(account = %account.name, "New account ignored until restart");
                }
            }
            let generation = next.generation;
            *guard = Arc::new(next);
            generation
        };
        self.reloaded.send_replace(generation);
        info!(generation, "Configuration reloaded");
        Ok(())
    }

    pub async fn status(&self) -> ServiceStatus {
        let snap = self.snapshot().await;
        let state = self.state.lock().await;
        let mut accounts: Vec<AccountStatus> = self
            .sources
            .iter()
            .map(|s| {
                state
                    .accounts
                    .get(s.account())
                    .cloned()
                    .unwrap_or_else(|| AccountStatus {
                        account: s.account().to_string(),
                        ..Default::default()
                    })
            })
            .collect();
        accounts.sort_by(|a, b| a.account.cmp(&b.account));
        ServiceStatus {
            running: state.running,
            started_at: state.started_at,
            generation: snap.generation,
            rules: snap.rules.len(),
            digest_schedule: snap
                .digest_schedule
                .times()
                .iter()
                .map(TimeOfDay::to_string)
                .collect(),
            next_digest: if snap.settings.service.digest.enabled {
                snap.digest_schedule.next_after(Local::now())
            } else {
                None
            },
            last_digest: state.last_digest,
            accounts,
        }
    }

    // ── Batch mode ──────────────────────────────────────────────────

    /// One polling pass over every monitored account, then a digest check.
    pub async fn run_once(&self, options: RunOptions) -> Result<CycleStats, Error> {
        let started = Instant::now();
        let snap = self.snapshot().await;
        let mut stats = CycleStats::default();

        if options.monitor {
            let current: &Snapshot = &snap;
            let polls = self
                .sources
                .iter()
                .filter(|s| current.settings.monitors(s.account()))
                .map(|s| async move {
                    let result = self.poll_account(current, s, options.dry_run).await;
                    (s.account(), result)
                });
            for (account, result) in futures::future::join_all(polls).await {
                match result {
                    Ok(account_stats) => stats.merge(&account_stats),
                    Err(Error::Database(e)) => return Err(Error::Database(e)),
                    Err(e) => {
                        error!(account, error = %e, "Polling failed");
                        stats.errors += 1;
                    }
                }
            }
        }

        if options.digest && !options.dry_run && snap.settings.service.digest.enabled {
            stats.digest = self.scheduled_digest(&snap).await?.map(|d| d.id);
        }

        stats.duration = started.elapsed();
        info!(
            found = stats.emails_found,
            processed = stats.emails_processed,
            duplicates = stats.duplicates,
            errors = stats.errors,
            duration_ms = stats.duration.as_millis() as u64,
            "Cycle complete"
        );
        Ok(stats)
    }

    // ── Polling ─────────────────────────────────────────────────────

    async fn account_loop(self: Arc<Self>, source: Arc<dyn MailSource>) {
        let account = source.account().to_string();
        let mut shutdown = self.shutdown.subscribe();
        let mut backoff: Option<Duration> = None;
        info!(account = %account, kind = source.kind().as_str(), "Poller started");

        while !*shutdown.borrow() {
            let snap = self.snapshot().await;
            let interval = Duration::from_secs(snap.settings.polling_interval_for(&account));

            let result = self.poll_account(&snap, &source, false).await;
            let error_text = result.as_ref().err().map(ToString::to_string);
            match result {
                Ok(stats) => {
                    backoff = None;
                    if stats.emails_found > 0 {
                        info!(
                            account = %account,
                            found = stats.emails_found,
                            processed = stats.emails_processed,
                            duplicates = stats.duplicates,
                            errors = stats.errors,
                            "Poll complete"
                        );
                    }
                }
                Err(Error::Source(e)) if e.is_retryable() => {
                    let next = next_backoff(backoff, interval);
                    backoff = Some(next);
                    warn!(account = %account, error = %e, retry_in_secs = next.as_secs(), "Source unavailable");
                }
                Err(Error::Database(e)) => {
                    error!(account = %account, error = %e, "Audit store unreachable, stopping service");
                    self.state.lock().await.fatal = Some(e.to_string());
                    self.stop();
                    break;
                }
                Err(e) => {
                    error!(account = %account, error = %e, "Poll failed");
                }
            }
            self.note_poll(&account, error_text, backoff).await;

            let wait = backoff.map_or(interval, with_jitter);
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!(account = %account, "Poller stopped");
    }

    async fn note_poll(&self, account: &str, error: Option<String>, backoff: Option<Duration>) {
        let mut state = self.state.lock().await;
        let entry = state
            .accounts
            .entry(account.to_string())
            .or_insert_with(|| AccountStatus {
                account: account.to_string(),
                ..Default::default()
            });
        entry.last_poll = Some(Utc::now());
        entry.last_error = error;
        entry.backoff_secs = backoff.map(|b| b.as_secs());
    }

    /// Poll every folder of one account once.
    async fn poll_account(
        &self,
        snap: &Snapshot,
        source: &Arc<dyn MailSource>,
        dry_run: bool,
    ) -> Result<CycleStats, Error> {
        let account = source.account();
        let mut stats = CycleStats::default();

        for folder in source.folders() {
            if self.stopping() {
                break;
            }
            let since = self.store.watermark(account, folder).await?;
            let messages = source
                .list_new(folder, since.as_deref(), snap.settings.batch_size)
                .await?;
            stats.emails_found += messages.len();
            if messages.is_empty() {
                continue;
            }
            debug!(account, folder = %folder, count = messages.len(), "Fetched batch");

            let batch = &messages;
            let mut outcomes: Vec<(usize, Result<Option<IngestReport>, Error>)> =
                futures::stream::iter(0..batch.len())
                    .map(move |i| async move {
                        if self.stopping() {
                            return (i, Ok(None));
                        }
                        let message = &batch[i];
                        (i, self.ingest_with(snap, source, message, dry_run).await.map(Some))
                    })
                    .buffer_unordered(snap.settings.max_in_flight.max(1))
                    .collect()
                    .await;
            outcomes.sort_by_key(|(i, _)| *i);

            // The watermark covers the longest recorded prefix of the batch.
            let mut watermark: Option<&str> = None;
            let mut contiguous = true;
            let mut fatal = None;
            for (i, outcome) in outcomes {
                match outcome {
                    Ok(Some(report)) => {
                        stats.tally(&report);
                        if contiguous {
                            watermark = Some(messages[i].source_ref.as_str());
                        }
                    }
                    Ok(None) => contiguous = false,
                    Err(e) => {
                        contiguous = false;
                        stats.errors += 1;
                        error!(message_id = %messages[i].id, error = %e, "Message not recorded");
                        fatal.get_or_insert(e);
                    }
                }
            }

            if !dry_run && let Some(mark) = watermark {
                self.store.set_watermark(account, folder, mark).await?;
                debug!(account, folder = %folder, watermark = mark, "Watermark advanced");
            }
            if let Some(e) = fatal {
                return Err(e);
            }
        }
        Ok(stats)
    }

    // ── Ingestion ───────────────────────────────────────────────────

    /// Run one message through the pipeline using its account's source.
    pub async fn ingest(&self, message: &Message, dry_run: bool) -> Result<IngestReport, Error> {
        let source = self
            .source(&message.account)
            .ok_or_else(|| SourceError::Unavailable {
                account: message.account.clone(),
                reason: "no source configured for account".into(),
            })?;
        let snap = self.snapshot().await;
        self.ingest_with(&snap, source, message, dry_run).await
    }

    async fn ingest_with(
        &self,
        snap: &Snapshot,
        source: &Arc<dyn MailSource>,
        message: &Message,
        dry_run: bool,
    ) -> Result<IngestReport, Error> {
        let Some(_claim) = Claim::try_take(&self.in_flight, &message.id) else {
            debug!(message_id = %message.id, "Already in flight");
            return self.skip_duplicate(message, dry_run).await;
        };
        if self.store.has_processed(&message.id).await? {
            debug!(message_id = %message.id, "Already processed");
            return self.skip_duplicate(message, dry_run).await;
        }

        let mut attempts = 1;
        if let Some(previous) = self.store.get(&message.id).await? {
            attempts = previous.attempts + 1;
            if !dry_run && matches!(previous.status, AuditStatus::Failed | AuditStatus::Retried) {
                let mut retry = AuditEntry::for_message(message, AuditStatus::Retried);
                retry.attempts = attempts;
                retry.error = previous.error.clone();
                self.record(retry).await?;
                info!(message_id = %message.id, attempts, "Retrying previously failed message");
            }
        }

        let monitor = &snap.settings.service.monitor;
        let mut entry = AuditEntry::for_message(message, AuditStatus::Processed);
        entry.attempts = attempts;

        let classification = match (&snap.classifier, monitor.auto_classify) {
            (Some(classifier), true) => {
                let _permit = self.permits.acquire().await.ok();
                match classifier.classify(message).await {
                    Ok(result) => {
                        entry.classification_status = StepStatus::Ok;
                        Some(result)
                    }
                    Err(e) => {
                        warn!(message_id = %message.id, error = %e, "Classification failed, applying message-only rules");
                        entry.classification_status = StepStatus::Failed;
                        entry.error = Some(format!("classification: {e}"));
                        None
                    }
                }
            }
            _ => None,
        };

        let plan = if monitor.apply_rules {
            resolve(
                snap.rules.evaluate(message, classification.as_ref()),
                snap.settings.conflict_policy,
            )
        } else {
            Vec::new()
        };

        let (applied, extracted) = self
            .apply_actions(snap, source, message, classification.as_ref(), plan, dry_run)
            .await;
        entry.actions_applied = applied;

        let mut items: Vec<ActionItem> = classification
            .as_ref()
            .map(|c| c.action_items.clone())
            .unwrap_or_default();
        items.extend(extracted);
        entry.classification = classification;

        if dry_run {
            for action in &entry.actions_applied {
                info!(
                    message_id = %message.id,
                    subject = %message.subject,
                    rule = %action.rule_id,
                    "[dry run] would {}",
                    action.action.describe()
                );
            }
            return Ok(IngestReport {
                action_items: items.len(),
                entry,
            });
        }

        if !items.is_empty()
            && let Err(e) = self.store.insert_action_items(&items).await
        {
            error!(message_id = %message.id, error = %e, "Failed to store action items");
            entry.status = AuditStatus::Failed;
            entry.error = Some(format!("action items: {e}"));
            items.clear();
        }

        let action_items = items.len();
        let entry = self.record(entry).await?;
        if entry.status == AuditStatus::Processed
            && let Err(e) = source.mark_processed(message).await
        {
            warn!(message_id = %message.id, error = %e, "Could not mark message processed at the source");
        }
        Ok(IngestReport {
            entry,
            action_items,
        })
    }

    async fn skip_duplicate(&self, message: &Message, dry_run: bool) -> Result<IngestReport, Error> {
        let mut entry = AuditEntry::for_message(message, AuditStatus::SkippedDuplicate);
        if !dry_run {
            entry = self.record(entry).await?;
        }
        Ok(IngestReport {
            entry,
            action_items: 0,
        })
    }

    /// Record an entry. A `processed` row written by another process for the
    /// same message turns this one into a skipped duplicate; the actions
    /// already applied stay on the returned entry.
    async fn record(&self, entry: AuditEntry) -> Result<AuditEntry, Error> {
        match self.store.record(&entry).await {
            Ok(()) => Ok(entry),
            Err(AuditError::Duplicate { message_id }) => {
                error!(
                    message_id = %message_id,
                    actions = entry.actions_applied.len(),
                    "Duplicate processed record rejected by audit store"
                );
                let mut skipped = entry;
                skipped.status = AuditStatus::SkippedDuplicate;
                self.store
                    .record(&skipped)
                    .await
                    .map_err(|e| match e {
                        AuditError::Database(db) => Error::Database(db),
                        other => Error::Audit(other),
                    })?;
                Ok(skipped)
            }
            Err(AuditError::Database(e)) => Err(e.into()),
        }
    }

    /// Apply a resolved plan. Placement actions run last so tags and
    /// forwards still see the message where it was fetched.
    async fn apply_actions(
        &self,
        snap: &Snapshot,
        source: &Arc<dyn MailSource>,
        message: &Message,
        classification: Option<&ClassificationResult>,
        plan: Vec<PlannedAction>,
        dry_run: bool,
    ) -> (Vec<AppliedAction>, Vec<ActionItem>) {
        let (placements, others): (Vec<_>, Vec<_>) =
            plan.into_iter().partition(|p| p.action.is_placement());

        let mut applied = Vec::new();
        let mut extracted = Vec::new();
        let mut extraction_done = false;

        for planned in others.into_iter().chain(placements) {
            let outcome = if dry_run {
                ActionOutcome::Planned
            } else {
                match &planned.action {
                    Action::ExtractActionItem => {
                        if extraction_done
                            || classification.is_some_and(|c| !c.action_items.is_empty())
                        {
                            ActionOutcome::Applied
                        } else {
                            extraction_done = true;
                            self.extract(snap, message, &mut extracted).await
                        }
                    }
                    Action::Notify { message: text } => {
                        let notification = Notification {
                            rule_id: planned.rule_id.clone(),
                            message_id: message.id.clone(),
                            account: message.account.clone(),
                            sender: message.sender.clone(),
                            subject: message.subject.clone(),
                            text: text.clone(),
                        };
                        match self.notify_tx.try_send(notification) {
                            Ok(()) => ActionOutcome::Applied,
                            Err(e) => ActionOutcome::Failed {
                                reason: format!("notification dropped: {e}"),
                            },
                        }
                    }
                    action => match source.apply(message, action).await {
                        Ok(()) => {
                            info!(
                                message_id = %message.id,
                                rule = %planned.rule_id,
                                action = action.label(),
                                "Applied {}",
                                action.describe()
                            );
                            ActionOutcome::Applied
                        }
                        Err(e) => {
                            warn!(message_id = %message.id, rule = %planned.rule_id, error = %e, "Action failed");
                            ActionOutcome::Failed {
                                reason: e.to_string(),
                            }
                        }
                    },
                }
            };
            applied.push(AppliedAction {
                rule_id: planned.rule_id,
                action: planned.action,
                outcome,
            });
        }
        (applied, extracted)
    }

    async fn extract(
        &self,
        snap: &Snapshot,
        message: &Message,
        out: &mut Vec<ActionItem>,
    ) -> ActionOutcome {
        let Some(classifier) = &snap.classifier else {
            return ActionOutcome::Failed {
                reason: "no LLM provider configured".into(),
            };
        };
        let _permit = self.permits.acquire().await.ok();
        match classifier.extract_action_items(message).await {
            Ok(items) => {
                out.extend(items);
                ActionOutcome::Applied
            }
            Err(e) => ActionOutcome::Failed {
                reason: e.to_string(),
            },
        }
    }

    // ── Digests and cleanup ─────────────────────────────────────────

    /// Generate and deliver a digest for the default window. Too few
    /// messages is not an error.
    async fn scheduled_digest(&self, snap: &Snapshot) -> Result<Option<Digest>, Error> {
        let (start, end) = snap.digest.window(None);
        match snap.digest.run(start, end, false).await {
            Ok(digest) => {
                self.state.lock().await.last_digest = Some(digest.created_at);
                Ok(Some(digest))
            }
            Err(DigestError::InsufficientData { found, required }) => {
                info!(found, required, "Skipping digest: not enough emails");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn digest_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut reloaded = self.reloaded.subscribe();

        while !*shutdown.borrow() {
            let snap = self.snapshot().await;
            let wait = if snap.settings.service.digest.enabled {
                snap.digest_schedule.until_next(Local::now())
            } else {
                None
            };

            match wait {
                Some(wait) => {
                    debug!(wait_secs = wait.as_secs(), "Next digest scheduled");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = reloaded.changed() => continue,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = reloaded.changed() => continue,
                    }
                }
            }

            let snap = self.snapshot().await;
            if let Err(e) = self.scheduled_digest(&snap).await {
                error!(error = %e, "Digest job failed");
            }
        }
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let schedule = match DailySchedule::new(&[TimeOfDay::CLEANUP]) {
            Ok(s) => s,
            Err(e) => {
                error!("Cleanup schedule invalid: {e}");
                return;
            }
        };

        while !*shutdown.borrow() {
            let Some(wait) = schedule.until_next(Local::now()) else {
                return;
            };
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let days = self.snapshot().await.settings.service.retention_days();
            let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
            match self.store.prune(cutoff).await {
                Ok(removed) => info!(removed, retention_days = days, "Audit log pruned"),
                Err(e) => error!(error = %e, "Cleanup failed"),
            }
        }
    }
}

/// Double the previous delay, starting at 30s, never past `cap`.
fn next_backoff(previous: Option<Duration>, cap: Duration) -> Duration {
    let next = previous.map_or(BACKOFF_START, |b| b.saturating_mul(2));
    next.min(cap)
}

/// Up to 10% extra so accounts sharing a server don't retry in lockstep.
fn with_jitter(delay: Duration) -> Duration {
    let spread = (delay.as_millis() / 10) as u64;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}
