//! Digest generation.
//!
//! A digest covers processed audit entries in `[start, end)`. Entries that
//! finish writing while a digest is being generated may land on either
//! side of the window boundary; the next window picks them up if missed.

pub mod delivery;
pub mod format;

pub use delivery::{DigestSink, FileSink, build_sinks};
pub use format::{DigestData, Section};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DigestSettings;
use crate::error::DigestError;
use crate::model::{
    ActionItemStatus, AuditEntry, DeliveryResult, Digest, DigestFormat, DigestStatus, Relevance,
};
use crate::pipeline::Classifier;
use crate::store::{ActionItemFilter, AuditFilter, AuditStore};
use format::{AccountGroup, DigestLine, DigestSection};

/// Pending direct action items listed per digest.
const MAX_ACTION_ITEMS: usize = 20;

/// A freshly generated digest with the data it was rendered from.
#[derive(Debug, Clone)]
pub struct GeneratedDigest {
    pub digest: Digest,
    pub data: DigestData,
}

pub struct DigestGenerator {
    store: Arc<dyn AuditStore>,
    classifier: Option<Arc<Classifier>>,
    settings: DigestSettings,
    sinks: Vec<Arc<dyn DigestSink>>,
}

impl DigestGenerator {
    pub fn new(
        store: Arc<dyn AuditStore>,
        classifier: Option<Arc<Classifier>>,
        settings: DigestSettings,
        sinks: Vec<Arc<dyn DigestSink>>,
    ) -> Self {
        Self {
            store,
            classifier,
            settings,
            sinks,
        }
    }

    /// Window ending now, `period_hours` long (or the configured default).
    pub fn window(&self, period_hours: Option<u32>) -> (DateTime<Utc>, DateTime<Utc>) {
        let hours = period_hours.unwrap_or(self.settings.period_hours);
        let end = Utc::now();
        (end - chrono::Duration::hours(i64::from(hours)), end)
    }

    /// Build and store a digest for `[start, end)`.
    ///
    /// Fails with `InsufficientData` below `min_emails` unless `force` is
    /// set. An empty window is always insufficient.
    pub async fn generate(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        force: bool,
    ) -> Result<GeneratedDigest, DigestError> {
        let all = self.store.query_all(AuditFilter::window(start, end)).await?;
        let total_found = all.len();
        let entries: Vec<AuditEntry> = all
            .into_iter()
            .filter(|e| !self.settings.exclude_categories.contains(&e.category()))
            .collect();
        if entries.len() < total_found {
            info!(
                filtered = total_found - entries.len(),
                "Excluded categories filtered from digest"
            );
        }

        let required = self.settings.min_emails.max(1);
        if entries.is_empty() || (entries.len() < required && !force) {
            return Err(DigestError::InsufficientData {
                found: entries.len(),
                required,
            });
        }

        let summary = match &self.classifier {
            Some(classifier) => classifier.summarize_digest(&entries).await,
            None => format!("Digest contains {} emails.", entries.len()),
        };

        let action_items = if self.settings.include_action_items {
            let filter = ActionItemFilter {
                status: Some(ActionItemStatus::Pending),
                relevance: Some(Relevance::Direct),
                message_ids: Some(entries.iter().map(|e| e.message_id.clone()).collect()),
                limit: Some(MAX_ACTION_ITEMS),
            };
            Some(self.store.list_action_items(&filter).await?)
        } else {
            None
        };

        let data = aggregate(&entries, summary, action_items, Local::now());
        let digest = Digest {
            id: Uuid::new_v4(),
            period_start: start,
            period_end: end,
            included_message_ids: entries.iter().map(|e| e.message_id.clone()).collect(),
            summary_text: data.summary.clone(),
            content: format::render_markdown(&data),
            format: DigestFormat::Markdown,
            delivery_results: Vec::new(),
            status: DigestStatus::Pending,
            created_at: Utc::now(),
        };
        self.store.insert_digest(&digest).await?;
        info!(digest_id = %digest.id, emails = entries.len(), "Digest generated");
        Ok(GeneratedDigest { digest, data })
    }

    /// Hand the digest to every sink. Delivered if any sink succeeded.
    pub async fn deliver(&self, generated: &mut GeneratedDigest) -> Result<(), DigestError> {
        let mut results = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            let result = match sink.deliver(&generated.digest, &generated.data).await {
                Ok(location) => DeliveryResult {
                    sink: sink.name(),
                    ok: true,
                    detail: location,
                },
                Err(e) => {
                    warn!(digest_id = %generated.digest.id, sink = %sink.name(), error = %e, "Digest delivery failed");
                    DeliveryResult {
                        sink: sink.name(),
                        ok: false,
                        detail: e.to_string(),
                    }
                }
            };
            results.push(result);
        }

        let status = if results.iter().any(|r| r.ok) {
            DigestStatus::Delivered
        } else {
            DigestStatus::Failed
        };
        self.store
            .update_digest_delivery(generated.digest.id, status, &results)
            .await?;
        generated.digest.status = status;
        generated.digest.delivery_results = results;
        Ok(())
    }

    /// Generate then deliver.
    pub async fn run(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        force: bool,
    ) -> Result<Digest, DigestError> {
        let mut generated = self.generate(start, end, force).await?;
        self.deliver(&mut generated).await?;
        Ok(generated.digest)
    }
}

/// Group entries into display sections, then by account.
pub fn aggregate(
    entries: &[AuditEntry],
    summary: String,
    action_items: Option<Vec<crate::model::ActionItem>>,
    generated_at: DateTime<Local>,
) -> DigestData {
    let mut grouped: BTreeMap<Section, BTreeMap<String, Vec<DigestLine>>> = BTreeMap::new();
    for entry in entries {
        grouped
            .entry(Section::for_category(entry.category()))
            .or_default()
            .entry(entry.account.clone())
            .or_default()
            .push(DigestLine {
                message_id: entry.message_id.clone(),
                account: entry.account.clone(),
                subject: entry.subject.clone(),
                sender: entry.sender.clone(),
                priority: entry.priority(),
            });
    }

    let accounts: BTreeSet<&str> = entries.iter().map(|e| e.account.as_str()).collect();
    let sections = Section::ALL
        .iter()
        .filter_map(|section| {
            let by_account = grouped.remove(section)?;
            Some(DigestSection {
                section: *section,
                groups: by_account
                    .into_iter()
                    .map(|(account, lines)| AccountGroup { account, lines })
                    .collect(),
            })
        })
        .collect();

    DigestData {
        generated_at,
        summary,
        total: entries.len(),
        sections,
        action_items,
        multi_account: accounts.len() > 1,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap as Map;

    use super::*;
    use crate::model::{
        ActionItem, AuditStatus, Category, ClassificationResult, Message, MessageBody, Priority,
        StepStatus,
    };
    use crate::store::LibSqlBackend;

    fn message(id: &str, account: &str) -> Message {
        Message {
            id: id.into(),
            account: account.into(),
            folder: "INBOX".into(),
            source_ref: id.into(),
            message_id_header: None,
            sender: format!("{id}@example.com"),
            recipients: vec![],
            cc: vec![],
            subject: format!("Subject {id}"),
            timestamp: Utc::now(),
            body: MessageBody::default(),
            headers: Map::new(),
            attachments: vec![],
        }
    }

    fn processed(id: &str, account: &str, category: Option<Category>) -> AuditEntry {
        let mut entry = AuditEntry::for_message(&message(id, account), AuditStatus::Processed);
        if let Some(category) = category {
            entry.classification = Some(ClassificationResult {
                message_id: id.into(),
                category,
                priority: Priority::Normal,
                action_items: vec![],
                confidence: 1.0,
                provider: "test".into(),
                model: "test".into(),
                raw_response: String::new(),
            });
            entry.classification_status = StepStatus::Ok;
        }
        entry
    }

    async fn generator(settings: DigestSettings, dir: &std::path::Path) -> (Arc<LibSqlBackend>, DigestGenerator) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let sinks: Vec<Arc<dyn DigestSink>> =
            vec![Arc::new(FileSink::new(dir, DigestFormat::Markdown))];
        let generator = DigestGenerator::new(store.clone(), None, settings, sinks);
        (store, generator)
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let end = Utc::now() + chrono::Duration::minutes(1);
        (end - chrono::Duration::hours(12), end)
    }

    #[tokio::test]
    async fn empty_window_is_insufficient() {
        let dir = tempfile::tempdir().unwrap();
        let (_, generator) = generator(DigestSettings::default(), dir.path()).await;
        let (start, end) = window();
        let err = generator.generate(start, end, false).await.unwrap_err();
        assert!(matches!(
            err,
            DigestError::InsufficientData { found: 0, required: 1 }
        ));
        assert!(matches!(
            generator.generate(start, end, true).await,
            Err(DigestError::InsufficientData { .. })
        ));
    }

    #[tokio::test]
    async fn excluded_categories_do_not_count() {
        let dir = tempfile::tempdir().unwrap();
        let settings = DigestSettings {
            min_emails: 2,
            ..Default::default()
        };
        let (store, generator) = generator(settings, dir.path()).await;
        store.record(&processed("a", "work", Some(Category::WorkClients))).await.unwrap();
        store.record(&processed("b", "work", Some(Category::Spam))).await.unwrap();
        let (start, end) = window();

        let err = generator.generate(start, end, false).await.unwrap_err();
        assert!(matches!(err, DigestError::InsufficientData { found: 1, required: 2 }));

        let forced = generator.generate(start, end, true).await.unwrap();
        assert_eq!(forced.digest.included_message_ids.len(), 1);
        assert!(forced.digest.included_message_ids.contains("a"));
    }

    #[tokio::test]
    async fn unclassified_entries_land_in_other() {
        let dir = tempfile::tempdir().unwrap();
        let (store, generator) = generator(DigestSettings::default(), dir.path()).await;
        store.record(&processed("a", "work", Some(Category::Personal))).await.unwrap();
        store.record(&processed("b", "work", None)).await.unwrap();
        let mut failed = processed("c", "work", None);
        failed.status = AuditStatus::Failed;
        store.record(&failed).await.unwrap();
        let (start, end) = window();

        let generated = generator.generate(start, end, false).await.unwrap();
        assert_eq!(generated.data.total, 2);
        assert!(generated.digest.content.contains("## Personal (1)"));
        assert!(generated.digest.content.contains("## Other (1)"));
        assert!(!generated.digest.included_message_ids.contains("c"));
        assert_eq!(generated.digest.summary_text, "Digest contains 2 emails.");
    }

    #[tokio::test]
    async fn action_items_come_from_included_messages() {
        let dir = tempfile::tempdir().unwrap();
        let (store, generator) = generator(DigestSettings::default(), dir.path()).await;
        store.record(&processed("a", "work", Some(Category::WorkClients))).await.unwrap();
        let mine = ActionItem::new("a", "Reply to client");
        let other = ActionItem::new("zzz", "Unrelated");
        let mut info = ActionItem::new("a", "FYI only");
        info.relevance = Relevance::Informational;
        store.insert_action_items(&[mine, other, info]).await.unwrap();
        let (start, end) = window();

        let generated = generator.generate(start, end, false).await.unwrap();
        let items = generated.data.action_items.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Reply to client");
    }

    #[tokio::test]
    async fn delivery_records_per_sink_results() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let sinks: Vec<Arc<dyn DigestSink>> = vec![
            Arc::new(FileSink::new(dir.path().join("ok"), DigestFormat::Markdown)),
            Arc::new(FileSink::new(blocker.join("sub"), DigestFormat::Text)),
        ];
        let generator = DigestGenerator::new(store.clone(), None, DigestSettings::default(), sinks);
        store.record(&processed("a", "work", None)).await.unwrap();
        let (start, end) = window();

        let digest = generator.run(start, end, false).await.unwrap();
        assert_eq!(digest.status, DigestStatus::Delivered);
        assert_eq!(digest.delivery_results.len(), 2);
        assert!(digest.delivery_results[0].ok);
        assert!(!digest.delivery_results[1].ok);

        let stored = store.list_digests(10).await.unwrap();
        assert_eq!(stored[0].status, DigestStatus::Delivered);
        assert_eq!(stored[0].delivery_results.len(), 2);
    }

    #[test]
    fn aggregate_groups_by_section_then_account() {
        let entries = vec![
            processed("a", "work", Some(Category::WorkAdmin)),
            processed("b", "home", Some(Category::Personal)),
            processed("c", "home", Some(Category::WorkAdmin)),
        ];
        let data = aggregate(&entries, "s".into(), None, Local::now());
        assert!(data.multi_account);
        assert_eq!(data.sections.len(), 2);
        assert_eq!(data.sections[0].section, Section::Personal);
        assert_eq!(data.sections[1].section, Section::WorkAdmin);
        let accounts: Vec<_> = data.sections[1].groups.iter().map(|g| g.account.as_str()).collect();
        assert_eq!(accounts, vec!["home", "work"]);
    }
}
