//! Classification pipeline: task-scoped prompts, single-shot LLM calls,
//! strict parsing.
//!
//! Flow for one message:
//! 1. Build a task-scoped view of the message (`prepare_body`)
//! 2. Check the context budget
//! 3. Call the provider, retrying transient failures
//! 4. Parse the JSON reply; anything off-schema is `Malformed`

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{ClassificationError, LlmError};
use crate::llm::provider::{ChatMessage, CompletionRequest, CompletionResponse, LlmProvider};
use crate::model::{
    ActionItem, ActionItemStatus, AuditEntry, Category, ClassificationResult, Draft, DraftStatus,
    Message, Priority, Relevance,
};
use crate::pipeline::text::{Task, prepare_body, truncate};

const CLASSIFY_MAX_TOKENS: u32 = 150;
const CLASSIFY_TEMPERATURE: f32 = 0.1;
const EXTRACT_MAX_TOKENS: u32 = 500;
const EXTRACT_TEMPERATURE: f32 = 0.1;
const DRAFT_MAX_TOKENS: u32 = 500;
const DRAFT_TEMPERATURE: f32 = 0.7;
const SUMMARY_MAX_TOKENS: u32 = 300;
const SUMMARY_TEMPERATURE: f32 = 0.5;
/// Entries listed in the digest summary prompt.
const SUMMARY_MAX_ENTRIES: usize = 20;
/// Cap on a single rate-limit wait.
const MAX_RETRY_WAIT: Duration = Duration::from_secs(30);

/// Tunables for the classifier.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Total attempts per call for retryable provider failures.
    pub attempts: u32,
    /// First retry delay; doubles per attempt.
    pub retry_backoff: Duration,
    /// Run action-item extraction after classification.
    pub auto_extract: bool,
    pub confidence_threshold: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            attempts: 2,
            retry_backoff: Duration::from_secs(1),
            auto_extract: true,
            confidence_threshold: 0.5,
        }
    }
}

impl ClassifierConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            attempts: settings.classification_attempts,
            auto_extract: settings.service.action_items.auto_extract,
            confidence_threshold: settings.service.action_items.confidence_threshold,
            ..Default::default()
        }
    }
}

/// LLM-backed classifier. Holds no per-message state.
pub struct Classifier {
    llm: Arc<dyn LlmProvider>,
    config: ClassifierConfig,
}

#[derive(Debug, Deserialize)]
struct RawClassification {
    category: Option<String>,
    priority: Option<String>,
    confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct RawActionItem {
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    urgency: Option<String>,
    #[serde(default)]
    due_date: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    relevance: Option<String>,
}

impl Classifier {
    pub fn new(llm: Arc<dyn LlmProvider>, config: ClassifierConfig) -> Self {
        Self { llm, config }
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.llm
    }

    /// Classify one message. Runs extraction too when `auto_extract` is on;
    /// an extraction failure leaves the classification intact with no items.
    pub async fn classify(&self, message: &Message) -> Result<ClassificationResult, ClassificationError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(CLASSIFY_SYSTEM_PROMPT),
            ChatMessage::user(build_context(message, Task::Classify)),
        ])
        .with_max_tokens(CLASSIFY_MAX_TOKENS)
        .with_temperature(CLASSIFY_TEMPERATURE);

        let response = self.call(request).await?;
        let (category, priority, confidence) = parse_classification(&response.content)?;

        let action_items = if self.config.auto_extract {
            match self.extract_action_items(message).await {
                Ok(items) => items,
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "Action item extraction failed");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        info!(
            message_id = %message.id,
            category = category.as_str(),
            priority = priority.as_str(),
            action_items = action_items.len(),
            "Message classified"
        );

        Ok(ClassificationResult {
            message_id: message.id.clone(),
            category,
            priority,
            action_items,
            confidence,
            provider: self.llm.name().to_string(),
            model: self.llm.model_name().to_string(),
            raw_response: response.content,
        })
    }

    /// Extract action items, dropping those below the confidence threshold.
    pub async fn extract_action_items(&self, message: &Message) -> Result<Vec<ActionItem>, ClassificationError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(EXTRACT_SYSTEM_PROMPT),
            ChatMessage::user(build_context(message, Task::ExtractActions)),
        ])
        .with_max_tokens(EXTRACT_MAX_TOKENS)
        .with_temperature(EXTRACT_TEMPERATURE);

        let response = self.call(request).await?;
        let items = parse_action_items(&response.content, &message.id)?;
        let total = items.len();
        let kept: Vec<ActionItem> = items
            .into_iter()
            .filter(|i| i.confidence >= self.config.confidence_threshold)
            .collect();
        if kept.len() < total {
            debug!(
                message_id = %message.id,
                dropped = total - kept.len(),
                threshold = self.config.confidence_threshold,
                "Dropped low-confidence action items"
            );
        }
        Ok(kept)
    }

    /// Draft a reply for human review. Never sent.
    pub async fn draft_reply(
        &self,
        message: &Message,
        instructions: Option<&str>,
    ) -> Result<Draft, ClassificationError> {
        let mut prompt = format!(
            "Original email:\n{}\n\n",
            build_context(message, Task::DraftReply)
        );
        match instructions.filter(|s| !s.trim().is_empty()) {
            Some(text) => prompt.push_str(&format!("Instructions: {text}\n\n")),
            None => prompt.push_str("Write a professional, helpful reply.\n\n"),
        }
        prompt.push_str("Draft reply (body only, no subject line or headers):");

        let request = CompletionRequest::new(vec![
            ChatMessage::system("You draft email replies for the user to review before sending."),
            ChatMessage::user(prompt),
        ])
        .with_max_tokens(DRAFT_MAX_TOKENS)
        .with_temperature(DRAFT_TEMPERATURE);

        let response = self.call(request).await?;
        let body = response.content.trim().to_string();
        if body.is_empty() {
            return Err(ClassificationError::Malformed {
                reason: "empty draft".into(),
                raw: response.content,
            });
        }

        let subject = if message.subject.to_ascii_lowercase().starts_with("re:") {
            message.subject.clone()
        } else {
            format!("Re: {}", message.subject)
        };
        Ok(Draft {
            id: Uuid::new_v4(),
            message_id: message.id.clone(),
            account: message.account.clone(),
            to: message.sender.clone(),
            subject,
            body,
            status: DraftStatus::Pending,
            created_at: Utc::now(),
        })
    }

    /// Short executive summary of digest entries. Falls back to a count on
    /// any failure.
    pub async fn summarize_digest(&self, entries: &[AuditEntry]) -> String {
        let fallback = format!("Digest contains {} emails.", entries.len());
        if entries.is_empty() {
            return fallback;
        }

        let listing = entries
            .iter()
            .take(SUMMARY_MAX_ENTRIES)
            .enumerate()
            .map(|(i, e)| {
                let marker = if e.priority() >= Priority::High { "(!) " } else { "" };
                let subject = if e.subject.is_empty() { "(no subject)" } else { &e.subject };
                format!(
                    "{}. {marker}[{}] From: {} - {}",
                    i + 1,
                    e.category(),
                    e.sender,
                    subject
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Summarize this email digest in 2-3 sentences.\n\n{listing}\n\nTotal: {} emails\n\n\
             Focus on appointments, meetings, client updates, personal items and work updates. \
             Mention specific senders and any urgent items.\n\nSummary:",
            entries.len()
        );
        let request = CompletionRequest::new(vec![
            ChatMessage::system("You are an email assistant."),
            ChatMessage::user(prompt),
        ])
        .with_max_tokens(SUMMARY_MAX_TOKENS)
        .with_temperature(SUMMARY_TEMPERATURE);

        match self.call(request).await {
            Ok(response) if !response.content.trim().is_empty() => response.content.trim().to_string(),
            Ok(_) => {
                warn!("LLM returned empty digest summary, using fallback");
                fallback
            }
            Err(e) => {
                warn!(error = %e, "Digest summary failed, using fallback");
                fallback
            }
        }
    }

    /// Budget check, then the provider call with bounded retries.
    async fn call(&self, request: CompletionRequest) -> Result<CompletionResponse, ClassificationError> {
        let limit = self.llm.context_length();
        let used = request.estimated_prompt_tokens() + request.max_tokens.unwrap_or(0) as usize;
        if used > limit {
            return Err(ClassificationError::BudgetExceeded { used, limit });
        }

        let attempts = self.config.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.llm.complete(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    let err = ClassificationError::from(e);
                    if attempt >= attempts || !err.is_retryable() {
                        return Err(err);
                    }
                    let wait = match &err {
                        ClassificationError::Provider(LlmError::RateLimited {
                            retry_after: Some(after),
                            ..
                        }) => (*after).min(MAX_RETRY_WAIT),
                        _ => retry_wait(self.config.retry_backoff, attempt),
                    };
                    warn!(
                        attempt,
                        max = attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "LLM call failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

const CLASSIFY_SYSTEM_PROMPT: &str = r#"You classify emails. Respond with JSON only.

Categories (choose ONE, prefer specific categories over "other"):
- personal: health and medical, personal finances, personal appointments, vehicles, personal account security, hobbies, casual communication
- work_clients: direct communication from or about business clients
- work_admin: internal work admin, team updates, HR, IT, support tickets for work tools
- newsletter: subscribed newsletters, digests, regular content
- promotional: marketing, sales, deals, giveaways, job-site postings
- spam: unwanted, suspicious, phishing
- other: only if none of the above fit

Priority: low, normal, high or urgent. Use urgent only for time-critical items.

Return JSON:
{"category": "<personal|work_clients|work_admin|newsletter|promotional|spam|other>", "priority": "<low|normal|high|urgent>", "confidence": <0.0-1.0>}"#;

const EXTRACT_SYSTEM_PROMPT: &str = r#"Extract action items from the email that are relevant to the recipient.

For each action item return a JSON object with:
- title: concise action item title (required)
- description: fuller description if needed
- priority: low, normal, high, or urgent
- urgency: low, normal, high, or urgent (how time-sensitive)
- due_date: ISO date (YYYY-MM-DD) if mentioned or implied, else null
- confidence: 0.0-1.0 how confident this is a real action item
- relevance: "direct" if someone personally asks the recipient to act, "informational" for announcements, newsletter calls to action or FYI

Return a JSON array. Return [] if there are none. Return ONLY valid JSON.

Example:
[{"title": "Reply to client", "priority": "high", "urgency": "high", "due_date": null, "confidence": 0.9, "relevance": "direct"}]"#;

/// Task-scoped view of a message for the prompt.
///
/// Classification sees sender, subject and a short preview; extraction also
/// sees recipients and the date.
pub fn build_context(message: &Message, task: Task) -> String {
    let mut parts = vec![format!("From: {}", message.sender)];
    if matches!(task, Task::ExtractActions | Task::Analyze | Task::Priority) {
        if !message.recipients.is_empty() {
            parts.push(format!("To: {}", message.recipients.join(", ")));
        }
        if !message.cc.is_empty() {
            parts.push(format!("CC: {}", message.cc.join(", ")));
        }
        parts.push(format!("Date: {}", message.timestamp.to_rfc3339()));
    }
    parts.push(format!("Subject: {}", message.subject));
    parts.push(format!("\nBody:\n{}", prepare_body(&message.body.to_text(), task)));
    parts.join("\n")
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    extract_json(text, '{', '}')
}

/// Extract a JSON array from LLM output (handles markdown wrapping).
fn extract_json_array(text: &str) -> String {
    extract_json(text, '[', ']')
}

fn extract_json(text: &str, open: char, close: char) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with(open) {
        return trimmed.to_string();
    }

    // Wrapped in markdown code block
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with(open) {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

/// Exponential wait before retry `attempt + 1`, capped at `MAX_RETRY_WAIT`.
fn retry_wait(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_RETRY_WAIT)
}

fn malformed(reason: impl Into<String>, raw: &str) -> ClassificationError {
    ClassificationError::Malformed {
        reason: reason.into(),
        raw: truncate(raw, 500),
    }
}

/// Strict parse of a classification reply.
fn parse_classification(raw: &str) -> Result<(Category, Priority, f32), ClassificationError> {
    let json = extract_json_object(raw);
    let parsed: RawClassification =
        serde_json::from_str(&json).map_err(|e| malformed(format!("not a JSON object: {e}"), raw))?;

    let category = parsed
        .category
        .ok_or_else(|| malformed("missing category", raw))?
        .parse::<Category>()
        .map_err(|e| malformed(e, raw))?;
    let priority = parsed
        .priority
        .ok_or_else(|| malformed("missing priority", raw))?
        .parse::<Priority>()
        .map_err(|e| malformed(e, raw))?;
    let confidence = parsed.confidence.unwrap_or(1.0);
    if !(0.0..=1.0).contains(&confidence) {
        return Err(malformed(format!("confidence {confidence} out of range"), raw));
    }
    Ok((category, priority, confidence))
}

/// Parse an extraction reply. The array itself must be well formed; odd
/// fields inside an item fall back to defaults.
fn parse_action_items(raw: &str, message_id: &str) -> Result<Vec<ActionItem>, ClassificationError> {
    let json = extract_json_array(raw);
    let parsed: Vec<RawActionItem> =
        serde_json::from_str(&json).map_err(|e| malformed(format!("not a JSON array: {e}"), raw))?;

    Ok(parsed
        .into_iter()
        .filter_map(|item| {
            let title = item.title.filter(|t| !t.trim().is_empty())?;
            let priority = item
                .priority
                .and_then(|p| p.parse::<Priority>().ok())
                .unwrap_or(Priority::Normal);
            let urgency = item.urgency.and_then(|p| p.parse::<Priority>().ok());
            Some(ActionItem {
                id: Uuid::new_v4(),
                source_message_id: message_id.to_string(),
                title: title.trim().to_string(),
                description: item.description.unwrap_or_default(),
                due_hint: item.due_date.filter(|d| !d.trim().is_empty()),
                priority: urgency.map_or(priority, |u| u.max(priority)),
                confidence: item.confidence.unwrap_or(1.0).clamp(0.0, 1.0),
                relevance: item
                    .relevance
                    .and_then(|r| r.parse::<Relevance>().ok())
                    .unwrap_or(Relevance::Direct),
                status: ActionItemStatus::Pending,
                created_at: Utc::now(),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::llm::provider::FinishReason;
    use crate::model::{AuditStatus, MessageBody};

    #[test]
    fn retry_wait_doubles_and_saturates() {
        let base = Duration::from_millis(500);
        assert_eq!(retry_wait(base, 1), Duration::from_millis(500));
        assert_eq!(retry_wait(base, 2), Duration::from_secs(1));
        assert_eq!(retry_wait(base, 40), MAX_RETRY_WAIT);
        assert_eq!(retry_wait(base, u32::MAX), MAX_RETRY_WAIT);
    }

    /// Replays scripted replies; `Err` strings become request failures.
    struct ScriptedLlm {
        replies: Mutex<VecDeque<Result<String, String>>>,
        calls: AtomicUsize,
        context_length: usize,
    }

    impl ScriptedLlm {
        fn new(replies: Vec<Result<&str, &str>>) -> Self {
            Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(String::from).map_err(String::from))
                        .collect(),
                ),
                calls: AtomicUsize::new(0),
                context_length: 24_576,
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn name(&self) -> &str {
            "scripted"
        }

        fn model_name(&self) -> &str {
            "scripted-1"
        }

        fn context_length(&self) -> usize {
            self.context_length
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.replies.lock().unwrap().pop_front();
            match next {
                Some(Ok(content)) => Ok(CompletionResponse {
                    content,
                    input_tokens: 10,
                    output_tokens: 10,
                    finish_reason: FinishReason::Stop,
                }),
                Some(Err(reason)) => Err(LlmError::RequestFailed {
                    provider: "scripted".into(),
                    reason,
                }),
                None => Err(LlmError::RequestFailed {
                    provider: "scripted".into(),
                    reason: "script exhausted".into(),
                }),
            }
        }
    }

    fn config() -> ClassifierConfig {
        ClassifierConfig {
            attempts: 2,
            retry_backoff: Duration::ZERO,
            auto_extract: false,
            confidence_threshold: 0.5,
        }
    }

    fn message() -> Message {
        Message {
            id: "m1".into(),
            account: "work".into(),
            folder: "INBOX".into(),
            source_ref: "1".into(),
            message_id_header: Some("<m1@example.com>".into()),
            sender: "client@example.com".into(),
            recipients: vec!["me@example.com".into()],
            cc: vec!["boss@example.com".into()],
            subject: "Contract review".into(),
            timestamp: Utc::now(),
            body: MessageBody::plain("Please review the contract by Friday.\n> old quote"),
            headers: BTreeMap::new(),
            attachments: vec![],
        }
    }

    #[tokio::test]
    async fn classify_parses_fenced_json() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(
            "```json\n{\"category\": \"work_clients\", \"priority\": \"urgent\", \"confidence\": 0.9}\n```",
        )]));
        let classifier = Classifier::new(llm, config());
        let result = classifier.classify(&message()).await.unwrap();
        assert_eq!(result.category, Category::WorkClients);
        assert_eq!(result.priority, Priority::Urgent);
        assert_eq!(result.provider, "scripted");
        assert_eq!(result.model, "scripted-1");
        assert!(result.raw_response.contains("work_clients"));
    }

    #[tokio::test]
    async fn unknown_category_fails_closed() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(
            r#"{"category": "bananas", "priority": "low"}"#,
        )]));
        let classifier = Classifier::new(llm.clone(), config());
        let err = classifier.classify(&message()).await.unwrap_err();
        assert!(matches!(err, ClassificationError::Malformed { .. }));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1, "malformed output is not retried");
    }

    #[tokio::test]
    async fn non_json_fails_closed() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok("I think this is work.")]));
        let classifier = Classifier::new(llm, config());
        assert!(matches!(
            classifier.classify(&message()).await,
            Err(ClassificationError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn provider_failure_is_retried_then_surfaces() {
        let llm = Arc::new(ScriptedLlm::new(vec![Err("down"), Err("down")]));
        let classifier = Classifier::new(llm.clone(), config());
        let err = classifier.classify(&message()).await.unwrap_err();
        assert!(matches!(err, ClassificationError::Provider(_)));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transient_failure_recovers() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Err("timeout"),
            Ok(r#"{"category": "personal", "priority": "normal"}"#),
        ]));
        let classifier = Classifier::new(llm, config());
        let result = classifier.classify(&message()).await.unwrap();
        assert_eq!(result.category, Category::Personal);
        assert_eq!(result.confidence, 1.0);
    }

    #[tokio::test]
    async fn budget_exceeded_before_calling() {
        let mut llm = ScriptedLlm::new(vec![]);
        llm.context_length = 100;
        let llm = Arc::new(llm);
        let classifier = Classifier::new(llm.clone(), config());
        let err = classifier.classify(&message()).await.unwrap_err();
        assert!(matches!(err, ClassificationError::BudgetExceeded { limit: 100, .. }));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn extraction_filters_by_confidence() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok(r#"{"category": "work_clients", "priority": "high"}"#),
            Ok(r#"Here you go: [{"title": "Review contract", "urgency": "urgent", "due_date": "2026-10-23", "confidence": 0.9, "relevance": "direct"}, {"title": "Maybe lunch", "confidence": 0.2}, {"description": "no title"}]"#),
        ]));
        let classifier = Classifier::new(
            llm,
            ClassifierConfig {
                auto_extract: true,
                ..config()
            },
        );
        let result = classifier.classify(&message()).await.unwrap();
        assert_eq!(result.action_items.len(), 1);
        let item = &result.action_items[0];
        assert_eq!(item.title, "Review contract");
        assert_eq!(item.priority, Priority::Urgent);
        assert_eq!(item.due_hint.as_deref(), Some("2026-10-23"));
        assert_eq!(item.source_message_id, "m1");
    }

    #[tokio::test]
    async fn extraction_failure_keeps_classification() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok(r#"{"category": "work_admin", "priority": "low"}"#),
            Ok("no items here"),
        ]));
        let classifier = Classifier::new(
            llm,
            ClassifierConfig {
                auto_extract: true,
                ..config()
            },
        );
        let result = classifier.classify(&message()).await.unwrap();
        assert_eq!(result.category, Category::WorkAdmin);
        assert!(result.action_items.is_empty());
    }

    #[tokio::test]
    async fn draft_reply_prefixes_subject() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok("  Thanks, will review by Friday.  ")]));
        let classifier = Classifier::new(llm, config());
        let draft = classifier.draft_reply(&message(), None).await.unwrap();
        assert_eq!(draft.subject, "Re: Contract review");
        assert_eq!(draft.to, "client@example.com");
        assert_eq!(draft.body, "Thanks, will review by Friday.");
        assert_eq!(draft.status, DraftStatus::Pending);
    }

    #[tokio::test]
    async fn summary_falls_back_on_failure() {
        let llm = Arc::new(ScriptedLlm::new(vec![Err("down"), Err("down")]));
        let classifier = Classifier::new(llm, config());
        let entries = vec![
            AuditEntry::for_message(&message(), AuditStatus::Processed),
            AuditEntry::for_message(&message(), AuditStatus::Processed),
        ];
        assert_eq!(
            classifier.summarize_digest(&entries).await,
            "Digest contains 2 emails."
        );
    }

    #[test]
    fn context_is_task_scoped() {
        let classify = build_context(&message(), Task::Classify);
        assert!(!classify.contains("CC:"));
        assert!(!classify.contains("old quote"));
        let extract = build_context(&message(), Task::ExtractActions);
        assert!(extract.contains("To: me@example.com"));
        assert!(extract.contains("CC: boss@example.com"));
        assert!(extract.contains("Date: "));
    }

    #[test]
    fn extract_json_variants() {
        assert_eq!(extract_json_object(r#"{"a":1}"#), r#"{"a":1}"#);
        assert_eq!(extract_json_object("```\n{\"a\":1}\n```"), r#"{"a":1}"#);
        assert_eq!(extract_json_object("sure: {\"a\":1} ok"), r#"{"a":1}"#);
        assert_eq!(extract_json_array("items: [1, 2] done"), "[1, 2]");
    }
}
