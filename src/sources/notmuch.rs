//! Local notmuch index source.
//!
//! Drives the `notmuch` CLI. An account is one search query, exposed as a
//! single logical folder named by that query. Tags are native here: the
//! `tag` action is `notmuch tag +<tag>`, a move tags the target folder name
//! and drops `inbox`, and a delete tags the trash folder (or `deleted` when
//! soft delete is off; notmuch never removes files itself). Message files
//! are read from disk and parsed like any other raw message.
//!
//! The watermark is `<unix timestamp, 10 digits>.<message id>`, which sorts
//! lexically in delivery order. Messages carrying the processed tag are
//! excluded from every listing.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{Forwarders, MailSource, is_after, parse_message};
use crate::config::{Guardrails, NotmuchAccount, SourceKind};
use crate::error::SourceError;
use crate::model::{Action, Message};

pub struct NotmuchSource {
    name: String,
    binary: PathBuf,
    config: Option<PathBuf>,
    query: String,
    processed_tag: String,
    folders: Vec<String>,
    soft_delete: bool,
    trash_folder: String,
    forwarders: Arc<Forwarders>,
}

/// One message object from `notmuch show --format=json`.
#[derive(Debug, Clone, Deserialize)]
struct Indexed {
    id: String,
    #[serde(default)]
    timestamp: i64,
    filename: Filenames,
    #[serde(default = "matched", rename = "match")]
    is_match: bool,
}

fn matched() -> bool {
    true
}

/// Older notmuch prints one filename, newer ones a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Filenames {
    One(String),
    Many(Vec<String>),
}

impl Filenames {
    fn first(&self) -> Option<&str> {
        match self {
            Self::One(f) => Some(f.as_str()),
            Self::Many(files) => files.first().map(String::as_str),
        }
    }
}

impl Indexed {
    fn source_ref(&self) -> String {
        format!("{:010}.{}", self.timestamp.max(0), self.id)
    }
}

impl NotmuchSource {
    pub fn new(
        name: &str,
        account: &NotmuchAccount,
        guardrails: &Guardrails,
        forwarders: Arc<Forwarders>,
    ) -> Self {
        Self {
            name: name.to_string(),
            binary: account.binary.clone(),
            config: account.config.clone(),
            query: account.query.clone(),
            processed_tag: account.processed_tag.clone(),
            folders: vec![account.query.clone()],
            soft_delete: guardrails.soft_delete,
            trash_folder: guardrails.trash_folder.clone(),
            forwarders,
        }
    }

    fn unavailable(&self, reason: impl Into<String>) -> SourceError {
        SourceError::Unavailable {
            account: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Run one notmuch subcommand and return its stdout.
    async fn run(&self, args: &[&str]) -> Result<String, SourceError> {
        let mut cmd = Command::new(&self.binary);
        if let Some(ref config) = self.config {
            cmd.arg(format!("--config={}", config.display()));
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd.output().await.map_err(|e| {
            self.unavailable(format!("cannot run {}: {e}", self.binary.display()))
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.unavailable(format!(
                "notmuch {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Matching messages for `query`, without bodies.
    async fn show(&self, query: &str) -> Result<Vec<Indexed>, SourceError> {
        let stdout = self
            .run(&[
                "show",
                "--format=json",
                "--entire-thread=false",
                "--body=false",
                query,
            ])
            .await?;
        parse_show(&stdout).map_err(|reason| SourceError::Parse {
            account: self.name.clone(),
            reason,
        })
    }

    async fn load(&self, folder: &str, indexed: &Indexed) -> Result<Message, SourceError> {
        let source_ref = indexed.source_ref();
        let path = indexed.filename.first().ok_or_else(|| SourceError::NotFound {
            account: self.name.clone(),
            folder: folder.to_string(),
            source_ref: source_ref.clone(),
        })?;
        let raw = tokio::fs::read(path).await?;
        parse_message(&self.name, folder, &source_ref, &raw)
    }

    async fn tag(&self, message: &Message, changes: &[String]) -> Result<(), SourceError> {
        let id = message_id_of(&message.source_ref).ok_or_else(|| SourceError::NotFound {
            account: self.name.clone(),
            folder: message.folder.clone(),
            source_ref: message.source_ref.clone(),
        })?;
        let target = id_query(id);
        let mut args: Vec<&str> = vec!["tag"];
        args.extend(changes.iter().map(String::as_str));
        args.extend(["--", target.as_str()]);
        self.run(&args).await?;
        debug!(account = %self.name, message_id = id, ?changes, "Tags updated");
        Ok(())
    }
}

#[async_trait]
impl MailSource for NotmuchSource {
    fn account(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Index
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
        let query = listing_query(&self.query, &self.processed_tag, since);
        let mut found: Vec<Indexed> = self
            .show(&query)
            .await?
            .into_iter()
            .filter(|m| since.is_none_or(|s| is_after(&m.source_ref(), s)))
            .collect();
        found.sort_by_key(Indexed::source_ref);
        found.truncate(limit);

        let mut messages = Vec::with_capacity(found.len());
        for indexed in &found {
            match self.load(folder, indexed).await {
                Ok(message) => messages.push(message),
                // The file moved since the last `notmuch new`; the next
                // index refresh brings it back under its new path.
                Err(SourceError::Io(e)) => {
                    warn!(account = %self.name, message_id = %indexed.id, error = %e, "Indexed file unreadable");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(messages)
    }

    async fn fetch(&self, folder: &str, source_ref: &str) -> Result<Message, SourceError> {
        let not_found = || SourceError::NotFound {
            account: self.name.clone(),
            folder: folder.to_string(),
            source_ref: source_ref.to_string(),
        };
        let id = message_id_of(source_ref).ok_or_else(not_found)?;
        let indexed = self.show(&id_query(id)).await?.into_iter().next().ok_or_else(not_found)?;
        self.load(folder, &indexed).await
    }

    async fn apply(&self, message: &Message, action: &Action) -> Result<(), SourceError> {
        match action {
            Action::Tag { tag } => self.tag(message, &[format!("+{tag}")]).await,
            Action::Move { folder } => {
                self.tag(message, &[format!("+{}", folder.to_lowercase()), "-inbox".into()])
                    .await?;
                info!(account = %self.name, to = %folder, "Message retagged for move");
                Ok(())
            }
            Action::Delete => {
                let mark = if self.soft_delete {
                    self.trash_folder.to_lowercase()
                } else {
                    "deleted".to_string()
                };
                self.tag(message, &[format!("+{mark}"), "-inbox".into()]).await?;
                info!(account = %self.name, tag = %mark, "Message tagged for deletion");
                Ok(())
            }
            Action::Forward { to, smtp_account } => {
                self.forwarders
                    .forward(&self.name, message, to, smtp_account.as_deref())
                    .await
            }
            Action::ExtractActionItem | Action::Notify { .. } => Ok(()),
        }
    }

    async fn mark_processed(&self, message: &Message) -> Result<(), SourceError> {
        self.tag(message, &[format!("+{}", self.processed_tag)]).await
    }

    async fn check(&self) -> Result<(), SourceError> {
        let out = self.run(&["count", self.query.as_str()]).await?;
        let count: u64 = out
            .trim()
            .parse()
            .map_err(|_| self.unavailable(format!("unexpected count output '{}'", out.trim())))?;
        debug!(account = %self.name, count, "notmuch index reachable");
        Ok(())
    }
}

/// Unprocessed mail of the account, from the watermark's second onward.
fn listing_query(base: &str, processed_tag: &str, since: Option<&str>) -> String {
    let mut query = format!("({base}) AND NOT tag:{processed_tag}");
    if let Some(ts) = since.and_then(|s| s.split_once('.')).and_then(|(ts, _)| ts.parse::<i64>().ok())
    {
        query.push_str(&format!(" AND date:@{ts}.."));
    }
    query
}

/// `id:"…"` term, quotes doubled.
fn id_query(id: &str) -> String {
    format!("id:\"{}\"", id.replace('"', "\"\""))
}

fn message_id_of(source_ref: &str) -> Option<&str> {
    source_ref
        .split_once('.')
        .map(|(_, id)| id)
        .filter(|id| !id.is_empty())
}

/// Flatten the thread/reply nesting of `notmuch show` into matching messages.
fn parse_show(stdout: &str) -> Result<Vec<Indexed>, String> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: serde_json::Value =
        serde_json::from_str(stdout).map_err(|e| format!("notmuch show output: {e}"))?;
    let mut out = Vec::new();
    collect(&value, &mut out)?;
    Ok(out)
}

fn collect(value: &serde_json::Value, out: &mut Vec<Indexed>) -> Result<(), String> {
    match value {
        serde_json::Value::Array(items) => {
            for item in items {
                collect(item, out)?;
            }
        }
        serde_json::Value::Object(map) if map.contains_key("id") => {
            let indexed: Indexed = serde_json::from_value(value.clone())
                .map_err(|e| format!("notmuch message object: {e}"))?;
            if indexed.is_match {
                out.push(indexed);
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOW: &str = r#"[[[
        {"id": "b@example.com", "match": true, "excluded": false,
         "filename": ["/mail/cur/b"], "timestamp": 1760000200, "tags": ["inbox"],
         "headers": {"Subject": "second"}},
        [[{"id": "reply@example.com", "match": false, "filename": ["/mail/cur/r"],
           "timestamp": 1760000300, "tags": []}, []]]
    ]], [[
        {"id": "a@example.com", "match": true, "filename": "/mail/cur/a",
         "timestamp": 1760000100, "tags": ["inbox", "unread"]},
        []
    ]]]"#;

    #[test]
    fn show_output_flattens_to_matching_messages() {
        let mut found = parse_show(SHOW).unwrap();
        found.sort_by_key(Indexed::source_ref);
        let ids: Vec<&str> = found.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a@example.com", "b@example.com"]);
        assert_eq!(found[0].filename.first(), Some("/mail/cur/a"));
        assert_eq!(found[1].filename.first(), Some("/mail/cur/b"));
        assert_eq!(found[0].source_ref(), "1760000100.a@example.com");
    }

    #[test]
    fn empty_show_output_is_no_messages() {
        assert!(parse_show("").unwrap().is_empty());
        assert!(parse_show("[]").unwrap().is_empty());
        assert!(parse_show("{not json").is_err());
    }

    #[test]
    fn listing_query_excludes_processed_and_bounds_by_watermark() {
        assert_eq!(
            listing_query("tag:inbox", "inbox-pilot", None),
            "(tag:inbox) AND NOT tag:inbox-pilot"
        );
        assert_eq!(
            listing_query("tag:inbox", "inbox-pilot", Some("1760000100.a@example.com")),
            "(tag:inbox) AND NOT tag:inbox-pilot AND date:@1760000100.."
        );
    }

    #[test]
    fn source_ref_carries_the_message_id() {
        assert_eq!(message_id_of("1760000100.a.b@example.com"), Some("a.b@example.com"));
        assert_eq!(message_id_of("1760000100."), None);
        assert_eq!(id_query("a\"b@x"), "id:\"a\"\"b@x\"");
        assert!(is_after("1760000200.b@x", "1760000100.z@x"));
    }

    #[cfg(unix)]
    mod cli {
        use std::os::unix::fs::PermissionsExt;

        use super::super::*;
        use crate::sources::tests::raw_email;

        /// A stand-in `notmuch` that logs its arguments and answers `show`
        /// and `count` from fixtures.
        fn fake_notmuch(dir: &std::path::Path) -> (NotmuchSource, PathBuf) {
            let mail = dir.join("cur");
            std::fs::create_dir_all(&mail).unwrap();
            for (name, subject) in [("a", "first"), ("b", "second")] {
                let raw = raw_email(&format!("{name}@example.com"), "x@y.com", subject, "hi");
                std::fs::write(mail.join(name), raw).unwrap();
            }
            let show = format!(
                r#"[[[{{"id": "b@example.com", "match": true, "filename": ["{0}/b"], "timestamp": 1760000200}}, []]],
                    [[{{"id": "a@example.com", "match": true, "filename": ["{0}/a"], "timestamp": 1760000100}}, []]]]"#,
                mail.display()
            );
            std::fs::write(dir.join("show.json"), show).unwrap();

            let log = dir.join("calls.log");
            let script = dir.join("notmuch");
            std::fs::write(
                &script,
                format!(
                    "#!/bin/sh\necho \"$@\" >> {log}\ncase \"$1\" in\n  show) cat {show} ;;\n  count) echo 2 ;;\nesac\n",
                    log = log.display(),
                    show = dir.join("show.json").display()
                ),
            )
            .unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

            let account = NotmuchAccount {
                config: None,
                query: "tag:inbox".into(),
                processed_tag: "inbox-pilot".into(),
                binary: script,
                polling_interval: None,
            };
            let source = NotmuchSource::new(
                "index",
                &account,
                &Guardrails::default(),
                Arc::new(Forwarders::default()),
            );
            (source, log)
        }

        #[tokio::test]
        async fn lists_oldest_first_and_tags_natively() {
            let dir = tempfile::tempdir().unwrap();
            let (source, log) = fake_notmuch(dir.path());
            source.check().await.unwrap();

            let messages = source.list_new("tag:inbox", None, 10).await.unwrap();
            let subjects: Vec<&str> = messages.iter().map(|m| m.subject.as_str()).collect();
            assert_eq!(subjects, vec!["first", "second"]);
            assert_eq!(messages[0].source_ref, "1760000100.a@example.com");

            let newer = source
                .list_new("tag:inbox", Some(&messages[0].source_ref), 10)
                .await
                .unwrap();
            assert_eq!(newer.len(), 1);
            assert_eq!(newer[0].subject, "second");

            source
                .apply(&messages[0], &Action::Tag { tag: "billing".into() })
                .await
                .unwrap();
            source
                .apply(&messages[0], &Action::Move { folder: "Archive".into() })
                .await
                .unwrap();
            source.mark_processed(&messages[0]).await.unwrap();

            let calls = std::fs::read_to_string(log).unwrap();
            assert!(calls.contains("tag +billing -- id:\"a@example.com\""));
            assert!(calls.contains("tag +archive -inbox -- id:\"a@example.com\""));
            assert!(calls.contains("tag +inbox-pilot -- id:\"a@example.com\""));
            assert!(calls.contains("NOT tag:inbox-pilot AND date:@1760000100.."));
        }

        #[tokio::test]
        async fn missing_binary_is_unavailable() {
            let account = NotmuchAccount {
                config: None,
                query: "tag:inbox".into(),
                processed_tag: "inbox-pilot".into(),
                binary: PathBuf::from("/nonexistent/notmuch"),
                polling_interval: None,
            };
            let source = NotmuchSource::new(
                "index",
                &account,
                &Guardrails::default(),
                Arc::new(Forwarders::default()),
            );
            let err = source.check().await.unwrap_err();
            assert!(err.is_retryable());
        }
    }
}
