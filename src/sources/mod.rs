//! Mail sources.
//!
//! A `MailSource` yields `Message` snapshots for one account and applies
//! rule-driven mutations back to it. The concrete variant per account is
//! chosen from configuration at startup and held behind
//! `Arc<dyn MailSource>` for the life of the service.

pub mod imap;
pub mod maildir;
pub mod notmuch;
pub mod smtp;

pub use imap::ImapSource;
pub use maildir::MaildirSource;
pub use notmuch::NotmuchSource;
pub use smtp::{Forwarders, SmtpForwarder};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};

use crate::config::{Settings, SourceKind};
use crate::error::SourceError;
use crate::model::{Action, Message, MessageBody, fingerprint};

#[async_trait]
pub trait MailSource: Send + Sync {
    /// Configured account name.
    fn account(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Folders polled for new mail.
    fn folders(&self) -> &[String];

    /// Messages in `folder` newer than the `since` watermark, oldest first,
    /// at most `limit`. Each message's `source_ref` is the watermark to
    /// store once it has been recorded.
    async fn list_new(
        &self,
        folder: &str,
        since: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>, SourceError>;

    /// Fetch one message by its source-native locator.
    async fn fetch(&self, folder: &str, source_ref: &str) -> Result<Message, SourceError>;

    /// Apply a rule action to a message from this source.
    async fn apply(&self, message: &Message, action: &Action) -> Result<(), SourceError>;

    /// Record on the source side that a message has been processed. Only
    /// sources with a native marker (notmuch tags) do anything here.
    async fn mark_processed(&self, _message: &Message) -> Result<(), SourceError> {
        Ok(())
    }

    /// Connectivity and credential check.
    async fn check(&self) -> Result<(), SourceError>;
}

/// Build one source per configured IMAP, Maildir and notmuch account.
pub fn create_sources(settings: &Settings) -> Result<Vec<Arc<dyn MailSource>>, SourceError> {
    let forwarders = Arc::new(Forwarders::from_settings(settings));
    let mut sources: Vec<Arc<dyn MailSource>> = Vec::new();

    for (name, account) in &settings.imap_accounts {
        sources.push(Arc::new(ImapSource::new(
            name,
            account,
            &settings.guardrails,
            Arc::clone(&forwarders),
        )?));
    }
    for (name, account) in &settings.maildir_accounts {
        sources.push(Arc::new(MaildirSource::new(
            name,
            account,
            &settings.guardrails,
            Arc::clone(&forwarders),
        )));
    }
    for (name, account) in &settings.notmuch_accounts {
        sources.push(Arc::new(NotmuchSource::new(
            name,
            account,
            &settings.guardrails,
            Arc::clone(&forwarders),
        )));
    }

    tracing::info!(count = sources.len(), "Mail sources configured");
    Ok(sources)
}

/// Compare two watermarks. IMAP UIDs compare numerically, Maildir unique
/// names lexically.
pub fn is_after(source_ref: &str, since: &str) -> bool {
    match (source_ref.parse::<u64>(), since.parse::<u64>()) {
        (Ok(a), Ok(b)) => a > b,
        _ => source_ref > since,
    }
}

/// Parse a raw RFC 5322 message into a `Message` snapshot.
pub fn parse_message(
    account: &str,
    folder: &str,
    source_ref: &str,
    raw: &[u8],
) -> Result<Message, SourceError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| SourceError::Parse {
            account: account.to_string(),
            reason: format!("unparseable message {folder}/{source_ref}"),
        })?;

    let mut headers = BTreeMap::new();
    for header in parsed.headers() {
        let start = header.offset_start as usize;
        let end = header.offset_end as usize;
        let value = raw
            .get(start..end)
            .map(|v| unfold(&String::from_utf8_lossy(v)))
            .unwrap_or_default();
        headers
            .entry(header.name().to_ascii_lowercase())
            .or_insert(value);
    }

    let message_id_header = parsed.message_id().map(str::to_string);
    let timestamp = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    let attachments = parsed
        .attachments()
        .map(|part| part.attachment_name().unwrap_or("unnamed").to_string())
        .collect();

    Ok(Message {
        id: fingerprint(account, folder, message_id_header.as_deref(), source_ref),
        account: account.to_string(),
        folder: folder.to_string(),
        source_ref: source_ref.to_string(),
        message_id_header,
        sender: extract_sender(&parsed),
        recipients: extract_addresses(parsed.to()),
        cc: extract_addresses(parsed.cc()),
        subject: parsed.subject().unwrap_or_default().to_string(),
        timestamp,
        body: MessageBody {
            text: parsed.body_text(0).map(|t| t.into_owned()),
            html: parsed.body_html(0).map(|h| h.into_owned()),
        },
        headers,
        attachments,
    })
}

/// Join folded header lines.
fn unfold(value: &str) -> String {
    value
        .split("\r\n")
        .flat_map(|l| l.split('\n'))
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn extract_sender(parsed: &mail_parser::Message<'_>) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

fn extract_addresses(addr: Option<&mail_parser::Address<'_>>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn raw_email(message_id: &str, from: &str, subject: &str, body: &str) -> String {
        format!(
            "Message-ID: <{message_id}>\r\n\
             From: Sender <{from}>\r\n\
             To: me@example.com, other@example.com\r\n\
             Cc: boss@example.com\r\n\
             Subject: {subject}\r\n\
             Date: Mon, 19 Oct 2026 09:30:00 +0000\r\n\
             X-Mailer: test\r\n\
             \tfolded\r\n\
             \r\n\
             {body}\r\n"
        )
    }

    #[test]
    fn parses_headers_and_addresses() {
        let raw = raw_email("abc@example.com", "client@acme.com", "Invoice due", "Please pay.");
        let msg = parse_message("work", "INBOX", "7", raw.as_bytes()).unwrap();
        assert_eq!(msg.sender, "client@acme.com");
        assert_eq!(msg.recipients, vec!["me@example.com", "other@example.com"]);
        assert_eq!(msg.cc, vec!["boss@example.com"]);
        assert_eq!(msg.subject, "Invoice due");
        assert_eq!(msg.message_id_header.as_deref(), Some("abc@example.com"));
        assert_eq!(msg.header("x-mailer"), Some("test folded"));
        assert_eq!(msg.timestamp.to_rfc3339(), "2026-10-19T09:30:00+00:00");
        assert!(msg.body.to_text().contains("Please pay."));
        assert_eq!(
            msg.id,
            fingerprint("work", "Archive", Some("abc@example.com"), "99")
        );
    }

    #[test]
    fn missing_message_id_uses_coordinates() {
        let raw = "From: a@b.com\r\nSubject: hi\r\n\r\nbody\r\n";
        let msg = parse_message("home", "INBOX", "42", raw.as_bytes()).unwrap();
        assert_eq!(msg.message_id_header, None);
        assert_eq!(msg.id, fingerprint("home", "INBOX", None, "42"));
    }

    #[test]
    fn watermark_ordering() {
        assert!(is_after("10", "9"));
        assert!(!is_after("9", "10"));
        assert!(is_after("1700000001.M2.host", "1700000000.M9.host"));
    }
}
