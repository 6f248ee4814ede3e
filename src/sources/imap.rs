//! IMAP source over raw rustls.
//!
//! Each operation opens a short session on a blocking thread: connect,
//! LOGIN, SELECT, work by UID, LOGOUT. The watermark is the highest UID
//! recorded per folder.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls_pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use super::{Forwarders, MailSource, is_after, parse_message};
use crate::config::{Guardrails, ImapAccount, SourceKind};
use crate::error::SourceError;
use crate::model::{Action, Message};

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection details, cloned into each blocking session.
#[derive(Clone)]
struct Endpoint {
    account: String,
    server: String,
    port: u16,
    username: String,
    password: SecretString,
    use_ssl: bool,
}

pub struct ImapSource {
    endpoint: Endpoint,
    folders: Vec<String>,
    soft_delete: bool,
    trash_folder: String,
    forwarders: Arc<Forwarders>,
}

impl ImapSource {
    pub fn new(
        name: &str,
        account: &ImapAccount,
        guardrails: &Guardrails,
        forwarders: Arc<Forwarders>,
    ) -> Result<Self, SourceError> {
        let password = account
            .password
            .clone()
            .ok_or_else(|| SourceError::Unavailable {
                account: name.to_string(),
                reason: "no password loaded".into(),
            })?;
        Ok(Self {
            endpoint: Endpoint {
                account: name.to_string(),
                server: account.server.clone(),
                port: account.port,
                username: account.username.clone(),
                password,
                use_ssl: account.use_ssl,
            },
            folders: account.folders.clone(),
            soft_delete: guardrails.soft_delete,
            trash_folder: guardrails.trash_folder.clone(),
            forwarders,
        })
    }

    /// Run `work` inside a logged-in session on a blocking thread.
    async fn with_session<T, F>(&self, work: F) -> Result<T, SourceError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Session) -> Result<T, SourceError> + Send + 'static,
    {
        let endpoint = self.endpoint.clone();
        let account = endpoint.account.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = Session::connect(&endpoint)?;
            let result = work(&mut session);
            session.logout();
            result
        })
        .await
        .map_err(|e| SourceError::Unavailable {
            account,
            reason: format!("IMAP task panicked: {e}"),
        })?
    }

    fn uid(&self, message: &Message) -> Result<u64, SourceError> {
        message
            .source_ref
            .parse()
            .map_err(|_| SourceError::Parse {
                account: self.endpoint.account.clone(),
                reason: format!("not an IMAP UID: {}", message.source_ref),
            })
    }
}

#[async_trait]
impl MailSource for ImapSource {
    fn account(&self) -> &str {
        &self.endpoint.account
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Imap
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
        let folder = folder.to_string();
        let since = since.map(str::to_string);
        let account = self.endpoint.account.clone();
        self.with_session(move |s| {
            s.select(&folder)?;
            let query = match since.as_deref().and_then(|v| v.parse::<u64>().ok()) {
                Some(uid) => format!("UID SEARCH UID {}:*", uid + 1),
                None => "UID SEARCH ALL".to_string(),
            };
            let mut uids = parse_search(&s.command(&query)?);
            // `n:*` always matches the highest UID, even below n.
            uids.retain(|uid| {
                since
                    .as_deref()
                    .is_none_or(|w| is_after(&uid.to_string(), w))
            });
            uids.sort_unstable();
            uids.truncate(limit);
            if uids.is_empty() {
                return Ok(Vec::new());
            }

            let set = uids
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let responses = s.command(&format!("UID FETCH {set} (UID BODY.PEEK[])"))?;
            let mut messages = Vec::new();
            for resp in responses {
                let (Some(uid), Some(raw)) = (fetch_uid(&resp.line), resp.literal) else {
                    continue;
                };
                match parse_message(&account, &folder, &uid.to_string(), &raw) {
                    Ok(msg) => messages.push(msg),
                    Err(e) => warn!(account = %account, uid, error = %e, "Skipping unparseable message"),
                }
            }
            messages.sort_by_key(|m| m.source_ref.parse::<u64>().unwrap_or(0));
            debug!(account = %account, folder = %folder, count = messages.len(), "Listed new messages");
            Ok(messages)
        })
        .await
    }

    async fn fetch(&self, folder: &str, source_ref: &str) -> Result<Message, SourceError> {
        let folder = folder.to_string();
        let source_ref = source_ref.to_string();
        let account = self.endpoint.account.clone();
        self.with_session(move |s| {
            s.select(&folder)?;
            let responses = s.command(&format!("UID FETCH {source_ref} (UID BODY.PEEK[])"))?;
            let raw = responses
                .into_iter()
                .find_map(|r| r.literal)
                .ok_or_else(|| SourceError::NotFound {
                    account: account.clone(),
                    folder: folder.clone(),
                    source_ref: source_ref.clone(),
                })?;
            parse_message(&account, &folder, &source_ref, &raw)
        })
        .await
    }

    async fn apply(&self, message: &Message, action: &Action) -> Result<(), SourceError> {
        let folder = message.folder.clone();
        match action {
            Action::Move { folder: target } => {
                let uid = self.uid(message)?;
                let target = target.clone();
                self.with_session(move |s| {
                    s.select(&folder)?;
                    s.move_uid(uid, &target)
                })
                .await?;
                info!(account = %self.endpoint.account, uid, "Message moved");
                Ok(())
            }
            Action::Delete => {
                let uid = self.uid(message)?;
                let trash = self.trash_folder.clone();
                let soft = self.soft_delete && !folder.eq_ignore_ascii_case(&trash);
                self.with_session(move |s| {
                    s.select(&folder)?;
                    if soft {
                        s.move_uid(uid, &trash)
                    } else {
                        s.command(&format!("UID STORE {uid} +FLAGS.SILENT (\\Deleted)"))?;
                        s.command("EXPUNGE").map(|_| ())
                    }
                })
                .await?;
                info!(account = %self.endpoint.account, uid, soft, "Message deleted");
                Ok(())
            }
            Action::Tag { tag } => {
                let uid = self.uid(message)?;
                let flag = imap_flag(tag).ok_or_else(|| SourceError::Unsupported {
                    account: self.endpoint.account.clone(),
                    action: format!("tag '{tag}' (not a valid IMAP keyword)"),
                })?;
                self.with_session(move |s| {
                    s.select(&folder)?;
                    s.command(&format!("UID STORE {uid} +FLAGS.SILENT ({flag})"))
                        .map(|_| ())
                })
                .await
            }
            Action::Forward { to, smtp_account } => {
                self.forwarders
                    .forward(&self.endpoint.account, message, to, smtp_account.as_deref())
                    .await
            }
            Action::ExtractActionItem | Action::Notify { .. } => Ok(()),
        }
    }

    async fn check(&self) -> Result<(), SourceError> {
        let folders = self.folders.clone();
        self.with_session(move |s| {
            for folder in &folders {
                s.select(folder)?;
            }
            Ok(())
        })
        .await
    }
}

/// Map a rule tag to an IMAP flag or keyword.
fn imap_flag(tag: &str) -> Option<String> {
    let tag = tag.trim();
    match tag.trim_start_matches('\\').to_ascii_lowercase().as_str() {
        "seen" | "read" => return Some("\\Seen".into()),
        "flagged" | "important" | "starred" => return Some("\\Flagged".into()),
        "answered" | "replied" => return Some("\\Answered".into()),
        "draft" => return Some("\\Draft".into()),
        _ => {}
    }
    let valid = !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '$'));
    valid.then(|| tag.to_string())
}

/// Quote a string for an IMAP command.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// UIDs from `* SEARCH` responses.
fn parse_search(responses: &[Response]) -> Vec<u64> {
    responses
        .iter()
        .filter(|r| r.line.starts_with("* SEARCH"))
        .flat_map(|r| {
            r.line
                .split_whitespace()
                .skip(2)
                .filter_map(|n| n.parse().ok())
                .collect::<Vec<u64>>()
        })
        .collect()
}

/// The `UID n` item of a FETCH response line.
fn fetch_uid(line: &str) -> Option<u64> {
    let upper = line.to_ascii_uppercase();
    let pos = upper.find("UID ")?;
    line[pos + 4..]
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()
}

/// Byte count of a trailing `{n}` literal marker.
fn literal_len(line: &str) -> Option<usize> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let open = trimmed.strip_suffix('}')?.rfind('{')?;
    trimmed[open + 1..trimmed.len() - 1].parse().ok()
}

/// One untagged response, with its literal payload if it carried one.
#[derive(Debug, Default)]
struct Response {
    line: String,
    literal: Option<Vec<u8>>,
}

trait Stream: Read + Write + Send {}
impl<T: Read + Write + Send> Stream for T {}

/// A logged-in, blocking IMAP session.
struct Session {
    account: String,
    stream: Box<dyn Stream>,
    tag: u32,
}

impl Session {
    fn connect(endpoint: &Endpoint) -> Result<Self, SourceError> {
        let unavailable = |reason: String| SourceError::Unavailable {
            account: endpoint.account.clone(),
            reason,
        };

        let tcp = TcpStream::connect((endpoint.server.as_str(), endpoint.port))
            .map_err(|e| unavailable(format!("connect {}:{}: {e}", endpoint.server, endpoint.port)))?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))?;

        let stream: Box<dyn Stream> = if endpoint.use_ssl {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = Arc::new(
                rustls::ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth(),
            );
            let server_name = ServerName::try_from(endpoint.server.clone())
                .map_err(|e| unavailable(format!("invalid server name: {e}")))?;
            let conn = rustls::ClientConnection::new(tls_config, server_name)
                .map_err(|e| unavailable(format!("TLS setup failed: {e}")))?;
            Box::new(rustls::StreamOwned::new(conn, tcp))
        } else {
            Box::new(tcp)
        };

        let mut session = Self {
            account: endpoint.account.clone(),
            stream,
            tag: 0,
        };
        session.read_line()?;
        session
            .command(&format!(
                "LOGIN {} {}",
                quote(&endpoint.username),
                quote(endpoint.password.expose_secret())
            ))
            .map_err(|_| unavailable("IMAP login failed".into()))?;
        Ok(session)
    }

    fn unavailable(&self, reason: impl Into<String>) -> SourceError {
        SourceError::Unavailable {
            account: self.account.clone(),
            reason: reason.into(),
        }
    }

    fn read_line(&mut self) -> Result<String, SourceError> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte) {
                Ok(0) => return Err(self.unavailable("IMAP connection closed")),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send a tagged command and collect untagged responses until the
    /// tagged completion. Anything but `OK` is an error.
    fn command(&mut self, cmd: &str) -> Result<Vec<Response>, SourceError> {
        self.tag += 1;
        let tag = format!("A{}", self.tag);
        self.stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        self.stream.flush()?;

        let mut responses = Vec::new();
        loop {
            let mut line = self.read_line()?;
            if let Some(status) = line.strip_prefix(&format!("{tag} ")) {
                if status.starts_with("OK") {
                    return Ok(responses);
                }
                let verb = cmd.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
                return Err(self.unavailable(format!("{verb}: {}", status.trim())));
            }

            let mut literal = None;
            if let Some(len) = literal_len(&line) {
                let mut data = vec![0u8; len];
                self.stream.read_exact(&mut data)?;
                literal = Some(data);
                // The rest of the response follows the literal.
                line.push_str(&self.read_line()?);
            }
            responses.push(Response { line, literal });
        }
    }

    fn select(&mut self, folder: &str) -> Result<(), SourceError> {
        self.command(&format!("SELECT {}", quote(folder))).map(|_| ())
    }

    /// `UID MOVE`, falling back to copy + delete + expunge.
    fn move_uid(&mut self, uid: u64, target: &str) -> Result<(), SourceError> {
        let target = quote(target);
        if self.command(&format!("UID MOVE {uid} {target}")).is_ok() {
            return Ok(());
        }
        self.command(&format!("UID COPY {uid} {target}"))?;
        self.command(&format!("UID STORE {uid} +FLAGS.SILENT (\\Deleted)"))?;
        self.command("EXPUNGE")?;
        Ok(())
    }

    fn logout(&mut self) {
        if let Err(e) = self.command("LOGOUT") {
            debug!(account = %self.account, error = %e, "IMAP logout failed");
        }
    }
}
