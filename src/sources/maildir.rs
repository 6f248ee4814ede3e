//! Local Maildir source.
//!
//! INBOX is `<path>/{cur,new}` (or `<path>/INBOX/`), other folders are
//! either direct subdirectories or Maildir++ `.<Folder>/`. The watermark is
//! the unique name (the filename before `:2,`), ordered lexically.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Forwarders, MailSource, is_after, parse_message};
use crate::config::{Guardrails, MaildirAccount, SourceKind};
use crate::error::SourceError;
use crate::model::{Action, Message};

const INFO_SEPARATOR: &str = ":2,";

pub struct MaildirSource {
    name: String,
    root: PathBuf,
    folders: Vec<String>,
    soft_delete: bool,
    trash_folder: String,
    forwarders: Arc<Forwarders>,
}

/// One message file on disk.
#[derive(Debug, Clone)]
struct Entry {
    unique: String,
    path: PathBuf,
}

impl MaildirSource {
    pub fn new(
        name: &str,
        account: &MaildirAccount,
        guardrails: &Guardrails,
        forwarders: Arc<Forwarders>,
    ) -> Self {
        Self {
            name: name.to_string(),
            root: account.path.clone(),
            folders: account.folders.clone(),
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

    /// Resolve a folder name to its directory.
    fn folder_path(&self, folder: &str) -> PathBuf {
        let direct = self.root.join(folder);
        if direct.join("cur").is_dir() {
            return direct;
        }
        if folder.eq_ignore_ascii_case("INBOX") && self.root.join("cur").is_dir() {
            return self.root.clone();
        }
        let plus = self.root.join(format!(".{folder}"));
        if plus.is_dir() {
            return plus;
        }
        // New folders are created Maildir++ style.
        if folder.eq_ignore_ascii_case("INBOX") {
            self.root.clone()
        } else {
            plus
        }
    }

    /// Every message file in `folder`, sorted by unique name.
    fn scan(&self, folder: &str) -> Result<Vec<Entry>, SourceError> {
        let dir = self.folder_path(folder);
        if !dir.is_dir() {
            return Err(SourceError::NotFound {
                account: self.name.clone(),
                folder: folder.to_string(),
                source_ref: String::new(),
            });
        }
        let mut entries = Vec::new();
        for sub in ["new", "cur"] {
            let sub_dir = dir.join(sub);
            if !sub_dir.is_dir() {
                continue;
            }
            for item in std::fs::read_dir(&sub_dir)? {
                let item = item?;
                if !item.file_type()?.is_file() {
                    continue;
                }
                let file_name = item.file_name().to_string_lossy().to_string();
                if file_name.starts_with('.') {
                    continue;
                }
                entries.push(Entry {
                    unique: unique_name(&file_name).to_string(),
                    path: item.path(),
                });
            }
        }
        entries.sort_by(|a, b| a.unique.cmp(&b.unique));
        Ok(entries)
    }

    fn locate(&self, folder: &str, source_ref: &str) -> Result<Entry, SourceError> {
        self.scan(folder)?
            .into_iter()
            .find(|e| e.unique == source_ref)
            .ok_or_else(|| SourceError::NotFound {
                account: self.name.clone(),
                folder: folder.to_string(),
                source_ref: source_ref.to_string(),
            })
    }

    fn read(&self, folder: &str, entry: &Entry) -> Result<Message, SourceError> {
        let raw = std::fs::read(&entry.path)?;
        parse_message(&self.name, folder, &entry.unique, &raw)
    }

    /// Rename into `<target>/cur`, keeping the filename.
    fn move_entry(&self, entry: &Entry, target: &str) -> Result<PathBuf, SourceError> {
        let dest_dir = self.folder_path(target).join("cur");
        std::fs::create_dir_all(&dest_dir)?;
        let file_name = entry
            .path
            .file_name()
            .ok_or_else(|| self.unavailable("message path has no file name"))?;
        let dest = dest_dir.join(file_name);
        std::fs::rename(&entry.path, &dest)?;
        Ok(dest)
    }

    fn set_flag(&self, entry: &Entry, flag: char) -> Result<(), SourceError> {
        let file_name = entry
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut flags: Vec<char> = file_name
            .split_once(INFO_SEPARATOR)
            .map(|(_, f)| f.chars().collect())
            .unwrap_or_default();
        if flags.contains(&flag) {
            return Ok(());
        }
        flags.push(flag);
        flags.sort_unstable();

        let folder_dir = entry
            .path
            .parent()
            .and_then(Path::parent)
            .ok_or_else(|| self.unavailable("message outside a maildir"))?;
        let dest = folder_dir.join("cur").join(format!(
            "{}{INFO_SEPARATOR}{}",
            entry.unique,
            flags.iter().collect::<String>()
        ));
        std::fs::create_dir_all(folder_dir.join("cur"))?;
        std::fs::rename(&entry.path, dest)?;
        Ok(())
    }
}

/// Filename up to the info separator.
fn unique_name(file_name: &str) -> &str {
    file_name
        .split_once(INFO_SEPARATOR)
        .map_or(file_name, |(u, _)| u)
}

/// Maildir flag letter for a tag, if the tag maps to one.
fn flag_for_tag(tag: &str) -> Option<char> {
    match tag.trim().trim_start_matches('\\').to_ascii_lowercase().as_str() {
        "seen" | "read" => Some('S'),
        "flagged" | "important" | "starred" => Some('F'),
        "answered" | "replied" => Some('R'),
        "draft" => Some('D'),
        _ => None,
    }
}

#[async_trait]
impl MailSource for MaildirSource {
    fn account(&self) -> &str {
        &self.name
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
        let entries = self.scan(folder)?;
        let mut messages = Vec::new();
        for entry in entries
            .iter()
            .filter(|e| since.is_none_or(|s| is_after(&e.unique, s)))
            .take(limit)
        {
            match self.read(folder, entry) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!(
                    account = %self.name,
                    path = %entry.path.display(),
                    error = %e,
                    "Skipping unreadable message"
                ),
            }
        }
        debug!(account = %self.name, folder, count = messages.len(), "Listed new messages");
        Ok(messages)
    }

    async fn fetch(&self, folder: &str, source_ref: &str) -> Result<Message, SourceError> {
        let entry = self.locate(folder, source_ref)?;
        self.read(folder, &entry)
    }

    async fn apply(&self, message: &Message, action: &Action) -> Result<(), SourceError> {
        match action {
            Action::Move { folder } => {
                let entry = self.locate(&message.folder, &message.source_ref)?;
                let dest = self.move_entry(&entry, folder)?;
                info!(account = %self.name, to = %dest.display(), "Message moved");
                Ok(())
            }
            Action::Delete => {
                let entry = self.locate(&message.folder, &message.source_ref)?;
                let in_trash = message.folder.eq_ignore_ascii_case(&self.trash_folder);
                if self.soft_delete && !in_trash {
                    self.move_entry(&entry, &self.trash_folder)?;
                    info!(account = %self.name, trash = %self.trash_folder, "Message moved to trash");
                } else {
                    std::fs::remove_file(&entry.path)?;
                    info!(account = %self.name, "Message deleted");
                }
                Ok(())
            }
            Action::Tag { tag } => {
                let flag = flag_for_tag(tag).ok_or_else(|| SourceError::Unsupported {
                    account: self.name.clone(),
                    action: format!("tag '{tag}' (maildir supports seen, flagged, answered, draft)"),
                })?;
                let entry = self.locate(&message.folder, &message.source_ref)?;
                self.set_flag(&entry, flag)
            }
            Action::Forward { to, smtp_account } => {
                self.forwarders
                    .forward(&self.name, message, to, smtp_account.as_deref())
                    .await
            }
            Action::ExtractActionItem | Action::Notify { .. } => Ok(()),
        }
    }

    async fn check(&self) -> Result<(), SourceError> {
        if !self.root.is_dir() {
            return Err(self.unavailable(format!(
                "maildir path does not exist: {}",
                self.root.display()
            )));
        }
        for folder in &self.folders {
            if !self.folder_path(folder).is_dir() {
                return Err(self.unavailable(format!("folder {folder} not found")));
            }
        }
        Ok(())
    }
}
