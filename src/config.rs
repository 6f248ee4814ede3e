//! Configuration: YAML document, file-backed secrets, validation.
//!
//! Loaded once at startup (and again on reload). A loaded `Settings` is
//! treated as an immutable snapshot; reloads build a new one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;
use serde::de::IgnoredAny;
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::llm::LlmBackend;
use crate::model::{Action, Category, DigestFormat};
use crate::pipeline::rules::{ConflictPolicy, RuleConfig, RuleEngine};
use crate::service::schedule::TimeOfDay;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "INBOX_PILOT_CONFIG";
/// Fallback source for the Anthropic key when `llm.api_key_file` is unset.
pub const ANTHROPIC_KEY_ENV: &str = "ANTHROPIC_API_KEY";
const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Root configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub llm: LlmSettings,
    pub imap_accounts: BTreeMap<String, ImapAccount>,
    pub smtp_accounts: BTreeMap<String, SmtpAccount>,
    pub maildir_accounts: BTreeMap<String, MaildirAccount>,
    pub notmuch_accounts: BTreeMap<String, NotmuchAccount>,
    /// Maximum messages fetched per folder per poll.
    pub batch_size: usize,
    /// Seconds between polls of each account.
    pub polling_interval: u64,
    /// Upper bound on concurrent classification calls across all accounts.
    pub max_in_flight: usize,
    /// Attempts per message before classification is given up.
    pub classification_attempts: u32,
    pub data_dir: PathBuf,
    pub rules: Vec<RuleConfig>,
    pub conflict_policy: ConflictPolicy,
    pub guardrails: Guardrails,
    pub service: ServiceSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm: LlmSettings::default(),
            imap_accounts: BTreeMap::new(),
            smtp_accounts: BTreeMap::new(),
            maildir_accounts: BTreeMap::new(),
            notmuch_accounts: BTreeMap::new(),
            batch_size: 50,
            polling_interval: 300,
            max_in_flight: 4,
            classification_attempts: 2,
            data_dir: PathBuf::from("./data"),
            rules: Vec::new(),
            conflict_policy: ConflictPolicy::default(),
            guardrails: Guardrails::default(),
            service: ServiceSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: LlmBackend,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub ollama_base_url: String,
    /// Context window used for budget checks.
    pub context_length: usize,
    pub timeout_secs: u64,
    pub api_key_file: Option<PathBuf>,
    #[serde(skip)]
    pub api_key: Option<SecretString>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: LlmBackend::Ollama,
            model: "llama3.1".into(),
            max_tokens: 1024,
            temperature: 0.3,
            ollama_base_url: "http://localhost:11434".into(),
            context_length: 24_576,
            timeout_secs: 120,
            api_key_file: None,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImapAccount {
    pub server: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub username: String,
    pub password_file: PathBuf,
    #[serde(default = "default_true")]
    pub use_ssl: bool,
    #[serde(default = "default_folders")]
    pub folders: Vec<String>,
    /// Per-account override of the global polling interval.
    #[serde(default)]
    pub polling_interval: Option<u64>,
    #[serde(default, rename = "password")]
    inline_password: Option<IgnoredAny>,
    #[serde(skip)]
    pub password: Option<SecretString>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpAccount {
    pub server: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub password_file: PathBuf,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    /// Envelope sender for forwarded mail; defaults to `username`.
    #[serde(default)]
    pub from_address: Option<String>,
    #[serde(default, rename = "password")]
    inline_password: Option<IgnoredAny>,
    #[serde(skip)]
    pub password: Option<SecretString>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaildirAccount {
    pub path: PathBuf,
    #[serde(default = "default_folders")]
    pub folders: Vec<String>,
    #[serde(default)]
    pub polling_interval: Option<u64>,
}

/// An account backed by a local notmuch index.
#[derive(Debug, Clone, Deserialize)]
pub struct NotmuchAccount {
    /// notmuch config file; notmuch's own lookup applies when unset.
    #[serde(default)]
    pub config: Option<PathBuf>,
    /// Search query selecting this account's mail.
    #[serde(default = "default_notmuch_query")]
    pub query: String,
    /// Tag added once a message has been recorded as processed.
    #[serde(default = "default_processed_tag")]
    pub processed_tag: String,
    #[serde(default = "default_notmuch_binary")]
    pub binary: PathBuf,
    #[serde(default)]
    pub polling_interval: Option<u64>,
}

fn default_notmuch_query() -> String {
    "tag:inbox".to_string()
}

fn default_processed_tag() -> String {
    "inbox-pilot".to_string()
}

fn default_notmuch_binary() -> PathBuf {
    PathBuf::from("notmuch")
}

fn default_imap_port() -> u16 {
    993
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

fn default_folders() -> Vec<String> {
    vec!["INBOX".to_string()]
}

/// Safety settings for destructive actions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Guardrails {
    /// Delete moves to `trash_folder` instead of expunging.
    pub soft_delete: bool,
    pub trash_folder: String,
}

impl Default for Guardrails {
    fn default() -> Self {
        Self {
            soft_delete: true,
            trash_folder: "Trash".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub monitor: MonitorSettings,
    pub digest: DigestSettings,
    pub action_items: ActionItemSettings,
    pub retention_days: Option<u32>,
}

impl ServiceSettings {
    /// Days of audit history kept by the cleanup task.
    pub fn retention_days(&self) -> u32 {
        self.retention_days.unwrap_or(30)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub enabled: bool,
    pub auto_classify: bool,
    pub apply_rules: bool,
    /// Restrict polling to these accounts; empty means all.
    pub accounts: Vec<String>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_classify: true,
            apply_rules: true,
            accounts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DigestSettings {
    pub enabled: bool,
    /// Local times of day (`HH:MM`) at which a digest is generated.
    pub schedule: Vec<String>,
    pub period_hours: u32,
    pub min_emails: usize,
    pub include_action_items: bool,
    pub exclude_categories: Vec<Category>,
    pub delivery: Vec<DeliverySettings>,
}

impl Default for DigestSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: vec!["08:00".into(), "20:00".into()],
            period_hours: 12,
            min_emails: 1,
            include_action_items: true,
            exclude_categories: vec![Category::Promotional, Category::Spam, Category::Newsletter],
            delivery: vec![DeliverySettings::File {
                format: DigestFormat::Markdown,
                output_dir: None,
            }],
        }
    }
}

/// One digest sink.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliverySettings {
    File {
        #[serde(default)]
        format: DigestFormat,
        /// Defaults to `<data_dir>/digests`.
        #[serde(default)]
        output_dir: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActionItemSettings {
    pub auto_extract: bool,
    /// Extracted items below this confidence are dropped.
    pub confidence_threshold: f32,
}

impl Default for ActionItemSettings {
    fn default() -> Self {
        Self {
            auto_extract: true,
            confidence_threshold: 0.5,
        }
    }
}

/// Kind of backend behind an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Imap,
    Smtp,
    Maildir,
    Index,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Imap => "imap",
            Self::Smtp => "smtp",
            Self::Maildir => "maildir",
            Self::Index => "index",
        }
    }
}

/// Flat view of one configured account, for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub name: String,
    pub kind: SourceKind,
    pub folders: Vec<String>,
    pub location: String,
}

impl Settings {
    /// Resolve the config path: explicit flag, then env var, then `./config.yaml`.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match std::env::var_os(CONFIG_ENV) {
            Some(p) if !p.is_empty() => PathBuf::from(p),
            _ => PathBuf::from(DEFAULT_CONFIG_FILE),
        }
    }

    /// Read, parse, load secrets and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::ParseError(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut settings = Self::from_yaml(&raw)?;

        // Relative secret paths are resolved against the config file.
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        settings.load_secrets(base)?;
        settings.validate()?;

        info!(
            path = %path.display(),
            accounts = settings.accounts().len(),
            rules = settings.rules.len(),
            "Configuration loaded"
        );
        Ok(settings)
    }

    /// Parse a YAML document without touching secrets or validating.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Read every `password_file` (and the LLM key) into memory.
    pub fn load_secrets(&mut self, base: &Path) -> Result<(), ConfigError> {
        for (name, account) in &mut self.imap_accounts {
            if account.inline_password.is_some() {
                return Err(inline_password_error("imap_accounts", name));
            }
            account.password = Some(read_secret(&base.join(&account.password_file))?);
        }
        for (name, account) in &mut self.smtp_accounts {
            if account.inline_password.is_some() {
                return Err(inline_password_error("smtp_accounts", name));
            }
            account.password = Some(read_secret(&base.join(&account.password_file))?);
        }

        self.llm.api_key = match self.llm.api_key_file {
            Some(ref file) => Some(read_secret(&base.join(file))?),
            None => std::env::var(ANTHROPIC_KEY_ENV)
                .ok()
                .filter(|k| !k.trim().is_empty())
                .map(SecretString::from),
        };
        debug!("Secrets loaded");
        Ok(())
    }

    /// Structural checks. Any failure keeps the service from starting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.imap_accounts.is_empty()
            && self.maildir_accounts.is_empty()
            && self.notmuch_accounts.is_empty()
        {
            return Err(ConfigError::MissingRequired {
                key: "imap_accounts / maildir_accounts / notmuch_accounts".into(),
                hint: "Configure at least one mail source account.".into(),
            });
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be greater than 0"));
        }
        if self.polling_interval == 0 {
            return Err(invalid("polling_interval", "must be greater than 0"));
        }
        if self.max_in_flight == 0 {
            return Err(invalid("max_in_flight", "must be greater than 0"));
        }
        if !(1..=10).contains(&self.classification_attempts) {
            return Err(invalid("classification_attempts", "must be between 1 and 10"));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(invalid("llm.temperature", "must be between 0.0 and 2.0"));
        }
        if self.llm.provider == LlmBackend::Anthropic && self.llm.api_key.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "llm.api_key_file".into(),
                hint: format!("Set llm.api_key_file or the {ANTHROPIC_KEY_ENV} environment variable."),
            });
        }

        let mut seen = std::collections::BTreeSet::new();
        let names = self
            .imap_accounts
            .keys()
            .chain(self.maildir_accounts.keys())
            .chain(self.notmuch_accounts.keys());
        for name in names {
            if !seen.insert(name) {
                return Err(invalid(
                    "accounts",
                    &format!("account name '{name}' is used by more than one source"),
                ));
            }
        }
        for (name, a) in &self.notmuch_accounts {
            if a.processed_tag.trim().is_empty() || a.processed_tag.contains(char::is_whitespace) {
                return Err(invalid(
                    &format!("notmuch_accounts.{name}.processed_tag"),
                    "must be a single non-empty tag",
                ));
            }
        }
        for name in &self.service.monitor.accounts {
            if !seen.contains(name) {
                return Err(invalid(
                    "service.monitor.accounts",
                    &format!("unknown account '{name}'"),
                ));
            }
        }

        for entry in &self.service.digest.schedule {
            entry.parse::<TimeOfDay>().map_err(|e| {
                invalid("service.digest.schedule", &format!("'{entry}': {e}"))
            })?;
        }
        if self.service.digest.period_hours == 0 {
            return Err(invalid("service.digest.period_hours", "must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.service.action_items.confidence_threshold) {
            return Err(invalid(
                "service.action_items.confidence_threshold",
                "must be between 0.0 and 1.0",
            ));
        }

        for rule in &self.rules {
            for action in &rule.actions {
                if let Action::Forward { smtp_account, .. } = action {
                    let known = match smtp_account {
                        Some(name) => self.smtp_accounts.contains_key(name),
                        None => !self.smtp_accounts.is_empty(),
                    };
                    if !known {
                        return Err(invalid(
                            &format!("rules.{}", rule.id),
                            "forward action needs a configured smtp account",
                        ));
                    }
                }
            }
        }
        // Compiling checks ids, operators and regexes.
        RuleEngine::compile(&self.rules)?;
        Ok(())
    }

    /// Every configured account, mail sources first.
    pub fn accounts(&self) -> Vec<AccountInfo> {
        let mut out = Vec::new();
        for (name, a) in &self.imap_accounts {
            out.push(AccountInfo {
                name: name.clone(),
                kind: SourceKind::Imap,
                folders: a.folders.clone(),
                location: format!("{}@{}:{}", a.username, a.server, a.port),
            });
        }
        for (name, a) in &self.maildir_accounts {
            out.push(AccountInfo {
                name: name.clone(),
                kind: SourceKind::Maildir,
                folders: a.folders.clone(),
                location: a.path.display().to_string(),
            });
        }
        for (name, a) in &self.notmuch_accounts {
            out.push(AccountInfo {
                name: name.clone(),
                kind: SourceKind::Index,
                folders: vec![a.query.clone()],
                location: a
                    .config
                    .as_ref()
                    .map_or_else(|| "notmuch".to_string(), |c| c.display().to_string()),
            });
        }
        for (name, a) in &self.smtp_accounts {
            out.push(AccountInfo {
                name: name.clone(),
                kind: SourceKind::Smtp,
                folders: Vec::new(),
                location: format!("{}@{}:{}", a.username, a.server, a.port),
            });
        }
        out
    }

    /// Whether the monitor should poll this account.
    pub fn monitors(&self, account: &str) -> bool {
        let only = &self.service.monitor.accounts;
        only.is_empty() || only.iter().any(|a| a == account)
    }

    /// Effective polling interval for an account, in seconds.
    pub fn polling_interval_for(&self, account: &str) -> u64 {
        self.imap_accounts
            .get(account)
            .and_then(|a| a.polling_interval)
            .or_else(|| {
                self.maildir_accounts
                    .get(account)
                    .and_then(|a| a.polling_interval)
            })
            .or_else(|| {
                self.notmuch_accounts
                    .get(account)
                    .and_then(|a| a.polling_interval)
            })
            .unwrap_or(self.polling_interval)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("inbox-pilot.db")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("inbox-pilot.pid")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn digest_dir(&self) -> PathBuf {
        self.data_dir.join("digests")
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn inline_password_error(section: &str, name: &str) -> ConfigError {
    invalid(
        &format!("{section}.{name}.password"),
        "inline passwords are not allowed; use password_file",
    )
}

/// Read a secret file, dropping the trailing newline.
fn read_secret(path: &Path) -> Result<SecretString, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Secret {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let secret = raw.trim_end_matches(['\r', '\n']);
    if secret.is_empty() {
        return Err(ConfigError::Secret {
            path: path.to_path_buf(),
            reason: "file is empty".into(),
        });
    }
    Ok(SecretString::from(secret.to_string()))
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    const MINIMAL: &str = r#"
maildir_accounts:
  local:
    path: /tmp/mail
"#;

    #[test]
    fn defaults_fill_missing_sections() {
        let s = Settings::from_yaml(MINIMAL).unwrap();
        assert_eq!(s.batch_size, 50);
        assert_eq!(s.polling_interval, 300);
        assert_eq!(s.max_in_flight, 4);
        assert_eq!(s.llm.provider, LlmBackend::Ollama);
        assert_eq!(s.llm.context_length, 24_576);
        assert_eq!(s.service.digest.schedule, vec!["08:00", "20:00"]);
        assert_eq!(s.service.digest.min_emails, 1);
        assert_eq!(s.service.retention_days(), 30);
        assert_eq!(s.maildir_accounts["local"].folders, vec!["INBOX"]);
        assert_eq!(s.conflict_policy, ConflictPolicy::LastWriteWins);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn reads_password_files_relative_to_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("imap.pw"), "hunter2\n").unwrap();
        let yaml = r#"
imap_accounts:
  work:
    server: imap.example.com
    username: me@example.com
    password_file: imap.pw
"#;
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, yaml).unwrap();

        let s = Settings::load(&path).unwrap();
        let account = &s.imap_accounts["work"];
        assert_eq!(account.port, 993);
        assert_eq!(account.password.as_ref().unwrap().expose_secret(), "hunter2");
    }

    #[test]
    fn inline_password_is_rejected() {
        let yaml = r#"
imap_accounts:
  work:
    server: imap.example.com
    username: me
    password_file: pw
    password: hunter2
"#;
        let mut s = Settings::from_yaml(yaml).unwrap();
        let err = s.load_secrets(Path::new("/nonexistent")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key.ends_with("password")));
    }

    #[test]
    fn missing_secret_file_is_config_error() {
        let yaml = r#"
smtp_accounts:
  out:
    server: smtp.example.com
    username: me
    password_file: missing.pw
"#;
        let mut s = Settings::from_yaml(yaml).unwrap();
        let err = s.load_secrets(Path::new("/nonexistent")).unwrap_err();
        assert!(matches!(err, ConfigError::Secret { .. }));
    }

    #[test]
    fn validate_requires_an_account() {
        let s = Settings::default();
        assert!(matches!(
            s.validate(),
            Err(ConfigError::MissingRequired { .. })
        ));
    }

    #[test]
    fn validate_rejects_bad_schedule() {
        let yaml = format!("{MINIMAL}service:\n  digest:\n    schedule: [\"25:00\"]\n");
        let s = Settings::from_yaml(&yaml).unwrap();
        assert!(matches!(s.validate(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn validate_rejects_forward_without_smtp() {
        let yaml = format!(
            "{MINIMAL}rules:\n  - id: fwd\n    actions:\n      - type: forward\n        to: boss@example.com\n"
        );
        let s = Settings::from_yaml(&yaml).unwrap();
        assert!(matches!(s.validate(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn validate_rejects_zero_batch() {
        let yaml = format!("{MINIMAL}batch_size: 0\n");
        let s = Settings::from_yaml(&yaml).unwrap();
        assert!(s.validate().is_err());
    }

    #[test]
    fn notmuch_accounts_parse_with_defaults() {
        let yaml = "notmuch_accounts:\n  index:\n    query: \"tag:inbox AND to:me@example.com\"\n    polling_interval: 90\n";
        let s = Settings::from_yaml(yaml).unwrap();
        let a = &s.notmuch_accounts["index"];
        assert_eq!(a.processed_tag, "inbox-pilot");
        assert_eq!(a.binary, PathBuf::from("notmuch"));
        assert!(s.validate().is_ok());
        assert_eq!(s.polling_interval_for("index"), 90);

        let info = s.accounts();
        assert_eq!(info[0].kind, SourceKind::Index);
        assert_eq!(info[0].folders, vec!["tag:inbox AND to:me@example.com"]);
    }

    #[test]
    fn validate_rejects_shared_account_names() {
        let yaml = format!("{MINIMAL}notmuch_accounts:\n  local:\n    query: \"*\"\n");
        let s = Settings::from_yaml(&yaml).unwrap();
        assert!(matches!(s.validate(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn validate_bounds_classification_attempts() {
        for attempts in [0, 33] {
            let yaml = format!("{MINIMAL}classification_attempts: {attempts}\n");
            let s = Settings::from_yaml(&yaml).unwrap();
            assert!(matches!(s.validate(), Err(ConfigError::InvalidValue { .. })));
        }
    }

    #[test]
    fn delivery_and_categories_parse() {
        let yaml = format!(
            "{MINIMAL}service:\n  digest:\n    exclude_categories: [spam]\n    delivery:\n      - type: file\n        format: html\n        output_dir: /tmp/out\n"
        );
        let s = Settings::from_yaml(&yaml).unwrap();
        assert_eq!(s.service.digest.exclude_categories, vec![Category::Spam]);
        assert_eq!(
            s.service.digest.delivery,
            vec![DeliverySettings::File {
                format: DigestFormat::Html,
                output_dir: Some(PathBuf::from("/tmp/out")),
            }]
        );
    }

    #[test]
    fn per_account_polling_interval_override() {
        let yaml = "maildir_accounts:\n  local:\n    path: /tmp/m\n    polling_interval: 60\n";
        let s = Settings::from_yaml(yaml).unwrap();
        assert_eq!(s.polling_interval_for("local"), 60);
        assert_eq!(s.polling_interval_for("other"), 300);
    }
}
