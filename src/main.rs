use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

use inbox_pilot::config::Settings;
use inbox_pilot::error::{ConfigError, DigestError};
use inbox_pilot::llm::{LlmProvider, create_provider};
use inbox_pilot::model::{
    ActionItemStatus, AuditEntry, AuditStatus, DraftStatus, Message,
};
use inbox_pilot::service::{Orchestrator, RunOptions, Snapshot};
use inbox_pilot::sources::{Forwarders, MailSource, create_sources};
use inbox_pilot::store::{
    ActionItemFilter, AuditFilter, AuditStore, ExportFormat, LibSqlBackend, export,
};

#[derive(Parser)]
#[command(name = "inbox-pilot", version, about = "Email triage and automation service")]
struct Cli {
    /// Config file (default: $INBOX_PILOT_CONFIG or ./config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Background service control
    Service {
        #[command(subcommand)]
        action: ServiceCommand,
    },
    /// Run a single poll and digest pass
    RunOnce {
        #[arg(long)]
        no_monitor: bool,
        #[arg(long)]
        no_digest: bool,
        /// Show what would happen without changing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Inspect the audit log
    Audit {
        #[command(subcommand)]
        action: AuditCommand,
    },
    /// List messages in the configured sources
    Email {
        #[command(subcommand)]
        action: EmailCommand,
    },
    /// Reply drafts
    Draft {
        #[command(subcommand)]
        action: DraftCommand,
    },
    Digest {
        #[command(subcommand)]
        action: DigestCommand,
    },
    ActionItems {
        #[command(subcommand)]
        action: ActionItemCommand,
    },
    /// Configured accounts
    Source {
        #[command(subcommand)]
        action: SourceCommand,
    },
}

#[derive(Subcommand)]
enum ServiceCommand {
    Start {
        /// Stay attached to the terminal
        #[arg(long)]
        foreground: bool,
        /// Set on the re-spawned background process
        #[arg(long, hide = true)]
        detached: bool,
    },
    Stop,
    Status,
}

#[derive(Subcommand)]
enum AuditCommand {
    List {
        #[arg(long)]
        account: Option<String>,
        /// processed, skipped-duplicate, failed or retried
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Full entry and history for one message (id or unique prefix)
    Show { id: String },
    /// Dump the audit log, oldest first
    Export {
        /// json or csv
        #[arg(long, default_value = "json")]
        format: String,
        #[arg(long)]
        account: Option<String>,
        #[arg(long)]
        status: Option<String>,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum EmailCommand {
    List(EmailListArgs),
}

#[derive(Args)]
struct EmailListArgs {
    #[arg(long)]
    account: Option<String>,
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Subcommand)]
enum DraftCommand {
    List {
        #[arg(long)]
        status: Option<String>,
    },
    Create {
        message_id: String,
        #[arg(long)]
        instructions: Option<String>,
    },
    Discard { id: Uuid },
}

#[derive(Subcommand)]
enum DigestCommand {
    Generate {
        /// Window length, defaults to service.digest.period_hours
        #[arg(long)]
        hours: Option<u32>,
        /// Generate even below min_emails
        #[arg(long)]
        force: bool,
    },
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum ActionItemCommand {
    List {
        #[arg(long, default_value = "pending")]
        status: String,
    },
    Done { id: Uuid },
}

#[derive(Subcommand)]
enum SourceCommand {
    List,
    Test { account: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };
    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            let config_error = e
                .chain()
                .any(|cause| cause.downcast_ref::<ConfigError>().is_some());
            ExitCode::from(if config_error { 2 } else { 1 })
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    let detached = matches!(
        cli.command,
        Command::Service {
            action: ServiceCommand::Start { detached: true, .. }
        }
    );
    let config_path = Settings::resolve_path(cli.config.as_deref());

    // The detached service logs to files under data_dir, which needs the
    // config first.
    let (settings, _guard) = if detached {
        let settings = Settings::load(&config_path)?;
        let guard = init_file_tracing(cli.verbose, &settings.log_dir())?;
        (settings, Some(guard))
    } else {
        init_tracing(cli.verbose);
        (Settings::load(&config_path)?, None)
    };

    match cli.command {
        Command::Service { action } => match action {
            ServiceCommand::Start {
                foreground,
                detached,
            } => {
                if foreground || detached {
                    service_start(settings, config_path).await
                } else {
                    spawn_background(&settings, &config_path, cli.verbose)
                }
            }
            ServiceCommand::Stop => service_stop(&settings),
            ServiceCommand::Status => service_status(&settings).await,
        },
        Command::RunOnce {
            no_monitor,
            no_digest,
            dry_run,
        } => {
            let orchestrator = build_orchestrator(settings).await?;
            let stats = orchestrator
                .run_once(RunOptions {
                    monitor: !no_monitor,
                    digest: !no_digest,
                    dry_run,
                })
                .await?;
            if dry_run {
                println!("Dry run: nothing was changed.");
            }
            println!("Emails found:         {}", stats.emails_found);
            println!("Processed:            {}", stats.emails_processed);
            println!("Duplicates skipped:   {}", stats.duplicates);
            println!("Classification fails: {}", stats.classification_failures);
            println!("Errors:               {}", stats.errors);
            println!("Action items:         {}", stats.action_items_created);
            if let Some(id) = stats.digest {
                println!("Digest:               {id}");
            }
            println!("Duration:             {:.1}s", stats.duration.as_secs_f64());
            Ok(())
        }
        Command::Audit { action } => {
            let store = open_store(&settings).await?;
            match action {
                AuditCommand::List {
                    account,
                    status,
                    limit,
                } => audit_list(store.as_ref(), account, status, limit).await,
                AuditCommand::Show { id } => audit_show(store.as_ref(), &id).await,
                AuditCommand::Export {
                    format,
                    account,
                    status,
                    output,
                } => audit_export(store.as_ref(), &format, account, status, output).await,
            }
        }
        Command::Email {
            action: EmailCommand::List(args),
        } => email_list(&settings, args).await,
        Command::Draft { action } => draft_command(settings, action).await,
        Command::Digest { action } => digest_command(settings, action).await,
        Command::ActionItems { action } => {
            let store = open_store(&settings).await?;
            match action {
                ActionItemCommand::List { status } => {
                    let status: ActionItemStatus =
                        status.parse().map_err(anyhow::Error::msg)?;
                    let items = store
                        .list_action_items(&ActionItemFilter {
                            status: Some(status),
                            ..Default::default()
                        })
                        .await?;
                    if items.is_empty() {
                        println!("No {} action items.", status.as_str());
                    }
                    for item in items {
                        let due = item
                            .due_hint
                            .map(|d| format!(" (due: {d})"))
                            .unwrap_or_default();
                        println!(
                            "{}  [{}] {}{}  ({})",
                            item.id,
                            item.priority,
                            item.title,
                            due,
                            item.relevance.as_str()
                        );
                    }
                    Ok(())
                }
                ActionItemCommand::Done { id } => {
                    if !store
                        .update_action_item_status(id, ActionItemStatus::Completed)
                        .await?
                    {
                        bail!("no action item with id {id}");
                    }
                    println!("Marked {id} completed.");
                    Ok(())
                }
            }
        }
        Command::Source { action } => match action {
            SourceCommand::List => {
                for account in settings.accounts() {
                    println!(
                        "{:<16} {:<8} {}  {}",
                        account.name,
                        account.kind.as_str(),
                        account.location,
                        account.folders.join(", ")
                    );
                }
                Ok(())
            }
            SourceCommand::Test { account } => source_test(&settings, &account).await,
        },
    }
}

fn init_tracing(verbose: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn init_file_tracing(
    verbose: bool,
    log_dir: &Path,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("cannot create log directory {}", log_dir.display()))?;
    let appender = tracing_appender::rolling::daily(log_dir, "inbox-pilot.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer)
        .init();
    Ok(guard)
}

fn env_filter(verbose: bool) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if verbose { "debug" } else { "info" })
    })
}

async fn open_store(settings: &Settings) -> anyhow::Result<Arc<dyn AuditStore>> {
    let path = settings.db_path();
    let store = LibSqlBackend::new_local(&path)
        .await
        .with_context(|| format!("cannot open database at {}", path.display()))?;
    Ok(Arc::new(store))
}

fn provider(settings: &Settings) -> anyhow::Result<Arc<dyn LlmProvider>> {
    Ok(create_provider(&settings.llm)?)
}

async fn build_orchestrator(settings: Settings) -> anyhow::Result<Arc<Orchestrator>> {
    let store = open_store(&settings).await?;
    let sources = create_sources(&settings)?;
    let llm = provider(&settings)?;
    let snapshot = Snapshot::new(settings, Some(Arc::clone(&llm)), Arc::clone(&store))?;
    Ok(Arc::new(Orchestrator::new(snapshot, store, sources, Some(llm))))
}

// ── service ─────────────────────────────────────────────────────────

fn read_pid(settings: &Settings) -> Option<u32> {
    std::fs::read_to_string(settings.pid_path())
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

fn running_pid(settings: &Settings) -> Option<u32> {
    read_pid(settings).filter(|pid| pid_alive(*pid))
}

fn spawn_background(settings: &Settings, config_path: &Path, verbose: bool) -> anyhow::Result<()> {
    if let Some(pid) = running_pid(settings) {
        bail!("service already running (pid {pid})");
    }
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("--config")
        .arg(config_path)
        .args(["service", "start", "--detached"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if verbose {
        command.arg("--verbose");
    }
    let child = command.spawn().context("failed to spawn background service")?;
    println!("Service started (pid {})", child.id());
    println!("Logs: {}", settings.log_dir().display());
    Ok(())
}

async fn service_start(settings: Settings, config_path: PathBuf) -> anyhow::Result<()> {
    if let Some(pid) = running_pid(&settings).filter(|pid| *pid != std::process::id()) {
        bail!("service already running (pid {pid})");
    }
    let pid_path = settings.pid_path();
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&pid_path, std::process::id().to_string())
        .with_context(|| format!("cannot write {}", pid_path.display()))?;

    let orchestrator = build_orchestrator(settings).await?;
    spawn_signal_handlers(Arc::clone(&orchestrator), config_path);

    let result = orchestrator.start().await;
    let _ = std::fs::remove_file(&pid_path);
    Ok(result?)
}

/// SIGTERM stops, SIGHUP reloads the config file.
#[cfg(unix)]
fn spawn_signal_handlers(orchestrator: Arc<Orchestrator>, config_path: PathBuf) {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut term, mut hup) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(term), Ok(hup)) => (term, hup),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!("Signal handlers unavailable: {e}");
            return;
        }
    };
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = term.recv() => {
                    tracing::info!("SIGTERM received, shutting down...");
                    orchestrator.stop();
                    break;
                }
                _ = hup.recv() => {
                    tracing::info!("SIGHUP received, reloading configuration");
                    match Settings::load(&config_path) {
                        Ok(settings) => {
                            if let Err(e) = orchestrator.reload(settings).await {
                                tracing::error!("Reload rejected: {e}");
                            }
                        }
                        Err(e) => tracing::error!("Reload failed: {e}"),
                    }
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_signal_handlers(_orchestrator: Arc<Orchestrator>, _config_path: PathBuf) {}

fn service_stop(settings: &Settings) -> anyhow::Result<()> {
    let Some(pid) = running_pid(settings) else {
        let _ = std::fs::remove_file(settings.pid_path());
        println!("Service is not running.");
        return Ok(());
    };
    let status = std::process::Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status()
        .context("failed to signal service")?;
    if !status.success() {
        bail!("could not stop pid {pid}");
    }
    println!("Stop signal sent (pid {pid}).");
    Ok(())
}

async fn service_status(settings: &Settings) -> anyhow::Result<()> {
    match running_pid(settings) {
        Some(pid) => println!("Service: running (pid {pid})"),
        None => println!("Service: stopped"),
    }
    println!(
        "Digest schedule: {}",
        settings.service.digest.schedule.join(", ")
    );
    let store = open_store(settings).await?;
    for (status, count) in store.count_by_status().await? {
        println!("  {:<18} {count}", status.as_str());
    }
    let watermarks = store.list_watermarks().await?;
    if !watermarks.is_empty() {
        println!("Watermarks:");
        for (account, folder, value, updated) in watermarks {
            println!(
                "  {account}/{folder}: {value} (updated {})",
                updated.format("%Y-%m-%d %H:%M")
            );
        }
    }
    if let Some(last) = store.list_digests(1).await?.first() {
        println!(
            "Last digest: {} ({}, {} emails)",
            last.created_at.format("%Y-%m-%d %H:%M"),
            last.status.as_str(),
            last.included_message_ids.len()
        );
    }
    Ok(())
}

// ── audit / email ───────────────────────────────────────────────────

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

fn print_entry_line(entry: &AuditEntry) {
    println!(
        "{}  {:<12} {:<17} {:<8} {:<12} {:<40} {}",
        entry.processed_at.format("%Y-%m-%d %H:%M"),
        &entry.message_id[..entry.message_id.len().min(12)],
        entry.status.as_str(),
        entry.classification_status.as_str(),
        entry.category().as_str(),
        truncate(&entry.subject, 40),
        entry.account
    );
}

async fn audit_export(
    store: &dyn AuditStore,
    format: &str,
    account: Option<String>,
    status: Option<String>,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let format: ExportFormat = format.parse().map_err(anyhow::Error::msg)?;
    let mut filter = AuditFilter::default();
    if let Some(account) = account {
        filter = filter.with_account(account);
    }
    if let Some(status) = status {
        let status: AuditStatus = status.parse().map_err(anyhow::Error::msg)?;
        filter = filter.with_status(status);
    }
    let entries = store.query_all(filter).await?;
    let rendered = export::render(&entries, format)?;
    match output {
        Some(path) => {
            tokio::fs::write(&path, rendered)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            eprintln!("Exported {} entries to {}", entries.len(), path.display());
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

async fn audit_list(
    store: &dyn AuditStore,
    account: Option<String>,
    status: Option<String>,
    limit: usize,
) -> anyhow::Result<()> {
    let mut filter = AuditFilter::default().with_limit(limit).newest_first();
    if let Some(account) = account {
        filter = filter.with_account(account);
    }
    if let Some(status) = status {
        let status: AuditStatus = status.parse().map_err(anyhow::Error::msg)?;
        filter = filter.with_status(status);
    }
    let entries = store.query_all(filter).await?;
    if entries.is_empty() {
        println!("No audit entries.");
        return Ok(());
    }
    println!(
        "{:<16}  {:<12} {:<17} {:<8} {:<12} {:<40} ACCOUNT",
        "PROCESSED", "ID", "STATUS", "CLASSIFY", "CATEGORY", "SUBJECT"
    );
    for entry in &entries {
        print_entry_line(entry);
    }
    Ok(())
}

async fn find_entry(store: &dyn AuditStore, id: &str) -> anyhow::Result<AuditEntry> {
    if let Some(entry) = store.get(id).await? {
        return Ok(entry);
    }
    let mut matches: Vec<AuditEntry> = store
        .query_all(AuditFilter::default())
        .await?
        .into_iter()
        .filter(|e| e.message_id.starts_with(id))
        .collect();
    match matches.len() {
        0 => bail!("no audit entry for {id}"),
        1 => Ok(matches.swap_remove(0)),
        n => bail!("{id} is ambiguous ({n} entries)"),
    }
}

async fn audit_show(store: &dyn AuditStore, id: &str) -> anyhow::Result<()> {
    let entry = find_entry(store, id).await?;
    println!("{}", serde_json::to_string_pretty(&entry)?);
    println!("\nHistory:");
    for event in store.history(&entry.message_id).await? {
        println!(
            "  {}  {:<17} {}",
            event.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            event.status.as_str(),
            event.detail.unwrap_or_default()
        );
    }
    Ok(())
}

async fn email_list(settings: &Settings, args: EmailListArgs) -> anyhow::Result<()> {
    let store = open_store(settings).await?;
    let sources = create_sources(settings)?;
    for source in sources
        .iter()
        .filter(|s| args.account.as_deref().is_none_or(|a| a == s.account()))
    {
        for folder in source.folders() {
            let messages = match source.list_new(folder, None, usize::MAX).await {
                Ok(m) => m,
                Err(e) => {
                    eprintln!("{}/{folder}: {e}", source.account());
                    continue;
                }
            };
            println!("== {}/{folder} ({} messages)", source.account(), messages.len());
            let newest = messages.iter().rev().take(args.limit);
            for message in newest {
                let mark = if store.has_processed(&message.id).await? {
                    "✓"
                } else {
                    " "
                };
                println!(
                    "{mark} {}  {:<12} {:<30} {}",
                    message.timestamp.format("%Y-%m-%d %H:%M"),
                    &message.id[..12],
                    truncate(&message.sender, 30),
                    truncate(&message.subject, 60)
                );
            }
        }
    }
    Ok(())
}

/// Locate a message by fingerprint across the sources' folders.
async fn find_message(
    sources: &[Arc<dyn MailSource>],
    entry: &AuditEntry,
) -> anyhow::Result<Message> {
    let source = sources
        .iter()
        .find(|s| s.account() == entry.account)
        .with_context(|| format!("account {} is not configured", entry.account))?;
    let messages = source.list_new(&entry.folder, None, usize::MAX).await?;
    messages
        .into_iter()
        .find(|m| m.id == entry.message_id)
        .with_context(|| {
            format!(
                "message {} no longer in {}/{}",
                entry.message_id, entry.account, entry.folder
            )
        })
}

// ── drafts / digests / sources ──────────────────────────────────────

async fn draft_command(settings: Settings, action: DraftCommand) -> anyhow::Result<()> {
    let store = open_store(&settings).await?;
    match action {
        DraftCommand::List { status } => {
            let status = status
                .map(|s| s.parse::<DraftStatus>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let drafts = store.list_drafts(status).await?;
            if drafts.is_empty() {
                println!("No drafts.");
            }
            for draft in drafts {
                println!(
                    "{}  {:<9} {}  to {}  {}",
                    draft.created_at.format("%Y-%m-%d %H:%M"),
                    draft.status.as_str(),
                    draft.id,
                    draft.to,
                    truncate(&draft.subject, 50)
                );
            }
            Ok(())
        }
        DraftCommand::Create {
            message_id,
            instructions,
        } => {
            let entry = find_entry(store.as_ref(), &message_id).await?;
            let sources = create_sources(&settings)?;
            let message = find_message(&sources, &entry).await?;
            let classifier = inbox_pilot::pipeline::Classifier::new(
                provider(&settings)?,
                inbox_pilot::pipeline::ClassifierConfig::from_settings(&settings),
            );
            let draft = classifier
                .draft_reply(&message, instructions.as_deref())
                .await?;
            store.insert_draft(&draft).await?;
            println!("Draft {} created.\n", draft.id);
            println!("To: {}\nSubject: {}\n\n{}", draft.to, draft.subject, draft.body);
            Ok(())
        }
        DraftCommand::Discard { id } => {
            if !store.update_draft_status(id, DraftStatus::Discarded).await? {
                bail!("no draft with id {id}");
            }
            println!("Draft {id} discarded.");
            Ok(())
        }
    }
}

async fn digest_command(settings: Settings, action: DigestCommand) -> anyhow::Result<()> {
    let store = open_store(&settings).await?;
    match action {
        DigestCommand::Generate { hours, force } => {
            let llm = provider(&settings).ok();
            let snapshot = Snapshot::new(settings, llm, Arc::clone(&store))?;
            let (start, end) = snapshot.digest.window(hours);
            let mut generated = match snapshot.digest.generate(start, end, force).await {
                Ok(g) => g,
                Err(DigestError::InsufficientData { found, required }) => {
                    println!("Not enough emails for a digest ({found} found, {required} required).");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            snapshot.digest.deliver(&mut generated).await?;
            println!(
                "Digest {} ({} emails, {}):",
                generated.digest.id,
                generated.digest.included_message_ids.len(),
                generated.digest.status.as_str()
            );
            for result in &generated.digest.delivery_results {
                let mark = if result.ok { "ok" } else { "failed" };
                println!("  {} {mark}: {}", result.sink, result.detail);
            }
            Ok(())
        }
        DigestCommand::List { limit } => {
            for digest in store.list_digests(limit).await? {
                println!(
                    "{}  {}  {:<9} {:>4} emails  {} .. {}",
                    digest.created_at.format("%Y-%m-%d %H:%M"),
                    digest.id,
                    digest.status.as_str(),
                    digest.included_message_ids.len(),
                    digest.period_start.format("%m-%d %H:%M"),
                    digest.period_end.format("%m-%d %H:%M")
                );
            }
            Ok(())
        }
    }
}

async fn source_test(settings: &Settings, account: &str) -> anyhow::Result<()> {
    if let Some(forwarder) = Forwarders::from_settings(settings).get(account).cloned() {
        tokio::task::spawn_blocking(move || forwarder.check()).await??;
        println!("{account}: SMTP connection ok");
        return Ok(());
    }
    let sources = create_sources(settings)?;
    let source = sources
        .iter()
        .find(|s| s.account() == account)
        .with_context(|| format!("no account named {account}"))?;
    source.check().await?;
    println!("{account}: {} connection ok", source.kind().as_str());
    Ok(())
}
