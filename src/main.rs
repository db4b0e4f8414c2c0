use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use miette::{miette, Context, IntoDiagnostic, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warden_core::{
    Credential, IdempotencyLedger, Identity, JobKey, JobStatus, RepoRef, WardenConfig,
};
use warden_review::github::SourceHost;
use warden_review::{GitHubClient, LlmReviewer, Orchestrator};
use warden_server::AppState;
use warden_store::{Database, SqliteCredentialStore, SqliteLedger};

const CONFIG_FILE: &str = ".warden.toml";
const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Parser)]
#[command(
    name = "warden",
    version,
    about = "Webhook-driven AI pull request reviewer",
    long_about = "Warden receives pull request webhooks, generates an AI review of the diff\n\
                  and posts it as a single comment, exactly once per change.\n\n\
                  Examples:\n  \
                    warden init                                   Create a .warden.toml config file\n  \
                    warden identity add --id 1001 --login alice --token ghp_...\n  \
                    warden identity select-repo --id 1001 acme/widgets\n  \
                    warden register-webhook --id 1001             Subscribe the selected repository\n  \
                    warden serve                                  Run the webhook listener\n  \
                    warden status                                 Show recent review jobs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (default: .warden.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    format: Format,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the webhook listener and the review workers
    #[command(long_about = "Run the webhook listener and the review workers.\n\n\
        Unfinished jobs from a previous run are resumed on startup. Stops gracefully\n\
        on Ctrl-C, letting in-flight jobs finish their current stage.\n\n\
        Examples:\n  warden serve\n  warden serve --bind 127.0.0.1:8080")]
    Serve {
        /// Socket address to listen on (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Manage the identities reviews are posted as
    Identity {
        #[command(subcommand)]
        action: IdentityCommand,
    },
    /// Subscribe a repository's pull request events to this server
    #[command(long_about = "Subscribe a repository's pull request events to this server.\n\n\
        The callback is {server.public_url}/webhook. Re-registering an existing hook\n\
        is harmless.\n\n\
        Examples:\n  warden register-webhook --id 1001\n  warden register-webhook --id 1001 --repo acme/widgets")]
    RegisterWebhook {
        /// Identity whose token creates the hook
        #[arg(long)]
        id: String,
        /// Repository (owner/name); defaults to the identity's selected repository
        #[arg(long)]
        repo: Option<String>,
    },
    /// Show a review job, or the most recent ones
    Status {
        /// Job key to inspect (omit to list recent jobs)
        key: Option<String>,
        /// Maximum jobs to list (default: 20)
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Maintain the idempotency ledger
    Ledger {
        #[command(subcommand)]
        action: LedgerCommand,
    },
    /// Create a default .warden.toml configuration file
    Init,
}

#[derive(Subcommand)]
enum IdentityCommand {
    /// Record an authorized identity (rotates the token if it exists)
    Add {
        /// Stable identity id (e.g. the GitHub user id)
        #[arg(long)]
        id: String,
        /// Display login
        #[arg(long)]
        login: String,
        /// Access token
        #[arg(long)]
        token: String,
    },
    /// Replace the token of an existing identity
    Rotate {
        #[arg(long)]
        id: String,
        #[arg(long)]
        token: String,
    },
    /// Select the repository an identity reviews
    SelectRepo {
        #[arg(long)]
        id: String,
        /// Repository as owner/name
        repo: String,
    },
    /// List identities (tokens are never shown)
    List,
}

#[derive(Subcommand)]
enum LedgerCommand {
    /// Delete finished jobs older than the given age
    Prune {
        #[arg(long)]
        older_than_days: u64,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// Human-readable text (default)
    Text,
    /// Machine-readable JSON with camelCase keys
    Json,
}

const DEFAULT_CONFIG: &str = r#"# Warden configuration
# Values here are overridden by environment variables, which are overridden by flags.

# Identity used when several identities selected the same repository.
# default_identity = "1001"

[server]
bind = "0.0.0.0:3000"
# Shared secret for X-Hub-Signature-256 (env: GITHUB_WEBHOOK_SECRET)
# webhook_secret = ""
# Externally reachable base URL, used by register-webhook (env: WARDEN_PUBLIC_URL)
# public_url = "https://warden.example.com"

[github]
api_base_url = "https://api.github.com"
user_agent = "warden"
timeout_secs = 30

[llm]
provider = "openai"
model = "gpt-4o-mini"
# api_key = ""  (env: OPENAI_API_KEY)
# base_url = "http://localhost:11434"
max_output_tokens = 1024
timeout_secs = 60
temperature = 0.2

[review]
# Diff characters sent to the model; larger diffs are truncated at file boundaries.
max_input_chars = 12000
# Upper bound of the posted comment.
max_output_chars = 4000

[pipeline]
workers = 4
per_repository_limit = 2
max_attempts = 3
base_backoff_ms = 500
max_backoff_ms = 30000
stage_timeout_secs = 120

[store]
path = ".warden/warden.db"
# Delete finished jobs older than this many days on startup (absent: keep forever).
# ledger_retention_days = 90
"#;

fn load_config(path: Option<&Path>) -> Result<WardenConfig> {
    let mut config = match path {
        Some(path) => WardenConfig::from_file(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("loading {}", path.display()))?,
        None => {
            let default_path = Path::new(CONFIG_FILE);
            if default_path.exists() {
                WardenConfig::from_file(default_path)
                    .into_diagnostic()
                    .wrap_err_with(|| format!("loading {CONFIG_FILE}"))?
            } else {
                WardenConfig::default()
            }
        }
    };
    config.apply_env();
    Ok(config)
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_database(config: &WardenConfig) -> Result<Arc<Database>> {
    let path = &config.store.path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .into_diagnostic()
            .wrap_err_with(|| format!("creating {}", parent.display()))?;
    }
    let db = Database::open(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("opening {}", path.display()))?;
    Ok(Arc::new(db))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).into_diagnostic()?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(miette::MietteHandlerOpts::new().terminal_links(true).build())
    }))
    .into_diagnostic()?;
    human_panic::setup_panic!();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Command::Init = cli.command {
        let path = Path::new(CONFIG_FILE);
        if path.exists() {
            miette::bail!("{CONFIG_FILE} already exists");
        }
        std::fs::write(path, DEFAULT_CONFIG).into_diagnostic()?;
        println!("Created {CONFIG_FILE} with default configuration");
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { bind } => serve(config, bind).await,
        Command::Identity { action } => identity(&config, action, cli.format),
        Command::RegisterWebhook { id, repo } => register_webhook(&config, &id, repo).await,
        Command::Status { key, limit } => status(&config, key, limit, cli.format).await,
        Command::Ledger {
            action: LedgerCommand::Prune { older_than_days },
        } => {
            let ledger = SqliteLedger::new(open_database(&config)?);
            let cutoff = days_ago(older_than_days)?;
            let removed = ledger.prune(cutoff).await.into_diagnostic()?;
            match cli.format {
                Format::Json => print_json(&serde_json::json!({ "removed": removed })),
                Format::Text => {
                    println!("Removed {removed} finished job(s) older than {older_than_days} day(s)");
                    Ok(())
                }
            }
        }
        Command::Init => Ok(()),
    }
}

async fn serve(config: WardenConfig, bind: Option<String>) -> Result<()> {
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    let db = open_database(&config)?;
    let ledger = Arc::new(SqliteLedger::new(db.clone()));

    let retention = config
        .store
        .ledger_retention_days
        .map(retention_window)
        .transpose()?;
    if config.server.webhook_secret.is_none() {
        warn!("no webhook secret configured, deliveries are not authenticated");
    }
    if config.llm.api_key.is_none() && config.llm.provider != "ollama" {
        warn!(provider = %config.llm.provider, "no LLM API key configured");
    }

    let credentials = Arc::new(
        SqliteCredentialStore::new(db).with_default_identity(config.default_identity.clone()),
    );
    let host = Arc::new(GitHubClient::new(&config.github).into_diagnostic()?);
    let generator =
        Arc::new(LlmReviewer::new(&config.llm, &config.review).into_diagnostic()?);

    let orchestrator = Arc::new(
        Orchestrator::builder(ledger, credentials, host, generator)
            .pipeline(&config.pipeline)
            .retention(retention)
            .start(),
    );
    let resumed = orchestrator.recover().await.into_diagnostic()?;
    if resumed > 0 {
        info!(resumed, "resuming unfinished jobs");
    }

    let listener = TcpListener::bind(&bind)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("binding {bind}"))?;
    let state = Arc::new(AppState::new(
        orchestrator.clone(),
        config.server.webhook_secret.clone(),
    ));
    warden_server::serve(listener, state, shutdown_signal())
        .await
        .into_diagnostic()?;

    orchestrator.shutdown().await;
    Ok(())
}

/// The instant `days` days before now.
fn days_ago(days: u64) -> Result<DateTime<Utc>> {
    i64::try_from(days)
        .ok()
        .and_then(chrono::Duration::try_days)
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .ok_or_else(|| miette!("{days} days is out of range"))
}

/// Retention of `days` days as a wall-clock window for the background pruner.
fn retention_window(days: u64) -> Result<std::time::Duration> {
    days_ago(days).wrap_err("invalid store.ledger_retention_days")?;
    Ok(std::time::Duration::from_secs(days * SECONDS_PER_DAY))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested");
}

fn identity(config: &WardenConfig, action: IdentityCommand, format: Format) -> Result<()> {
    let store = SqliteCredentialStore::new(open_database(config)?);
    match action {
        IdentityCommand::Add { id, login, token } => {
            store.upsert_identity(&id, &login, &token).into_diagnostic()?;
            println!("Identity {id} ({login}) saved");
        }
        IdentityCommand::Rotate { id, token } => {
            store.rotate_token(&id, &token).into_diagnostic()?;
            println!("Token of identity {id} rotated");
        }
        IdentityCommand::SelectRepo { id, repo } => {
            let repo: RepoRef = repo.parse().into_diagnostic()?;
            store.set_selected_repo(&id, &repo).into_diagnostic()?;
            println!("Identity {id} now reviews {repo}");
        }
        IdentityCommand::List => {
            let identities = store.list_identities().into_diagnostic()?;
            match format {
                Format::Json => {
                    let views: Vec<_> = identities.iter().map(identity_json).collect();
                    print_json(&views)?;
                }
                Format::Text => {
                    if identities.is_empty() {
                        println!("No identities. Add one with `warden identity add`.");
                    }
                    for identity in &identities {
                        let repo = identity
                            .selected_repo
                            .as_ref()
                            .map(RepoRef::full_name)
                            .unwrap_or_else(|| "-".into());
                        println!(
                            "{:<12} {:<20} {:<30} updated {}",
                            identity.id,
                            identity.login,
                            repo,
                            short_time(identity.updated_at)
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

/// JSON view of an identity without its token.
fn identity_json(identity: &Identity) -> serde_json::Value {
    serde_json::json!({
        "id": identity.id,
        "login": identity.login,
        "selectedRepo": identity.selected_repo.as_ref().map(RepoRef::full_name),
        "createdAt": identity.created_at,
        "updatedAt": identity.updated_at,
    })
}

async fn register_webhook(config: &WardenConfig, id: &str, repo: Option<String>) -> Result<()> {
    let store = SqliteCredentialStore::new(open_database(config)?);
    let identity = store
        .identity(id)
        .into_diagnostic()?
        .ok_or_else(|| miette!("unknown identity '{id}'; add it with `warden identity add`"))?;

    let repo = match repo {
        Some(repo) => repo.parse::<RepoRef>().into_diagnostic()?,
        None => identity.selected_repo.clone().ok_or_else(|| {
            miette!("identity '{id}' has no selected repository; pass --repo owner/name")
        })?,
    };
    let public_url = config.server.public_url.as_deref().ok_or_else(|| {
        miette!("server.public_url (or WARDEN_PUBLIC_URL) is required to register a webhook")
    })?;
    let callback = format!("{}/webhook", public_url.trim_end_matches('/'));

    let client = GitHubClient::new(&config.github)
        .into_diagnostic()?
        .with_webhook_secret(config.server.webhook_secret.clone());
    let credential = Credential::new(identity.id.clone(), identity.token.clone(), repo.clone());
    let ack = client
        .register_webhook(&repo, &credential, &callback)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("registering webhook on {repo}"))?;

    match &ack.url {
        Some(url) => println!("Webhook for {repo} -> {callback} registered ({url})"),
        None => println!("Webhook for {repo} -> {callback} already registered"),
    }
    Ok(())
}

async fn status(
    config: &WardenConfig,
    key: Option<String>,
    limit: usize,
    format: Format,
) -> Result<()> {
    let ledger = SqliteLedger::new(open_database(config)?);
    match key {
        Some(key) => {
            let entry = ledger
                .get(&JobKey::from_raw(key.as_str()))
                .await
                .into_diagnostic()?
                .ok_or_else(|| miette!("unknown job {key}"))?;
            match format {
                Format::Json => print_json(&entry.status)?,
                Format::Text => print_status(&entry.status),
            }
        }
        None => {
            let jobs = ledger.list_recent(limit).await.into_diagnostic()?;
            match format {
                Format::Json => print_json(&jobs)?,
                Format::Text => {
                    if jobs.is_empty() {
                        println!("No review jobs recorded.");
                    }
                    for job in &jobs {
                        println!(
                            "{}  {:<16} {:<30} {}",
                            job.key.short(),
                            job.state.as_str(),
                            format!("{}#{}", job.repository, job.number),
                            short_time(job.last_transition_at)
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

fn print_status(status: &JobStatus) {
    let attempts = &status.attempts;
    println!("Job:       {}", status.key);
    println!("Change:    {}#{} ({})", status.repository, status.number, status.url);
    println!("State:     {}", status.state);
    println!(
        "Attempts:  credentials {}, diff {}, review {}, post {}",
        attempts.credential_resolution,
        attempts.diff_fetch,
        attempts.review_generation,
        attempts.comment_posting
    );
    if let Some(url) = &status.comment_url {
        println!("Comment:   {url}");
    }
    if let Some(failure) = &status.failure {
        let stage = failure.stage.map(|s| s.as_str()).unwrap_or("-");
        println!("Failure:   [{stage}] {}: {}", failure.kind, failure.message);
    }
    println!("Created:   {}", short_time(status.created_at));
    println!("Updated:   {}", short_time(status.last_transition_at));
}

fn short_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}
