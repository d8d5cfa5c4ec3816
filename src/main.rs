use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use massblock::bus::{MessageBus, Request, Response, StatusData};
use massblock::cli::{Cli, Command, parse_username_list};
use massblock::config::BlockerConfig;
use massblock::error::BlockerError;
use massblock::forum::{ForumClient, SimulatedForum};
use massblock::orchestrator::{BlockingOrchestrator, OrchestratorHandle, OrchestratorSettings};
use massblock::state_machine::OperationStatus;
use massblock::store::{FileStore, MemoryStore, OperationStore};
use massblock::ui::ProgressWidget;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = BlockerConfig::load()?;
    if let Some(max_attempts) = cli.max_attempts {
        config.max_attempts = max_attempts;
    }
    if let Some(spacing_ms) = cli.spacing_ms {
        config.min_call_spacing_ms = spacing_ms;
    }
    if let Some(store) = cli.store {
        config.store_path = store;
    }

    match cli.command {
        Command::Run { usernames, file } => run(&config, usernames, file).await,
        Command::Status { json } => status(&config, json),
        Command::Serve => serve(&config).await,
        Command::Demo => demo(&config).await,
    }
}

// Logs go to stderr at `warn` by default so they do not fight the progress bar.
fn init_tracing(verbose: bool) {
    let default = if verbose {
        "massblock=debug"
    } else {
        "massblock=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(config: &BlockerConfig, mut usernames: Vec<String>, file: Option<PathBuf>) -> Result<()> {
    if let Some(path) = file {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        usernames.extend(parse_username_list(&contents));
    }

    let handle = spawn_orchestrator(config)?;
    // Without resume, an interrupted operation is closed before any new start.
    let resuming = handle.is_resuming();
    let bus = MessageBus::new(handle);
    stop_on_ctrl_c(bus.clone());

    if resuming {
        println!("Resuming interrupted operation...");
        let resumed = ProgressWidget::follow(&bus).await;
        if usernames.is_empty() {
            return check_outcome(resumed);
        }
    }

    if usernames.is_empty() {
        bail!("no usernames given, pass them as arguments or with --file");
    }
    start_and_follow(&bus, usernames).await
}

/// Spawn the orchestrator on the configured store, which this process then owns.
fn spawn_orchestrator(config: &BlockerConfig) -> Result<OrchestratorHandle> {
    if config.api_key.is_empty() {
        warn!("FORUM_API_KEY is not set, requests will be sent without credentials");
    }

    let client = ForumClient::from_config(config)?;
    let store = FileStore::new(&config.store_path);
    let lock_path = store.lock_path();
    let spawned = BlockingOrchestrator::spawn(
        OrchestratorSettings::from_config(config),
        Arc::new(client),
        Arc::new(store),
    );
    match spawned {
        Ok(handle) => Ok(handle),
        Err(BlockerError::AlreadyRunning) => bail!(
            "another massblock process holds {}, watch it with `massblock status`",
            lock_path.display()
        ),
        Err(e) => Err(e.into()),
    }
}

// One JSON request per stdin line, one response per stdout line; progress
// pushes are interleaved as they happen.
async fn serve(config: &BlockerConfig) -> Result<()> {
    let bus = MessageBus::new(spawn_orchestrator(config)?);

    let mut observer = bus.observe();
    tokio::spawn(async move {
        while let Some(push) = observer.next_json().await {
            println!("{push}");
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        println!("{}", bus.dispatch_json(&line).await);
    }
    Ok(())
}

fn status(config: &BlockerConfig, json: bool) -> Result<()> {
    let store = FileStore::new(&config.store_path);
    let op = store.load()?;

    if json {
        let response = Response::status(op.as_ref());
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    match op {
        None => println!("No blocking operation recorded in {}", store.path().display()),
        Some(op) => {
            println!("Operation {} ({})", op.id, op.status);
            ProgressWidget::new().print_summary(&StatusData::from(&op));
        }
    }
    Ok(())
}

async fn demo(config: &BlockerConfig) -> Result<()> {
    let forum = SimulatedForum::new()
        .with_latency(Duration::from_millis(300))
        .fail_terminal("ghost_account", "user not found")
        .fail_terminal("moderator_mia", "permission denied")
        .fail_transient("flaky_fred", "timeout", 1)
        .fail_transient("offline_olga", "timeout", 100);

    let mut settings = OrchestratorSettings::from_config(config);
    settings.min_call_spacing = settings.min_call_spacing.min(Duration::from_millis(200));
    settings.retry.base_delay_ms = 500;

    let handle = BlockingOrchestrator::spawn(
        settings,
        Arc::new(forum),
        Arc::new(MemoryStore::new()),
    )?;
    let bus = MessageBus::new(handle);
    stop_on_ctrl_c(bus.clone());

    let usernames = [
        "spam_bot_1",
        "ghost_account",
        "flaky_fred",
        "spam_bot_2",
        "@Spam_Bot_1",
        "moderator_mia",
        "offline_olga",
        "spam_bot_3",
    ];
    start_and_follow(&bus, usernames.iter().map(|s| s.to_string()).collect()).await
}

async fn start_and_follow(bus: &MessageBus, usernames: Vec<String>) -> Result<()> {
    let response = bus.dispatch(Request::StartBlocking { usernames }).await;
    if !response.success {
        bail!(
            "could not start blocking: {}",
            response.error.unwrap_or_else(|| "unknown error".into())
        );
    }
    check_outcome(ProgressWidget::follow(bus).await)
}

fn check_outcome(status: Option<StatusData>) -> Result<()> {
    match status {
        Some(data) if data.status == OperationStatus::Failed => bail!(
            "operation failed: {}",
            data.failure.unwrap_or_else(|| "unknown error".into())
        ),
        _ => Ok(()),
    }
}

// First Ctrl-C stops after the in-flight user; a second one exits immediately.
fn stop_on_ctrl_c(bus: MessageBus) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!("Stopping after the current user, press Ctrl-C again to quit now");
        bus.dispatch(Request::StopBlocking).await;

        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}
