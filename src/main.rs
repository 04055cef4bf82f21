mod agent;
mod app;
mod cli;
mod components;
mod config;
mod error;
mod limit;
mod llm;

use std::io::Write;
use std::panic;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use color_eyre::eyre::Result;
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, LeaveAlternateScreen};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use agent::context::RunContext;
use agent::engine::AgentEngine;
use agent::loading::LoadingState;
use agent::message::ChatMessage;
use agent::runner::RunController;
use agent::store::DiskTranscriptStore;
use cli::Cli;
use config::Config;
use limit::bucket::RateLimiter;
use limit::storage::{FileUsageStorage, UsageStorage};
use limit::usage::UsageTracker;
use llm::anthropic::AnthropicClient;
use llm::client::ModelClient;
use llm::mock::MockClient;
use llm::tools::BuiltinToolExecutor;

/// Log directory (~/.local/share/helmsman/logs/)
fn log_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "helmsman", "helmsman")
        .map(|dirs| dirs.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("/tmp/helmsman/logs"))
}

/// File-only logging; stdout belongs to the TUI.
fn init_logging(log_level: &str) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_path = log_dir();
    std::fs::create_dir_all(&log_path)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_path, "helmsman.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true),
        )
        .init();

    Ok(guard)
}

fn main() -> Result<()> {
    // Restore the terminal before panic output; Drop won't always run.
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let _ = disable_raw_mode();
        let _ = execute!(std::io::stdout(), LeaveAlternateScreen);
        let _ = std::io::stdout().flush();
        original_hook(panic_info);
    }));

    color_eyre::install()?;

    let cli = Cli::parse_args();
    let _log_guard = init_logging(&cli.log_level)?;
    tracing::info!("starting helmsman v{}", env!("CARGO_PKG_VERSION"));

    // ---- Configuration ----

    let config_path = cli
        .config
        .clone()
        .or_else(Config::default_path)
        .unwrap_or_else(|| PathBuf::from("helmsman.toml"));
    let mut cfg = Config::load(&config_path)?;
    if !config_path.exists() {
        if let Err(e) = cfg.save(&config_path) {
            tracing::warn!("could not write default config: {e}");
        }
    }
    if let Some(db_path) = &cli.db_path {
        cfg.db_path = Some(db_path.clone());
    }
    if let Some(model) = &cli.model {
        cfg.chat.model = model.clone();
    }

    // ---- Shared core ----

    let store = Arc::new(Mutex::new(DiskTranscriptStore::open(cfg.db_path())?));
    let loading = Arc::new(LoadingState::new());
    let limiter = Arc::new(RateLimiter::new((&cfg.rate_limit).into()));

    let usage_storage: Option<Arc<dyn UsageStorage>> = if cfg.persistence.enabled {
        match FileUsageStorage::new(cfg.usage_storage_path()) {
            Ok(storage) => Some(Arc::new(storage)),
            Err(e) => {
                tracing::warn!("usage persistence disabled: {e}");
                None
            }
        }
    } else {
        None
    };
    let usage = UsageTracker::with_storage(
        (&cfg.usage_limit).into(),
        usage_storage,
        &cfg.persistence.key_prefix,
    );

    // ---- Event callbacks, surfaced to the status line ----

    let (notice_tx, notice_rx) = crossbeam_channel::unbounded::<String>();
    {
        let tx = notice_tx.clone();
        usage.set_on_warning_callback(move |w| {
            let _ = tx.send(format!(
                "Budget warning: {} at {:.0}% of its limit",
                w.metric, w.percent_used
            ));
        });
    }
    {
        let tx = notice_tx.clone();
        usage.set_on_paused_callback(move |p| {
            let _ = tx.send(format!("{} (Ctrl+R to resume)", p.reason));
        });
    }
    {
        let loading = loading.clone();
        usage.set_on_update_callback(move |_| loading.mark_state_changed());
    }

    // ---- Provider and engine ----

    let demo_mode = cli.demo || cli.api_key.is_none();
    let client: Arc<dyn ModelClient> = if demo_mode {
        Arc::new(MockClient::new())
    } else {
        Arc::new(AnthropicClient::new(cli.api_key.clone().unwrap_or_default()))
    };
    tracing::info!(provider = client.name(), model = %cfg.chat.model, "provider ready");

    let mut ctx =
        RunContext::new(cfg.chat.model.clone()).with_max_tokens(cfg.chat.max_tokens);
    if let Some(prompt) = &cfg.chat.system_prompt {
        ctx = ctx.with_system_prompt(prompt.clone());
    }
    {
        let tx = notice_tx.clone();
        ctx.on_rate_limited = Some(Arc::new(move |n| {
            let _ = tx.send(format!(
                "Rate limited ({}), waited {} ms (queue position {})",
                n.kind, n.wait_ms, n.queue_position
            ));
        }));
    }

    let engine = AgentEngine::new(
        store.clone(),
        loading.clone(),
        limiter.clone(),
        usage.clone(),
        client,
        Arc::new(BuiltinToolExecutor::new()),
        ctx,
    );
    let controller =
        RunController::start(engine, store.clone(), loading.clone(), usage, limiter)?;

    // The startup cleanup above already ran, so this notice lives exactly
    // until the next launch.
    if demo_mode {
        let notice = ChatMessage::system(
            "Demo mode: no API key configured. Replies come from a canned mock stream; \
             set ANTHROPIC_API_KEY to go live.",
        )
        .ephemeral();
        if let Ok(guard) = store.lock() {
            use agent::store::TranscriptStore;
            let _ = guard.append_message(notice);
        }
        loading.mark_state_changed();
    }

    // ---- UI loop ----

    let mut terminal = app::init_terminal()?;
    let mut app = app::App::new(controller, notice_rx);
    let result = app.run(&mut terminal);
    app::restore_terminal();

    match result {
        Ok(()) => {
            tracing::info!("exited normally");
            Ok(())
        }
        Err(e) => {
            tracing::error!("exited with error: {e}");
            Err(e.into())
        }
    }
}
