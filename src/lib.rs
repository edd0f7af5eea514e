// src/lib.rs

pub mod api;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod launch;
pub mod logging;
pub mod provision;
pub mod store;
pub mod tracker;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::api::Router;
use crate::cli::{CliArgs, Command};
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::engine::{Dispatcher, JobId};
use crate::provision::local::LocalProvider;
use crate::store::{ArtifactStore, FileArtifactStore, MemoryArtifactStore};
use crate::tracker::StatusTracker;
use crate::types::{JobState, ProviderKind, StoreMode};

/// High-level entry point used by `main.rs`. Returns the process exit code.
///
/// This wires together:
/// - config loading
/// - artifact store (plus retention pruning)
/// - status tracker and its journal
/// - provider and dispatcher
/// - the selected subcommand
pub async fn run(args: CliArgs) -> Result<i32> {
    let cfg = load_and_validate(&args.config)
        .with_context(|| format!("loading config from {}", args.config))?;

    if let Command::Check = args.command {
        print_check(&cfg);
        return Ok(0);
    }

    let dispatcher = build_dispatcher(&cfg)?;
    dispatcher.reclaim_orphaned_environments().await;

    match args.command {
        Command::Run {
            artifact,
            start_command,
            owner,
        } => run_once(&dispatcher, &artifact, &start_command, &owner).await,
        Command::Serve { owner } => {
            let router = Router::new(dispatcher);
            tokio::select! {
                served = api::stdio::serve_stdio(&router, &owner) => served?,
                _ = tokio::signal::ctrl_c() => info!("interrupted; stopping stdio server"),
            }
            Ok(0)
        }
        Command::Check => Ok(0),
    }
}

/// Build the store, tracker and provider described by `cfg`.
pub fn build_dispatcher(cfg: &ConfigFile) -> Result<Dispatcher> {
    let store: Arc<dyn ArtifactStore> = match cfg.store.mode {
        StoreMode::File => Arc::new(
            FileArtifactStore::open(&cfg.store.root)
                .with_context(|| format!("opening artifact store at {:?}", cfg.store.root))?,
        ),
        StoreMode::Memory => Arc::new(MemoryArtifactStore::new()),
    };

    if let Err(e) = store.prune(cfg.store.retention, Utc::now()) {
        warn!(error = %e, "artifact pruning failed");
    }

    let tracker = match &cfg.tracker.journal {
        Some(path) => StatusTracker::open(path)
            .with_context(|| format!("opening job journal at {path:?}"))?,
        None => StatusTracker::in_memory(),
    };

    let provider = match cfg.provider.kind {
        ProviderKind::Local => Arc::new(LocalProvider::new(
            cfg.provider.root.clone(),
            cfg.provider.max_environments,
        )),
    };

    Ok(Dispatcher::new(
        store,
        provider.clone(),
        provider,
        tracker,
        cfg.dispatch,
    ))
}

/// Upload `artifact`, launch `start_command` against it and print the job
/// history until it reaches a terminal state. Ctrl-C cancels the job.
async fn run_once(
    dispatcher: &Dispatcher,
    artifact: &Path,
    start_command: &str,
    owner: &str,
) -> Result<i32> {
    let bytes = std::fs::read(artifact)
        .with_context(|| format!("reading artifact {}", artifact.display()))?;
    let filename = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());

    let stored = dispatcher.store().put(owner, &filename, &bytes)?;
    info!(hash = %stored.hash, size = stored.size, "artifact uploaded");

    let id = dispatcher.submit(owner, stored.hash.as_str(), start_command)?;
    println!("job {id}");

    let follow = follow_job(dispatcher, id);
    tokio::pin!(follow);

    let state = tokio::select! {
        state = &mut follow => state,
        _ = tokio::signal::ctrl_c() => {
            info!(job_id = %id, "interrupted; cancelling job");
            if let Err(e) = dispatcher.cancel(&id) {
                warn!(job_id = %id, error = %e, "cancel failed");
            }
            follow.await
        }
    };

    Ok(match state {
        Some(JobState::Completed) => 0,
        Some(JobState::Cancelled) => 130,
        _ => 1,
    })
}

/// Print each new history entry of `id` until the job is terminal.
async fn follow_job(dispatcher: &Dispatcher, id: JobId) -> Option<JobState> {
    let tracker = dispatcher.tracker();
    let mut printed = 0usize;
    loop {
        let job = tracker
            .wait_until(&id, |j| j.history().len() > printed || j.is_terminal())
            .await?;
        for entry in &job.history()[printed..] {
            println!(
                "{}  {:<12}  {}",
                entry.at.format("%H:%M:%S%.3f"),
                entry.state,
                entry.detail
            );
        }
        printed = job.history().len();

        if job.is_terminal() {
            if let Some(reason) = job.reason() {
                println!("job {id} {} ({reason})", job.state());
            } else {
                println!("job {id} {}", job.state());
            }
            return Some(job.state());
        }
    }
}

/// `check` output: the effective configuration after defaults.
fn print_check(cfg: &ConfigFile) {
    println!("launchpad config check");
    println!("  store.mode = {:?}", cfg.store.mode);
    println!("  store.root = {}", cfg.store.root.display());
    println!("  store.retention = {:?}", cfg.store.retention);
    println!();

    let d = &cfg.dispatch;
    println!("dispatch:");
    println!("  provision_attempts = {}", d.provision_retry.max_attempts);
    println!(
        "  provision_backoff = {:?} .. {:?}",
        d.provision_retry.base_delay, d.provision_retry.max_delay
    );
    println!("  request_timeout = {:?}", d.request_timeout);
    println!("  provision_timeout = {:?}", d.provision_timeout);
    println!("  poll_interval = {:?}", d.poll_interval);
    println!(
        "  transfer = {} attempts, {:?} apart, {:?} each",
        d.transfer_attempts, d.transfer_retry_delay, d.transfer_timeout
    );
    println!("  start_timeout = {:?}", d.start_timeout);
    println!("  run_window = {:?}", d.run_window);
    println!("  max_command_len = {}", d.max_command_len);
    println!("  terminate_on_finish = {}", d.terminate_on_finish);
    println!();

    match &cfg.tracker.journal {
        Some(path) => println!("tracker.journal = {}", path.display()),
        None => println!("tracker.journal = (in memory)"),
    }
    println!(
        "provider = {:?} (root {}, max {} environments)",
        cfg.provider.kind,
        cfg.provider.root.display(),
        cfg.provider.max_environments
    );

    debug!("config check complete");
}
