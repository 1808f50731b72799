use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use chrono::Utc;
use clap::Args;
use engine::{Engine, ExecutionLedger, JobState, Submission};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::{info, warn};

use crate::config;
use crate::error::DaemonResult;

#[derive(Args)]
pub struct InitArgs {
    /// Directory to write the default scriptd.yaml into
    #[arg(long, default_value = ".")]
    dir: PathBuf,
}

pub async fn run_init(args: InitArgs) -> DaemonResult<()> {
    let path = config::generate(&args.dir).await?;
    info!(path = %path.display(), "wrote default config");
    Ok(())
}

#[derive(Args)]
pub struct StartArgs {
    /// Path to scriptd.yaml config file
    #[arg(long, short, env = "SCRIPTD_CONFIG")]
    config: PathBuf,
}

/// Run the engine until SIGTERM/SIGINT, with periodic maintenance
/// (record purge + ledger snapshot) in between.
pub async fn run_start(args: StartArgs) -> DaemonResult<()> {
    let config = config::load(&args.config).await?;
    tokio::fs::create_dir_all(&config.base_dir).await?;
    tokio::fs::create_dir_all(&config.engine.jobs_dir).await?;

    let snapshot_path = config.ledger_snapshot_path();
    let ledger = if tokio::fs::try_exists(&snapshot_path).await.unwrap_or(false) {
        let ledger = ExecutionLedger::load_snapshot(&snapshot_path, &config.engine.limits)?;
        // Jobs that were live when the previous supervisor died have no
        // process anymore; reconcile them before accepting new work.
        let swept = ledger.sweep_orphans();
        if swept > 0 {
            info!(swept, "reconciled jobs orphaned by restart");
        }
        ledger
    } else {
        ExecutionLedger::new(&config.engine.limits)
    };

    let retention_days = config.maintenance.retention_days;
    let maintenance_interval = Duration::from_secs(config.maintenance.interval_secs);
    let engine = Engine::with_ledger(config.engine, ledger)?;
    info!("scriptd ready");

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();
    let mut ticker = tokio::time::interval(maintenance_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = recv_signal(&mut sigterm) => {
                info!("received SIGTERM, draining");
                break;
            }
            _ = recv_signal(&mut sigint) => {
                info!("received SIGINT, draining");
                break;
            }
            _ = ticker.tick() => {
                maintain(&engine, &snapshot_path, retention_days);
            }
        }
    }

    let ledger = engine.shutdown().await;
    if let Err(e) = ledger.save_snapshot(&snapshot_path) {
        warn!(error = %e, "final ledger snapshot failed");
    }
    info!("scriptd stopped");
    Ok(())
}

fn maintain(engine: &Engine, snapshot_path: &Path, retention_days: u64) {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    engine.purge_older_than(cutoff);
    if let Err(e) = engine.save_snapshot(snapshot_path) {
        warn!(error = %e, "ledger snapshot failed");
    }
}

#[derive(Args)]
pub struct ExecArgs {
    /// Path to scriptd.yaml config file
    #[arg(long, short, env = "SCRIPTD_CONFIG")]
    config: PathBuf,
    /// User id to submit as
    #[arg(long, default_value_t = 0)]
    user: i64,
    /// Declared language (detected from the source when omitted)
    #[arg(long)]
    language: Option<String>,
    /// Lines of captured output to print when the job ends
    #[arg(long, default_value_t = 50)]
    tail: usize,
    /// Script file to submit
    file: PathBuf,
}

/// Submit a local script file, wait for it to finish, and print its output.
/// Ctrl-C stops the job through the normal graceful path.
pub async fn run_exec(args: ExecArgs) -> DaemonResult<ExitCode> {
    let config = config::load(&args.config).await?;
    tokio::fs::create_dir_all(&config.base_dir).await?;
    tokio::fs::create_dir_all(&config.engine.jobs_dir).await?;

    let engine = Engine::start(config.engine)?;
    let source = tokio::fs::read_to_string(&args.file).await?;
    let id = engine
        .submit(Submission::new(args.user, args.language, source))
        .await?;
    info!(job_id = %id, "job submitted");

    let mut sigint = signal(SignalKind::interrupt()).ok();
    let record = loop {
        let record = engine.status(id)?;
        if record.state.is_terminal() {
            break record;
        }
        tokio::select! {
            _ = recv_signal(&mut sigint) => {
                info!(job_id = %id, "interrupt, stopping job");
                engine.stop(id, args.user)?;
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }
    };

    for chunk in engine.logs(id, args.tail)? {
        println!("{}", chunk.line);
    }
    match &record.reason {
        Some(reason) => info!(state = %record.state, "job finished: {reason}"),
        None => info!(state = %record.state, "job finished"),
    }
    engine.shutdown().await;

    Ok(if record.state == JobState::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
