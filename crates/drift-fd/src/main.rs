//! driftfd - the dispatch supervisor.
//!
//! Usage:
//!   driftfd [--work-dir /path] [--strict-accounting]

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use drift_base::lock::{lock_proc, ProcLock, ProcLockId};
use drift_config::{init_logging, Config, Layout, LogLevel};
use drift_ipc::exit_code;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "driftfd")]
#[command(version, about = "Drift dispatch supervisor", long_about = None)]
struct Cli {
    /// Work directory (default: $DRIFT_WORK_DIR or ~/.drift)
    #[arg(long, env = "DRIFT_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Escalate repaired counter drift to event-log records
    #[arg(long)]
    strict_accounting: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(LogLevel::Info);
    let cli = Cli::parse();

    let work_dir = drift_config::resolve_work_dir(cli.work_dir.as_deref());
    let layout = Layout::new(&work_dir);
    layout.ensure()?;

    let mut config = Config::load(&work_dir)?;
    if cli.strict_accounting {
        config.fd.strict_accounting = true;
    }

    // One supervisor per work directory.
    let _guard = match lock_proc(&layout.lock_file, ProcLockId::Dispatcher, false)? {
        ProcLock::Acquired(g) => g,
        ProcLock::Held { holder } => {
            error!(holder, "dispatch supervisor already running");
            std::process::exit(exit_code::IS_ACTIVE);
        }
    };

    info!(work_dir = %work_dir.display(), "starting driftfd");
    drift_fd::run_daemon(layout, config).await
}
