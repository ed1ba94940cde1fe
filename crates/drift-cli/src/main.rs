//! driftctl - operator CLI.
//!
//! Reads the shared regions passively and talks to the running
//! supervisor through its control fifo.

mod view;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use drift_base::fifo::{open_fifo_wr, send_cmd};
use drift_base::lock::{lock_proc, ProcLock, ProcLockId};
use drift_config::Layout;
use drift_ipc::{exit_code, ControlCmd};

#[derive(Parser)]
#[command(name = "driftctl")]
#[command(version, about = "Drift operator CLI", long_about = None)]
struct Cli {
    /// Work directory (default: $DRIFT_WORK_DIR or ~/.drift)
    #[arg(long, env = "DRIFT_WORK_DIR", global = true)]
    work_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host table overview
    Status,
    /// Monitored-directory overview
    Dirs,
    /// Registered distribution rules
    Jobs {
        /// Obfuscate recipients in the listing
        #[arg(long)]
        blur: bool,
    },
    /// Queued and dispatched messages
    Queue,
    /// Sign history of the log pipeline
    Logs,
    /// Send a control command to the supervisor
    Ctl {
        /// Command name, e.g. retry, stop, search-old-files
        name: String,
    },
    /// Lift auto-paused hosts immediately
    Retry,
    /// Probe whether the supervisor is running
    Ping,
}

fn main() {
    let cli = Cli::parse();
    let work_dir = drift_config::resolve_work_dir(cli.work_dir.as_deref());
    let layout = Layout::new(&work_dir);

    let code = match run(&cli.command, &layout) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("driftctl: {e:#}");
            exit_code::INCORRECT
        }
    };
    std::process::exit(code);
}

fn run(command: &Commands, layout: &Layout) -> Result<i32> {
    match command {
        Commands::Status => view::print_hosts(layout),
        Commands::Dirs => view::print_dirs(layout),
        Commands::Jobs { blur } => view::print_jobs(layout, *blur),
        Commands::Queue => view::print_queue(layout),
        Commands::Logs => view::print_log_history(layout),
        Commands::Ctl { name } => send_control(layout, name),
        Commands::Retry => send_byte(layout, ControlCmd::Retry),
        Commands::Ping => ping(layout),
    }
}

fn send_control(layout: &Layout, name: &str) -> Result<i32> {
    let cmd = parse_command(name)
        .with_context(|| format!("unknown control command '{name}'"))?;
    send_byte(layout, cmd)
}

fn send_byte(layout: &Layout, cmd: ControlCmd) -> Result<i32> {
    let mut fifo = open_fifo_wr(&layout.fd_cmd_fifo)
        .context("supervisor control fifo not available (is driftfd running?)")?;
    send_cmd(cmd.as_byte(), &mut fifo)?;
    println!("sent {:?}", cmd);
    Ok(exit_code::SUCCESS)
}

fn ping(layout: &Layout) -> Result<i32> {
    match lock_proc(&layout.lock_file, ProcLockId::Dispatcher, true)? {
        ProcLock::Held { holder } => {
            println!("driftfd running: {holder}");
            Ok(exit_code::IS_ACTIVE)
        }
        ProcLock::Acquired(_) => {
            println!("driftfd not running");
            Ok(exit_code::IS_NOT_ACTIVE)
        }
    }
}

fn parse_command(name: &str) -> Result<ControlCmd> {
    use ControlCmd::*;
    let cmd = match name.to_ascii_lowercase().replace('-', "_").as_str() {
        "halt" => Halt,
        "stop" => Stop,
        "start" => Start,
        "save_stop" => SaveStop,
        "quick_stop" => QuickStop,
        "retry" => Retry,
        "debug" => Debug,
        "shutdown" => Shutdown,
        "shutdown_all" => ShutdownAll,
        "start_dispatcher" => StartDispatcher,
        "stop_dispatcher" => StopDispatcher,
        "check_file_dir" => CheckFileDir,
        "search_old_files" => SearchOldFiles,
        "flush_queue" | "dump_queue" => FlushMsgFifoDumpQueue,
        "check_table_entries" => CheckTableEntries,
        "is_alive" => IsAlive,
        other => bail!("no such command: {other}"),
    };
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_accepts_dashes() {
        assert_eq!(
            parse_command("search-old-files").unwrap(),
            ControlCmd::SearchOldFiles
        );
        assert_eq!(parse_command("RETRY").unwrap(), ControlCmd::Retry);
        assert!(parse_command("bogus").is_err());
    }
}
