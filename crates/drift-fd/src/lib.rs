//! # drift-fd
//!
//! The dispatch supervisor.
//!
//! ## Architecture
//!
//! One `driftfd` per work directory:
//! - owns the message queue region and the `msg.fifo` wake-ups,
//! - forks one transfer worker per dispatched message, recording the
//!   worker pid in the queue entry (which is the pool-directory
//!   ownership capability),
//! - runs the per-host error state machine (retry, auto-pause),
//! - answers the operator TCP protocol.
//!
//! Fifo readers are blocking threads bridged into the tokio loop over
//! an mpsc channel; child exits arrive on the same channel.

pub mod operator;
pub mod supervisor;

use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use drift_config::{Config, Layout};
use tokio::sync::mpsc;
use tracing::{info, warn};

pub use supervisor::{ActiveTransfer, FdEvent, Supervisor};

/// Main daemon entry point.
pub async fn run_daemon(layout: Layout, config: Config) -> Result<()> {
    let (tx, rx) = mpsc::channel::<FdEvent>(4096);
    let active: Arc<DashMap<i32, ActiveTransfer>> = Arc::new(DashMap::new());

    let mut supervisor = Supervisor::open(layout.clone(), config.clone(), active.clone())?;
    supervisor.restore_dump()?;
    supervisor.rescan_spool()?;

    // Fifo readers (msg.fifo wake-ups, control bytes).
    supervisor::spawn_fifo_reader(
        layout.fifodir.join(drift_queue::MSG_FIFO),
        tx.clone(),
        supervisor::FifoRole::MsgQueue,
    );
    supervisor::spawn_fifo_reader(
        layout.fd_cmd_fifo.clone(),
        tx.clone(),
        supervisor::FifoRole::Control,
    );

    // Operator TCP service.
    if config.operator.enabled {
        let op = operator::OperatorService {
            layout: layout.clone(),
            bind: config.operator.bind.clone(),
            port: config.operator.port,
            active: active.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = op.run().await {
                warn!(error = %e, "operator service stopped");
            }
        });
    }

    info!("driftfd ready");
    supervisor.run(rx, tx).await
}
