//! Deadline Sweeper - periodic enforcement of transfer deadlines
//!
//! Refunds funded transactions whose transfer window closed, retries
//! payouts that stalled at the settlement rail, and runs the group monitor
//! when one is attached.

use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

use crate::{group_monitor::GroupMonitor, transaction_manager::TransactionManager, EscrowResult};

/// Configuration for the sweeper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// Seconds between passes
    pub interval_secs: u64,
    pub enabled: bool,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            enabled: true,
        }
    }
}

/// What a single pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub refunded: usize,
    pub released: usize,
    /// Purchases refunded because another buyer holds the listing
    pub superseded: usize,
    /// Listings the group monitor flagged
    pub flagged: usize,
}

pub struct Sweeper {
    manager: Arc<TransactionManager>,
    monitor: Option<Arc<GroupMonitor>>,
    interval: Duration,
}

/// Running sweeper task
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop after the current pass and wait for the task to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Sweeper task ended abnormally: {}", e);
        }
    }
}

impl Sweeper {
    pub fn new(manager: Arc<TransactionManager>, config: &SweeperConfig) -> Self {
        Self {
            manager,
            monitor: None,
            interval: Duration::from_secs(config.interval_secs.max(1)),
        }
    }

    /// Also run the group monitor on every pass
    pub fn with_monitor(mut self, monitor: Arc<GroupMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// One pass over the ledger
    pub async fn run_once(&self) -> EscrowResult<SweepReport> {
        let refunded = self.manager.sweep_expired().await?.len();
        let released = self.manager.resume_stalled_releases().await?.len();
        let superseded = self.manager.refund_superseded_purchases().await?.len();
        let flagged = match &self.monitor {
            Some(monitor) => monitor.run_once().await.flagged,
            None => 0,
        };

        Ok(SweepReport {
            refunded,
            released,
            superseded,
            flagged,
        })
    }

    /// Sweep on every tick until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        info!("Deadline sweeper running every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(report) => {
                            if report != SweepReport::default() {
                                info!(
                                    "Sweep: refunded {}, released {}, superseded {}, flagged {}",
                                    report.refunded,
                                    report.released,
                                    report.superseded,
                                    report.flagged
                                );
                            }
                        }
                        Err(e) => warn!("Sweep error: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Deadline sweeper stopped");
    }

    /// Run on a background task
    pub fn spawn(self) -> SweeperHandle {
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(self.run(rx));
        SweeperHandle { shutdown: tx, task }
    }
}
