//! Abandonment sweeper and purge job.
//!
//! Both run on their own intervals, independent of request traffic, and only
//! touch orders that are unpaid and well past their age threshold.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::services::order_ledger::OrderLedger;

#[derive(Debug, Clone, Copy)]
pub struct SweeperSchedule {
    pub sweep_interval: Duration,
    pub purge_interval: Duration,
}

impl From<&AppConfig> for SweeperSchedule {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            sweep_interval: Duration::from_secs(cfg.sweep_interval_secs),
            purge_interval: Duration::from_secs(cfg.purge_interval_secs),
        }
    }
}

#[derive(Clone)]
pub struct AbandonmentSweeper {
    ledger: Arc<OrderLedger>,
}

impl AbandonmentSweeper {
    pub fn new(ledger: Arc<OrderLedger>) -> Self {
        Self { ledger }
    }

    pub async fn run_abandon_sweep(&self) -> Result<u64, ServiceError> {
        self.ledger.sweep_abandoned(Utc::now()).await
    }

    pub async fn run_purge(&self) -> Result<u64, ServiceError> {
        self.ledger.purge_abandoned(Utc::now()).await
    }

    /// Starts both jobs. They stop when `shutdown` flips.
    pub fn spawn(
        self,
        schedule: SweeperSchedule,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let sweeper = self.clone();
        let sweep = spawn_periodic(
            "abandon_sweep",
            schedule.sweep_interval,
            shutdown.clone(),
            move || {
                let sweeper = sweeper.clone();
                async move { sweeper.run_abandon_sweep().await }
            },
        );
        let purger = self;
        let purge = spawn_periodic("purge", schedule.purge_interval, shutdown, move || {
            let purger = purger.clone();
            async move { purger.run_purge().await }
        });
        vec![sweep, purge]
    }
}

fn spawn_periodic<F, Fut>(
    job: &'static str,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
    run: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<u64, ServiceError>> + Send,
{
    tokio::spawn(async move {
        info!(job, ?every, "background job started");
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match run().await {
                        Ok(count) if count > 0 => info!(job, count, "background job finished"),
                        Ok(_) => {}
                        Err(e) => error!(job, error = %e, "background job failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!(job, "background job stopped");
    })
}
