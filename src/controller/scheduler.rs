use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::v2g_session::{OptimizeDecision, SessionManager};
use crate::config::SchedulerConfig;
use crate::context::OpContext;
use crate::error::V2gResult;
use crate::settlement::BatchPayoutSummary;

/// Task status tracking
#[derive(Debug, Clone, Default)]
pub struct TaskStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub success_count: u64,
    pub error_count: u64,
}

impl TaskStatus {
    fn begin(&mut self, now: DateTime<Utc>) {
        self.last_run = Some(now);
        self.run_count += 1;
    }

    fn succeed(&mut self, now: DateTime<Utc>) {
        self.last_success = Some(now);
        self.success_count += 1;
        self.last_error = None;
    }

    fn fail(&mut self, error: String) {
        self.error_count += 1;
        self.last_error = Some(error);
    }
}

/// Outcome of one optimization pass over the fleet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizeRound {
    pub started: u32,
    pub skipped: u32,
    pub failed: u32,
}

/// Periodic driver for auto-discharge and payout sweeps.
pub struct V2gScheduler {
    config: SchedulerConfig,
    manager: Arc<SessionManager>,
    optimize_status: Arc<RwLock<TaskStatus>>,
    payout_status: Arc<RwLock<TaskStatus>>,
    shutdown: CancellationToken,
}

impl V2gScheduler {
    pub fn new(manager: Arc<SessionManager>, config: SchedulerConfig) -> Self {
        Self {
            config,
            manager,
            optimize_status: Arc::new(RwLock::new(TaskStatus::default())),
            payout_status: Arc::new(RwLock::new(TaskStatus::default())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn both periodic tasks.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let scheduler = self.clone();
        let optimize = tokio::spawn(async move {
            scheduler.run_optimize_task().await;
        });

        let scheduler = self.clone();
        let payout = tokio::spawn(async move {
            scheduler.run_payout_task().await;
        });

        info!(
            fleet = self.config.fleet.len(),
            optimize_every_seconds = self.config.optimize_every_seconds,
            batch_payout_every_minutes = self.config.batch_payout_every_minutes,
            "V2G periodic tasks started"
        );
        vec![optimize, payout]
    }

    /// Stop the periodic tasks and cancel in-flight operations.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub async fn optimize_status(&self) -> TaskStatus {
        self.optimize_status.read().await.clone()
    }

    pub async fn payout_status(&self) -> TaskStatus {
        self.payout_status.read().await.clone()
    }

    fn context(&self) -> OpContext {
        OpContext::with_token(self.shutdown.child_token())
    }

    async fn run_optimize_task(&self) {
        let mut ticker = interval(Duration::from_secs(self.config.optimize_every_seconds.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = Utc::now();
            self.optimize_status.write().await.begin(now);

            let round = self.run_optimize_once().await;
            let mut status = self.optimize_status.write().await;
            if round.failed == 0 {
                status.succeed(now);
            } else {
                status.fail(format!("{} device(s) failed optimization", round.failed));
            }
        }
        info!("optimize task stopped");
    }

    async fn run_payout_task(&self) {
        let minutes = self.config.batch_payout_every_minutes.max(1);
        let mut ticker = interval(Duration::from_secs(minutes * 60));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = Utc::now();
            self.payout_status.write().await.begin(now);

            match self.run_payout_once().await {
                Ok(_) => self.payout_status.write().await.succeed(now),
                Err(e) => {
                    error!(error = %e, "batch payout sweep failed");
                    self.payout_status.write().await.fail(e.to_string());
                }
            }
        }
        info!("payout task stopped");
    }

    /// One optimization pass over every configured device, concurrently.
    pub async fn run_optimize_once(&self) -> OptimizeRound {
        let ctx = self.context();
        let results = join_all(self.config.fleet.iter().map(|entry| {
            let ctx = &ctx;
            async move {
                let result = self
                    .manager
                    .optimize_v2g(ctx, &entry.device_id, entry.owner_id)
                    .await;
                (entry, result)
            }
        }))
        .await;

        let mut round = OptimizeRound::default();
        for (entry, result) in results {
            match result {
                Ok(OptimizeDecision::Started(_)) => round.started += 1,
                Ok(OptimizeDecision::Skipped(_)) => round.skipped += 1,
                Err(e) => {
                    round.failed += 1;
                    warn!(device_id = %entry.device_id, error = %e, "optimization failed");
                }
            }
        }
        round
    }

    pub async fn run_payout_once(&self) -> V2gResult<BatchPayoutSummary> {
        self.manager
            .compensation()
            .batch_process_pending_payouts(&self.context())
            .await
    }
}
