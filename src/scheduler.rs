//! Periodic refresh passes and the daily deals bot timer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::deals::DealsBot;
use crate::tracker::PriceTracker;

/// Owns the cron jobs and the cancellation signal shared by all passes.
pub struct Scheduler {
    sched: JobScheduler,
    cancel: CancellationToken,
    refresh_running: Arc<Mutex<()>>,
    bot_running: Arc<Mutex<()>>,
    grace: Duration,
}

impl Scheduler {
    /// Register the jobs and start ticking.
    ///
    /// When `run_on_startup` is set, a first refresh pass is spawned right away.
    pub async fn start(tracker: PriceTracker, bot: Arc<DealsBot>, settings: &Settings) -> Result<Self> {
        let sched = JobScheduler::new().await?;
        let cancel = CancellationToken::new();
        let refresh_running = Arc::new(Mutex::new(()));
        let bot_running = Arc::new(Mutex::new(()));

        let job_tracker = tracker.clone();
        let job_guard = refresh_running.clone();
        let job_cancel = cancel.clone();
        sched
            .add(Job::new_repeated_async(
                settings.refresh_interval,
                move |_uuid, _l| {
                    let tracker = job_tracker.clone();
                    let guard = job_guard.clone();
                    let cancel = job_cancel.clone();
                    Box::pin(async move {
                        refresh_pass(&tracker, &guard, &cancel).await;
                    })
                },
            )?)
            .await?;

        let job_guard = bot_running.clone();
        let job_cancel = cancel.clone();
        sched
            .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
                let bot = bot.clone();
                let guard = job_guard.clone();
                let cancel = job_cancel.clone();
                Box::pin(async move {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let Ok(_running) = guard.try_lock() else {
                        return;
                    };
                    if let Some(summary) = bot.tick(Local::now(), &cancel).await {
                        info!("Deals bot added {} products", summary.added);
                    }
                })
            })?)
            .await?;

        sched.start().await?;
        info!(
            "Scheduler started - refreshing every {} minutes",
            settings.refresh_interval.as_secs() / 60
        );

        if settings.run_on_startup {
            let guard = refresh_running.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                refresh_pass(&tracker, &guard, &cancel).await;
            });
        }

        Ok(Self {
            sched,
            cancel,
            refresh_running,
            bot_running,
            grace: settings.shutdown_grace,
        })
    }

    /// Stop scheduling, cancel running passes and wait for them to wind down.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Shutting down scheduler");
        self.cancel.cancel();
        self.sched.shutdown().await?;

        // Passes honour the grace period themselves; allow one more for teardown.
        let wait = self.grace.saturating_mul(2);
        let drained = tokio::time::timeout(wait, async {
            let _refresh = self.refresh_running.lock().await;
            let _bot = self.bot_running.lock().await;
        })
        .await;

        if drained.is_err() {
            warn!("Gave up waiting for running passes after {:?}", wait);
        }
        Ok(())
    }
}

/// One refresh pass followed by the image backfill; overlapping passes are skipped.
async fn refresh_pass(tracker: &PriceTracker, running: &Mutex<()>, cancel: &CancellationToken) {
    if cancel.is_cancelled() {
        return;
    }
    let Ok(_running) = running.try_lock() else {
        warn!("Previous refresh pass still running, skipping this one");
        return;
    };

    if let Err(e) = tracker.refresh_all(cancel).await {
        error!("Refresh pass failed: {}", e);
        return;
    }

    if cancel.is_cancelled() {
        return;
    }
    if let Err(e) = tracker
        .backfill_images(tracker.config().image_backfill_limit)
        .await
    {
        error!("Image backfill failed: {}", e);
    }
}
