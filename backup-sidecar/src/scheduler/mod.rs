//! Scheduler main loop.
//!
//! A thin driver around [`ScheduleState`]: tick, run if due, sleep, repeat.
//! Runs are awaited to completion before the next tick, so two runs never
//! overlap.

pub mod schedule;

pub use schedule::{Action, IntervalUnit, Schedule, ScheduleState};

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Upper bound on the time between two schedule checks.
pub const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// One full backup cycle, triggered by the scheduler.
#[async_trait]
pub trait CycleRunner: Send + Sync {
    async fn run_cycle(&self, shutdown: &CancellationToken);
}

pub struct Scheduler<R> {
    state: ScheduleState,
    runner: R,
    poll: Duration,
}

impl<R: CycleRunner> Scheduler<R> {
    pub fn new(state: ScheduleState, runner: R) -> Self {
        Self {
            state,
            runner,
            poll: POLL_INTERVAL,
        }
    }

    /// Override the poll cap.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Loop until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            schedule = %self.state.schedule(),
            next_run = %self.state.next_fire(),
            "Scheduler started"
        );

        while !shutdown.is_cancelled() {
            if self.state.tick(Utc::now()) == Action::RunNow {
                self.runner.run_cycle(&shutdown).await;
                info!(next_run = %self.state.next_fire(), "Next backup scheduled");
                continue;
            }

            let pause = self.state.sleep_for(Utc::now(), self.poll);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("Scheduler stopped");
    }
}
