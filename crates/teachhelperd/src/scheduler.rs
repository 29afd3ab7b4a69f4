//! Fixed-rate background jobs.
//!
//! Each registered [`PeriodicJob`] runs on its own tokio task. The first
//! run happens one interval after registration. A failing run is logged
//! and the job keeps its schedule.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[async_trait]
pub trait PeriodicJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> anyhow::Result<()>;
}

pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    jobs: Vec<(String, JoinHandle<()>)>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            jobs: Vec::new(),
        }
    }

    /// Run `job` every `every` until [`Scheduler::shutdown`].
    pub fn register(&mut self, job: Arc<dyn PeriodicJob>, every: Duration) {
        let name = job.name().to_string();
        let mut shutdown = self.shutdown.subscribe();
        let every = every.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut timer = interval(every);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately.
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = timer.tick() => match job.run().await {
                        Ok(()) => debug!(job = %job.name(), "periodic job ran"),
                        Err(e) => warn!(job = %job.name(), error = %e, "periodic job failed"),
                    },
                }
            }
        });

        info!(job = %name, every_ms = every.as_millis() as u64, "registered periodic job");
        self.jobs.push((name, handle));
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Signal every job to stop and wait for them to exit.
    ///
    /// A run already in progress is allowed to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (name, handle) in self.jobs {
            if let Err(e) = handle.await {
                warn!(job = %name, error = %e, "periodic job ended abnormally");
            }
        }
        debug!("scheduler stopped");
    }
}
