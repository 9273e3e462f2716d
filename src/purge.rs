use std::time::Duration;

use tokio::{sync::oneshot, task::JoinHandle, time::MissedTickBehavior};

use crate::{config::PurgeConfig, store::Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeSchedule {
    pub interval: Duration,
    pub max_age: Duration,
}

impl From<&PurgeConfig> for PurgeSchedule {
    fn from(config: &PurgeConfig) -> Self {
        Self {
            interval: config.interval(),
            max_age: config.max_age(),
        }
    }
}

#[derive(Debug)]
pub struct PurgeHandle {
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl PurgeHandle {
    /// Stops the timer. A purge that is already running finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

/// Starts the background purge loop. The first purge runs immediately, then one
/// per `schedule.interval`; runs never overlap.
pub fn spawn(store: Store, schedule: PurgeSchedule) -> PurgeHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(schedule.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => run_once(&store, schedule.max_age).await,
            }
        }
        tracing::debug!("purge loop stopped");
    });

    PurgeHandle { shutdown_tx, join }
}

async fn run_once(store: &Store, max_age: Duration) {
    match store.purge_sessions(max_age).await {
        Ok(summary) if summary.sessions > 0 => {
            tracing::info!(
                sessions = summary.sessions,
                requests = summary.requests,
                max_age_secs = max_age.as_secs(),
                "purged expired sessions"
            );
        }
        Ok(_) => tracing::debug!(max_age_secs = max_age.as_secs(), "no expired sessions"),
        Err(err) => tracing::error!(code = err.code(), "{err}"),
    }
}
