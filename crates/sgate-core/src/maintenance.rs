//! Process-wide periodic tasks (§4.5): session sweep, cooldown recovery,
//! request-log pruning, and daily API-key counter reset.
//!
//! Each task runs in its own `tokio::spawn`ed loop rather than one scheduler
//! thread doing everything. All four are idempotent; a failed pass logs and
//! the loop continues to the next tick rather than aborting the task.

use std::sync::Arc;
use std::time::Duration;

use sgate_provider::ProviderScheduler;
use sgate_storage::GatewayStorage;
use time::{OffsetDateTime, Time};

#[derive(Debug, Clone, Copy)]
pub struct MaintenanceConfig {
    pub session_cleanup_interval: Duration,
    pub recovery_interval: Duration,
    pub log_retention: time::Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            session_cleanup_interval: Duration::from_secs(300),
            recovery_interval: Duration::from_secs(60),
            log_retention: time::Duration::days(30),
        }
    }
}

/// Spawns the four maintenance loops and returns immediately; the loops run
/// for the lifetime of the process.
pub fn spawn_maintenance_tasks<S: GatewayStorage + 'static>(
    storage: Arc<S>,
    scheduler: Arc<ProviderScheduler<S>>,
    config: MaintenanceConfig,
) {
    spawn_session_sweep(storage.clone(), config.session_cleanup_interval);
    spawn_cooldown_recovery(scheduler, config.recovery_interval);
    spawn_daily_at(storage.clone(), Time::from_hms(3, 0, 0).unwrap(), {
        let retention = config.log_retention;
        move |storage| {
            let storage = storage.clone();
            async move {
                let cutoff = OffsetDateTime::now_utc() - retention;
                match storage.prune_request_logs_older_than(cutoff).await {
                    Ok(count) => {
                        tracing::info!(event = "request_log_prune", deleted = count)
                    }
                    Err(err) => {
                        tracing::warn!(event = "request_log_prune_failed", %err)
                    }
                }
            }
        }
    });
    spawn_daily_at(storage, Time::from_hms(0, 0, 0).unwrap(), |storage| {
        let storage = storage.clone();
        async move {
            match storage.reset_daily_usage().await {
                Ok(count) => tracing::info!(event = "daily_usage_reset", keys = count),
                Err(err) => tracing::warn!(event = "daily_usage_reset_failed", %err),
            }
        }
    });
}

fn spawn_session_sweep<S: GatewayStorage + 'static>(storage: Arc<S>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match storage.delete_stale_sessions(OffsetDateTime::now_utc()).await {
                Ok(count) => {
                    if count > 0 {
                        tracing::info!(event = "session_sweep", deleted = count);
                    }
                }
                Err(err) => tracing::warn!(event = "session_sweep_failed", %err),
            }
        }
    });
}

fn spawn_cooldown_recovery<S: GatewayStorage + 'static>(
    scheduler: Arc<ProviderScheduler<S>>,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match scheduler.recover_cooling_providers().await {
                Ok(count) => {
                    if count > 0 {
                        tracing::info!(event = "cooldown_recovery", recovered = count);
                    }
                }
                Err(err) => tracing::warn!(event = "cooldown_recovery_failed", %err),
            }
        }
    });
}

/// Runs `task` once a day at `at` local time, sleeping until the next
/// occurrence (today's if still ahead, otherwise tomorrow's) after each run.
fn spawn_daily_at<S, F, Fut>(storage: Arc<S>, at: Time, task: F)
where
    S: GatewayStorage + 'static,
    F: Fn(&Arc<S>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        loop {
            let sleep_for = duration_until_next(at);
            tokio::time::sleep(sleep_for).await;
            task(&storage).await;
        }
    });
}

fn duration_until_next(at: Time) -> Duration {
    let now = OffsetDateTime::now_utc();
    let today_at = now.replace_time(at);
    let next = if today_at > now {
        today_at
    } else {
        today_at + time::Duration::days(1)
    };
    let diff = next - now;
    Duration::from_millis(diff.whole_milliseconds().max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn future_time_today_is_chosen_directly() {
        let now = OffsetDateTime::now_utc();
        let future = (now + time::Duration::minutes(1)).time();
        let wait = duration_until_next(future);
        assert!(wait <= Duration::from_secs(61));
    }

    #[test]
    fn past_time_today_rolls_to_tomorrow() {
        let now = OffsetDateTime::now_utc();
        let past = (now - time::Duration::minutes(1)).time();
        let wait = duration_until_next(past);
        assert!(wait > Duration::from_secs(23 * 3600));
    }
}
