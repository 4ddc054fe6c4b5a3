//! Scheduled cleaning of timed-out sessions.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::manager::LifecycleManager;
use super::models::Selector;

/// Result of one reaper firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    /// A previous pass was still running.
    Skipped,
    Reaped(usize),
    Failed,
}

/// Periodically cleans up sessions older than `timeout`.
#[derive(Clone)]
pub struct Reaper {
    manager: Arc<LifecycleManager>,
    interval: Duration,
    timeout: chrono::Duration,
    in_flight: Arc<AtomicBool>,
}

/// Clears the in-flight flag when a pass finishes, even by panic.
struct PassGuard(Arc<AtomicBool>);

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Reaper {
    pub fn new(manager: Arc<LifecycleManager>, interval: Duration, timeout: Duration) -> Self {
        let timeout = chrono::Duration::from_std(timeout)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        Self {
            manager,
            interval,
            timeout,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns `None` unless both interval and timeout are configured.
    pub fn from_settings(
        manager: Arc<LifecycleManager>,
        interval_secs: Option<u64>,
        timeout_secs: Option<u64>,
    ) -> Option<Self> {
        match (interval_secs, timeout_secs) {
            (Some(interval), Some(timeout)) if interval > 0 => Some(Self::new(
                manager,
                Duration::from_secs(interval),
                Duration::from_secs(timeout),
            )),
            _ => None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one cleaning pass unless another is still running.
    pub async fn tick(&self) -> ReapOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Previous cleaning pass still running, skipping tick");
            return ReapOutcome::Skipped;
        }
        let _guard = PassGuard(self.in_flight.clone());

        match self.manager.cleanup(&Selector::OlderThan(self.timeout)).await {
            Ok(cleaned) => {
                if !cleaned.is_empty() {
                    info!(
                        count = cleaned.len(),
                        sessions = ?cleaned.iter().map(|s| s.session_name.as_str()).collect::<Vec<_>>(),
                        "Cleaned up timed-out sessions"
                    );
                }
                ReapOutcome::Reaped(cleaned.len())
            }
            Err(e) => {
                error!(error = %e, "Scheduled cleaning failed");
                ReapOutcome::Failed
            }
        }
    }

    /// Start the timer loop. Each pass runs in its own task so a slow pass
    /// makes the following ticks skip instead of queueing behind it.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; the first pass fires after one interval.
            ticker.tick().await;

            info!(
                interval_secs = self.interval.as_secs(),
                timeout_secs = self.timeout.num_seconds(),
                "Scheduled cleaning enabled"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Scheduled cleaning stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let reaper = self.clone();
                        tokio::spawn(async move {
                            reaper.tick().await;
                        });
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spinner::manager::SpinRequest;
    use crate::spinner::manager::tests::manager;
    use crate::spinner::command::CommandSpec;

    #[tokio::test]
    async fn test_from_settings_requires_both_values() {
        let (mgr, _, _) = manager((8000, 8001)).await;
        assert!(Reaper::from_settings(mgr.clone(), None, None).is_none());
        assert!(Reaper::from_settings(mgr.clone(), Some(60), None).is_none());
        assert!(Reaper::from_settings(mgr.clone(), None, Some(60)).is_none());
        assert!(Reaper::from_settings(mgr.clone(), Some(0), Some(60)).is_none());
        let reaper = Reaper::from_settings(mgr, Some(60), Some(3600)).unwrap();
        assert_eq!(reaper.interval(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_session_survives_until_timeout() {
        let (mgr, driver, clock) = manager((8000, 8001)).await;
        let reaper = Reaper::new(mgr.clone(), Duration::from_secs(1), Duration::from_secs(60));
        mgr.spin(SpinRequest::new("alice", CommandSpec::raw("mark db data.jsonl")))
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(59));
        assert_eq!(reaper.tick().await, ReapOutcome::Reaped(0));
        assert_eq!(mgr.list().await.unwrap().len(), 1);

        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(reaper.tick().await, ReapOutcome::Reaped(1));
        assert!(mgr.list().await.unwrap().is_empty());
        assert_eq!(driver.alive_count(), 0);
        assert_eq!(mgr.free_ports().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_tick_skips_while_pass_in_flight() {
        let (mgr, _, _) = manager((8000, 8001)).await;
        let reaper = Reaper::new(mgr, Duration::from_secs(1), Duration::from_secs(1));
        reaper.in_flight.store(true, Ordering::SeqCst);
        assert_eq!(reaper.tick().await, ReapOutcome::Skipped);

        reaper.in_flight.store(false, Ordering::SeqCst);
        assert_eq!(reaper.tick().await, ReapOutcome::Reaped(0));
        assert!(!reaper.in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_spawned_loop_reaps_and_stops_on_cancel() {
        let (mgr, _, clock) = manager((8000, 8001)).await;
        mgr.spin(SpinRequest::new("alice", CommandSpec::raw("mark db data.jsonl")))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(120));

        let reaper = Reaper::new(mgr.clone(), Duration::from_millis(20), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let handle = reaper.spawn(cancel.clone());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !mgr.list().await.unwrap().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "reaper never fired");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reaper loop did not stop")
            .unwrap();
    }
}
