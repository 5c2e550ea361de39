//! Connection liveness probing.
//!
//! A background task probes the server on a fixed interval. After
//! `max_failures` consecutive failed probes the connection is presumed
//! dead and the task asks its target to reconnect, then keeps probing the
//! new connection.

use std::future::Future;
use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::errors::McpError;

/// Consecutive-failure counter for one heartbeat loop.
#[derive(Debug, Clone)]
pub struct HeartbeatState {
    consecutive_failures: u32,
    max_failures: u32,
}

impl HeartbeatState {
    pub fn new(max_failures: u32) -> Self {
        Self {
            consecutive_failures: 0,
            max_failures: max_failures.max(1),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Count a failed probe. Returns `true` when the threshold is reached.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        self.consecutive_failures >= self.max_failures
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}

/// Probe cadence.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_failures: u32,
}

/// What the heartbeat loop monitors.
pub trait HeartbeatTarget: Send + Sync + 'static {
    /// One lightweight round trip bounded by `timeout`.
    fn probe(&self, timeout: Duration) -> impl Future<Output = Result<(), McpError>> + Send;

    /// Replace the presumed-dead connection.
    fn reconnect(&self) -> impl Future<Output = Result<(), McpError>> + Send;
}

/// Handle to a running heartbeat task.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    handle: JoinHandle<()>,
}

impl HeartbeatMonitor {
    /// Start probing. The task ends on its own once `target` is dropped.
    pub fn spawn<T: HeartbeatTarget>(target: Weak<T>, settings: HeartbeatSettings) -> Self {
        Self {
            handle: tokio::spawn(run(target, settings)),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the loop and wait for it to unwind.
    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }

    /// Cancel without waiting; used from `Drop`.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

async fn run<T: HeartbeatTarget>(target: Weak<T>, settings: HeartbeatSettings) {
    let mut state = HeartbeatState::new(settings.max_failures);
    tracing::debug!(
        interval_ms = settings.interval.as_millis() as u64,
        max_failures = settings.max_failures,
        "heartbeat started"
    );

    loop {
        tokio::time::sleep(settings.interval).await;

        let Some(target) = target.upgrade() else {
            tracing::debug!("heartbeat target dropped, stopping");
            return;
        };

        match target.probe(settings.timeout).await {
            Ok(()) => {
                if state.consecutive_failures() > 0 {
                    tracing::info!(
                        after_failures = state.consecutive_failures(),
                        "heartbeat recovered"
                    );
                }
                state.record_success();
            }
            Err(e) => {
                let reached = state.record_failure();
                tracing::warn!(
                    failures = state.consecutive_failures(),
                    max_failures = settings.max_failures,
                    error = %e,
                    "heartbeat probe failed"
                );
                if reached {
                    tracing::error!("connection presumed dead, reconnecting");
                    match target.reconnect().await {
                        Ok(()) => tracing::info!("heartbeat reconnect succeeded"),
                        Err(e) => tracing::error!(error = %e, "heartbeat reconnect failed"),
                    }
                    state.reset();
                }
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_state_counts_consecutive_failures() {
        let mut state = HeartbeatState::new(3);
        assert!(!state.record_failure());
        assert!(!state.record_failure());
        state.record_success();
        assert_eq!(state.consecutive_failures(), 0);

        assert!(!state.record_failure());
        assert!(!state.record_failure());
        assert!(state.record_failure());
    }

    #[test]
    fn test_state_zero_max_is_treated_as_one() {
        let mut state = HeartbeatState::new(0);
        assert!(state.record_failure());
    }

    /// Fails the first `fail_first` probes, then succeeds.
    struct ScriptedTarget {
        fail_first: u32,
        probes: AtomicU32,
        reconnects: AtomicU32,
    }

    impl ScriptedTarget {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                probes: AtomicU32::new(0),
                reconnects: AtomicU32::new(0),
            })
        }
    }

    impl HeartbeatTarget for ScriptedTarget {
        fn probe(&self, _timeout: Duration) -> impl Future<Output = Result<(), McpError>> + Send {
            let n = self.probes.fetch_add(1, Ordering::SeqCst);
            let fail = n < self.fail_first;
            async move {
                if fail {
                    Err(McpError::transient("probe timed out"))
                } else {
                    Ok(())
                }
            }
        }

        fn reconnect(&self) -> impl Future<Output = Result<(), McpError>> + Send {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        }
    }

    fn fast(max_failures: u32) -> HeartbeatSettings {
        HeartbeatSettings {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(5),
            max_failures,
        }
    }

    async fn wait_for_probes(target: &ScriptedTarget, n: u32) {
        for _ in 0..400 {
            if target.probes.load(Ordering::SeqCst) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("only {} probes ran", target.probes.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failures_below_threshold_never_reconnect() {
        let target = ScriptedTarget::new(2);
        let monitor = HeartbeatMonitor::spawn(Arc::downgrade(&target), fast(3));

        wait_for_probes(&target, 10).await;
        monitor.stop().await;

        assert_eq!(target.reconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_threshold_triggers_exactly_one_reconnect() {
        let target = ScriptedTarget::new(3);
        let monitor = HeartbeatMonitor::spawn(Arc::downgrade(&target), fast(3));

        wait_for_probes(&target, 10).await;
        monitor.stop().await;

        assert_eq!(target.reconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_counter_resets_after_reconnect() {
        // Six failures with a threshold of three: two separate reconnects.
        let target = ScriptedTarget::new(6);
        let monitor = HeartbeatMonitor::spawn(Arc::downgrade(&target), fast(3));

        wait_for_probes(&target, 12).await;
        monitor.stop().await;

        assert_eq!(target.reconnects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_loop_ends_when_target_dropped() {
        let target = ScriptedTarget::new(0);
        let monitor = HeartbeatMonitor::spawn(Arc::downgrade(&target), fast(3));
        drop(target);

        for _ in 0..200 {
            if monitor.is_finished() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("heartbeat kept running without a target");
    }
}
