//! Dispatcher: turns registry targets into capture workers.
//!
//! Every cycle the dispatcher snapshots the registry, skips targets whose
//! lock is present, and spawns a worker for each remaining target while the
//! pool has a free permit. The lock check is only a filter; the worker's own
//! atomic lock acquisition is what rules out double capture.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::capture::{CaptureContext, CaptureOutcome, run_capture};
use crate::config::CaptureConfig;
use crate::registry::TargetRegistry;

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Cycle period, measured from cycle start.
    pub interval: Duration,
    /// Maximum simultaneous workers.
    pub max_concurrent: usize,
}

impl From<&CaptureConfig> for DispatcherConfig {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            interval: config.dispatch_interval(),
            max_concurrent: config.max_concurrent_captures,
        }
    }
}

/// What one dispatch cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: usize,
    pub skipped_locked: usize,
    /// Targets left for a later cycle because the pool was full.
    pub deferred: usize,
}

pub struct Dispatcher {
    registry: Arc<TargetRegistry>,
    ctx: Arc<CaptureContext>,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<TargetRegistry>,
        ctx: Arc<CaptureContext>,
        config: DispatcherConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            registry,
            ctx,
            config,
            permits,
        }
    }

    /// Workers currently holding a pool permit.
    pub fn active_workers(&self) -> usize {
        self.config.max_concurrent.max(1) - self.permits.available_permits()
    }

    /// Run one dispatch cycle, spawning workers into `tasks`.
    pub async fn dispatch_once(&self, tasks: &mut JoinSet<CaptureOutcome>) -> DispatchStats {
        let mut stats = DispatchStats::default();
        let targets = self.registry.snapshot();

        let mut pending = Vec::with_capacity(targets.len());
        for target in targets {
            if self.ctx.locks.is_locked(&target.name).await {
                trace!(target_name = %target.name, "Target locked, skipping");
                stats.skipped_locked += 1;
            } else {
                pending.push(target);
            }
        }

        for (index, target) in pending.iter().enumerate() {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                stats.deferred = pending.len() - index;
                debug!(deferred = stats.deferred, "Worker pool full");
                break;
            };

            let ctx = self.ctx.clone();
            let target = target.clone();
            debug!(target_name = %target.name, "Dispatching capture");
            tasks.spawn(async move {
                let _permit = permit;
                run_capture(&ctx, target).await
            });
            stats.dispatched += 1;
        }

        stats
    }

    /// Dispatch on a fixed interval until `cancel` fires.
    ///
    /// On cancellation in-flight workers are aborted: their recorder children
    /// are killed, partial fragments stay on disk, and any lock left behind
    /// is purged at the next startup.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks: JoinSet<CaptureOutcome> = JoinSet::new();

        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            max_concurrent = self.config.max_concurrent,
            "Dispatcher started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    reap_finished(&mut tasks);
                    let stats = self.dispatch_once(&mut tasks).await;
                    if stats.dispatched > 0 || stats.deferred > 0 {
                        debug!(
                            dispatched = stats.dispatched,
                            skipped_locked = stats.skipped_locked,
                            deferred = stats.deferred,
                            active = self.active_workers(),
                            "Dispatch cycle"
                        );
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "Dispatcher stopping");
        tasks.shutdown().await;
    }
}

fn reap_finished(tasks: &mut JoinSet<CaptureOutcome>) {
    while let Some(result) = tasks.try_join_next() {
        match result {
            Ok(outcome) => trace!(?outcome, "Capture worker finished"),
            Err(e) if e.is_panic() => error!(error = %e, "Capture worker panicked"),
            Err(e) => debug!(error = %e, "Capture worker aborted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::fallback::{FallbackSets, RetryConfig};
    use crate::lock::LockManager;
    use crate::recorder::test_support::{FakeAttempt, FakeRecorder};
    use crate::registry::Target;
    use tempfile::TempDir;

    fn setup(temp: &TempDir, max_concurrent: usize) -> (Dispatcher, Arc<TargetRegistry>, Arc<CaptureContext>) {
        let data = temp.path();
        let config = CaptureConfig {
            lock_dir: data.join("locks"),
            segments_dir: data.join("segments"),
            output_dir: data.join("videos"),
            max_concurrent_captures: max_concurrent,
            retry: RetryConfig {
                max_primary_attempts: 1,
                backoff_secs: 0,
            },
            ..Default::default()
        };
        let recorder = Arc::new(FakeRecorder::new([], FakeAttempt::Record(b"x".to_vec())));
        let ctx = Arc::new(
            CaptureContext::from_config(
                &config,
                LockManager::with_dir(&config.lock_dir).unwrap(),
                Arc::new(FallbackSets::in_memory()),
                recorder,
                EventBus::default(),
            )
            .unwrap(),
        );
        let registry = Arc::new(TargetRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone(), ctx.clone(), DispatcherConfig::from(&config));
        (dispatcher, registry, ctx)
    }

    #[tokio::test]
    async fn test_locked_targets_are_skipped() {
        let temp = TempDir::new().unwrap();
        let (dispatcher, registry, ctx) = setup(&temp, 8);
        registry.upsert(Target::new("a", "https://x/stream-1_a.m3u8"));
        registry.upsert(Target::new("b", "https://x/stream-2_a.m3u8"));
        let _held = ctx.locks.try_acquire("a").await.unwrap().unwrap();

        let mut tasks = JoinSet::new();
        let stats = dispatcher.dispatch_once(&mut tasks).await;

        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.skipped_locked, 1);
        let outcome = tasks.join_next().await.unwrap().unwrap();
        assert!(matches!(outcome, CaptureOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_pool_bound_defers_extra_targets() {
        let temp = TempDir::new().unwrap();
        let (dispatcher, registry, _ctx) = setup(&temp, 2);
        for name in ["a", "b", "c", "d"] {
            registry.upsert(Target::new(name, format!("https://x/stream-{name}_a.m3u8")));
        }

        let mut tasks = JoinSet::new();
        let stats = dispatcher.dispatch_once(&mut tasks).await;

        assert_eq!(stats.dispatched, 2);
        assert_eq!(stats.deferred, 2);
        assert_eq!(dispatcher.active_workers(), 2);

        while tasks.join_next().await.is_some() {}
        assert_eq!(dispatcher.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let temp = TempDir::new().unwrap();
        let (dispatcher, registry, _ctx) = setup(&temp, 4);
        registry.upsert(Target::new("a", "https://x/stream-1_a.m3u8"));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatcher.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
