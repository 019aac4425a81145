//! End-to-end tests for the capture engine.
//!
//! These drive the public API with an in-process recorder that writes
//! scripted bytes instead of spawning ffmpeg.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use live_rec::Result;
use live_rec::capture::{CaptureContext, CaptureOutcome, run_capture};
use live_rec::config::CaptureConfig;
use live_rec::consolidator::Consolidator;
use live_rec::events::{CaptureEvent, EventBus};
use live_rec::fallback::{FallbackSets, Protocol, RetryConfig};
use live_rec::lock::{FileLockStore, LockManager};
use live_rec::recorder::{RecordExit, RecordRequest, Recorder, parse_concat_list};
use live_rec::registry::{Target, TargetRegistry};
use live_rec::scheduler::{Dispatcher, DispatcherConfig};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Recorder that writes `payload` on success and nothing on failure.
///
/// While `gate` has no permits, every recording blocks, which keeps a worker
/// in flight for as long as a test needs.
struct ScriptedRecorder {
    outcomes: Mutex<VecDeque<bool>>,
    default_success: bool,
    payload: Vec<u8>,
    gate: Option<Arc<Semaphore>>,
    calls: Mutex<Vec<RecordRequest>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedRecorder {
    fn new(default_success: bool) -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            default_success,
            payload: b"media".to_vec(),
            gate: None,
            calls: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn calls(&self) -> Vec<RecordRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Recorder for ScriptedRecorder {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn record(&self, request: &RecordRequest) -> Result<RecordExit> {
        self.calls.lock().push(request.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.expect("gate closed");
            permit.forget();
        }

        let success = self
            .outcomes
            .lock()
            .pop_front()
            .unwrap_or(self.default_success);
        if success {
            tokio::fs::write(&request.output, &self.payload).await?;
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(if success {
            RecordExit::clean()
        } else {
            RecordExit::failed(1, "HTTP error 404 Not Found")
        })
    }

    /// Resolves list entries the way ffmpeg's concat demuxer does: relative
    /// to the list file's directory.
    async fn concat(&self, list_file: &Path, output: &Path) -> Result<()> {
        let list = tokio::fs::read_to_string(list_file).await?;
        let base = list_file.parent().unwrap_or(Path::new(""));
        let mut merged = Vec::new();
        for path in parse_concat_list(&list) {
            merged.extend(tokio::fs::read(base.join(path)).await?);
        }
        tokio::fs::write(output, merged).await?;
        Ok(())
    }

    fn is_available(&self) -> bool {
        true
    }

    fn version(&self) -> Option<String> {
        None
    }
}

struct Engine {
    temp: TempDir,
    config: CaptureConfig,
    ctx: Arc<CaptureContext>,
    registry: Arc<TargetRegistry>,
    recorder: Arc<ScriptedRecorder>,
}

impl Engine {
    fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.registry.clone(),
            self.ctx.clone(),
            DispatcherConfig::from(&self.config),
        )
    }

    fn fallback_file(&self) -> PathBuf {
        self.temp.path().join("fallback_targets.txt")
    }

    fn artifacts(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = std::fs::read_dir(&self.config.output_dir)
            .map(|rd| rd.flatten().map(|e| e.path()).collect())
            .unwrap_or_default();
        out.sort();
        out
    }
}

async fn engine(recorder: ScriptedRecorder) -> Engine {
    let temp = TempDir::new().expect("temp dir");
    let data = temp.path();
    let config = CaptureConfig {
        lock_dir: data.join("locks"),
        segments_dir: data.join("segments"),
        output_dir: data.join("videos"),
        fallback_file: data.join("fallback_targets.txt"),
        always_secondary_file: data.join("always_secondary.txt"),
        retry: RetryConfig {
            max_primary_attempts: 12,
            backoff_secs: 0,
        },
        ..Default::default()
    };

    let recorder = Arc::new(recorder);
    let fallback = Arc::new(
        FallbackSets::load(&config.fallback_file, Some(config.always_secondary_file.as_path()))
            .await
            .expect("fallback sets"),
    );
    let ctx = Arc::new(
        CaptureContext::from_config(
            &config,
            LockManager::with_dir(&config.lock_dir).expect("locks"),
            fallback,
            recorder.clone(),
            EventBus::default(),
        )
        .expect("context"),
    );

    Engine {
        temp,
        config,
        ctx,
        registry: Arc::new(TargetRegistry::new()),
        recorder,
    }
}

fn alice() -> Target {
    Target::new("alice", "https://edge.example/stream-7301_or4/index.m3u8")
        .with_secondary("https://edge.example/stream-7301_or4.flv")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

mod mutual_exclusion {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_workers_for_one_target() {
        let gate = Arc::new(Semaphore::new(0));
        let engine = engine(ScriptedRecorder::new(true).gated(gate.clone())).await;

        let mut tasks = JoinSet::new();
        for _ in 0..8 {
            let ctx = engine.ctx.clone();
            tasks.spawn(async move { run_capture(&ctx, alice()).await });
        }

        wait_until(|| engine.recorder.calls().len() == 1).await;
        gate.add_permits(1);

        let mut completed = 0;
        let mut held = 0;
        while let Some(result) = tasks.join_next().await {
            match result.unwrap() {
                CaptureOutcome::Completed { .. } => completed += 1,
                CaptureOutcome::LockHeld => held += 1,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }

        assert_eq!(completed, 1);
        assert_eq!(held, 7);
        assert_eq!(engine.recorder.max_running.load(Ordering::SeqCst), 1);
        assert!(!engine.ctx.locks.is_locked("alice").await);
    }

    #[tokio::test]
    async fn test_repeated_dispatch_does_not_double_capture() {
        let gate = Arc::new(Semaphore::new(0));
        let engine = engine(ScriptedRecorder::new(true).gated(gate.clone())).await;
        engine.registry.upsert(alice());
        let dispatcher = engine.dispatcher();

        let mut tasks = JoinSet::new();
        dispatcher.dispatch_once(&mut tasks).await;
        wait_until(|| engine.recorder.calls().len() == 1).await;
        assert!(engine.ctx.locks.is_locked("alice").await);

        for _ in 0..3 {
            let stats = dispatcher.dispatch_once(&mut tasks).await;
            assert_eq!(stats.dispatched, 0);
            assert_eq!(stats.skipped_locked, 1);
        }

        gate.add_permits(1);
        while tasks.join_next().await.is_some() {}
        assert_eq!(engine.recorder.calls().len(), 1);
    }
}

mod startup_recovery {
    use super::*;

    #[tokio::test]
    async fn test_purge_makes_stale_targets_dispatchable() {
        let engine = engine(ScriptedRecorder::new(true)).await;
        let store = FileLockStore::new(&engine.config.lock_dir).unwrap();
        let names = ["a", "b", "c"];
        for name in names {
            std::fs::write(store.lock_path(name), b"stale").unwrap();
            engine
                .registry
                .upsert(Target::new(name, format!("https://x/stream-{}_a.m3u8", name.len())));
        }

        let dispatcher = engine.dispatcher();
        let mut tasks = JoinSet::new();
        assert_eq!(dispatcher.dispatch_once(&mut tasks).await.dispatched, 0);

        assert_eq!(engine.ctx.locks.purge_all().await.unwrap(), names.len());
        assert!(engine.ctx.locks.locked_targets().await.unwrap().is_empty());

        let stats = dispatcher.dispatch_once(&mut tasks).await;
        assert_eq!(stats.dispatched, names.len());
        while tasks.join_next().await.is_some() {}
        assert_eq!(engine.artifacts().len(), names.len());
    }
}

mod fallback_sequencing {
    use super::*;

    #[tokio::test]
    async fn test_twelve_primary_failures_then_one_secondary() {
        let engine = engine(ScriptedRecorder::new(false)).await;
        let mut events = engine.ctx.events.subscribe();

        let outcome = run_capture(&engine.ctx, alice()).await;

        assert!(matches!(outcome, CaptureOutcome::Exhausted { .. }));
        let calls = engine.recorder.calls();
        assert_eq!(calls.len(), 13);
        assert!(calls[..12].iter().all(|c| c.protocol == Protocol::Primary));
        assert_eq!(calls[12].protocol, Protocol::Secondary);
        assert!(calls.iter().all(|c| c.session_id == "7301"));

        let persisted = std::fs::read_to_string(engine.fallback_file()).unwrap();
        assert_eq!(persisted.lines().collect::<Vec<_>>(), vec!["alice"]);
        assert!(engine.artifacts().is_empty());
        assert!(!engine.ctx.locks.is_locked("alice").await);

        let mut failed = 0;
        let mut exhausted = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                CaptureEvent::AttemptFailed { .. } => failed += 1,
                CaptureEvent::SessionExhausted { .. } => exhausted += 1,
                _ => {}
            }
        }
        assert_eq!(failed, 13);
        assert_eq!(exhausted, 1);
    }

    #[tokio::test]
    async fn test_next_session_goes_straight_to_secondary() {
        let engine = engine(ScriptedRecorder::new(false)).await;
        run_capture(&engine.ctx, alice()).await;

        engine.recorder.outcomes.lock().push_back(true);
        let before = engine.recorder.calls().len();
        let outcome = run_capture(&engine.ctx, alice()).await;

        assert!(matches!(outcome, CaptureOutcome::Completed { .. }));
        let calls = engine.recorder.calls();
        assert_eq!(calls.len(), before + 1);
        assert_eq!(calls[before].protocol, Protocol::Secondary);
        assert_eq!(engine.artifacts()[0].extension().unwrap(), "flv");
    }

    #[tokio::test]
    async fn test_always_secondary_never_tries_primary() {
        let engine = engine(ScriptedRecorder::new(true)).await;
        std::fs::write(&engine.config.always_secondary_file, "alice\n").unwrap();
        engine
            .ctx
            .fallback
            .reload_pinned(&engine.config.always_secondary_file)
            .await
            .unwrap();

        run_capture(&engine.ctx, alice()).await;

        let calls = engine.recorder.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].protocol, Protocol::Secondary);
        assert!(!engine.fallback_file().exists());
    }
}

mod consolidation {
    use super::*;

    #[tokio::test]
    async fn test_fragments_merge_in_chronological_order() {
        let engine = engine(ScriptedRecorder::new(true)).await;
        let dir = engine.config.segments_dir.join("A");
        std::fs::create_dir_all(&dir).unwrap();
        for (name, body) in [
            ("A_123_2024-05-01_10-20-00-000.mp4", "t3"),
            ("A_123_2024-05-01_10-00-00-000.mp4", "t1,"),
            ("A_123_2024-05-01_10-10-00-000.mp4", "t2,"),
        ] {
            std::fs::write(dir.join(name), body).unwrap();
        }

        let consolidator = Consolidator::new(
            engine.recorder.clone(),
            &engine.config.segments_dir,
            &engine.config.output_dir,
            ["mp4".to_string(), "flv".to_string()],
        );
        let report = consolidator.consolidate("A", "123").await.unwrap();

        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(std::fs::read_to_string(&report.artifacts[0]).unwrap(), "t1,t2,t3");
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_zero_fragments_is_a_quiet_no_op() {
        let engine = engine(ScriptedRecorder::new(true)).await;
        let consolidator = Consolidator::new(
            engine.recorder.clone(),
            &engine.config.segments_dir,
            &engine.config.output_dir,
            ["mp4".to_string()],
        );

        let report = consolidator.consolidate("nobody", "1").await.unwrap();

        assert!(report.is_empty());
        assert!(!engine.config.output_dir.exists());
    }
}

mod rescheduling {
    use super::*;

    #[tokio::test]
    async fn test_removed_target_finishes_and_is_not_redispatched() {
        let gate = Arc::new(Semaphore::new(0));
        let engine = engine(ScriptedRecorder::new(true).gated(gate.clone())).await;
        engine.registry.upsert(alice());
        let dispatcher = engine.dispatcher();

        let mut tasks = JoinSet::new();
        assert_eq!(dispatcher.dispatch_once(&mut tasks).await.dispatched, 1);
        wait_until(|| engine.recorder.calls().len() == 1).await;

        engine.registry.remove("alice");
        gate.add_permits(1);
        let outcome = tasks.join_next().await.unwrap().unwrap();

        assert!(matches!(outcome, CaptureOutcome::Completed { .. }));
        assert_eq!(engine.artifacts().len(), 1);
        assert!(!engine.ctx.locks.is_locked("alice").await);

        assert_eq!(dispatcher.dispatch_once(&mut tasks).await.dispatched, 0);

        engine.registry.upsert(alice());
        gate.add_permits(1);
        assert_eq!(dispatcher.dispatch_once(&mut tasks).await.dispatched, 1);
        while tasks.join_next().await.is_some() {}
        assert_eq!(engine.recorder.calls().len(), 2);
    }
}
