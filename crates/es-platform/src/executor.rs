//! Local executor for remote-style function calls.
//!
//! Every call runs in its own tokio task with the mounts of its
//! [`FunctionSpec`], under the function's concurrency ceiling and timeout.
//! Errors returned by the function body propagate unchanged; platform
//! failures (timeout, panic) surface as [`PlatformError`]s. Nothing is
//! retried.

use es_types::{GpuKind, PlatformError, SweepResult};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::function::FunctionSpec;
use crate::image::ImageSpec;
use crate::mounts::MountTable;

/// GPU held by a running call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuSlot {
    pub kind: GpuKind,
    pub index: usize,
}

/// What a function body knows about its own call.
#[derive(Debug, Clone)]
pub struct FunctionContext {
    pub function: String,
    pub call_id: Uuid,
    /// Position of the input in a `map`; 0 for `remote`.
    pub input_index: usize,
    pub gpu: Option<GpuSlot>,
    mounts: Arc<MountTable>,
}

impl FunctionContext {
    /// Host path for a path inside the container.
    pub fn resolve<P: AsRef<Path>>(&self, container_path: P) -> SweepResult<PathBuf> {
        self.mounts.resolve(container_path)
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }
}

#[derive(Debug, Default)]
struct SlotPool {
    free: BTreeSet<usize>,
    next: usize,
}

impl SlotPool {
    fn take(&mut self) -> usize {
        self.free.pop_first().unwrap_or_else(|| {
            let index = self.next;
            self.next += 1;
            index
        })
    }

    fn give_back(&mut self, index: usize) {
        self.free.insert(index);
    }
}

/// Concurrency state shared by all calls of one function.
#[derive(Debug)]
struct FunctionGate {
    permits: Option<Arc<Semaphore>>,
    slots: Mutex<SlotPool>,
}

impl FunctionGate {
    fn new(limit: Option<usize>) -> Self {
        Self {
            permits: limit.map(|n| Arc::new(Semaphore::new(n))),
            slots: Mutex::new(SlotPool::default()),
        }
    }
}

struct SlotGuard {
    gate: Arc<FunctionGate>,
    index: usize,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.gate.slots.lock().give_back(self.index);
    }
}

fn panic_message(function: &str, err: JoinError) -> PlatformError {
    let message = if err.is_panic() {
        let payload = err.into_panic();
        if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panicked".to_string()
        }
    } else {
        "cancelled".to_string()
    };
    PlatformError::Crashed {
        function: function.to_string(),
        message,
    }
}

fn spawn_committer(mounts: Arc<MountTable>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = mounts.commit_volumes() {
                warn!("Background volume commit failed: {}", e);
            }
        }
    })
}

async fn invoke<F, Fut, T>(
    gate: Arc<FunctionGate>,
    spec: Arc<FunctionSpec>,
    input_index: usize,
    commit_interval: Duration,
    body: F,
) -> SweepResult<T>
where
    F: FnOnce(FunctionContext) -> Fut,
    Fut: Future<Output = SweepResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let _permit: Option<OwnedSemaphorePermit> = match &gate.permits {
        Some(semaphore) => Some(Arc::clone(semaphore).acquire_owned().await.map_err(|e| {
            PlatformError::Crashed {
                function: spec.name.clone(),
                message: e.to_string(),
            }
        })?),
        None => None,
    };

    let slot = spec.gpu.map(|kind| {
        let index = gate.slots.lock().take();
        (
            GpuSlot { kind, index },
            SlotGuard {
                gate: Arc::clone(&gate),
                index,
            },
        )
    });

    let mounts = Arc::new(MountTable::new(spec.mounts.clone()));
    let context = FunctionContext {
        function: spec.name.clone(),
        call_id: Uuid::new_v4(),
        input_index,
        gpu: slot.as_ref().map(|(gpu, _)| *gpu),
        mounts: Arc::clone(&mounts),
    };
    debug!(
        "Starting {} call {} (input {}, gpu {:?})",
        spec.name, context.call_id, input_index, context.gpu
    );

    let committer = (spec.allow_background_volume_commits && mounts.has_volumes())
        .then(|| spawn_committer(Arc::clone(&mounts), commit_interval));

    let task = tokio::spawn(body(context));
    let abort = task.abort_handle();
    let outcome = tokio::time::timeout(spec.timeout(), task).await;
    if let Some(committer) = committer {
        committer.abort();
    }
    drop(slot);

    let result = match outcome {
        Err(_) => {
            abort.abort();
            warn!("{} timed out after {}s", spec.name, spec.timeout_secs);
            Err(PlatformError::Timeout {
                function: spec.name.clone(),
                timeout_secs: spec.timeout_secs,
            }
            .into())
        }
        Ok(Err(join_error)) => Err(panic_message(&spec.name, join_error).into()),
        Ok(Ok(result)) => result,
    };

    // Keep whatever the call wrote, even if it failed.
    if let Err(e) = mounts.commit_volumes() {
        if result.is_ok() {
            return Err(e);
        }
        warn!("Volume commit after failed {} call: {}", spec.name, e);
    }
    result
}

/// Results of a [`LocalExecutor::map`], yielded as calls finish.
pub struct MapCall<T> {
    function: String,
    tasks: JoinSet<SweepResult<T>>,
}

impl<T: Send + 'static> MapCall<T> {
    /// Calls not yet collected.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Next finished call, in completion order.
    pub async fn next(&mut self) -> Option<SweepResult<T>> {
        let joined = self.tasks.join_next().await?;
        Some(joined.unwrap_or_else(|e| Err(panic_message(&self.function, e).into())))
    }

    /// Wait for every call; the first error wins.
    pub async fn collect(mut self) -> SweepResult<Vec<T>> {
        let mut results = Vec::with_capacity(self.pending());
        while let Some(result) = self.next().await {
            results.push(result?);
        }
        Ok(results)
    }
}

/// Runs an app's functions as local tokio tasks.
pub struct LocalExecutor {
    image: ImageSpec,
    commit_interval: Duration,
    gates: Mutex<HashMap<String, Arc<FunctionGate>>>,
}

impl LocalExecutor {
    pub fn new(app_name: impl Into<String>, image: ImageSpec) -> Self {
        let app_name = app_name.into();
        info!(
            "App '{}' using image {} with {} build steps",
            app_name,
            image.base,
            image.steps.len()
        );
        for step in &image.steps {
            debug!("  image step: {}", step);
        }
        Self {
            image,
            commit_interval: Duration::from_secs(30),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Period of background volume commits for functions that allow them.
    pub fn with_commit_interval(mut self, every: Duration) -> Self {
        self.commit_interval = every;
        self
    }

    pub fn image(&self) -> &ImageSpec {
        &self.image
    }

    /// The concurrency ceiling of a function spans all of its calls.
    fn gate(&self, spec: &FunctionSpec) -> Arc<FunctionGate> {
        let mut gates = self.gates.lock();
        Arc::clone(
            gates
                .entry(spec.name.clone())
                .or_insert_with(|| Arc::new(FunctionGate::new(spec.concurrency_limit))),
        )
    }

    /// Run one call and wait for it.
    pub async fn remote<F, Fut, T>(&self, spec: &FunctionSpec, body: F) -> SweepResult<T>
    where
        F: FnOnce(FunctionContext) -> Fut,
        Fut: Future<Output = SweepResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        spec.validate()?;
        invoke(
            self.gate(spec),
            Arc::new(spec.clone()),
            0,
            self.commit_interval,
            body,
        )
        .await
    }

    /// Start one call per input. Must be called from within a tokio runtime.
    pub fn map<I, F, Fut, T>(&self, spec: &FunctionSpec, inputs: I, body: F) -> SweepResult<MapCall<T>>
    where
        I: IntoIterator,
        I::Item: Send + 'static,
        F: Fn(FunctionContext, I::Item) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SweepResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        spec.validate()?;
        let gate = self.gate(spec);
        let spec = Arc::new(spec.clone());
        let body = Arc::new(body);

        let mut tasks = JoinSet::new();
        for (input_index, input) in inputs.into_iter().enumerate() {
            let gate = Arc::clone(&gate);
            let spec = Arc::clone(&spec);
            let body = Arc::clone(&body);
            let commit_interval = self.commit_interval;
            tasks.spawn(async move {
                invoke(gate, spec, input_index, commit_interval, move |ctx| {
                    (*body)(ctx, input)
                })
                .await
            });
        }
        debug!("Dispatched {} calls of {}", tasks.len(), spec.name);

        Ok(MapCall {
            function: spec.name.clone(),
            tasks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mounts::{NetworkFileSystem, Volume};
    use es_types::SweepError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn executor() -> LocalExecutor {
        LocalExecutor::new("test-app", ImageSpec::debian_slim())
    }

    #[tokio::test]
    async fn remote_resolves_mounted_paths() {
        let dir = tempdir().unwrap();
        let nfs = NetworkFileSystem::ephemeral(dir.path(), "r1").unwrap();
        let spec = FunctionSpec::new("init").with_mount(nfs.mount_at("/root/cache"));

        let host = executor()
            .remote(&spec, |ctx| async move {
                let path = ctx.resolve("/root/cache/journal.log")?;
                std::fs::write(&path, b"x")?;
                Ok(path)
            })
            .await
            .unwrap();
        assert_eq!(host, nfs.host_root().join("journal.log"));
        assert!(host.exists());
    }

    #[tokio::test]
    async fn function_errors_propagate_unchanged() {
        let spec = FunctionSpec::new("boom");
        let err = executor()
            .remote(&spec, |_ctx| async move {
                Err::<(), _>(es_types::validation_error!("bad input"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SweepError::Validation(ref m) if m == "bad input"));
    }

    #[tokio::test]
    async fn panic_surfaces_as_crash() {
        let spec = FunctionSpec::new("panicky");
        let err = executor()
            .remote(&spec, |_ctx| async move {
                if true {
                    panic!("container died");
                }
                Ok(())
            })
            .await
            .unwrap_err();
        match err {
            SweepError::Platform(PlatformError::Crashed { function, message }) => {
                assert_eq!(function, "panicky");
                assert!(message.contains("container died"));
            }
            other => panic!("expected crash, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_ceiling_applies() {
        let spec = FunctionSpec::new("slow").with_timeout_secs(5);
        let err = executor()
            .remote(&spec, |_ctx| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SweepError::Platform(PlatformError::Timeout { timeout_secs: 5, .. })
        ));
    }

    #[tokio::test]
    async fn map_respects_concurrency_limit_and_gpu_slots() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let spec = FunctionSpec::new("worker")
            .with_gpu(GpuKind::A10g)
            .with_concurrency_limit(3);

        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
        let call = executor()
            .map(&spec, 1..=8usize, move |ctx, i| {
                let (running, peak) = (Arc::clone(&r), Arc::clone(&p));
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    let gpu = ctx.gpu.expect("worker has a gpu");
                    assert_eq!(gpu.kind, GpuKind::A10g);
                    assert!(gpu.index < 3, "slot {} beyond limit", gpu.index);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                }
            })
            .unwrap();

        let mut results = call.collect().await.unwrap();
        results.sort_unstable();
        assert_eq!(results, (1..=8).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn map_yields_in_completion_order() {
        let spec = FunctionSpec::new("staggered");
        let mut call = executor()
            .map(&spec, vec![30u64, 10, 20], |_ctx, delay| async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(delay)
            })
            .unwrap();

        let mut order = Vec::new();
        while let Some(result) = call.next().await {
            order.push(result.unwrap());
        }
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn map_input_index_follows_input_order() {
        let spec = FunctionSpec::new("indexed");
        let mut results = executor()
            .map(&spec, vec!["a", "b", "c"], |ctx, input| async move {
                Ok((ctx.input_index, input))
            })
            .unwrap()
            .collect()
            .await
            .unwrap();
        results.sort_unstable();
        assert_eq!(results, vec![(0, "a"), (1, "b"), (2, "c")]);
    }

    #[tokio::test]
    async fn lost_volume_fails_successful_call() {
        let dir = tempdir().unwrap();
        let volume = Volume::named(dir.path(), "v".into()).unwrap();
        let root = volume.host_root().to_path_buf();
        let spec = FunctionSpec::new("writer").with_mount(volume.mount_at("/vol"));

        let err = executor()
            .remote(&spec, move |_ctx| async move {
                std::fs::remove_dir_all(&root)?;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SweepError::Platform(PlatformError::VolumeCommit { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn background_commits_run_during_long_calls() {
        let dir = tempdir().unwrap();
        let volume = Volume::named(dir.path(), "v".into()).unwrap();
        let spec = FunctionSpec::new("trainer")
            .with_mount(volume.mount_at("/vol"))
            .with_background_commits(true);

        let seen = executor()
            .with_commit_interval(Duration::from_secs(1))
            .remote(&spec, |ctx| async move {
                tokio::time::sleep(Duration::from_millis(3500)).await;
                Ok(ctx.mounts().commits())
            })
            .await
            .unwrap();
        assert_eq!(seen, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn volumes_commit_once_without_background_commits() {
        let dir = tempdir().unwrap();
        let volume = Volume::named(dir.path(), "v".into()).unwrap();
        let spec = FunctionSpec::new("trainer").with_mount(volume.mount_at("/vol"));

        let (during, mounts) = executor()
            .with_commit_interval(Duration::from_secs(1))
            .remote(&spec, |ctx| async move {
                tokio::time::sleep(Duration::from_millis(3500)).await;
                Ok((ctx.mounts().commits(), ctx))
            })
            .await
            .unwrap();
        assert_eq!(during, 0);
        assert_eq!(mounts.mounts().commits(), 1);
    }

    #[tokio::test]
    async fn invalid_spec_never_runs() {
        let spec = FunctionSpec::new("bad").with_concurrency_limit(0);
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let result = executor()
            .remote(&spec, move |_ctx| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
