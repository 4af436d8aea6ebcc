//! Warm and cold container worker lifecycle.
//!
//! At most one warm worker exists per workspace. A request finding the warm
//! worker busy is serviced by a cold container instead of queueing, which
//! keeps per-workspace ordering trivial: one in-flight request per warm
//! worker, ever.

mod cold;
pub mod protocol;
mod warm;

use crate::error::PoolError;
use crate::{Bind, ContainerConfig, ContainerJob, ContainerOutput};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

pub use warm::WorkerState;

/// How long a warm spawn may take to produce the readiness marker.
pub(crate) const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle-reap scan period.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Bytes of stderr tail embedded in a cold worker's non-zero-exit error.
pub(crate) const STDERR_TAIL_BYTES: usize = 200;

/// Pool-wide settings, fixed at startup.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub runtime_bin: String,
    pub image: String,
    /// Default per-request deadline; a chat's container config may override.
    pub default_timeout: Duration,
    /// Cap on a cold worker's stdout and stderr, each.
    pub max_output_bytes: usize,
    /// Warm worker idle timeout; zero disables the warm pool.
    pub idle_timeout: Duration,
}

/// A warm worker slot as the pool sees it.
pub(crate) struct WarmEntry {
    pub worker_id: Uuid,
    pub state: WorkerState,
    pub last_active: Instant,
    pub tx: tokio::sync::mpsc::Sender<warm::WarmRequest>,
}

pub(crate) type WarmMap = Arc<Mutex<HashMap<String, WarmEntry>>>;

/// Counts reported by [`WorkerPool::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub warm_containers: usize,
    pub ready: usize,
    pub busy: usize,
    pub starting: usize,
}

/// Container worker pool. Cheap to clone via `Arc`.
pub struct WorkerPool {
    settings: PoolSettings,
    warm: WarmMap,
}

impl WorkerPool {
    pub fn new(settings: PoolSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            warm: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Spawn the idle-reaper background task.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pool.reap_idle().await;
            }
        })
    }

    /// Execute one job in the given workspace.
    ///
    /// Dispatch order: cold when the warm pool is disabled; the warm worker
    /// when one is ready; cold when the warm worker is busy or starting; a
    /// fresh warm spawn otherwise, falling back to cold on spawn failure.
    pub async fn run(
        &self,
        folder: &str,
        job: &ContainerJob,
        binds: &[Bind],
        container: &ContainerConfig,
    ) -> ContainerOutput {
        let line = match serde_json::to_string(job) {
            Ok(line) => line,
            Err(error) => return ContainerOutput::error(format!("unserializable job: {error}")),
        };
        let timeout = container
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.settings.default_timeout);

        if self.settings.idle_timeout.is_zero() {
            return cold::run(&self.settings, binds, &container.env, &line, timeout).await;
        }

        // Inspect the warm slot under the lock, but never await while holding it.
        enum Route {
            Warm(tokio::sync::mpsc::Sender<warm::WarmRequest>),
            Cold,
            Spawn {
                worker_id: Uuid,
                tx: tokio::sync::mpsc::Sender<warm::WarmRequest>,
                rx: tokio::sync::mpsc::Receiver<warm::WarmRequest>,
            },
        }

        let route = {
            let mut warm_map = self.warm.lock().await;
            match warm_map.get_mut(folder) {
                Some(entry) if entry.state == WorkerState::Ready => {
                    entry.state = WorkerState::Busy;
                    Route::Warm(entry.tx.clone())
                }
                Some(_) => Route::Cold,
                None => {
                    // Reserve the slot immediately so concurrent requests go
                    // cold while this spawn is in flight.
                    let worker_id = Uuid::new_v4();
                    let (tx, rx) = tokio::sync::mpsc::channel(1);
                    warm_map.insert(
                        folder.to_string(),
                        WarmEntry {
                            worker_id,
                            state: WorkerState::Starting,
                            last_active: Instant::now(),
                            tx: tx.clone(),
                        },
                    );
                    Route::Spawn { worker_id, tx, rx }
                }
            }
        };

        match route {
            Route::Warm(tx) => {
                self.run_on_warm(folder, tx, line, timeout, binds, container)
                    .await
            }
            Route::Cold => {
                tracing::debug!(%folder, "warm worker occupied, running cold");
                cold::run(&self.settings, binds, &container.env, &line, timeout).await
            }
            Route::Spawn { worker_id, tx, rx } => {
                match warm::spawn(
                    &self.settings,
                    Arc::clone(&self.warm),
                    folder,
                    worker_id,
                    binds,
                    &container.env,
                    rx,
                )
                .await
                {
                    Ok(()) => {
                        {
                            let mut warm_map = self.warm.lock().await;
                            if let Some(entry) = warm_map.get_mut(folder)
                                && entry.worker_id == worker_id
                            {
                                entry.state = WorkerState::Busy;
                            }
                        }
                        self.run_on_warm(folder, tx, line, timeout, binds, container)
                            .await
                    }
                    Err(error) => {
                        tracing::warn!(%folder, %error, "warm spawn failed, running cold");
                        cold::run(&self.settings, binds, &container.env, &line, timeout).await
                    }
                }
            }
        }
    }

    async fn run_on_warm(
        &self,
        folder: &str,
        tx: tokio::sync::mpsc::Sender<warm::WarmRequest>,
        line: String,
        timeout: Duration,
        binds: &[Bind],
        container: &ContainerConfig,
    ) -> ContainerOutput {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let request = warm::WarmRequest::Job {
            line: line.clone(),
            timeout,
            reply: reply_tx,
        };

        if tx.send(request).await.is_err() {
            // Runner already gone; treat like an unexpected exit and go cold.
            tracing::warn!(%folder, "warm worker vanished before accepting job, running cold");
            return cold::run(&self.settings, binds, &container.env, &line, timeout).await;
        }

        match reply_rx.await {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => {
                tracing::warn!(%folder, %error, "warm request failed");
                ContainerOutput::error(error.to_string())
            }
            Err(_) => ContainerOutput::error(PoolError::WorkerExited.to_string()),
        }
    }

    /// Kill warm workers idle past the timeout.
    async fn reap_idle(&self) {
        let mut victims = Vec::new();
        {
            let mut warm_map = self.warm.lock().await;
            let idle_timeout = self.settings.idle_timeout;
            for (folder, entry) in warm_map.iter_mut() {
                if entry.state != WorkerState::Busy
                    && entry.last_active.elapsed() >= idle_timeout
                {
                    entry.state = WorkerState::Draining;
                    victims.push((folder.clone(), entry.tx.clone()));
                }
            }
        }

        for (folder, tx) in victims {
            tracing::info!(%folder, "reaping idle warm worker");
            let _ = tx.send(warm::WarmRequest::Shutdown).await;
        }
    }

    /// Terminate all warm workers. Called on supervisor shutdown.
    pub async fn shutdown(&self) {
        let entries: Vec<_> = {
            let mut warm_map = self.warm.lock().await;
            warm_map
                .drain()
                .map(|(folder, entry)| (folder, entry.tx))
                .collect()
        };
        for (folder, tx) in entries {
            tracing::debug!(%folder, "terminating warm worker");
            let _ = tx.send(warm::WarmRequest::Shutdown).await;
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let warm_map = self.warm.lock().await;
        let mut stats = PoolStats {
            warm_containers: warm_map.len(),
            ready: 0,
            busy: 0,
            starting: 0,
        };
        for entry in warm_map.values() {
            match entry.state {
                WorkerState::Ready => stats.ready += 1,
                WorkerState::Busy => stats.busy += 1,
                WorkerState::Starting => stats.starting += 1,
                WorkerState::Draining | WorkerState::Dead => {}
            }
        }
        stats
    }
}

/// SIGTERM a child process; falls back to SIGKILL where SIGTERM is
/// unavailable or the pid is already gone.
pub(crate) async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        // Give the worker a moment to exit cleanly before the hard kill.
        if tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .is_ok()
        {
            return;
        }
    }

    let _ = child.kill().await;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::OutputStatus;
    use std::os::unix::fs::PermissionsExt as _;

    /// Write an executable stub standing in for the container runtime. It
    /// ignores the `run` arguments and speaks the worker stdio protocol.
    fn write_stub(dir: &std::path::Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        let mut permissions = std::fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn settings(runtime_bin: String, idle_timeout: Duration) -> PoolSettings {
        PoolSettings {
            runtime_bin,
            image: "nanoclaw-agent:test".to_string(),
            default_timeout: Duration::from_secs(10),
            max_output_bytes: 1024 * 1024,
            idle_timeout,
        }
    }

    fn job(folder: &str) -> ContainerJob {
        ContainerJob {
            prompt: "<messages></messages>".to_string(),
            session_id: None,
            folder: folder.to_string(),
            session_key: folder.to_string(),
            is_main: false,
            is_scheduled_task: false,
            chat_type: None,
        }
    }

    #[tokio::test]
    async fn warm_worker_is_reused_across_requests() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(
            dir.path(),
            "warm-runtime",
            r#"echo '---NANOCLAW_READY---' >&2
while read line; do
  echo '---NANOCLAW_OUTPUT_START---'
  echo '{"status":"success","result":"all good","new_session_id":"s1"}'
  echo '---NANOCLAW_OUTPUT_END---'
  echo '---NANOCLAW_READY---' >&2
done"#,
        );

        let pool = WorkerPool::new(settings(stub, Duration::from_secs(60)));

        let first = pool
            .run("family-chat", &job("family-chat"), &[], &ContainerConfig::default())
            .await;
        assert_eq!(first.status, OutputStatus::Success);
        assert_eq!(first.result.as_deref(), Some("all good"));
        assert_eq!(first.new_session_id.as_deref(), Some("s1"));

        // Give the runner a beat to observe the re-arm marker.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pool.stats().await.warm_containers, 1);
        assert_eq!(pool.stats().await.ready, 1);

        let second = pool
            .run("family-chat", &job("family-chat"), &[], &ContainerConfig::default())
            .await;
        assert_eq!(second.status, OutputStatus::Success);
        assert_eq!(pool.stats().await.warm_containers, 1);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_warm_pool_runs_cold_with_fallback_parse() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(
            dir.path(),
            "cold-runtime",
            r#"read line
echo 'stray log line'
echo '{"status":"success","result":"cold ok"}'"#,
        );

        let pool = WorkerPool::new(settings(stub, Duration::ZERO));
        let output = pool
            .run("family-chat", &job("family-chat"), &[], &ContainerConfig::default())
            .await;

        assert_eq!(output.status, OutputStatus::Success);
        assert_eq!(output.result.as_deref(), Some("cold ok"));
        assert_eq!(pool.stats().await.warm_containers, 0);
    }

    #[tokio::test]
    async fn cold_nonzero_exit_embeds_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(
            dir.path(),
            "broken-runtime",
            r#"read line
echo 'model crashed: out of cheese' >&2
exit 3"#,
        );

        let pool = WorkerPool::new(settings(stub, Duration::ZERO));
        let output = pool
            .run("family-chat", &job("family-chat"), &[], &ContainerConfig::default())
            .await;

        assert_eq!(output.status, OutputStatus::Error);
        let error = output.error.unwrap();
        assert!(error.contains("out of cheese"), "error was: {error}");
    }

    #[tokio::test]
    async fn request_deadline_kills_cold_worker() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(dir.path(), "hung-runtime", "read line\nsleep 60");

        let pool = WorkerPool::new(settings(stub, Duration::ZERO));
        let container = ContainerConfig {
            timeout_secs: Some(1),
            ..Default::default()
        };
        let output = pool
            .run("family-chat", &job("family-chat"), &[], &container)
            .await;

        assert_eq!(output.status, OutputStatus::Error);
        assert!(output.error.unwrap().contains("deadline"));
    }
}
