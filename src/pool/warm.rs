//! Warm worker lifecycle: spawn, readiness handshake, request loop.
//!
//! Each warm worker is owned by a single runner task holding the child
//! process and its stdio. The pool posts requests over an mpsc channel and
//! awaits a oneshot reply, so per-workspace serialization falls out of the
//! channel rather than shared flags.

use super::protocol::{OUTPUT_END, READY_MARKER, parse_output};
use super::{PoolSettings, READY_TIMEOUT, WarmMap, terminate};
use crate::error::PoolError;
use crate::{Bind, ContainerOutput};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Warm worker lifecycle states. `absent` is the slot not existing at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Ready,
    Busy,
    Draining,
    Dead,
}

/// A request posted to a warm worker's runner task.
pub(crate) enum WarmRequest {
    Job {
        line: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<ContainerOutput, PoolError>>,
    },
    Shutdown,
}

/// Start a warm container for `folder` and wait for its readiness marker.
///
/// The caller has already reserved the pool slot (state `Starting`); on
/// success the slot transitions to `Ready` and a runner task owns the child
/// from then on. On failure the slot is released.
pub(crate) async fn spawn(
    settings: &PoolSettings,
    warm_map: WarmMap,
    folder: &str,
    worker_id: Uuid,
    binds: &[Bind],
    env: &HashMap<String, String>,
    request_rx: mpsc::Receiver<WarmRequest>,
) -> Result<(), PoolError> {
    let mut command = Command::new(&settings.runtime_bin);
    command.arg("run").arg("-i").arg("--rm");
    for bind in binds {
        command.arg("-v").arg(bind.to_volume_arg());
    }
    command
        .arg("-e")
        .arg("WARM_MODE=true")
        .arg("-e")
        .arg(format!("IDLE_TIMEOUT={}", settings.idle_timeout.as_secs()));
    for (key, value) in env {
        command.arg("-e").arg(format!("{key}={value}"));
    }
    command.arg(&settings.image);
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::info!(%folder, %worker_id, "spawning warm worker");

    let spawn_result = async {
        let mut child = command
            .spawn()
            .map_err(|error| PoolError::Spawn(error.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Spawn("worker stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Spawn("worker stdout not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PoolError::Spawn("worker stderr not piped".to_string()))?;

        // Stderr is logged as it arrives; readiness markers become signals.
        let (ready_tx, mut ready_rx) = mpsc::channel::<()>(8);
        let stderr_folder = folder.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim() == READY_MARKER {
                    let _ = ready_tx.try_send(());
                } else {
                    tracing::debug!(folder = %stderr_folder, "worker: {line}");
                }
            }
        });

        match tokio::time::timeout(READY_TIMEOUT, ready_rx.recv()).await {
            Ok(Some(())) => {}
            _ => {
                terminate(&mut child).await;
                return Err(PoolError::ReadyTimeout(READY_TIMEOUT));
            }
        }

        Ok((child, stdin, BufReader::new(stdout), ready_rx))
    }
    .await;

    match spawn_result {
        Ok((child, stdin, stdout, ready_rx)) => {
            let slot_kept = {
                let mut map = warm_map.lock().await;
                match map.get_mut(folder) {
                    Some(entry) if entry.worker_id == worker_id => {
                        entry.state = WorkerState::Ready;
                        entry.last_active = Instant::now();
                        true
                    }
                    _ => false,
                }
            };
            if !slot_kept {
                // Slot was released (shutdown) while we were starting.
                let mut child = child;
                terminate(&mut child).await;
                return Err(PoolError::Spawn("pool slot released".to_string()));
            }

            let folder = folder.to_string();
            tokio::spawn(runner(
                child, stdin, stdout, ready_rx, request_rx, warm_map, folder, worker_id,
            ));
            Ok(())
        }
        Err(error) => {
            release_slot(&warm_map, folder, worker_id).await;
            Err(error)
        }
    }
}

/// Per-worker request loop. Breaks on shutdown, deadline, protocol violation,
/// or unexpected exit; the epilogue terminates the child and releases the
/// slot.
#[allow(clippy::too_many_arguments)]
async fn runner(
    mut child: Child,
    mut stdin: ChildStdin,
    mut stdout: BufReader<ChildStdout>,
    mut ready_rx: mpsc::Receiver<()>,
    mut request_rx: mpsc::Receiver<WarmRequest>,
    warm_map: WarmMap,
    folder: String,
    worker_id: Uuid,
) {
    while let Some(request) = request_rx.recv().await {
        match request {
            WarmRequest::Shutdown => break,
            WarmRequest::Job {
                line,
                timeout,
                reply,
            } => match handle_job(&mut stdin, &mut stdout, &line, timeout).await {
                Ok(output) => {
                    let _ = reply.send(Ok(output));

                    // The contract requires a readiness marker before the
                    // next input; a worker that never re-arms is dead.
                    match tokio::time::timeout(READY_TIMEOUT, ready_rx.recv()).await {
                        Ok(Some(())) => {
                            let mut map = warm_map.lock().await;
                            if let Some(entry) = map.get_mut(&folder)
                                && entry.worker_id == worker_id
                            {
                                entry.state = WorkerState::Ready;
                                entry.last_active = Instant::now();
                            }
                        }
                        _ => {
                            tracing::warn!(%folder, "warm worker never re-armed after response");
                            break;
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(%folder, %error, "warm request failed, removing worker");
                    let _ = reply.send(Err(error));
                    break;
                }
            },
        }
    }

    terminate(&mut child).await;
    release_slot(&warm_map, &folder, worker_id).await;
    tracing::debug!(%folder, %worker_id, "warm worker slot released");
}

/// Write one job line and collect stdout until the end marker, bounded by the
/// per-request deadline.
async fn handle_job(
    stdin: &mut ChildStdin,
    stdout: &mut BufReader<ChildStdout>,
    line: &str,
    timeout: Duration,
) -> Result<ContainerOutput, PoolError> {
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|_| PoolError::WorkerExited)?;
    stdin
        .write_all(b"\n")
        .await
        .map_err(|_| PoolError::WorkerExited)?;
    stdin.flush().await.map_err(|_| PoolError::WorkerExited)?;

    let deadline = Instant::now() + timeout;
    let mut buffer = String::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(PoolError::RequestTimeout(timeout));
        }

        let mut chunk = String::new();
        match tokio::time::timeout(remaining, stdout.read_line(&mut chunk)).await {
            Err(_) => return Err(PoolError::RequestTimeout(timeout)),
            Ok(Ok(0)) => return Err(PoolError::WorkerExited),
            Ok(Ok(_)) => {
                let is_end = chunk.trim() == OUTPUT_END;
                buffer.push_str(&chunk);
                if is_end {
                    return parse_output(&buffer, false);
                }
            }
            Ok(Err(error)) => {
                return Err(PoolError::Protocol(format!("stdout read failed: {error}")));
            }
        }
    }
}

/// Remove the slot if it still belongs to this worker.
async fn release_slot(warm_map: &WarmMap, folder: &str, worker_id: Uuid) {
    let mut map = warm_map.lock().await;
    let owned = map
        .get(folder)
        .is_some_and(|entry| entry.worker_id == worker_id);
    if owned {
        map.remove(folder);
    }
}
