//! Cold worker path: one container, one request, `--rm`.

use super::protocol::{CappedBuffer, parse_output};
use super::{PoolSettings, STDERR_TAIL_BYTES, terminate};
use crate::{Bind, ContainerOutput};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::process::Command;

/// Run one job in a fresh container. Never returns an Err: every failure mode
/// is folded into a `ContainerOutput` error per the supervisor's error
/// contract.
pub(crate) async fn run(
    settings: &PoolSettings,
    binds: &[Bind],
    env: &HashMap<String, String>,
    line: &str,
    timeout: Duration,
) -> ContainerOutput {
    let mut command = Command::new(&settings.runtime_bin);
    command.arg("run").arg("-i").arg("--rm");
    for bind in binds {
        command.arg("-v").arg(bind.to_volume_arg());
    }
    for (key, value) in env {
        command.arg("-e").arg(format!("{key}={value}"));
    }
    command.arg(&settings.image);
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(error) => {
            tracing::error!(%error, runtime = %settings.runtime_bin, "failed to spawn cold worker");
            return ContainerOutput::error(format!("failed to spawn container: {error}"));
        }
    };

    // Send the single input line, then close stdin so the worker knows the
    // request is complete.
    if let Some(mut stdin) = child.stdin.take() {
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        if let Err(error) = write.await {
            tracing::warn!(%error, "failed to write job to cold worker stdin");
        }
        drop(stdin);
    }

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let max = settings.max_output_bytes;

    let collect = async {
        let stdout_task = async {
            let mut buffer = CappedBuffer::new(max);
            if let Some(pipe) = stdout_pipe.as_mut() {
                let mut chunk = [0u8; 8192];
                while let Ok(n) = pipe.read(&mut chunk).await {
                    if n == 0 {
                        break;
                    }
                    buffer.push(&chunk[..n]);
                }
            }
            buffer
        };
        let stderr_task = async {
            let mut buffer = CappedBuffer::new(max);
            if let Some(pipe) = stderr_pipe.as_mut() {
                let mut chunk = [0u8; 8192];
                while let Ok(n) = pipe.read(&mut chunk).await {
                    if n == 0 {
                        break;
                    }
                    buffer.push(&chunk[..n]);
                }
            }
            buffer
        };

        let (stdout, stderr) = tokio::join!(stdout_task, stderr_task);
        let status = child.wait().await;
        (stdout, stderr, status)
    };

    let (stdout_buf, stderr_buf, status) = match tokio::time::timeout(timeout, collect).await {
        Ok(collected) => collected,
        Err(_) => {
            tracing::warn!(timeout_secs = timeout.as_secs(), "cold worker deadline exceeded");
            terminate(&mut child).await;
            return ContainerOutput::error(format!(
                "request deadline of {}s exceeded",
                timeout.as_secs()
            ));
        }
    };

    if stdout_buf.truncated() || stderr_buf.truncated() {
        tracing::warn!(
            stdout_truncated = stdout_buf.truncated(),
            stderr_truncated = stderr_buf.truncated(),
            cap_bytes = max,
            "cold worker output truncated at cap"
        );
    }

    match status {
        Ok(status) if status.success() => {
            match parse_output(&stdout_buf.as_text(), true) {
                Ok(output) => output,
                Err(error) => {
                    tracing::warn!(%error, "cold worker produced unparseable output");
                    ContainerOutput::error(error.to_string())
                }
            }
        }
        Ok(status) => {
            let tail = stderr_buf.tail(STDERR_TAIL_BYTES);
            ContainerOutput::error(format!("worker exited with {status}: {tail}"))
        }
        Err(error) => ContainerOutput::error(format!("failed to await worker exit: {error}")),
    }
}
