//! Command pool: runs external commands with their stdout piped into a stream.

use anyhow::{Context, Result};
use longbuffer::{run_blocking, Stream};
use smcconf::CommandConfig;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const READ_CHUNK: usize = 64 * 1024;

/// Closes the stream when dropped, whatever happened to the producer.
struct CloseOnDrop(Stream);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if let Err(e) = self.0.close() {
            tracing::warn!(stream.id = %self.0.id(), error = %e, "Failed to close stream");
        }
    }
}

/// Bounds how many commands run at once.
#[derive(Clone)]
pub struct CommandPool {
    permits: Arc<Semaphore>,
}

impl CommandPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Commands that could start right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `spec` with `args`, writing its stdout into `sink`.
    ///
    /// Waits for a free slot first. The child gets only the configured
    /// environment and inherits stderr. Cancelling `cancel` kills it. The
    /// stream is closed on every exit path.
    pub async fn run(
        &self,
        spec: &CommandConfig,
        args: &[String],
        sink: Stream,
        cancel: CancellationToken,
    ) -> Result<ExitStatus> {
        let guard = CloseOnDrop(sink);
        let stream = &guard.0;

        let _permit = tokio::select! {
            permit = self.permits.acquire() => permit.context("Command pool closed")?,
            _ = cancel.cancelled() => anyhow::bail!("Cancelled before start"),
        };

        let started = Instant::now();
        let mut child = Command::new(&spec.command)
            .args(args)
            .env_clear()
            .envs(&spec.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", spec.command))?;

        tracing::info!(
            command.slug = %spec.slug,
            command.pid = ?child.id(),
            stream.id = %stream.id(),
            "Command started"
        );

        let mut stdout = child.stdout.take().context("Child stdout not captured")?;
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            let n = tokio::select! {
                read = stdout.read(&mut buf) => read.context("Failed to read command output")?,
                _ = cancel.cancelled() => {
                    child.kill().await.context("Failed to kill command")?;
                    tracing::info!(
                        command.slug = %spec.slug,
                        stream.id = %stream.id(),
                        bytes = stream.len(),
                        "Command cancelled"
                    );
                    break;
                }
            };
            if n == 0 {
                break;
            }
            // A write may rotate a segment: flush plus chmod.
            run_blocking(|| stream.write(&buf[..n]))
                .context("Failed to write command output")?;
        }

        let status = child.wait().await.context("Failed to wait for command")?;
        let elapsed = started.elapsed();
        if status.success() {
            tracing::info!(
                command.slug = %spec.slug,
                stream.id = %stream.id(),
                bytes = stream.len(),
                duration_ms = elapsed.as_millis() as u64,
                "Command finished"
            );
        } else {
            tracing::warn!(
                command.slug = %spec.slug,
                stream.id = %stream.id(),
                bytes = stream.len(),
                status = %status,
                "Command exited with failure"
            );
        }

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn shell(slug: &str, script: &str) -> CommandConfig {
        CommandConfig::new(slug, "/bin/sh").with_arguments(["-c", script])
    }

    fn collect(stream: &Stream) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        stream.copy_with_interval(0, &mut out, Duration::from_millis(1))?;
        Ok(out)
    }

    #[tokio::test]
    async fn test_run_captures_stdout() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let stream = Stream::create(temp_dir.path(), 4)?;
        let pool = CommandPool::new(1);
        let spec = CommandConfig::new("echo", "/bin/echo").with_arguments(["$1"]);

        let status = pool
            .run(&spec, &["bonjour".to_string()], stream.clone(), CancellationToken::new())
            .await?;

        assert!(status.success());
        assert!(stream.is_closed());
        assert_eq!(collect(&stream)?, b"bonjour\n");
        assert_eq!(stream.segment_count(), 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_on_multi_thread_runtime_rotates_segments() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let stream = Stream::create(temp_dir.path(), 8)?;
        let spec = shell("seq", "for i in 1 2 3 4 5 6 7 8 9; do echo line$i; done");

        let status = CommandPool::new(1)
            .run(&spec, &spec.arguments, stream.clone(), CancellationToken::new())
            .await?;

        assert!(status.success());
        let expected: Vec<u8> = (1..=9)
            .flat_map(|i| format!("line{}\n", i).into_bytes())
            .collect();
        assert_eq!(collect(&stream)?, expected);
        assert_eq!(stream.segment_count(), 7);
        Ok(())
    }

    #[tokio::test]
    async fn test_environment_is_only_configured_vars() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let stream = Stream::create(temp_dir.path(), 1024)?;
        let spec = shell("env", "echo \"$GREETING:$HOME\"").with_env("GREETING", "salut");

        CommandPool::new(1)
            .run(&spec, &spec.arguments, stream.clone(), CancellationToken::new())
            .await?;

        assert_eq!(collect(&stream)?, b"salut:\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_failing_command_still_closes() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let stream = Stream::create(temp_dir.path(), 1024)?;
        let spec = shell("fail", "echo partial; exit 3");

        let status = CommandPool::new(1)
            .run(&spec, &spec.arguments, stream.clone(), CancellationToken::new())
            .await?;

        assert_eq!(status.code(), Some(3));
        assert!(stream.is_closed());
        assert_eq!(collect(&stream)?, b"partial\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_spawn_failure_closes_stream() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let stream = Stream::create(temp_dir.path(), 1024)?;
        let spec = CommandConfig::new("missing", "/nonexistent/binary");

        let result = CommandPool::new(1)
            .run(&spec, &[], stream.clone(), CancellationToken::new())
            .await;

        assert!(result.is_err());
        assert!(stream.is_closed());
        assert!(stream.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_kills_command() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let stream = Stream::create(temp_dir.path(), 1024)?;
        let spec =
            shell("slow", "echo start; sleep 30; echo never").with_env("PATH", "/usr/bin:/bin");
        let cancel = CancellationToken::new();

        let pool = CommandPool::new(1);
        let run = {
            let pool = pool.clone();
            let stream = stream.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.run(&spec, &spec.arguments, stream, cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let status = tokio::time::timeout(Duration::from_secs(5), run).await???;

        assert!(!status.success());
        assert!(stream.is_closed());
        assert_eq!(collect(&stream)?, b"start\n");
        assert_eq!(pool.available(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_before_start() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let stream = Stream::create(temp_dir.path(), 1024)?;
        let pool = CommandPool::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        // Hold the only permit so the run has to wait.
        let _busy = pool.permits.acquire().await?;
        let spec = shell("queued", "echo hi");
        let result = pool.run(&spec, &spec.arguments, stream.clone(), cancel).await;

        assert!(result.is_err());
        assert!(stream.is_closed());
        Ok(())
    }
}
