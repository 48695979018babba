//! Local child-process execution backend.
//!
//! `image` names the executable; `args`, `env` and `workdir` are applied to
//! the spawned command. Messages are written to the child's stdin as one JSON
//! object per line.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use cnap_core::{ChatMessage, RunnerStatus};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::backend::{ExecutionBackend, RunnerConfig};
use crate::error::BackendError;

/// Runs the task as a local child process.
#[derive(Default)]
pub struct ProcessBackend {
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    stopped: AtomicBool,
}

impl ProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    async fn start(&self, config: &RunnerConfig) -> Result<(), BackendError> {
        if config.image.trim().is_empty() {
            return Err(BackendError::InvalidConfig(
                "image (executable) is required".to_string(),
            ));
        }

        let mut slot = self.child.lock().await;
        if slot.is_some() {
            return Err(BackendError::AlreadyStarted);
        }

        let mut cmd = Command::new(&config.image);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.workdir {
            cmd.current_dir(dir);
        }

        debug!("Full command: {:?}", cmd);
        let mut child = cmd.spawn().map_err(|e| {
            error!(image = %config.image, error = %e, "Failed to spawn backend process");
            e
        })?;

        info!(
            image = %config.image,
            pid = ?child.id(),
            args = config.args.len(),
            "Backend process spawned"
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain_lines(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_lines(stderr, "stderr"));
        }

        *self.stdin.lock().await = child.stdin.take();
        *slot = Some(child);
        self.stopped.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: &ChatMessage) -> Result<(), BackendError> {
        let json = serde_json::to_string(message)?;

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(BackendError::NotStarted)?;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;

        debug!(json_len = json.len(), role = %message.role, "Message written to backend stdin");
        Ok(())
    }

    async fn status(&self) -> Result<RunnerStatus, BackendError> {
        let mut guard = self.child.lock().await;
        let child = guard.as_mut().ok_or(BackendError::NotStarted)?;

        let status = match child.try_wait()? {
            None => RunnerStatus::Running,
            Some(_) if self.stopped.load(Ordering::SeqCst) => RunnerStatus::Canceled,
            Some(exit) if exit.success() => RunnerStatus::Completed,
            Some(exit) => {
                debug!(code = ?exit.code(), "Backend process exited with failure");
                RunnerStatus::Failed
            }
        };
        Ok(status)
    }

    async fn stop(&self) -> Result<(), BackendError> {
        // Closing stdin lets well-behaved children exit on their own.
        self.stdin.lock().await.take();

        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return Err(BackendError::NotStarted);
        };

        if let Some(exit) = child.try_wait()? {
            debug!(code = ?exit.code(), "Backend process already exited");
            return Ok(());
        }
        self.stopped.store(true, Ordering::SeqCst);
        child.kill().await?;
        info!(pid = ?child.id(), "Backend process stopped");
        Ok(())
    }
}

async fn drain_lines<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break, // EOF
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if stream == "stderr" {
                    warn!(stream, line = %trimmed, "Backend output");
                } else {
                    debug!(stream, line = %trimmed, "Backend output");
                }
            }
            Err(e) => {
                error!(stream, error = %e, "Error reading backend output");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn wait_for_exit(backend: &ProcessBackend) -> RunnerStatus {
        for _ in 0..100 {
            let status = backend.status().await.unwrap();
            if status != RunnerStatus::Running {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("process did not exit");
    }

    #[tokio::test]
    async fn test_send_then_stop() {
        let backend = ProcessBackend::new();
        backend.start(&RunnerConfig::new("cat")).await.unwrap();
        assert_eq!(backend.status().await.unwrap(), RunnerStatus::Running);

        backend.send(&ChatMessage::user("hello")).await.unwrap();
        backend.stop().await.unwrap();

        assert_eq!(wait_for_exit(&backend).await, RunnerStatus::Canceled);
        assert!(matches!(
            backend.send(&ChatMessage::user("late")).await,
            Err(BackendError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_exit_codes_map_to_status() {
        let ok = ProcessBackend::new();
        ok.start(&RunnerConfig::new("sh").with_arg("-c").with_arg("exit 0"))
            .await
            .unwrap();
        assert_eq!(wait_for_exit(&ok).await, RunnerStatus::Completed);

        let failing = ProcessBackend::new();
        failing
            .start(&RunnerConfig::new("sh").with_arg("-c").with_arg("exit 3"))
            .await
            .unwrap();
        assert_eq!(wait_for_exit(&failing).await, RunnerStatus::Failed);
    }

    #[tokio::test]
    async fn test_stop_after_exit_keeps_exit_status() {
        let ok = ProcessBackend::new();
        ok.start(&RunnerConfig::new("sh").with_arg("-c").with_arg("exit 0"))
            .await
            .unwrap();
        assert_eq!(wait_for_exit(&ok).await, RunnerStatus::Completed);
        ok.stop().await.unwrap();
        assert_eq!(ok.status().await.unwrap(), RunnerStatus::Completed);

        let failing = ProcessBackend::new();
        failing
            .start(&RunnerConfig::new("sh").with_arg("-c").with_arg("exit 3"))
            .await
            .unwrap();
        assert_eq!(wait_for_exit(&failing).await, RunnerStatus::Failed);
        failing.stop().await.unwrap();
        assert_eq!(failing.status().await.unwrap(), RunnerStatus::Failed);
    }

    #[tokio::test]
    async fn test_start_errors() {
        let backend = ProcessBackend::new();
        assert!(matches!(
            backend.start(&RunnerConfig::default()).await,
            Err(BackendError::InvalidConfig(_))
        ));
        assert!(matches!(
            backend.start(&RunnerConfig::new("/nonexistent/cnap-binary")).await,
            Err(BackendError::Io(_))
        ));
        assert!(matches!(backend.status().await, Err(BackendError::NotStarted)));
    }

    #[tokio::test]
    async fn test_env_and_workdir_applied() {
        let dir = std::env::temp_dir();
        let backend = ProcessBackend::new();
        backend
            .start(
                &RunnerConfig::new("sh")
                    .with_arg("-c")
                    .with_arg("test \"$CNAP_FLAG\" = on && test \"$(pwd -P)\" = \"$(cd \"$EXPECTED\" && pwd -P)\"")
                    .with_env("CNAP_FLAG", "on")
                    .with_env("EXPECTED", dir.to_string_lossy())
                    .with_workdir(&dir),
            )
            .await
            .unwrap();
        assert_eq!(wait_for_exit(&backend).await, RunnerStatus::Completed);
    }
}
