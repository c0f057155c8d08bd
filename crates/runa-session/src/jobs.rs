// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Signal delivered by `stop_program`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Term,
    Kill,
}

/// Point-in-time view of a job for `status_program`.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub id: u64,
    pub command: String,
    pub completed: bool,
    pub exit_code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// A long-running command detached from the tool call that launched it.
///
/// Each job owns two stdio reader tasks and one wait task.  Once `completed`
/// flips to true the wait task has finished and the stdio line lists no
/// longer grow.
pub struct BackgroundJob {
    pub id: u64,
    pub command: String,
    pub dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pid: Option<u32>,
    state: Mutex<JobState>,
    done_rx: watch::Receiver<bool>,
}

#[derive(Default)]
struct JobState {
    completed: bool,
    exit_code: Option<i32>,
    stdout: Vec<String>,
    stderr: Vec<String>,
}

impl BackgroundJob {
    /// Spawn `command` under `bash -c` in `dir` and wire up the reader and
    /// wait tasks.  Returns the shared job handle; the process keeps running
    /// after the launching tool call returns.
    pub fn launch(
        id: u64,
        command: impl Into<String>,
        dir: impl Into<PathBuf>,
    ) -> anyhow::Result<std::sync::Arc<Self>> {
        let command = command.into();
        let dir = dir.into();

        let mut cmd = tokio::process::Command::new("bash");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Detach from the controlling terminal so the job cannot write
        // escape sequences at the caller's terminal.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (done_tx, done_rx) = watch::channel(false);
        let job = std::sync::Arc::new(Self {
            id,
            command,
            dir,
            started_at: Utc::now(),
            pid,
            state: Mutex::new(JobState::default()),
            done_rx,
        });

        debug!(id, pid, cmd = %job.command, "background job launched");

        if let Some(out) = stdout {
            let j = std::sync::Arc::clone(&job);
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    j.lock().stdout.push(line);
                }
            });
        }
        if let Some(err) = stderr {
            let j = std::sync::Arc::clone(&job);
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    j.lock().stderr.push(line);
                }
            });
        }

        let j = std::sync::Arc::clone(&job);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(id = j.id, error = %e, "background job wait failed");
                    None
                }
            };
            // Give the reader tasks a moment to drain any buffered output
            // before the completed flag promises the lists are final.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            {
                let mut st = j.lock();
                st.exit_code = code;
                st.completed = true;
            }
            debug!(id = j.id, exit_code = ?code, "background job finished");
            let _ = done_tx.send(true);
        });

        Ok(job)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn completed(&self) -> bool {
        self.lock().completed
    }

    pub fn status(&self) -> JobStatus {
        let st = self.lock();
        JobStatus {
            id: self.id,
            command: self.command.clone(),
            completed: st.completed,
            exit_code: st.exit_code,
            stdout: st.stdout.clone(),
            stderr: st.stderr.clone(),
        }
    }

    /// Suspend until the job completes or `cancel` fires.
    ///
    /// Returns `true` when the job is complete, `false` on cancellation.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.done_rx.clone();
        loop {
            if *rx.borrow() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        // Sender dropped without completing; treat as done.
                        return self.completed();
                    }
                }
            }
        }
    }

    /// Deliver a stop signal.  No-op for jobs that already completed.
    pub fn stop(&self, signal: StopSignal) {
        if self.completed() {
            return;
        }
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            let sig = match signal {
                StopSignal::Term => libc::SIGTERM,
                StopSignal::Kill => libc::SIGKILL,
            };
            // The job leads its own process group (setsid); signal the whole
            // group so shell pipelines die with the leader.
            unsafe {
                libc::kill(-(pid as i32), sig);
                libc::kill(pid as i32, sig);
            }
            debug!(id = self.id, pid, ?signal, "stop signal delivered");
        }
        #[cfg(not(unix))]
        {
            let _ = signal;
            warn!(id = self.id, "stop_program is unsupported on this platform");
        }
    }

    /// SIGKILL shortcut used by session teardown.
    pub fn kill(&self) {
        self.stop(StopSignal::Kill);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn short_job_completes_and_captures_stdout() {
        let job = BackgroundJob::launch(1, "echo hello; echo world >&2", "/tmp").unwrap();
        assert!(job.wait(&CancellationToken::new()).await);
        let st = job.status();
        assert!(st.completed);
        assert_eq!(st.exit_code, Some(0));
        assert_eq!(st.stdout, vec!["hello"]);
        assert_eq!(st.stderr, vec!["world"]);
    }

    #[tokio::test]
    async fn exit_code_is_propagated() {
        let job = BackgroundJob::launch(2, "exit 3", "/tmp").unwrap();
        assert!(job.wait(&CancellationToken::new()).await);
        assert_eq!(job.status().exit_code, Some(3));
    }

    #[tokio::test]
    async fn wait_returns_false_on_cancellation() {
        let job = BackgroundJob::launch(3, "sleep 30", "/tmp").unwrap();
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            c.cancel();
        });
        assert!(!job.wait(&cancel).await);
        job.kill();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_kill_terminates_long_job() {
        let job = BackgroundJob::launch(4, "sleep 30", "/tmp").unwrap();
        assert!(!job.completed());
        job.stop(StopSignal::Kill);
        assert!(job.wait(&CancellationToken::new()).await);
        // Killed by signal → no exit code.
        assert_eq!(job.status().exit_code, None);
    }

    #[tokio::test]
    async fn completed_job_ignores_stop() {
        let job = BackgroundJob::launch(5, "true", "/tmp").unwrap();
        assert!(job.wait(&CancellationToken::new()).await);
        job.stop(StopSignal::Term); // must not panic or signal a reused pid
        assert!(job.completed());
    }
}
