//! Worker Invoker
//!
//! Launches one inference process per request as
//! `<runtime> <script> <image> <model>` and collects its standard output and
//! standard error as independent byte streams.
//!
//! - The model artifact is checked before anything is spawned
//! - Both pipes are drained by their own reader task, chunk by chunk
//! - An optional timeout kills the child and still drains its pipes
//! - The child is spawned with kill-on-drop, so a cancelled request does not
//!   leave an orphaned worker behind

use crate::config::WorkerConfig;
use crate::error::{PipelineError, Result};
use crate::metrics::Timer;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// How long to keep draining pipes after a timed-out child was killed
const DRAIN_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// How to launch the worker
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub runtime: String,
    pub script_path: PathBuf,
    pub model_path: PathBuf,
    pub timeout: Option<Duration>,
}

/// One finished worker run.
///
/// Buffers are filled only by the stream readers; the value is handed out
/// after the exit code is known and never changes afterwards.
#[derive(Debug, Clone)]
pub struct WorkerInvocation {
    pub command: String,
    pub arguments: Vec<String>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

impl WorkerInvocation {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

impl WorkerSpec {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            runtime: config.runtime.clone(),
            script_path: config.script_path.clone(),
            model_path: config.model_path.clone(),
            timeout: config.timeout(),
        }
    }

    /// Argument order is fixed: script, image, model.
    pub fn arguments(&self, image_path: &Path) -> Vec<String> {
        vec![
            self.script_path.to_string_lossy().into_owned(),
            image_path.to_string_lossy().into_owned(),
            self.model_path.to_string_lossy().into_owned(),
        ]
    }

    pub async fn model_exists(&self) -> bool {
        tokio::fs::try_exists(&self.model_path).await.unwrap_or(false)
    }

    /// Run the worker against `image_path` and wait for it to exit.
    ///
    /// A non-zero exit is not an error here: it is recorded in the returned
    /// invocation and judged by the caller.
    pub async fn invoke(&self, image_path: &Path) -> Result<WorkerInvocation> {
        if !self.model_exists().await {
            warn!(model_path = %self.model_path.display(), "Model file not found");
            return Err(PipelineError::ModelNotFound(self.model_path.clone()));
        }

        let arguments = self.arguments(image_path);
        let timer = Timer::new();

        let mut command = Command::new(&self.runtime);
        command
            .args(&arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // own group, so a kill also reaches anything the worker forked
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|source| PipelineError::WorkerLaunchFailed {
                command: self.runtime.clone(),
                source,
            })?;
        let mut group = ProcessGroupGuard::new(child.id());

        info!(
            pid = ?child.id(),
            runtime = %self.runtime,
            image_path = %image_path.display(),
            "Worker started"
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::Internal("worker stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PipelineError::Internal("worker stderr was not captured".to_string()))?;

        let mut stdout = StreamCapture::spawn(stdout, "stdout");
        let mut stderr = StreamCapture::spawn(stderr, "stderr");

        // the deadline covers both the exit and the end of both streams
        let run = async {
            let status = child.wait().await;
            tokio::join!(stdout.finish(), stderr.finish());
            status
        };

        let finished = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.ok(),
            None => Some(run.await),
        };

        let Some(status) = finished else {
            let timeout = self.timeout.unwrap_or_default();
            warn!(
                timeout_secs = timeout.as_secs_f64(),
                "Worker timed out, killing its process group"
            );
            group.kill();
            // the direct child may have exited already while a fork held the pipes
            if let Ok(None) = child.try_wait() {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed-out worker");
                }
            }
            tokio::join!(stdout.settle(DRAIN_GRACE), stderr.settle(DRAIN_GRACE));
            return Err(PipelineError::WorkerTimeout {
                timeout,
                stderr: String::from_utf8_lossy(&stderr.take()).into_owned(),
            });
        };

        let status = status
            .map_err(|e| PipelineError::Internal(format!("failed to wait for worker: {}", e)))?;
        group.release();

        let stdout = stdout.take();
        let stderr = stderr.take();
        let elapsed = Duration::from_millis(timer.elapsed_ms());

        info!(
            exit_code = ?status.code(),
            elapsed_ms = elapsed.as_millis() as u64,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            "Worker exited"
        );

        Ok(WorkerInvocation {
            command: self.runtime.clone(),
            arguments,
            stdout,
            stderr,
            exit_code: status.code(),
            elapsed,
        })
    }
}

/// One worker pipe, read to EOF by its own task into a shared buffer.
///
/// The buffer outlives the reader, so whatever arrived before a timeout is
/// still available after the reader is abandoned.
struct StreamCapture {
    stream: &'static str,
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl StreamCapture {
    fn spawn<R>(mut pipe: R, stream: &'static str) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = buffer.clone();

        let reader = tokio::spawn(async move {
            let mut chunk = vec![0u8; READ_CHUNK_BYTES];
            let mut total = 0usize;

            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        trace!(
                            stream,
                            bytes = n,
                            text = %String::from_utf8_lossy(&chunk[..n]),
                            "Worker output"
                        );
                        total += n;
                        lock(&sink).extend_from_slice(&chunk[..n]);
                    }
                    Err(e) => {
                        warn!(stream, error = %e, "Failed to read worker output");
                        break;
                    }
                }
            }

            debug!(stream, total_bytes = total, "Worker stream drained");
        });

        Self {
            stream,
            buffer,
            reader,
        }
    }

    /// Wait for EOF
    async fn finish(&mut self) {
        // a finished handle may already have been polled to completion
        if self.reader.is_finished() {
            return;
        }
        if let Err(e) = (&mut self.reader).await {
            warn!(stream = self.stream, error = %e, "Worker stream reader failed");
        }
    }

    /// Wait for EOF at most `grace`, then give up on the pipe
    async fn settle(&mut self, grace: Duration) {
        if tokio::time::timeout(grace, self.finish()).await.is_err() {
            warn!(stream = self.stream, "Worker pipe still open after kill, abandoning reader");
            self.reader.abort();
        }
    }

    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *lock(&self.buffer))
    }
}

impl Drop for StreamCapture {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn lock(buffer: &Mutex<Vec<u8>>) -> MutexGuard<'_, Vec<u8>> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Kills the worker's process group when dropped, unless released after a
/// normal exit. `kill_on_drop` only reaches the direct child.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }

    fn release(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; an empty group yields ESRCH
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, error = %std::io::Error::last_os_error(), "Worker process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}
