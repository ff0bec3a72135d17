//! Process supervision for agent CLI subprocesses.
//!
//! The supervisor launches the `claude` binary bound to a worktree, tracks
//! liveness per pid, captures output into a bounded buffer, and terminates
//! processes with a SIGTERM-then-SIGKILL escalation.
//!
//! A crashed agent is never swallowed: its exit code is retained in the
//! process table until the adapter releases the entry, so status queries
//! after the fact still see the failure. An orphaned process after a
//! supervisor crash remains a known risk; the pid is recorded in the
//! worktree's bootstrap manifest so an external reclaim can find it.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::{self, SpawnContext};
use crate::error::LaunchError;

/// Directory inside each worktree holding bootstrap files for the agent.
pub const BOOTSTRAP_DIR: &str = ".herd";
/// Prompt file the agent CLI is pointed at.
pub const PROMPT_FILE: &str = "PROMPT.md";
/// Manifest recording instance identity and pid for external reclaim.
pub const MANIFEST_FILE: &str = "instance.json";

/// Everything the supervisor needs to launch one agent process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub instance_id: Uuid,
    pub role: String,
    pub task_ref: String,
    pub branch: String,
    pub model: String,
    pub worktree: PathBuf,
    pub context: SpawnContext,
}

/// Lightweight handle for a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
    pub instance_id: Uuid,
}

/// Result of a non-blocking liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Running,
    Exited { code: i32 },
}

/// Which stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

/// One captured line of agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub source: OutputSource,
    pub line: String,
}

/// Snapshot of the bounded output buffer.
#[derive(Debug, Clone, Default)]
pub struct OutputSnapshot {
    pub lines: Vec<OutputLine>,
    /// Lines discarded because the buffer was full.
    pub dropped: u64,
}

/// Ring buffer of recent output lines.
#[derive(Debug)]
struct OutputBuffer {
    lines: VecDeque<OutputLine>,
    capacity: usize,
    dropped: u64,
}

impl OutputBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(256)),
            capacity,
            dropped: 0,
        }
    }

    fn push(&mut self, line: OutputLine) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    fn snapshot(&self) -> OutputSnapshot {
        OutputSnapshot {
            lines: self.lines.iter().cloned().collect(),
            dropped: self.dropped,
        }
    }
}

/// The child process plus its recorded exit, serialised per process.
struct ChildSlot {
    child: Child,
    exit: Option<i32>,
}

/// Per-process bookkeeping.
struct Process {
    /// Guards wait/kill so terminate and poll do not race. Held across
    /// the grace period during terminate, which only delays callers
    /// touching this same process.
    child: tokio::sync::Mutex<ChildSlot>,
    output: std::sync::Mutex<OutputBuffer>,
    tx: broadcast::Sender<OutputLine>,
}

/// Launches and supervises agent CLI subprocesses.
pub struct ProcessSupervisor {
    /// Path to the `claude` binary.
    binary: String,
    /// Output lines retained per process.
    buffer_capacity: usize,
    /// Process table keyed by OS pid. Never locked across an await.
    processes: std::sync::Mutex<HashMap<u32, Arc<Process>>>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("binary", &self.binary)
            .field("buffer_capacity", &self.buffer_capacity)
            .finish()
    }
}

/// Map an exit status to a numeric code, folding signal deaths into the
/// conventional 128+signal range on unix.
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

impl ProcessSupervisor {
    pub fn new(binary: impl Into<String>, buffer_capacity: usize) -> Self {
        Self {
            binary: binary.into(),
            buffer_capacity: buffer_capacity.max(1),
            processes: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn process(&self, pid: u32) -> Option<Arc<Process>> {
        self.processes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pid)
            .cloned()
    }

    /// Write the bootstrap context files and start the agent process
    /// bound to the worktree.
    ///
    /// The prompt is rendered into `.herd/PROMPT.md` and handed to the
    /// CLI via its `@file` syntax; the context's environment variables
    /// plus the `HERD_*` identity variables are merged into the process
    /// environment.
    pub async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle, LaunchError> {
        if !spec.worktree.is_dir() {
            return Err(LaunchError::MissingWorkdir(spec.worktree.clone()));
        }

        let bootstrap_dir = spec.worktree.join(BOOTSTRAP_DIR);
        let prompt_path = bootstrap_dir.join(PROMPT_FILE);
        let prompt = context::assemble_prompt(
            &spec.role,
            &spec.task_ref,
            &spec.branch,
            &spec.context,
            &spec.worktree,
        );

        std::fs::create_dir_all(&bootstrap_dir)
            .and_then(|()| std::fs::write(&prompt_path, &prompt))
            .map_err(|e| LaunchError::Bootstrap {
                path: bootstrap_dir.clone(),
                source: e,
            })?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p")
            .arg(format!("@{}", prompt_path.display()))
            .arg("--model")
            .arg(&spec.model);

        cmd.current_dir(&spec.worktree);

        // Merge, don't replace the inherited environment.
        for (key, value) in &spec.context.environment {
            cmd.env(key, value);
        }
        cmd.env("HERD_AGENT_NAME", &spec.role);
        cmd.env("HERD_TICKET_ID", &spec.task_ref);
        cmd.env("HERD_BRANCH", &spec.branch);
        cmd.env("HERD_INSTANCE_ID", spec.instance_id.to_string());

        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| LaunchError::Spawn {
            binary: self.binary.clone(),
            source: e,
        })?;

        let pid = child.id().ok_or(LaunchError::NoPid)?;

        // Record the pid alongside the instance identity so an orphaned
        // process can be reclaimed externally if the supervisor dies.
        let manifest = serde_json::json!({
            "instance_id": spec.instance_id,
            "role": spec.role,
            "task_ref": spec.task_ref,
            "branch": spec.branch,
            "model": spec.model,
            "pid": pid,
            "spawned_at": Utc::now(),
        });
        if let Err(e) = std::fs::write(
            bootstrap_dir.join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&manifest).unwrap_or_default(),
        ) {
            warn!(pid, error = %e, "failed to write instance manifest (non-fatal)");
        }

        let (tx, _) = broadcast::channel(self.buffer_capacity);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let process = Arc::new(Process {
            child: tokio::sync::Mutex::new(ChildSlot { child, exit: None }),
            output: std::sync::Mutex::new(OutputBuffer::new(self.buffer_capacity)),
            tx,
        });

        if let Some(stdout) = stdout {
            spawn_reader(stdout, OutputSource::Stdout, Arc::clone(&process));
        }
        if let Some(stderr) = stderr {
            spawn_reader(stderr, OutputSource::Stderr, Arc::clone(&process));
        }

        self.processes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid, process);

        tracing::info!(
            instance_id = %spec.instance_id,
            pid,
            worktree = %spec.worktree.display(),
            model = %spec.model,
            "launched agent process"
        );

        Ok(ProcessHandle {
            pid,
            instance_id: spec.instance_id,
        })
    }

    /// Non-blocking liveness check.
    ///
    /// Once an exit has been observed, the code is retained and returned
    /// on every subsequent poll until [`Self::release`].
    pub async fn poll(&self, handle: ProcessHandle) -> PollStatus {
        let Some(process) = self.process(handle.pid) else {
            debug!(pid = handle.pid, "poll on unknown pid (already released)");
            return PollStatus::Exited { code: -1 };
        };

        let mut slot = process.child.lock().await;
        if let Some(code) = slot.exit {
            return PollStatus::Exited { code };
        }

        match slot.child.try_wait() {
            Ok(Some(status)) => {
                let code = exit_code(&status);
                slot.exit = Some(code);
                debug!(pid = handle.pid, code, "agent process exited");
                PollStatus::Exited { code }
            }
            Ok(None) => PollStatus::Running,
            Err(e) => {
                warn!(pid = handle.pid, error = %e, "error checking process status");
                slot.exit = Some(-1);
                PollStatus::Exited { code: -1 }
            }
        }
    }

    /// Terminate a process: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// Idempotent on an already-exited process.
    pub async fn terminate(&self, handle: ProcessHandle, grace: Duration) -> Result<()> {
        let Some(process) = self.process(handle.pid) else {
            debug!(pid = handle.pid, "terminate on unknown pid (already released)");
            return Ok(());
        };

        let mut slot = process.child.lock().await;
        if slot.exit.is_some() {
            return Ok(());
        }

        // Already gone but not yet observed?
        if let Ok(Some(status)) = slot.child.try_wait() {
            slot.exit = Some(exit_code(&status));
            return Ok(());
        }

        #[cfg(unix)]
        {
            // SAFETY: pid came from a child this supervisor spawned.
            let ret = unsafe { libc::kill(handle.pid as i32, libc::SIGTERM) };
            if ret != 0 {
                warn!(pid = handle.pid, "SIGTERM failed, proceeding to SIGKILL");
            }
        }

        match tokio::time::timeout(grace, slot.child.wait()).await {
            Ok(Ok(status)) => {
                slot.exit = Some(exit_code(&status));
                debug!(pid = handle.pid, "process exited after SIGTERM");
            }
            _ => {
                debug!(pid = handle.pid, "process did not exit within grace, sending SIGKILL");
                slot.child
                    .kill()
                    .await
                    .with_context(|| format!("failed to kill pid {}", handle.pid))?;
                let status = slot
                    .child
                    .wait()
                    .await
                    .with_context(|| format!("failed to reap pid {}", handle.pid))?;
                slot.exit = Some(exit_code(&status));
            }
        }

        Ok(())
    }

    /// Snapshot the captured output for a process.
    pub fn output(&self, handle: ProcessHandle) -> OutputSnapshot {
        match self.process(handle.pid) {
            Some(process) => process
                .output
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .snapshot(),
            None => OutputSnapshot::default(),
        }
    }

    /// Stream output lines as they arrive.
    ///
    /// The stream never blocks the producer: a subscriber that falls
    /// behind skips the lines it missed and keeps going. Lines emitted
    /// before subscription are only available via [`Self::output`].
    pub fn follow(&self, handle: ProcessHandle) -> Pin<Box<dyn Stream<Item = OutputLine> + Send>> {
        let Some(process) = self.process(handle.pid) else {
            return Box::pin(futures::stream::empty());
        };
        let mut rx = process.tx.subscribe();

        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(line) => yield line,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "output follower lagged, skipping lines");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Box::pin(stream)
    }

    /// Drop the bookkeeping for a process. Idempotent.
    pub fn release(&self, handle: ProcessHandle) {
        self.processes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.pid);
    }
}

/// Read lines from a child stream into the buffer and broadcast channel.
fn spawn_reader<R>(reader: R, source: OutputSource, process: Arc<Process>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let out = OutputLine { source, line };
            process
                .output
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(out.clone());
            // No subscribers is fine.
            let _ = process.tx.send(out);
        }
    });
}
