//! Managed child dev-server processes.
//!
//! The agent starts long-running processes (dev servers, watchers) under an
//! agent-supplied id, reads their interleaved stdout/stderr through a bounded
//! per-process log buffer, and stops them with a tree-terminate. Exit status
//! is retained until the id is reused.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::SecondsFormat;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::sleep;
use tracing::debug;
use tracing::info;
use tracing::warn;

use pagebridge_common::RingBuffer;

const STOP_GRACE: Duration = Duration::from_secs(3);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("no managed process with id {0:?}")]
    NotFound(String),

    #[error("a process with id {0:?} is already running")]
    DuplicateId(String),

    #[error("failed to spawn {command:?}: {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub timestamp_iso: String,
    pub stream: LogStream,
    pub line: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDescriptor {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at_iso: String,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessLogs {
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

struct ManagedProcess {
    id: String,
    command: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    pid: Option<u32>,
    started_at_iso: String,
    logs: Arc<Mutex<RingBuffer<LogLine>>>,
    exit: Arc<Mutex<Option<ExitInfo>>>,
    monitor_task: Option<JoinHandle<()>>,
    reader_tasks: Vec<JoinHandle<()>>,
}

impl ManagedProcess {
    async fn is_running(&self) -> bool {
        self.exit.lock().await.is_none()
    }

    async fn descriptor(&self) -> ProcessDescriptor {
        let exit = *self.exit.lock().await;
        ProcessDescriptor {
            id: self.id.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            cwd: self.cwd.clone(),
            pid: self.pid,
            started_at_iso: self.started_at_iso.clone(),
            running: exit.is_none(),
            exit,
        }
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;
    ExitInfo {
        code: status.code(),
        signal,
    }
}

fn signal_tree(pid: u32, signal: i32) {
    #[cfg(unix)]
    {
        let pid = pid as i32;
        unsafe {
            if libc::kill(-pid, signal) != 0 {
                libc::kill(pid, signal);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
    }
}

/// Sole owner of the managed-process map.
pub struct ProcessManager {
    log_capacity: usize,
    processes: Mutex<HashMap<String, ManagedProcess>>,
}

impl ProcessManager {
    pub fn new(log_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            log_capacity,
            processes: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn a process under an agent-supplied id. Starting over a live id
    /// fails; a finished entry with the same id is replaced.
    pub async fn start(&self, request: StartRequest) -> Result<ProcessDescriptor> {
        let mut processes = self.processes.lock().await;
        if let Some(existing) = processes.get(&request.id) {
            if existing.is_running().await {
                return Err(ProcessError::DuplicateId(request.id));
            }
        }

        let mut command = tokio::process::Command::new(&request.command);
        command
            .args(&request.args)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| ProcessError::SpawnFailed {
            command: request.command.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id();
        info!("started managed process {:?} pid={pid:?}", request.id);

        let logs = Arc::new(Mutex::new(RingBuffer::new(self.log_capacity)));
        let exit = Arc::new(Mutex::new(None));

        let mut reader_tasks = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            reader_tasks.push(spawn_line_reader(stdout, LogStream::Stdout, Arc::clone(&logs)));
        }
        if let Some(stderr) = child.stderr.take() {
            reader_tasks.push(spawn_line_reader(stderr, LogStream::Stderr, Arc::clone(&logs)));
        }

        let monitor_exit = Arc::clone(&exit);
        let monitor_id = request.id.clone();
        let monitor_task = tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    debug!("managed process {monitor_id:?} exited: {status}");
                    *monitor_exit.lock().await = Some(exit_info(status));
                }
                Err(e) => {
                    warn!("wait failed for managed process {monitor_id:?}: {e}");
                    *monitor_exit.lock().await = Some(ExitInfo {
                        code: None,
                        signal: None,
                    });
                }
            }
        });

        let process = ManagedProcess {
            id: request.id.clone(),
            command: request.command,
            args: request.args,
            cwd: request.cwd,
            pid,
            started_at_iso: now_iso(),
            logs,
            exit,
            monitor_task: Some(monitor_task),
            reader_tasks,
        };
        let descriptor = process.descriptor().await;
        processes.insert(request.id, process);
        Ok(descriptor)
    }

    /// Tree-terminate and wait out a bounded grace period, escalating to a
    /// hard kill. The entry stays in the map with its exit status.
    pub async fn stop(&self, id: &str) -> Result<ProcessDescriptor> {
        let (pid, exit) = {
            let processes = self.processes.lock().await;
            let process = processes
                .get(id)
                .ok_or_else(|| ProcessError::NotFound(id.to_string()))?;
            (process.pid, Arc::clone(&process.exit))
        };

        if exit.lock().await.is_none() {
            if let Some(pid) = pid {
                #[cfg(unix)]
                signal_tree(pid, libc::SIGTERM);
                #[cfg(not(unix))]
                signal_tree(pid, 15);

                let deadline = Instant::now() + STOP_GRACE;
                while exit.lock().await.is_none() && Instant::now() < deadline {
                    sleep(EXIT_POLL_INTERVAL).await;
                }
                if exit.lock().await.is_none() {
                    warn!("managed process {id:?} ignored SIGTERM, killing");
                    #[cfg(unix)]
                    signal_tree(pid, libc::SIGKILL);
                    #[cfg(not(unix))]
                    signal_tree(pid, 9);
                    let deadline = Instant::now() + STOP_GRACE;
                    while exit.lock().await.is_none() && Instant::now() < deadline {
                        sleep(EXIT_POLL_INTERVAL).await;
                    }
                }
            }
        }

        let processes = self.processes.lock().await;
        let process = processes
            .get(id)
            .ok_or_else(|| ProcessError::NotFound(id.to_string()))?;
        Ok(process.descriptor().await)
    }

    /// Buffered log lines, split back into stdout and stderr. With `clear`
    /// the buffer is drained.
    pub async fn logs(&self, id: &str, clear: bool) -> Result<ProcessLogs> {
        let logs = {
            let processes = self.processes.lock().await;
            let process = processes
                .get(id)
                .ok_or_else(|| ProcessError::NotFound(id.to_string()))?;
            Arc::clone(&process.logs)
        };
        let mut buffer = logs.lock().await;
        let lines = if clear { buffer.drain() } else { buffer.peek() };
        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();
        for line in lines {
            let rendered = format!("[{}] {}", line.timestamp_iso, line.line);
            match line.stream {
                LogStream::Stdout => stdout_lines.push(rendered),
                LogStream::Stderr => stderr_lines.push(rendered),
            }
        }
        Ok(ProcessLogs {
            stdout_lines,
            stderr_lines,
        })
    }

    pub async fn list(&self) -> Vec<ProcessDescriptor> {
        let processes = self.processes.lock().await;
        let mut descriptors = Vec::with_capacity(processes.len());
        for process in processes.values() {
            descriptors.push(process.descriptor().await);
        }
        descriptors.sort_by(|a, b| a.started_at_iso.cmp(&b.started_at_iso));
        descriptors
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = {
            let processes = self.processes.lock().await;
            processes.keys().cloned().collect()
        };
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!("failed to stop managed process {id:?}: {e}");
            }
        }
        let mut processes = self.processes.lock().await;
        for process in processes.values_mut() {
            if let Some(task) = process.monitor_task.take() {
                task.abort();
            }
            for task in process.reader_tasks.drain(..) {
                task.abort();
            }
        }
    }
}

fn spawn_line_reader<R>(
    reader: R,
    stream: LogStream,
    logs: Arc<Mutex<RingBuffer<LogLine>>>,
) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            logs.lock().await.push(LogLine {
                timestamp_iso: now_iso(),
                stream,
                line,
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request(id: &str, command: &str, args: &[&str]) -> StartRequest {
        StartRequest {
            id: id.to_string(),
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            env: HashMap::new(),
        }
    }

    async fn wait_for_exit(manager: &ProcessManager, id: &str) {
        for _ in 0..100 {
            let list = manager.list().await;
            if list.iter().any(|d| d.id == id && !d.running) {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("process {id} did not exit in time");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_captures_output_and_exit_status() {
        let manager = ProcessManager::new(100);
        let started = manager
            .start(request("echo", "sh", &["-c", "echo out; echo err >&2"]))
            .await
            .unwrap();
        assert!(started.running);
        assert!(started.pid.is_some());

        wait_for_exit(&manager, "echo").await;
        let logs = manager.logs("echo", false).await.unwrap();
        assert_eq!(logs.stdout_lines.len(), 1);
        assert!(logs.stdout_lines[0].ends_with("out"));
        assert_eq!(logs.stderr_lines.len(), 1);
        assert!(logs.stderr_lines[0].ends_with("err"));

        let list = manager.list().await;
        let descriptor = list.iter().find(|d| d.id == "echo").unwrap();
        assert_eq!(descriptor.exit.unwrap().code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn duplicate_live_id_is_rejected_but_finished_id_is_reusable() {
        let manager = ProcessManager::new(100);
        manager
            .start(request("server", "sleep", &["30"]))
            .await
            .unwrap();
        assert!(matches!(
            manager.start(request("server", "sleep", &["30"])).await,
            Err(ProcessError::DuplicateId(_))
        ));

        manager.stop("server").await.unwrap();
        wait_for_exit(&manager, "server").await;
        assert!(manager.start(request("server", "true", &[])).await.is_ok());
        manager.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_terminates_a_long_running_process() {
        let manager = ProcessManager::new(100);
        manager
            .start(request("sleeper", "sleep", &["600"]))
            .await
            .unwrap();
        let stopped = manager.stop("sleeper").await.unwrap();
        assert!(!stopped.running);
        assert!(stopped.exit.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn logs_with_clear_drains_the_buffer() {
        let manager = ProcessManager::new(100);
        manager
            .start(request("printer", "sh", &["-c", "echo one; echo two"]))
            .await
            .unwrap();
        wait_for_exit(&manager, "printer").await;

        let first = manager.logs("printer", true).await.unwrap();
        assert_eq!(first.stdout_lines.len(), 2);
        let second = manager.logs("printer", false).await.unwrap();
        assert!(second.stdout_lines.is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_error() {
        let manager = ProcessManager::new(100);
        assert!(matches!(
            manager.logs("ghost", false).await,
            Err(ProcessError::NotFound(_))
        ));
        assert!(matches!(
            manager.stop("ghost").await,
            Err(ProcessError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_as_error() {
        let manager = ProcessManager::new(100);
        let result = manager
            .start(request("bad", "/definitely/not/a/command", &[]))
            .await;
        assert!(matches!(result, Err(ProcessError::SpawnFailed { .. })));
        assert!(manager.list().await.is_empty());
    }
}
