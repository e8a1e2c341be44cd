use async_trait::async_trait;
use ollama_agent_core::{Error, Result, ToolResult, ToolStatus};
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{truncate_output, Tool, ToolContext, ToolSchema};

pub const EXECUTE_COMMAND: &str = "execute_command";

const MAX_OUTPUT_BYTES: usize = 10_000;
/// Bytes retained per stream before truncation; the rest is drained and dropped.
const CAPTURE_LIMIT: usize = MAX_OUTPUT_BYTES * 4;
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Runs `sh -c <command>` in its own process group.
pub struct ExecuteCommandTool;

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: EXECUTE_COMMAND.to_string(),
            description: "Execute a shell command on the local machine and return its exit code, stdout and stderr".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The shell command to execute"
                    }
                },
                "required": ["command"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        params
            .get("command")
            .and_then(|v| v.as_str())
            .filter(|c| !c.trim().is_empty())
            .map(|_| ())
            .ok_or_else(|| Error::Validation("Missing required parameter: command".to_string()))
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<ToolResult> {
        let command = params
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Validation("Missing required parameter: command".to_string()))?;
        run_command(command, ctx.timeout).await
    }
}

/// Kills the whole process group when dropped while armed.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    // ESRCH just means the group is already gone.
    unsafe {
        libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

type Captured = Arc<Mutex<Vec<u8>>>;

fn spawn_capture<R>(mut reader: R) -> (Captured, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buf: Captured = Arc::new(Mutex::new(Vec::new()));
    let sink = buf.clone();
    let handle = tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut b) = sink.lock() {
                        let room = CAPTURE_LIMIT.saturating_sub(b.len());
                        b.extend_from_slice(&chunk[..n.min(room)]);
                    }
                }
            }
        }
    });
    (buf, handle)
}

fn take_captured(buf: &Captured) -> String {
    let bytes = buf.lock().map(|b| b.clone()).unwrap_or_default();
    truncate_output(String::from_utf8_lossy(&bytes).into_owned(), MAX_OUTPUT_BYTES)
}

async fn drain(handles: Vec<JoinHandle<()>>) {
    for mut h in handles {
        if timeout(DRAIN_GRACE, &mut h).await.is_err() {
            h.abort();
        }
    }
}

/// Run a shell command with a hard deadline. Output written before the
/// deadline is kept; the process group is killed on timeout or when the
/// returned future is dropped.
pub async fn run_command(command: &str, limit: Duration) -> Result<ToolResult> {
    let started = Instant::now();

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Tool(format!("Failed to execute command: {}", e)))?;
    let mut guard = ProcessGroupGuard { pgid: child.id() };
    debug!(command, pgid = ?guard.pgid, "Spawned command");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Tool("command stdout unavailable".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Tool("command stderr unavailable".to_string()))?;
    let (out_buf, out_task) = spawn_capture(stdout);
    let (err_buf, err_task) = spawn_capture(stderr);

    let remaining = limit.saturating_sub(started.elapsed());
    match timeout(remaining, child.wait()).await {
        Ok(Ok(status)) => {
            // Stray background children would otherwise hold the pipes open.
            guard.kill();
            drain(vec![out_task, err_task]).await;
            let exit_code = status.code();
            Ok(ToolResult {
                status: if status.success() { ToolStatus::Ok } else { ToolStatus::Error },
                exit_code,
                stdout: take_captured(&out_buf),
                stderr: take_captured(&err_buf),
                elapsed_seconds: started.elapsed().as_secs_f64(),
            })
        }
        Ok(Err(e)) => Err(Error::Tool(format!("Failed to wait for command: {}", e))),
        Err(_) => {
            warn!(command, timeout_secs = limit.as_secs_f64(), "Command timed out, killing process group");
            guard.kill();
            let _ = child.kill().await;
            drain(vec![out_task, err_task]).await;
            Ok(ToolResult::timeout(
                take_captured(&out_buf),
                take_captured(&err_buf),
                started.elapsed().as_secs_f64(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_and_validate() {
        let tool = ExecuteCommandTool;
        assert_eq!(tool.schema().name, "execute_command");
        assert!(tool.validate(&json!({"command": "ls"})).is_ok());
        assert!(tool.validate(&json!({})).is_err());
        assert!(tool.validate(&json!({"command": "  "})).is_err());
    }

    #[tokio::test]
    async fn test_echo_ok() {
        let r = run_command("echo hi", Duration::from_secs(5)).await.unwrap();
        assert_eq!(r.status, ToolStatus::Ok);
        assert_eq!(r.exit_code, Some(0));
        assert_eq!(r.stdout, "hi\n");
        assert!(r.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error_status() {
        let r = run_command("echo oops >&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(r.status, ToolStatus::Error);
        assert_eq!(r.exit_code, Some(3));
        assert_eq!(r.stderr, "oops\n");
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let started = Instant::now();
        let r = run_command("echo before; sleep 30", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(r.status, ToolStatus::Timeout);
        assert_eq!(r.exit_code, None);
        assert_eq!(r.stdout, "before\n");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_output_truncated() {
        let r = run_command("head -c 20000 /dev/zero | tr '\\0' 'a'", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(r.stdout.ends_with("... (output truncated)"));
        assert!(r.stdout.len() < 10_100);
    }

    #[cfg(target_os = "linux")]
    fn is_live(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            // Field 3 is the state; zombies are dead.
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .map(|state| state != "Z" && state != "X")
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_leaves_no_live_child() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let command = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let r = run_command(&command, Duration::from_millis(500)).await.unwrap();
        assert_eq!(r.status, ToolStatus::Timeout);

        let pid: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        let mut alive = true;
        for _ in 0..20 {
            if !is_live(pid) {
                alive = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!alive, "background sleep {} survived the timeout", pid);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropped_invocation_kills_group() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let command = format!("echo $$ > {}; sleep 30", pid_file.display());
        let fut = run_command(&command, Duration::from_secs(30));
        let _ = timeout(Duration::from_millis(500), fut).await;

        let pid: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        let mut alive = true;
        for _ in 0..20 {
            if !is_live(pid) {
                alive = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!alive);
    }
}
