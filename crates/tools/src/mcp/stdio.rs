use async_trait::async_trait;
use ollama_agent_core::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::rpc::{transport_error, JsonRpcRequest, McpTransport, PendingMap};

/// Newline-delimited JSON-RPC over a child process's stdin/stdout.
pub struct StdioTransport {
    server_name: String,
    stdin: Mutex<ChildStdin>,
    next_id: AtomicU64,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    child: Mutex<Child>,
}

impl StdioTransport {
    /// Launch the provider process and start the response reader.
    pub async fn spawn(
        server_name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&str>,
    ) -> Result<Self> {
        let program = which::which(command).map_err(|e| Error::ProviderStartup {
            name: server_name.to_string(),
            message: format!("command '{}' not found: {}", command, e),
        })?;

        let mut cmd = Command::new(&program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (k, v) in env {
            cmd.env(k, v);
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| Error::ProviderStartup {
            name: server_name.to_string(),
            message: format!("failed to spawn '{}': {}", command, e),
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| transport_error(server_name, "no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| transport_error(server_name, "no stdout"))?;

        let pending = PendingMap::default();
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(Self::reader_task(
            stdout,
            pending.clone(),
            closed.clone(),
            server_name.to_string(),
        ));

        info!(server = %server_name, command, pid = ?child.id(), "Spawned MCP server");
        Ok(Self {
            server_name: server_name.to_string(),
            stdin: Mutex::new(stdin),
            next_id: AtomicU64::new(1),
            pending,
            closed,
            child: Mutex::new(child),
        })
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let io = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        io.await
            .map_err(|e| transport_error(&self.server_name, format!("write error: {}", e)))
    }

    /// Dispatches incoming JSON-RPC responses to waiting callers.
    async fn reader_task(
        stdout: ChildStdout,
        pending: PendingMap,
        closed: Arc<AtomicBool>,
        server_name: String,
    ) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    debug!(server = %server_name, "MCP ← {}", crate::safe_truncate(&line, 200));
                    pending.dispatch(&server_name, &line);
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!(server = %server_name, "MCP: stdout closed");
                    break;
                }
                Err(e) => {
                    error!(server = %server_name, error = %e, "MCP: read error");
                    break;
                }
            }
        }
        closed.store(true, Ordering::SeqCst);
        pending.fail_all("MCP server stdout closed");
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(transport_error(&self.server_name, "server closed"));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = serde_json::to_string(&JsonRpcRequest::call(id, method, params))?;
        let waiting = self.pending.register(id);
        debug!(server = %self.server_name, id, method, "MCP → request");

        self.write_line(&line).await?;
        // Callers bound the wait: startup and listing deadlines in the
        // manager, the tool timeout in the executor.
        waiting.wait(&self.server_name, None).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let line = serde_json::to_string(&JsonRpcRequest::notification(method, params))?;
        self.write_line(&line).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let mut child = self.child.lock().await;
        match child.kill().await {
            Ok(()) => {}
            // Already exited.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(transport_error(&self.server_name, format!("kill failed: {}", e))),
        }
        self.pending.fail_all("MCP server stopped");
        info!(server = %self.server_name, "Stopped MCP server");
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "stdio"
    }
}
