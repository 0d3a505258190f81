//! Long-lived worker child speaking newline-delimited JSON-RPC 2.0 on stdio.
//!
//! The server is started lazily on first use with an `initialize` handshake.
//! Each invocation is a `tools/call` request. A call that outlives its timeout
//! kills the server; the next call starts a fresh one.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use super::{AgentError, AgentHandle, ExecOptions, ExecOutput};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

struct ServerProcess {
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<String>,
}

impl ServerProcess {
    fn stop(mut self) {
        if let Err(err) = self.child.kill() {
            debug!(err = %err, "tool server already exited");
        }
        if let Err(err) = self.child.wait() {
            warn!(err = %err, "failed to reap tool server");
        }
    }
}

pub struct ToolServerAgent {
    name: String,
    command: Vec<String>,
    workdir: PathBuf,
    tool: String,
    server: Mutex<Option<ServerProcess>>,
    next_id: AtomicU64,
    released: AtomicBool,
}

impl ToolServerAgent {
    pub fn new(
        name: impl Into<String>,
        command: Vec<String>,
        workdir: impl Into<PathBuf>,
        tool: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            command,
            workdir: workdir.into(),
            tool: tool.into(),
            server: Mutex::new(None),
            next_id: AtomicU64::new(1),
            released: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<ServerProcess>>, AgentError> {
        self.server
            .lock()
            .map_err(|_| AgentError::Other(anyhow!("tool server lock poisoned")))
    }

    fn spawn(&self) -> Result<ServerProcess, AgentError> {
        let (program, args) = self.command.split_first().ok_or_else(|| AgentError::Spawn {
            worker: self.name.clone(),
            message: "empty command".to_string(),
        })?;
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| AgentError::Spawn {
                worker: self.name.clone(),
                message: format!("{program}: {err}"),
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Other(anyhow!("tool server stdin was not piped")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Other(anyhow!("tool server stdout was not piped")))?;

        let (tx, lines) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        info!(worker = %self.name, pid = child.id(), "tool server started");
        Ok(ServerProcess {
            child,
            stdin,
            lines,
        })
    }

    fn start(&self) -> Result<ServerProcess, AgentError> {
        let mut server = self.spawn()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let init = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "initialize",
            "params": {"clientInfo": {"name": "autopilot", "version": env!("CARGO_PKG_VERSION")}},
        });
        let handshake = self
            .send(&mut server, &init)
            .and_then(|()| self.await_response(&mut server, id, HANDSHAKE_TIMEOUT));
        if let Err(err) = handshake {
            server.stop();
            return Err(err);
        }
        let initialized = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        if let Err(err) = self.send(&mut server, &initialized) {
            server.stop();
            return Err(err);
        }
        debug!(worker = %self.name, "tool server initialized");
        Ok(server)
    }

    fn send(&self, server: &mut ServerProcess, message: &Value) -> Result<(), AgentError> {
        writeln!(server.stdin, "{message}")
            .and_then(|()| server.stdin.flush())
            .map_err(|err| AgentError::Failed {
                worker: self.name.clone(),
                message: format!("write to tool server: {err}"),
            })
    }

    /// Wait for the response carrying `id`, ignoring notifications and stray ids.
    fn await_response(
        &self,
        server: &mut ServerProcess,
        id: u64,
        timeout: Duration,
    ) -> Result<Value, AgentError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = match server.lines.recv_timeout(remaining) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(AgentError::Timeout {
                        worker: self.name.clone(),
                        timeout,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(AgentError::Failed {
                        worker: self.name.clone(),
                        message: "tool server exited".to_string(),
                    });
                }
            };
            let Ok(message) = serde_json::from_str::<Value>(&line) else {
                debug!(worker = %self.name, "ignoring non-JSON line from tool server");
                continue;
            };
            if message.get("id").and_then(Value::as_u64) != Some(id) {
                continue;
            }
            if let Some(error) = message.get("error") {
                let text = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(AgentError::Failed {
                    worker: self.name.clone(),
                    message: format!("rpc error: {text}"),
                });
            }
            return Ok(message.get("result").cloned().unwrap_or(Value::Null));
        }
    }
}

/// Flatten a `tools/call` result into process-shaped output.
fn call_output(result: &Value) -> ExecOutput {
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_else(|| result.to_string());
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if is_error {
        ExecOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: text,
        }
    } else {
        ExecOutput {
            exit_code: Some(0),
            stdout: text,
            stderr: String::new(),
        }
    }
}

impl AgentHandle for ToolServerAgent {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(worker = %self.name, tool = %self.tool))]
    fn execute(&self, prompt: &str, options: &ExecOptions) -> Result<ExecOutput, AgentError> {
        if !self.is_alive() {
            return Err(AgentError::Released {
                worker: self.name.clone(),
            });
        }
        let mut guard = self.lock()?;
        let mut server = match guard.take() {
            Some(server) => server,
            None => self.start()?,
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let call = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {
                "name": self.tool,
                "arguments": {
                    "prompt": prompt,
                    "cwd": self.workdir.display().to_string(),
                    "resume_id": options.resume_id,
                },
            },
        });
        let result = self
            .send(&mut server, &call)
            .and_then(|()| self.await_response(&mut server, id, options.timeout));
        match result {
            Ok(result) => {
                *guard = Some(server);
                Ok(call_output(&result))
            }
            Err(err @ AgentError::Failed { .. }) if server_alive(&mut server) => {
                // An rpc-level error leaves the server usable.
                *guard = Some(server);
                Err(err)
            }
            Err(err) => {
                warn!(err = %err, "stopping tool server after failed call");
                server.stop();
                Err(err)
            }
        }
    }

    fn kill(&self) -> anyhow::Result<()> {
        self.released.store(true, Ordering::SeqCst);
        let mut guard = self
            .server
            .lock()
            .map_err(|_| anyhow!("tool server lock poisoned"))?;
        if let Some(server) = guard.take() {
            server.stop();
            debug!(worker = %self.name, "tool server stopped");
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.released.load(Ordering::SeqCst)
    }
}

fn server_alive(server: &mut ServerProcess) -> bool {
    matches!(server.child.try_wait(), Ok(None))
}
