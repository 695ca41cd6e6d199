//! Interpreter backed by a long-lived python or node worker process.
//!
//! The worker runs an embedded runner script. Each execution is one JSON line
//! `{"code": ..., "env": {...}}` on its stdin, answered by one line on its stdout:
//! `{"ok": {...bindings}}` or `{"err": "traceback"}`. Output the executed code prints
//! goes to the worker's stderr, which the pod inherits.

use async_trait::async_trait;
use log::{debug, info, warn};
use rust_embed::RustEmbed;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::channel::types::Bindings;
use crate::error_handling::types::FleetError;
use crate::sandbox::pod_instance::Interpreter;

#[derive(RustEmbed)]
#[folder = "$CARGO_MANIFEST_DIR/runners/"]
struct Runners;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    Node,
}

impl Language {
    fn program(&self) -> &'static str {
        match self {
            Language::Python => "python3",
            Language::Node => "node",
        }
    }

    fn runner(&self) -> &'static str {
        match self {
            Language::Python => "python_runner.py",
            Language::Node => "node_runner.js",
        }
    }

    fn eval_flags(&self) -> &'static [&'static str] {
        match self {
            Language::Python => &["-u", "-c"],
            Language::Node => &["-e"],
        }
    }
}

#[derive(Serialize)]
struct Request<'a> {
    code: &'a str,
    env: &'a Bindings,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum Reply {
    Ok(Bindings),
    Err(String),
}

struct Worker {
    _child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// [`Interpreter`] forwarding executions to a worker process.
///
/// The worker is spawned on first use (or by [`ScriptInterpreter::warm_up`]) and kept
/// for the life of the pod, so modules it imported stay loaded between executions. A
/// worker that dies is replaced on the next execution.
pub struct ScriptInterpreter {
    command: Vec<String>,
    worker: Mutex<Option<Worker>>,
}

impl ScriptInterpreter {
    /// Interpreter for `language` that imports `preload` when its worker starts.
    pub fn new(language: Language, preload: &[String]) -> Result<Self, FleetError> {
        let name = language.runner();
        let file = Runners::get(name)
            .ok_or_else(|| FleetError::TemplateError(format!("no runner named {}", name)))?;
        let script = String::from_utf8(file.data.into_owned())
            .map_err(|e| FleetError::TemplateError(format!("{} is not UTF-8: {}", name, e)))?;

        let mut command = vec![language.program().to_string()];
        command.extend(language.eval_flags().iter().map(|flag| flag.to_string()));
        command.push(script);
        command.extend(preload.iter().cloned());

        info!(
            "Executing code with {} ({} preloaded module(s))",
            language.program(),
            preload.len()
        );
        Ok(Self::from_command(command))
    }

    /// Interpreter whose worker is `command` (program first, then arguments).
    pub(crate) fn from_command(command: Vec<String>) -> Self {
        Self {
            command,
            worker: Mutex::new(None),
        }
    }

    /// Starts the worker now rather than on the first execution.
    pub async fn warm_up(&self) -> Result<(), FleetError> {
        let mut worker = self.worker.lock().await;
        if worker.is_none() {
            *worker = Some(self.spawn_worker().map_err(FleetError::StartFailure)?);
        }
        Ok(())
    }

    fn spawn_worker(&self) -> Result<Worker, String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or("empty interpreter command")?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {}", program, e))?;

        let stdin = child.stdin.take().ok_or("worker stdin unavailable")?;
        let stdout = child.stdout.take().ok_or("worker stdout unavailable")?;
        debug!("Spawned {} worker", program);
        Ok(Worker {
            _child: child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }
}

async fn exchange(worker: &mut Worker, code: &str, env: &Bindings) -> Result<Reply, String> {
    let mut line = serde_json::to_string(&Request { code, env }).map_err(|e| e.to_string())?;
    line.push('\n');
    worker
        .stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| format!("worker unreachable: {}", e))?;
    worker
        .stdin
        .flush()
        .await
        .map_err(|e| format!("worker unreachable: {}", e))?;

    let reply = worker
        .stdout
        .next_line()
        .await
        .map_err(|e| format!("worker unreadable: {}", e))?
        .ok_or("worker exited")?;
    serde_json::from_str(&reply).map_err(|e| format!("malformed worker reply: {}", e))
}

#[async_trait]
impl Interpreter for ScriptInterpreter {
    async fn run(&self, code: &str, env: Bindings) -> Result<Bindings, String> {
        let mut guard = self.worker.lock().await;
        if guard.is_none() {
            *guard = Some(self.spawn_worker()?);
        }
        let worker = guard.as_mut().ok_or("worker unavailable")?;

        match exchange(worker, code, &env).await {
            Ok(Reply::Ok(bindings)) => Ok(bindings),
            Ok(Reply::Err(message)) => Err(message),
            Err(e) => {
                warn!("Interpreter worker failed, replacing it: {}", e);
                *guard = None;
                Err(e)
            }
        }
    }
}

/// Reads a `preload.txt`: one module per line, blank lines and `#` comments skipped.
pub fn read_preload(path: &Path) -> Result<Vec<String>, FleetError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}
