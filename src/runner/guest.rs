//! Runs caller-supplied source in a fresh interpreter process.
//!
//! Every request gets its own interpreter, started from the embedded loader
//! script. The loader reports back on its own channel with one JSON document,
//! so nothing the user code prints can be mistaken for a result.

use crate::protocol::{ErrorKind, ExecutionResult, PayloadKind};
use crate::runner::normalize::ScoreOutput;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;

const LOADER: &str = include_str!("loader.py");

/// Frames belonging to the loader itself, as rendered in tracebacks
const HARNESS_FRAME: &str = "File \"<string>\"";

const REPLY_LIMIT: usize = 8 * 1024 * 1024;
const STDERR_LIMIT: usize = 64 * 1024;
const STDERR_GRACE: Duration = Duration::from_millis(250);

#[derive(Serialize)]
struct GuestJob<'a> {
    source: &'a str,
    input: &'a Map<String, Value>,
    thread: bool,
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum GuestReply {
    Ok { result: Value },
    InvalidCode { trace: String },
    MissingImplementation { found: Vec<String> },
    EvaluationError { trace: String },
}

/// Interpreter launch settings for user code
#[derive(Clone, Debug)]
pub struct Guest {
    interpreter: PathBuf,
    workdir: PathBuf,
    env: Vec<(String, String)>,
}

impl Guest {
    pub fn new(interpreter: impl Into<PathBuf>, workdir: impl Into<PathBuf>) -> Self {
        let workdir = workdir.into();
        let home = workdir.to_string_lossy().into_owned();
        Self {
            interpreter: interpreter.into(),
            env: vec![
                ("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string()),
                ("HOME".to_string(), home.clone()),
                ("TMPDIR".to_string(), home),
                ("LANG".to_string(), "C.UTF-8".to_string()),
                ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
            ],
            workdir,
        }
    }

    /// Load `source`, find its single scoring implementation and invoke it
    pub fn run(&self, source: &str, input: &Map<String, Value>, payload_kind: PayloadKind) -> ExecutionResult {
        let job = match serde_json::to_vec(&GuestJob {
            source,
            input,
            thread: payload_kind.is_thread_level(),
        }) {
            Ok(job) => job,
            Err(e) => {
                return ExecutionResult::failure(
                    ErrorKind::EvaluationError,
                    format!("failed to encode scoring input: {}", e),
                )
            }
        };

        let mut child = match Command::new(&self.interpreter)
            .args(["-I", "-B", "-c", LOADER])
            .current_dir(&self.workdir)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return ExecutionResult::failure(
                    ErrorKind::EvaluationError,
                    format!(
                        "failed to start interpreter {}: {}",
                        self.interpreter.display(),
                        e
                    ),
                )
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            std::thread::spawn(move || {
                if let Err(e) = stdin.write_all(&job) {
                    log::debug!("Interpreter closed stdin early: {}", e);
                }
            });
        }

        let (stderr_tx, stderr_rx) = crossbeam_channel::bounded(1);
        if let Some(stderr) = child.stderr.take() {
            std::thread::spawn(move || {
                let _ = stderr_tx.send(read_bounded(stderr, STDERR_LIMIT));
            });
        }

        let reply = match child.stdout.take() {
            Some(stdout) => read_bounded(stdout, REPLY_LIMIT),
            None => Vec::new(),
        };

        let status = match child.wait() {
            Ok(status) => status,
            Err(e) => {
                return ExecutionResult::failure(
                    ErrorKind::EvaluationError,
                    format!("failed to wait for interpreter: {}", e),
                )
            }
        };

        // Detached descendants may keep stderr open; don't wait on them.
        let stderr = stderr_rx.recv_timeout(STDERR_GRACE).unwrap_or_default();
        let stderr = String::from_utf8_lossy(&stderr);
        if !stderr.trim().is_empty() {
            log::debug!("Scoring process stderr:\n{}", stderr.trim_end());
        }

        interpret_reply(&reply, status, &stderr)
    }
}

/// Read up to `limit` bytes, then drain and discard the rest so the writer never blocks
fn read_bounded<R: Read>(mut reader: R, limit: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Err(e) = reader.by_ref().take(limit as u64).read_to_end(&mut buf) {
        log::debug!("Reading guest output failed: {}", e);
        return buf;
    }
    let _ = std::io::copy(&mut reader, &mut std::io::sink());
    buf
}

fn interpret_reply(reply: &[u8], status: ExitStatus, stderr: &str) -> ExecutionResult {
    let text = String::from_utf8_lossy(reply);
    let text = text.trim();
    if text.is_empty() {
        let mut message = format!("scoring process exited without producing a result ({})", status);
        let tail = stderr.trim();
        if !tail.is_empty() {
            message.push('\n');
            message.push_str(tail);
        }
        return ExecutionResult::failure(ErrorKind::EvaluationError, message);
    }

    let reply: GuestReply = match serde_json::from_str(text) {
        Ok(reply) => reply,
        Err(e) => {
            return ExecutionResult::failure(
                ErrorKind::EvaluationError,
                format!("scoring process produced a malformed result ({}): {}", status, e),
            )
        }
    };

    match reply {
        GuestReply::Ok { result } => match ScoreOutput::from_json(result) {
            Ok(output) => ExecutionResult::success(output.into_records()),
            Err(e) => ExecutionResult::failure(
                ErrorKind::EvaluationError,
                format!("invalid score output: {}", e),
            ),
        },
        GuestReply::InvalidCode { trace } => {
            ExecutionResult::failure(ErrorKind::InvalidCode, strip_harness_frames(&trace))
        }
        GuestReply::MissingImplementation { found } if found.is_empty() => ExecutionResult::failure(
            ErrorKind::MissingImplementation,
            "no scoring implementation found: define exactly one class with a score() method",
        ),
        GuestReply::MissingImplementation { found } => ExecutionResult::failure(
            ErrorKind::MissingImplementation,
            format!(
                "expected exactly one scoring implementation, found {}: {}",
                found.len(),
                found.join(", ")
            ),
        ),
        GuestReply::EvaluationError { trace } => {
            ExecutionResult::failure(ErrorKind::EvaluationError, strip_harness_frames(&trace))
        }
    }
}

/// Drop loader frames (and any source line printed under them) from a traceback
pub fn strip_harness_frames(trace: &str) -> String {
    let mut kept = Vec::new();
    let mut skipping = false;
    for line in trace.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("File \"") {
            skipping = trimmed.starts_with(HARNESS_FRAME);
            if skipping {
                continue;
            }
        } else if skipping && line.starts_with("    ") {
            continue;
        } else {
            skipping = false;
        }
        kept.push(line);
    }
    kept.join("\n").trim_end().to_string()
}
