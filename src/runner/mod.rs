//! Sandbox runner: the program that executes inside each isolated environment.
//!
//! The runner answers `execute` frames one at a time. Every failure inside a
//! request (bad source, catalog miss, metric error, even a panic) becomes a
//! typed `Failure` result. Between requests the scratch area is emptied and,
//! when the runner is init of its own PID namespace, every leftover process is
//! killed and reaped.

pub mod catalog;
pub mod guest;
pub mod heuristics;
pub mod normalize;

use crate::config::types::Result;
use crate::protocol::codec::{read_frame, write_frame, HostFrame, RunnerFrame, MAX_FRAME_BYTES};
use crate::protocol::{bound_diagnostic, ErrorKind, ExecutionRequest, ExecutionResult, PayloadKind};
use catalog::{Catalog, ScoreArgs};
use guest::Guest;
use serde_json::{Map, Value};
use std::io::{BufRead, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

pub struct Runner {
    catalog: &'static Catalog,
    guest: Guest,
    scratch: Vec<PathBuf>,
    namespace_init: bool,
}

impl Runner {
    /// `scratch` directories are emptied after every request.
    /// `namespace_init` enables the post-request process sweep.
    pub fn new(guest: Guest, scratch: Vec<PathBuf>, namespace_init: bool) -> Self {
        Self {
            catalog: Catalog::builtin(),
            guest,
            scratch,
            namespace_init,
        }
    }

    /// Execute one request to completion or to a caught failure
    pub fn handle(&self, request: &ExecutionRequest) -> ExecutionResult {
        match panic::catch_unwind(AssertUnwindSafe(|| self.execute(request))) {
            Ok(result) => result,
            Err(payload) => {
                let detail = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                log::error!("Request handling panicked: {}", detail);
                ExecutionResult::failure(
                    ErrorKind::EvaluationError,
                    format!("scoring panicked: {}", detail),
                )
            }
        }
    }

    fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        match request {
            ExecutionRequest::UserCode {
                source,
                input,
                payload_kind,
            } => self.guest.run(source, input, *payload_kind),
            ExecutionRequest::CatalogRef {
                metric_id,
                init_config,
                scoring_kwargs,
                payload_kind,
            } => self.run_catalog(metric_id, init_config, scoring_kwargs, *payload_kind),
        }
    }

    fn run_catalog(
        &self,
        metric_id: &str,
        init_config: &Map<String, Value>,
        scoring_kwargs: &Map<String, Value>,
        payload_kind: PayloadKind,
    ) -> ExecutionResult {
        let Some(factory) = self.catalog.resolve(metric_id) else {
            return ExecutionResult::failure(
                ErrorKind::UnknownMetric,
                format!(
                    "unknown metric '{}'; available: {}",
                    metric_id,
                    self.catalog.ids().join(", ")
                ),
            );
        };

        let metric = match factory(init_config) {
            Ok(metric) => metric,
            Err(e) => {
                return ExecutionResult::failure(
                    ErrorKind::EvaluationError,
                    format!("failed to construct metric '{}': {}", metric_id, e),
                )
            }
        };

        let args = if payload_kind.is_thread_level() {
            ScoreArgs::Thread(scoring_kwargs)
        } else {
            ScoreArgs::Keywords(scoring_kwargs)
        };
        match metric.score(&args) {
            Ok(output) => ExecutionResult::success(output.into_records()),
            Err(e) => ExecutionResult::failure(
                ErrorKind::EvaluationError,
                format!("metric '{}' failed: {}", metric.name(), e),
            ),
        }
    }

    /// Frame loop: announce readiness, then answer execute frames until EOF or shutdown
    pub fn serve<R: BufRead, W: Write>(&self, mut input: R, mut output: W, controls: Vec<String>) -> Result<()> {
        write_frame(
            &mut output,
            &RunnerFrame::Ready {
                runner_pid: std::process::id(),
                controls,
            },
        )?;

        loop {
            let frame = match read_frame::<_, HostFrame>(&mut input, MAX_FRAME_BYTES) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    log::debug!("Host closed the request stream");
                    return Ok(());
                }
                Err(e) => {
                    let _ = write_frame(
                        &mut output,
                        &RunnerFrame::Fatal {
                            message: bound_diagnostic(&e.to_string()),
                        },
                    );
                    return Err(e);
                }
            };

            match frame {
                HostFrame::Execute {
                    request_id,
                    request,
                } => {
                    log::debug!("Executing request {} ({})", request_id, request.kind_name());
                    let result = self.handle(&request);
                    write_frame(&mut output, &RunnerFrame::Result { request_id, result })?;
                    self.reset();
                }
                HostFrame::Shutdown => {
                    log::debug!("Shutdown requested by host");
                    return Ok(());
                }
            }
        }
    }

    /// One JSON document in, one out. Returns whether the result was a success.
    pub fn run_once<R: Read, W: Write>(&self, mut input: R, mut output: W) -> Result<bool> {
        let mut raw = Vec::new();
        input.read_to_end(&mut raw)?;

        let result = match serde_json::from_slice::<ExecutionRequest>(&raw) {
            Ok(request) => self.handle(&request),
            Err(e) => ExecutionResult::failure(
                ErrorKind::EvaluationError,
                format!("malformed execution request: {}", e),
            ),
        };

        serde_json::to_writer(&mut output, &result)?;
        output.write_all(b"\n")?;
        output.flush()?;
        self.reset();
        Ok(result.is_success())
    }

    fn reset(&self) {
        if self.namespace_init {
            sweep_namespace();
        }
        for dir in &self.scratch {
            clear_directory(dir);
        }
    }
}

/// Kill and reap every other process in this PID namespace.
/// Only valid when the caller is the namespace's init.
fn sweep_namespace() {
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::waitpid;
    use nix::unistd::Pid;

    if std::process::id() != 1 {
        log::warn!("Skipping process sweep: runner is not PID 1 of its namespace");
        return;
    }

    // From PID 1, kill(-1) reaches every other process in the namespace.
    let _ = kill(Pid::from_raw(-1), Signal::SIGKILL);
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
}

fn clear_directory(dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Cannot list scratch directory {}: {}", dir.display(), e);
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let removed = match entry.file_type() {
            Ok(kind) if kind.is_dir() => std::fs::remove_dir_all(&path),
            _ => std::fs::remove_file(&path),
        };
        if let Err(e) = removed {
            log::warn!("Failed to clear scratch entry {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::encode_frame;
    use serde_json::json;
    use std::io::Cursor;

    fn runner(scratch: &Path) -> Runner {
        Runner::new(
            Guest::new("/nonexistent/python3", scratch),
            vec![scratch.to_path_buf()],
            false,
        )
    }

    fn kwargs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn catalog_request_scores() {
        let dir = tempfile::tempdir().unwrap();
        let result = runner(dir.path()).handle(&ExecutionRequest::catalog(
            "LevenshteinRatio",
            Map::new(),
            kwargs(json!({"output": "abc", "reference": "abc"})),
        ));
        assert_eq!(result.scores()[0].value, 1.0);
    }

    #[test]
    fn unknown_metric_is_typed() {
        let dir = tempfile::tempdir().unwrap();
        let result = runner(dir.path()).handle(&ExecutionRequest::catalog("NoSuchMetric", Map::new(), Map::new()));
        assert_eq!(result.error_kind(), Some(ErrorKind::UnknownMetric));
        if let ExecutionResult::Failure { message, .. } = result {
            assert!(message.contains("available:"), "{}", message);
            assert!(message.contains("levenshtein_ratio"), "{}", message);
        }
    }

    #[test]
    fn catalog_thread_level_is_an_evaluation_error() {
        let dir = tempfile::tempdir().unwrap();
        let request = ExecutionRequest::catalog("equals", Map::new(), kwargs(json!({"output": "a"}))).thread_level();
        let result = runner(dir.path()).handle(&request);
        assert_eq!(result.error_kind(), Some(ErrorKind::EvaluationError));
    }

    #[test]
    fn missing_interpreter_is_an_evaluation_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = runner(dir.path()).handle(&ExecutionRequest::user_code("x = 1", Map::new()));
        assert_eq!(result.error_kind(), Some(ErrorKind::EvaluationError));
    }

    #[test]
    fn serve_answers_each_frame_and_clears_scratch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("leftover.txt"), b"state").unwrap();

        let mut input = Vec::new();
        for id in ["first", "second"] {
            input.extend(
                encode_frame(&HostFrame::Execute {
                    request_id: id.to_string(),
                    request: ExecutionRequest::catalog(
                        "equals",
                        Map::new(),
                        kwargs(json!({"output": id, "reference": "first"})),
                    ),
                })
                .unwrap(),
            );
        }
        let mut output = Vec::new();
        runner(dir.path())
            .serve(Cursor::new(input), &mut output, vec!["test".to_string()])
            .unwrap();

        let mut reader = Cursor::new(output);
        let ready: RunnerFrame = read_frame(&mut reader, MAX_FRAME_BYTES).unwrap().unwrap();
        assert!(matches!(ready, RunnerFrame::Ready { .. }));
        let mut values = Vec::new();
        while let Some(frame) = read_frame::<_, RunnerFrame>(&mut reader, MAX_FRAME_BYTES).unwrap() {
            if let RunnerFrame::Result { request_id, result } = frame {
                values.push((request_id, result.scores()[0].value));
            }
        }
        assert_eq!(values, vec![("first".to_string(), 1.0), ("second".to_string(), 0.0)]);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn serve_reports_garbage_as_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut output = Vec::new();
        let outcome = runner(dir.path()).serve(Cursor::new(b"not json\n".to_vec()), &mut output, Vec::new());
        assert!(outcome.is_err());
        let text = String::from_utf8(output).unwrap();
        assert!(text.lines().last().unwrap().contains("\"fatal\""));
    }

    #[test]
    fn run_once_writes_one_document() {
        let dir = tempfile::tempdir().unwrap();
        let request = serde_json::to_vec(&ExecutionRequest::catalog(
            "is_json",
            Map::new(),
            kwargs(json!({"output": "[1, 2]"})),
        ))
        .unwrap();
        let mut output = Vec::new();
        let ok = runner(dir.path()).run_once(&request[..], &mut output).unwrap();
        assert!(ok);
        let result: ExecutionResult = serde_json::from_slice(&output).unwrap();
        assert_eq!(result.scores()[0].name, "is_json_metric");
    }
}
