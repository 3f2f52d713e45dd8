//! Host side of the process isolation backend.
//!
//! Each environment is one `scorebox-runner` process in its own process group,
//! optionally inside its own cgroup. The runner seals itself and reports the
//! controls it applied; the host refuses any environment that is missing a
//! control the configured mode requires. Timeouts are enforced here, never
//! by the runner.

use crate::config::types::{IsolationConfig, Result, ScoreboxError, SecurityMode};
use crate::isolation::cgroup::{cgroup_v2_available, InstanceCgroup};
use crate::isolation::jail::{required_controls, user_namespaces_available, JailSpec};
use crate::isolation::{Environment, Execution, IsolationAdapter};
use crate::observability::audit;
use crate::protocol::codec::{read_frame, write_frame, HostFrame, RunnerFrame, MAX_FRAME_BYTES};
use crate::protocol::{ErrorKind, ExecutionRequest, ExecutionResult};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::fs;
use std::io::{BufRead, BufReader};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const EXIT_GRACE: Duration = Duration::from_millis(500);
const THREAD_JOIN_GRACE: Duration = Duration::from_secs(1);

/// Events produced by the stdout reader thread
#[derive(Debug)]
enum FrameEvent {
    Frame(RunnerFrame),
    Malformed(String),
    Closed,
}

/// Spawns sealed runner processes
pub struct ProcessIsolation {
    config: IsolationConfig,
}

impl ProcessIsolation {
    pub fn new(config: IsolationConfig) -> Self {
        Self { config }
    }

    /// Check host prerequisites for the configured mode without spawning anything
    pub fn preflight(&self) -> Result<()> {
        if !self.config.runner_path.exists() {
            return Err(ScoreboxError::Config(format!(
                "runner binary not found at {}",
                self.config.runner_path.display()
            )));
        }
        if !self.config.interpreter.exists() {
            log::warn!(
                "Interpreter {} not found; user-code requests will fail",
                self.config.interpreter.display()
            );
        }

        let root = nix::unistd::geteuid().is_root();
        match self.config.mode {
            SecurityMode::Strict => {
                if !root {
                    return Err(ScoreboxError::Privilege("strict mode requires root".to_string()));
                }
                if !cgroup_v2_available() {
                    return Err(ScoreboxError::Cgroup(
                        "strict mode requires a cgroup v2 hierarchy".to_string(),
                    ));
                }
            }
            SecurityMode::Permissive => {
                if !root && !user_namespaces_available() {
                    return Err(ScoreboxError::Namespace(
                        "unprivileged user namespaces are disabled on this host".to_string(),
                    ));
                }
            }
            SecurityMode::Dev => {
                log::warn!("Dev mode selected: sandboxes will run WITHOUT isolation");
            }
        }
        Ok(())
    }

    fn create_cgroup(&self, instance_id: &str) -> Result<Option<InstanceCgroup>> {
        let mode = self.config.mode;
        if !mode.is_isolated() {
            return Ok(None);
        }
        match InstanceCgroup::create(
            &self.config.cgroup_root,
            instance_id,
            &self.config.limits,
            mode.strict_mode(),
        ) {
            Ok(cgroup) => Ok(Some(cgroup)),
            Err(e) if mode.strict_mode() => Err(e),
            Err(e) => {
                log::warn!("{} (permissive mode)", e);
                Ok(None)
            }
        }
    }
}

impl IsolationAdapter for ProcessIsolation {
    fn backend_name(&self) -> &'static str {
        "process"
    }

    fn create(&self, instance_id: &str) -> Result<Box<dyn Environment>> {
        let scratch_dir = self.config.runtime_root.join(instance_id);
        let root_dir = scratch_dir.join("root");
        fs::create_dir_all(&root_dir).map_err(|e| {
            ScoreboxError::Filesystem(format!("Failed to create {}: {}", root_dir.display(), e))
        })?;

        let cgroup = match self.create_cgroup(instance_id) {
            Ok(cgroup) => cgroup,
            Err(e) => {
                let _ = fs::remove_dir_all(&scratch_dir);
                return Err(e);
            }
        };

        let spec = JailSpec {
            instance_id: instance_id.to_string(),
            mode: self.config.mode,
            root_dir,
            runtime_mounts: self.config.runtime_mounts.clone(),
            interpreter: self.config.interpreter.clone(),
            limits: self.config.limits.clone(),
            cgroup_procs: cgroup.as_ref().map(InstanceCgroup::procs_file),
            sandbox_uid: self.config.sandbox_uid,
            sandbox_gid: self.config.sandbox_gid,
        };

        let mut env = ProcessEnvironment::spawn(&self.config.runner_path, &spec, cgroup, scratch_dir)?;
        match env.await_ready(self.config.boot_timeout(), required_controls(self.config.mode)) {
            Ok(()) => {
                log::info!(
                    "Created environment {} (mode={}, controls={:?})",
                    instance_id,
                    self.config.mode.as_str(),
                    env.controls
                );
                audit::environment_created(instance_id, env.child.id(), &env.controls);
                Ok(Box::new(env))
            }
            Err(e) => {
                audit::environment_rejected(instance_id, &e.to_string());
                if let Err(cleanup) = env.destroy() {
                    log::warn!("Cleanup after failed create of {}: {}", instance_id, cleanup);
                }
                Err(e)
            }
        }
    }
}

/// One running sandbox runner
pub struct ProcessEnvironment {
    instance_id: String,
    child: Child,
    pgid: Pid,
    stdin: Option<ChildStdin>,
    frames: Receiver<FrameEvent>,
    threads: Vec<JoinHandle<()>>,
    cgroup: Option<InstanceCgroup>,
    scratch_dir: PathBuf,
    controls: Vec<String>,
    exit_status: Option<ExitStatus>,
    destroyed: bool,
}

impl ProcessEnvironment {
    fn spawn(
        runner_path: &std::path::Path,
        spec: &JailSpec,
        cgroup: Option<InstanceCgroup>,
        scratch_dir: PathBuf,
    ) -> Result<Self> {
        let jail = serde_json::to_string(spec)?;
        let mut command = Command::new(runner_path);
        command
            .arg("--jail")
            .arg(jail)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Ok(filter) = std::env::var("RUST_LOG") {
            command.env("RUST_LOG", filter);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = fs::remove_dir_all(&scratch_dir);
                return Err(ScoreboxError::Process(format!(
                    "Failed to spawn runner {}: {}",
                    runner_path.display(),
                    e
                )));
            }
        };
        let pgid = Pid::from_raw(child.id() as i32);

        let (tx, frames) = unbounded();
        let mut threads = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            threads.push(std::thread::spawn(move || {
                let mut reader = BufReader::new(stdout);
                loop {
                    match read_frame::<_, RunnerFrame>(&mut reader, MAX_FRAME_BYTES) {
                        Ok(Some(frame)) => {
                            if tx.send(FrameEvent::Frame(frame)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            let _ = tx.send(FrameEvent::Closed);
                            break;
                        }
                        Err(e) => {
                            let _ = tx.send(FrameEvent::Malformed(e.to_string()));
                            break;
                        }
                    }
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let id = spec.instance_id.clone();
            threads.push(std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    log::debug!("[{}] {}", id, line);
                }
            }));
        }

        Ok(Self {
            instance_id: spec.instance_id.clone(),
            stdin: child.stdin.take(),
            child,
            pgid,
            frames,
            threads,
            cgroup,
            scratch_dir,
            controls: Vec::new(),
            exit_status: None,
            destroyed: false,
        })
    }

    fn await_ready(&mut self, boot_timeout: Duration, required: &[&str]) -> Result<()> {
        let event = match self.frames.recv_timeout(boot_timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                return Err(ScoreboxError::Environment(format!(
                    "runner did not report ready within {:?}",
                    boot_timeout
                )))
            }
            Err(RecvTimeoutError::Disconnected) => FrameEvent::Closed,
        };

        match event {
            FrameEvent::Frame(RunnerFrame::Ready { controls, .. }) => {
                let missing: Vec<&str> = required
                    .iter()
                    .copied()
                    .filter(|control| !controls.iter().any(|c| c == control))
                    .collect();
                if !missing.is_empty() {
                    return Err(ScoreboxError::Environment(format!(
                        "environment is missing required isolation controls: {}",
                        missing.join(", ")
                    )));
                }
                self.controls = controls;
                Ok(())
            }
            FrameEvent::Frame(RunnerFrame::Fatal { message }) => Err(ScoreboxError::Environment(format!(
                "runner failed to seal: {}",
                message
            ))),
            FrameEvent::Frame(other) => Err(ScoreboxError::Protocol(format!(
                "expected ready frame, got {:?}",
                other
            ))),
            FrameEvent::Malformed(e) => Err(ScoreboxError::Protocol(e)),
            FrameEvent::Closed => {
                let status = self.reap(EXIT_GRACE);
                Err(ScoreboxError::Environment(format!(
                    "runner exited during startup ({})",
                    describe_status(status)
                )))
            }
        }
    }

    /// Kill everything this environment started
    fn kill(&mut self) {
        if let Some(cgroup) = &self.cgroup {
            cgroup.kill_all();
        }
        if self.exit_status.is_none() {
            if let Err(e) = killpg(self.pgid, Signal::SIGKILL) {
                log::debug!("killpg({}) for {}: {}", self.pgid, self.instance_id, e);
            }
            match self.child.wait() {
                Ok(status) => self.exit_status = Some(status),
                Err(e) => log::warn!("Failed to reap runner of {}: {}", self.instance_id, e),
            }
        }
        self.stdin = None;
    }

    /// Give an exiting runner a moment, then force it
    fn reap(&mut self, grace: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + grace;
        while self.exit_status.is_none() && Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(status)) => self.exit_status = Some(status),
                Ok(None) => std::thread::sleep(Duration::from_millis(10)),
                Err(_) => break,
            }
        }
        self.kill();
        self.exit_status
    }

    fn crashed(&mut self, detail: String) -> Execution {
        let status = self.reap(EXIT_GRACE);
        log::warn!("Environment {} crashed: {} ({})", self.instance_id, detail, describe_status(status));
        Execution::crashed(ExecutionResult::failure(
            ErrorKind::EvaluationError,
            format!("{} ({})", detail, describe_status(status)),
        ))
    }
}

fn describe_status(status: Option<ExitStatus>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "exit status unknown".to_string(),
    }
}

impl Environment for ProcessEnvironment {
    fn execute(&mut self, request: &ExecutionRequest, timeout: Duration) -> Execution {
        let Some(stdin) = self.stdin.as_mut() else {
            return Execution::crashed(ExecutionResult::failure(
                ErrorKind::EvaluationError,
                "sandbox environment is no longer available",
            ));
        };

        let request_id = uuid::Uuid::new_v4().to_string();
        let frame = HostFrame::Execute {
            request_id: request_id.clone(),
            request: request.clone(),
        };
        if let Err(e) = write_frame(stdin, &frame) {
            return self.crashed(format!("failed to send request to sandbox runner: {}", e));
        }

        match self.frames.recv_timeout(timeout) {
            Ok(FrameEvent::Frame(RunnerFrame::Result {
                request_id: answered,
                result,
            })) if answered == request_id => Execution::healthy(result.bounded()),
            Ok(FrameEvent::Frame(RunnerFrame::Fatal { message })) => {
                self.crashed(format!("sandbox runner failed: {}", message))
            }
            Ok(FrameEvent::Frame(other)) => {
                self.crashed(format!("sandbox runner sent an unexpected frame: {:?}", other))
            }
            Ok(FrameEvent::Malformed(e)) => {
                self.crashed(format!("sandbox runner broke protocol: {}", e))
            }
            Ok(FrameEvent::Closed) | Err(RecvTimeoutError::Disconnected) => {
                self.crashed("sandbox runner exited without producing a result".to_string())
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "Request {} on {} exceeded {:?}; killing environment",
                    request_id,
                    self.instance_id,
                    timeout
                );
                self.kill();
                Execution::killed(ExecutionResult::failure(
                    ErrorKind::Timeout,
                    format!("execution exceeded the time limit of {:?}", timeout),
                ))
            }
        }
    }

    fn runner_pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn is_alive(&mut self) -> bool {
        if self.destroyed || self.exit_status.is_some() || self.stdin.is_none() {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                false
            }
            Err(_) => false,
        }
    }

    fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        self.kill();

        let deadline = Instant::now() + THREAD_JOIN_GRACE;
        while self.threads.iter().any(|t| !t.is_finished()) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        for handle in self.threads.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                log::debug!("Detaching output reader of {}", self.instance_id);
            }
        }

        let mut first_error = None;
        if let Some(mut cgroup) = self.cgroup.take() {
            if let Err(e) = cgroup.remove() {
                first_error.get_or_insert(e);
            }
        }
        if self.scratch_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&self.scratch_dir) {
                first_error.get_or_insert(ScoreboxError::Filesystem(format!(
                    "Failed to remove {}: {}",
                    self.scratch_dir.display(),
                    e
                )));
            }
        }

        log::debug!("Destroyed environment {}", self.instance_id);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ProcessEnvironment {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            log::warn!("Destroying environment {}: {}", self.instance_id, e);
        }
    }
}
