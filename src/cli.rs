use crate::config::types::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::isolation::cgroup::cgroup_v2_available;
use crate::isolation::jail::{self, user_namespaces_available, JailSpec};
use crate::isolation::ProcessIsolation;
use crate::protocol::codec::{write_frame, RunnerFrame};
use crate::protocol::{bound_diagnostic, ExecutionRequest};
use crate::runner::guest::Guest;
use crate::runner::Runner;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CliMode {
    /// `scorebox`: drives requests through the pool
    Host,
    /// `scorebox-runner`: executes requests inside an environment
    Runner,
}

#[derive(Parser)]
#[command(name = "scorebox", author, version, about = "Sandboxed metric execution engine", long_about = None)]
struct HostCli {
    #[command(subcommand)]
    command: HostCommand,
}

#[derive(Subcommand)]
enum HostCommand {
    /// Execute one request and print the result as JSON
    Run {
        /// Request JSON file, or - for stdin
        #[arg(long)]
        request: String,
        /// Wall-clock timeout in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Engine configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Report which isolation features this host supports
    Check {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Parser)]
#[command(name = "scorebox-runner", author, version, about = "Sandbox runner", long_about = None)]
struct RunnerCli {
    /// Jail description supplied by the host; the runner seals itself before serving
    #[arg(long)]
    jail: Option<String>,
    /// Read one request document from stdin, write one result document, exit
    #[arg(long)]
    once: bool,
    /// Interpreter for user code when running without --jail
    #[arg(long, default_value = "/usr/bin/python3")]
    interpreter: PathBuf,
}

pub fn run(mode: CliMode) -> Result<()> {
    env_logger::init();

    if !cfg!(target_os = "linux") {
        anyhow::bail!("scorebox requires Linux namespaces and cgroups");
    }

    match mode {
        CliMode::Host => run_host(HostCli::parse()),
        CliMode::Runner => run_runner(RunnerCli::parse()),
    }
}

/// File (if any), then environment overrides, then validation
fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::from_env()?);
    };
    let mut config = EngineConfig::load_from_file(path)?;
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn read_request(source: &str) -> Result<ExecutionRequest> {
    let mut raw = String::new();
    if source == "-" {
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("Failed to read request from stdin")?;
    } else {
        raw = std::fs::read_to_string(source).with_context(|| format!("Failed to read {}", source))?;
    }
    serde_json::from_str(&raw).context("Malformed execution request")
}

fn run_host(cli: HostCli) -> Result<()> {
    match cli.command {
        HostCommand::Run {
            request,
            timeout_secs,
            config,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(secs) = timeout_secs {
                config.default_timeout_ms = Duration::from_secs(secs).as_millis() as u64;
                config.validate()?;
            }
            // A single request never benefits from warm instances
            config.pool.warmup = false;

            let request = read_request(&request)?;
            let dispatcher = Dispatcher::from_config(&config)?;
            let outcome = dispatcher.run_detailed(&request, dispatcher.default_timeout());
            dispatcher.shutdown();

            println!("{}", serde_json::to_string_pretty(&outcome.result)?);
            log::info!(
                "Request {} finished as {:?} in {:?}",
                outcome.request_id,
                outcome.phase,
                outcome.elapsed
            );
            if !outcome.result.is_success() {
                std::process::exit(1);
            }
            Ok(())
        }
        HostCommand::Check { config } => {
            let config = load_config(config.as_deref())?;
            let report = CapabilityReport::probe(&config);
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.preflight_error.is_some() {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

#[derive(Debug, Serialize)]
struct CapabilityReport {
    mode: &'static str,
    euid: u32,
    user_namespaces: bool,
    cgroup_v2: bool,
    interpreter: PathBuf,
    interpreter_present: bool,
    runner: PathBuf,
    runner_present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    preflight_error: Option<String>,
}

impl CapabilityReport {
    fn probe(config: &EngineConfig) -> Self {
        let isolation = &config.isolation;
        let preflight = ProcessIsolation::new(isolation.clone()).preflight();
        Self {
            mode: isolation.mode.as_str(),
            euid: nix::unistd::geteuid().as_raw(),
            user_namespaces: user_namespaces_available(),
            cgroup_v2: cgroup_v2_available(),
            interpreter: isolation.interpreter.clone(),
            interpreter_present: isolation.interpreter.exists(),
            runner: isolation.runner_path.clone(),
            runner_present: isolation.runner_path.exists(),
            preflight_error: preflight.err().map(|e| e.to_string()),
        }
    }
}

fn run_runner(cli: RunnerCli) -> Result<()> {
    let (runner, controls, scratch_root) = match cli.jail.as_deref() {
        Some(raw) => {
            let spec: JailSpec = serde_json::from_str(raw).context("Malformed --jail description")?;
            let sealed = match jail::seal(&spec) {
                Ok(sealed) => sealed,
                Err(e) => {
                    let _ = write_frame(
                        &mut std::io::stdout().lock(),
                        &RunnerFrame::Fatal {
                            message: bound_diagnostic(&e.to_string()),
                        },
                    );
                    return Err(e).context("Failed to seal sandbox");
                }
            };
            let guest = Guest::new(&sealed.interpreter, &sealed.workdir);
            (Runner::new(guest, sealed.scratch, sealed.namespace_init), sealed.controls, None)
        }
        None => {
            log::warn!("Runner started without --jail: no isolation is applied");
            let workdir = std::env::temp_dir().join(format!("scorebox-runner-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&workdir)
                .with_context(|| format!("Failed to create {}", workdir.display()))?;
            let guest = Guest::new(&cli.interpreter, &workdir);
            (Runner::new(guest, vec![workdir.clone()], false), Vec::new(), Some(workdir))
        }
    };

    let outcome = if cli.once {
        runner
            .run_once(std::io::stdin().lock(), std::io::stdout().lock())
            .map(Some)
    } else {
        runner
            .serve(std::io::stdin().lock(), std::io::stdout().lock(), controls)
            .map(|()| None)
    };

    if let Some(dir) = scratch_root {
        let _ = std::fs::remove_dir_all(dir);
    }
    let _ = std::io::stdout().flush();

    match outcome? {
        Some(false) => std::process::exit(1),
        _ => Ok(()),
    }
}
