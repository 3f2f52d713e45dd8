//! Isolation adapter: creates and destroys sandbox environments.
//!
//! The pool only sees the two traits below. `ProcessIsolation` is the real
//! backend; tests substitute their own adapters.

pub mod cgroup;
pub mod jail;
pub mod privileges;
pub mod process;

use crate::config::types::Result;
use crate::protocol::{ExecutionRequest, ExecutionResult};
use std::time::Duration;

pub use process::{ProcessEnvironment, ProcessIsolation};

/// What the host knows about an environment after a request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Answered normally; may be recycled
    Healthy,
    /// Killed by the host (timeout); must be destroyed
    Killed,
    /// Runner died or broke protocol; must be destroyed
    Crashed,
}

impl Disposition {
    pub fn is_healthy(self) -> bool {
        matches!(self, Disposition::Healthy)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Execution {
    pub result: ExecutionResult,
    pub disposition: Disposition,
}

impl Execution {
    pub fn healthy(result: ExecutionResult) -> Self {
        Self {
            result,
            disposition: Disposition::Healthy,
        }
    }

    pub fn killed(result: ExecutionResult) -> Self {
        Self {
            result,
            disposition: Disposition::Killed,
        }
    }

    pub fn crashed(result: ExecutionResult) -> Self {
        Self {
            result,
            disposition: Disposition::Crashed,
        }
    }
}

/// One live, sealed sandbox
pub trait Environment: Send {
    /// Run one request, enforcing `timeout` from the host side
    fn execute(&mut self, request: &ExecutionRequest, timeout: Duration) -> Execution;

    /// Cheap liveness probe; false once the runner has exited
    fn is_alive(&mut self) -> bool;

    /// Tear down every resource. Must be idempotent.
    fn destroy(&mut self) -> Result<()>;

    /// Host-side pid of the runner, for audit correlation
    fn runner_pid(&self) -> Option<u32> {
        None
    }
}

/// Factory for environments
pub trait IsolationAdapter: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Create a fully isolated environment, or fail. Never returns a
    /// partially isolated one.
    fn create(&self, instance_id: &str) -> Result<Box<dyn Environment>>;
}
