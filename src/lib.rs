//! scorebox: sandboxed execution of untrusted scoring code
//!
//! Scoring requests (caller-supplied source or a reference to a built-in
//! metric) run inside pre-warmed, OS-isolated environments and come back as
//! typed results: a list of scores or a classified failure.
//!
//! # Architecture
//!
//! ## Protocol ([`protocol`])
//! - [`protocol`]: `ExecutionRequest`, `ScoreRecord`, `ExecutionResult`, `ErrorKind`
//! - [`protocol::codec`]: line-delimited JSON frames between host and runner
//!
//! ## Sandbox Runner ([`runner`])
//! - [`runner::guest`]: user code in a fresh interpreter per request
//! - [`runner::catalog`]: registry of built-in metrics, normalized ids
//! - [`runner::heuristics`]: the built-in heuristic metrics
//! - [`runner::normalize`]: one, many or no scores into an ordered list
//!
//! ## Isolation ([`isolation`])
//! - [`isolation::process`]: host side; spawns, supervises and kills runners
//! - [`isolation::jail`]: runner side; namespaces, chroot, limits, privilege drop
//! - [`isolation::cgroup`]: per-instance cgroup v2 limits and kill switch
//! - [`isolation::privileges`]: capability and credential reduction
//!
//! ## Pool and dispatch
//! - [`pool`]: warm instances, checkout/release, retirement, top-up
//! - [`dispatch`]: the single entry point for callers
//!
//! ## Configuration and observability
//! - [`config`]: engine configuration, environment knobs, error types
//! - [`observability::audit`]: structured audit events
//!
//! # Security model
//!
//! Isolation is a property of the environment, never of the runner's
//! cooperation: the runner seals itself before it reads a request, and the
//! host refuses any environment that does not report every control the
//! configured mode requires. Wall-clock limits are enforced by the host by
//! killing the environment.

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod isolation;
pub mod observability;
pub mod pool;
pub mod protocol;
pub mod runner;

pub use config::types::{
    EngineConfig, IsolationConfig, PoolConfig, PoolError, Result, ReusePolicy, SandboxLimits, ScoreboxError,
    SecurityMode,
};
pub use dispatch::{DispatchOutcome, Dispatcher, RequestPhase};
pub use isolation::{Disposition, Environment, Execution, IsolationAdapter, ProcessIsolation};
pub use pool::{PoolLease, PoolManager, PoolStats};
pub use protocol::{ErrorKind, ExecutionRequest, ExecutionResult, PayloadKind, ScoreRecord};
