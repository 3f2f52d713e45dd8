//! Dispatcher: the single entry point for scoring requests.
//!
//! `run` checks an instance out of the pool, executes the request with a
//! host-enforced timeout, releases the instance with the observed outcome and
//! returns a terminal `ExecutionResult`. A successful execution that produced
//! no scores is reported as `NoScoreProduced`.

use crate::config::types::{EngineConfig, Result};
use crate::isolation::{IsolationAdapter, ProcessIsolation};
use crate::observability::audit::{self, AuditEvent, AuditEventType, CorrelationIds};
use crate::pool::{PoolManager, PoolStats};
use crate::protocol::{ErrorKind, ExecutionRequest, ExecutionResult};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle of one in-flight request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    Pending,
    Dispatched,
    Completed,
    TimedOut,
    PoolExhausted,
}

impl RequestPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestPhase::Completed | RequestPhase::TimedOut | RequestPhase::PoolExhausted
        )
    }

    /// Pending -> Dispatched | PoolExhausted, Dispatched -> Completed | TimedOut
    pub fn can_transition_to(self, next: RequestPhase) -> bool {
        use RequestPhase::*;
        matches!(
            (self, next),
            (Pending, Dispatched) | (Pending, PoolExhausted) | (Dispatched, Completed) | (Dispatched, TimedOut)
        )
    }
}

/// Result of `Dispatcher::run_detailed`
#[derive(Clone, Debug, Serialize)]
pub struct DispatchOutcome {
    pub request_id: String,
    pub phase: RequestPhase,
    pub result: ExecutionResult,
    /// None when no instance was ever checked out
    pub instance_id: Option<String>,
    /// Host-side pid of the runner that served the request, when the backend has one
    pub runner_pid: Option<u32>,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

fn serialize_millis<S: serde::Serializer>(elapsed: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(elapsed.as_millis() as u64)
}

struct Tracker {
    phase: RequestPhase,
}

impl Tracker {
    fn advance(&mut self, next: RequestPhase) {
        debug_assert!(self.phase.can_transition_to(next), "{:?} -> {:?}", self.phase, next);
        self.phase = next;
    }
}

pub struct Dispatcher {
    pool: PoolManager,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(pool: PoolManager, default_timeout: Duration) -> Self {
        Self { pool, default_timeout }
    }

    /// Dispatcher over an arbitrary isolation backend
    pub fn with_adapter(adapter: Arc<dyn IsolationAdapter>, config: &EngineConfig) -> Self {
        Self::new(PoolManager::new(adapter, config.pool.clone()), config.default_timeout())
    }

    /// Dispatcher over process isolation, after checking host prerequisites
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let isolation = ProcessIsolation::new(config.isolation.clone());
        isolation.preflight()?;
        Ok(Self::with_adapter(Arc::new(isolation), config))
    }

    pub fn pool(&self) -> &PoolManager {
        &self.pool
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn run(&self, request: &ExecutionRequest, timeout: Duration) -> ExecutionResult {
        self.run_detailed(request, timeout).result
    }

    pub fn run_default(&self, request: &ExecutionRequest) -> ExecutionResult {
        self.run(request, self.default_timeout)
    }

    pub fn run_detailed(&self, request: &ExecutionRequest, timeout: Duration) -> DispatchOutcome {
        let request_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut tracker = Tracker {
            phase: RequestPhase::Pending,
        };

        let mut lease = match self.pool.checkout() {
            Ok(lease) => lease,
            Err(e) => {
                tracker.advance(RequestPhase::PoolExhausted);
                let result = ExecutionResult::failure(ErrorKind::PoolExhausted, e.to_string());
                audit::log_audit_event(
                    AuditEvent::new(AuditEventType::PoolExhausted, CorrelationIds::request(&request_id), e.to_string())
                        .with_request_kind(request.kind_name())
                        .with_elapsed(started.elapsed()),
                );
                return DispatchOutcome {
                    request_id,
                    phase: tracker.phase,
                    result,
                    instance_id: None,
                    runner_pid: None,
                    elapsed: started.elapsed(),
                };
            }
        };

        tracker.advance(RequestPhase::Dispatched);
        let instance_id = lease.instance_id().to_string();
        let runner_pid = lease.runner_pid();
        let correlation = CorrelationIds::request(&request_id)
            .with_instance(&instance_id)
            .with_runner_pid(runner_pid);
        let mut dispatched = AuditEvent::new(
            AuditEventType::RequestDispatched,
            correlation.clone(),
            format!("timeout {:?}", timeout),
        )
        .with_request_kind(request.kind_name());
        if let ExecutionRequest::UserCode { source, .. } = request {
            dispatched = dispatched.with_source(source);
        }
        audit::log_audit_event(dispatched);

        let execution = lease.execute(request, timeout);
        self.pool.release(lease, execution.disposition.is_healthy());

        let result = require_scores(execution.result);
        let timed_out = result.error_kind() == Some(ErrorKind::Timeout);
        tracker.advance(if timed_out {
            RequestPhase::TimedOut
        } else {
            RequestPhase::Completed
        });

        let elapsed = started.elapsed();
        audit::log_audit_event(
            AuditEvent::new(
                if timed_out {
                    AuditEventType::RequestTimedOut
                } else {
                    AuditEventType::RequestCompleted
                },
                correlation,
                format!("disposition {:?}", execution.disposition),
            )
            .with_error_kind(result.error_kind())
            .with_elapsed(elapsed),
        );

        DispatchOutcome {
            request_id,
            phase: tracker.phase,
            result,
            instance_id: Some(instance_id),
            runner_pid,
            elapsed,
        }
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

/// A well-formed execution that yielded nothing is still a failure for the caller
fn require_scores(result: ExecutionResult) -> ExecutionResult {
    match result {
        ExecutionResult::Success { scores } if scores.is_empty() => ExecutionResult::failure(
            ErrorKind::NoScoreProduced,
            "scoring implementation returned no scores",
        ),
        other => other,
    }
}
