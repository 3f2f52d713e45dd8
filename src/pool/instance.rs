/// Pool-owned sandbox instances and their lifecycle
use crate::isolation::Environment;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceState {
    Warm,
    Busy,
    Draining,
    Dead,
}

impl InstanceState {
    /// Warm <-> Busy, either -> Draining -> Dead
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Warm, Busy) | (Busy, Warm) | (Warm, Draining) | (Busy, Draining) | (Draining, Dead)
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::Warm => "warm",
            InstanceState::Busy => "busy",
            InstanceState::Draining => "draining",
            InstanceState::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// Why an instance left the pool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetireReason {
    SingleUse,
    MaxUses,
    MaxAge,
    Unhealthy,
    NotAlive,
    Shutdown,
    Abandoned,
}

impl RetireReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RetireReason::SingleUse => "single_use",
            RetireReason::MaxUses => "max_uses",
            RetireReason::MaxAge => "max_age",
            RetireReason::Unhealthy => "unhealthy",
            RetireReason::NotAlive => "not_alive",
            RetireReason::Shutdown => "shutdown",
            RetireReason::Abandoned => "abandoned",
        }
    }
}

pub struct SandboxInstance {
    id: String,
    state: InstanceState,
    created_at: DateTime<Utc>,
    born: Instant,
    uses_count: u32,
    env: Box<dyn Environment>,
}

impl SandboxInstance {
    /// Instances enter the pool Warm
    pub fn new(id: String, env: Box<dyn Environment>) -> Self {
        Self {
            id,
            state: InstanceState::Warm,
            created_at: Utc::now(),
            born: Instant::now(),
            uses_count: 0,
            env,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn uses_count(&self) -> u32 {
        self.uses_count
    }

    pub fn runner_pid(&self) -> Option<u32> {
        self.env.runner_pid()
    }

    pub fn age(&self) -> Duration {
        self.born.elapsed()
    }

    pub fn env_mut(&mut self) -> &mut dyn Environment {
        self.env.as_mut()
    }

    pub(crate) fn record_use(&mut self) {
        self.uses_count = self.uses_count.saturating_add(1);
    }

    pub(crate) fn is_alive(&mut self) -> bool {
        self.env.is_alive()
    }

    /// Invalid transitions are logged and ignored
    pub(crate) fn transition(&mut self, next: InstanceState) -> bool {
        if !self.state.can_transition_to(next) {
            log::error!("Instance {}: invalid transition {} -> {}", self.id, self.state, next);
            return false;
        }
        self.state = next;
        true
    }

    /// Draining -> Dead. Tears down the environment.
    pub(crate) fn destroy(mut self, reason: RetireReason) {
        if self.state != InstanceState::Draining {
            self.transition(InstanceState::Draining);
        }
        if let Err(e) = self.env.destroy() {
            log::warn!("Destroying instance {}: {}", self.id, e);
        }
        self.transition(InstanceState::Dead);
        log::debug!(
            "Instance {} retired ({}) after {} uses, created {}",
            self.id,
            reason.as_str(),
            self.uses_count,
            self.created_at.to_rfc3339()
        );
    }
}

impl fmt::Debug for SandboxInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxInstance")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("created_at", &self.created_at)
            .field("uses_count", &self.uses_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::Execution;
    use crate::protocol::{ExecutionRequest, ExecutionResult};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Stub(Arc<AtomicBool>);

    impl Environment for Stub {
        fn execute(&mut self, _: &ExecutionRequest, _: Duration) -> Execution {
            Execution::healthy(ExecutionResult::success(Vec::new()))
        }
        fn is_alive(&mut self) -> bool {
            !self.0.load(Ordering::SeqCst)
        }
        fn destroy(&mut self) -> crate::config::types::Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn lifecycle_transitions() {
        use InstanceState::*;
        assert!(Warm.can_transition_to(Busy));
        assert!(Busy.can_transition_to(Warm));
        assert!(Busy.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Dead));
        assert!(!Dead.can_transition_to(Warm));
        assert!(!Draining.can_transition_to(Warm));
        assert!(!Warm.can_transition_to(Dead));
    }

    #[test]
    fn destroy_tears_down_environment() {
        let destroyed = Arc::new(AtomicBool::new(false));
        let mut instance = SandboxInstance::new("a".to_string(), Box::new(Stub(destroyed.clone())));
        assert_eq!(instance.state(), InstanceState::Warm);
        assert!(instance.transition(InstanceState::Busy));
        instance.record_use();
        assert_eq!(instance.uses_count(), 1);
        assert!(!instance.transition(InstanceState::Dead));
        instance.destroy(RetireReason::SingleUse);
        assert!(destroyed.load(Ordering::SeqCst));
    }
}
