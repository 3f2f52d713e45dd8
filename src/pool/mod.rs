//! Warm pool of sandbox instances.
//!
//! All bookkeeping happens under one mutex; environment creation, execution
//! and destruction always happen outside it. Capacity counts instances in
//! every state (warm, busy, being created, being destroyed), so the pool
//! never exceeds `max_size`.
//!
//! Exhaustion policy: checkout at capacity waits on a condition variable for
//! up to `checkout_wait`, then fails with `PoolError::Exhausted`.

pub mod instance;

use crate::config::types::{PoolConfig, PoolError, Result, ReusePolicy};
use crate::isolation::{Execution, IsolationAdapter};
use crate::protocol::ExecutionRequest;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use instance::{InstanceState, RetireReason, SandboxInstance};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Snapshot of pool occupancy and lifetime counters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub warm: usize,
    pub busy: usize,
    pub creating: usize,
    pub draining: usize,
    pub created: u64,
    pub destroyed: u64,
    pub checkouts: u64,
    pub exhausted: u64,
}

#[derive(Default)]
struct PoolState {
    warm: VecDeque<SandboxInstance>,
    busy: usize,
    creating: usize,
    draining: usize,
    shutting_down: bool,
    created: u64,
    destroyed: u64,
    checkouts: u64,
    exhausted: u64,
}

impl PoolState {
    fn total(&self) -> usize {
        self.warm.len() + self.busy + self.creating + self.draining
    }
}

enum MaintenanceSignal {
    Wake,
    Shutdown,
}

struct PoolShared {
    adapter: Arc<dyn IsolationAdapter>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
    wake_tx: Sender<MaintenanceSignal>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake_maintenance(&self) {
        let _ = self.wake_tx.try_send(MaintenanceSignal::Wake);
    }

    fn create_instance(&self) -> Result<SandboxInstance> {
        let id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let env = self.adapter.create(&id)?;
        log::debug!(
            "Created instance {} via {} in {:?}",
            id,
            self.adapter.backend_name(),
            started.elapsed()
        );
        Ok(SandboxInstance::new(id, env))
    }

    /// Destroy an instance already counted in `draining`
    fn finish_retire(&self, instance: SandboxInstance, reason: RetireReason) {
        instance.destroy(reason);
        let mut state = self.lock();
        state.draining -= 1;
        state.destroyed += 1;
        drop(state);
        self.available.notify_all();
    }

    fn release(&self, mut instance: SandboxInstance, healthy: bool) {
        instance.record_use();
        let recyclable = healthy
            && self.config.reuse == ReusePolicy::Recycle
            && instance.uses_count() < self.config.max_uses
            && instance.age() < self.config.max_age()
            && instance.is_alive();

        let mut state = self.lock();
        state.busy -= 1;
        let reason = if state.shutting_down {
            Some(RetireReason::Shutdown)
        } else if recyclable {
            None
        } else if !healthy {
            Some(RetireReason::Unhealthy)
        } else if self.config.reuse == ReusePolicy::SingleUse {
            Some(RetireReason::SingleUse)
        } else if instance.uses_count() >= self.config.max_uses {
            Some(RetireReason::MaxUses)
        } else if instance.age() >= self.config.max_age() {
            Some(RetireReason::MaxAge)
        } else {
            Some(RetireReason::NotAlive)
        };

        match reason {
            None => {
                instance.transition(InstanceState::Warm);
                state.warm.push_back(instance);
                drop(state);
                self.available.notify_all();
            }
            Some(reason) => {
                instance.transition(InstanceState::Draining);
                state.draining += 1;
                drop(state);
                self.finish_retire(instance, reason);
                self.wake_maintenance();
            }
        }
    }

    fn retire_expired(&self) {
        let max_age = self.config.max_age();
        let expired: Vec<SandboxInstance> = {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            let (expired, keep): (Vec<_>, Vec<_>) = state.warm.drain(..).partition(|i| i.age() >= max_age);
            state.warm = keep.into();
            state.draining += expired.len();
            expired
        };
        for instance in expired {
            self.finish_retire(instance, RetireReason::MaxAge);
        }
    }

    /// Create instances until the warm target is met. Returns how many were added.
    fn top_up(&self) -> Result<usize> {
        let target = self.config.effective_min_warm();
        let mut added = 0;
        loop {
            {
                let mut state = self.lock();
                if state.shutting_down
                    || state.warm.len() + state.creating >= target
                    || state.total() >= self.config.max_size
                {
                    return Ok(added);
                }
                state.creating += 1;
            }

            let created = self.create_instance();
            let mut state = self.lock();
            state.creating -= 1;
            match created {
                Ok(instance) if state.shutting_down => {
                    state.created += 1;
                    state.draining += 1;
                    drop(state);
                    self.finish_retire(instance, RetireReason::Shutdown);
                    return Ok(added);
                }
                Ok(instance) => {
                    state.created += 1;
                    state.warm.push_back(instance);
                    added += 1;
                    drop(state);
                    self.available.notify_all();
                }
                Err(e) => {
                    drop(state);
                    self.available.notify_all();
                    return Err(e);
                }
            }
        }
    }

    fn maintain(&self) {
        self.retire_expired();
        if let Err(e) = self.top_up() {
            log::warn!("Pool top-up failed: {}", e);
        }
    }
}

/// A checked-out instance. Dropping it without `PoolManager::release` destroys the instance.
pub struct PoolLease {
    shared: Arc<PoolShared>,
    instance: Option<SandboxInstance>,
}

impl PoolLease {
    pub fn instance_id(&self) -> &str {
        self.instance.as_ref().map(SandboxInstance::id).unwrap_or_default()
    }

    pub fn runner_pid(&self) -> Option<u32> {
        self.instance.as_ref().and_then(SandboxInstance::runner_pid)
    }

    pub fn execute(&mut self, request: &ExecutionRequest, timeout: Duration) -> Execution {
        match self.instance.as_mut() {
            Some(instance) => instance.env_mut().execute(request, timeout),
            None => Execution::crashed(crate::protocol::ExecutionResult::failure(
                crate::protocol::ErrorKind::EvaluationError,
                "lease no longer holds an instance",
            )),
        }
    }

    fn release(mut self, healthy: bool) {
        if let Some(instance) = self.instance.take() {
            self.shared.release(instance, healthy);
        }
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        if let Some(mut instance) = self.instance.take() {
            log::warn!("Lease for instance {} dropped without release", instance.id());
            instance.transition(InstanceState::Draining);
            {
                let mut state = self.shared.lock();
                state.busy -= 1;
                state.draining += 1;
            }
            self.shared.finish_retire(instance, RetireReason::Abandoned);
            self.shared.wake_maintenance();
        }
    }
}

struct Maintenance {
    tx: Sender<MaintenanceSignal>,
    handle: JoinHandle<()>,
}

pub struct PoolManager {
    shared: Arc<PoolShared>,
    maintenance: Mutex<Option<Maintenance>>,
}

impl PoolManager {
    /// Build the pool and start its maintenance thread, which begins warm-up immediately
    pub fn new(adapter: Arc<dyn IsolationAdapter>, config: PoolConfig) -> Self {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        let shared = Arc::new(PoolShared {
            adapter,
            config,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
            wake_tx: wake_tx.clone(),
        });

        let worker = Arc::clone(&shared);
        let interval = shared.config.maintenance_interval();
        let handle = thread::spawn(move || maintenance_loop(worker, wake_rx, interval));

        log::info!(
            "Pool started: backend={} min_warm={} max_size={} reuse={:?}",
            shared.adapter.backend_name(),
            shared.config.effective_min_warm(),
            shared.config.max_size,
            shared.config.reuse
        );

        Self {
            shared,
            maintenance: Mutex::new(Some(Maintenance { tx: wake_tx, handle })),
        }
    }

    /// Fill the warm set to `min_warm` before returning.
    /// Also waits out creations the maintenance thread already started.
    pub fn prefill(&self) -> Result<usize> {
        let added = self.shared.top_up()?;
        let target = self.shared.config.effective_min_warm();
        let mut state = self.shared.lock();
        while state.creating > 0 && state.warm.len() < target && !state.shutting_down {
            state = self
                .shared
                .available
                .wait_timeout(state, Duration::from_millis(20))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Ok(added)
    }

    pub fn checkout(&self) -> std::result::Result<PoolLease, PoolError> {
        let shared = &self.shared;
        let started = Instant::now();
        let deadline = started + shared.config.checkout_wait();
        let mut state = shared.lock();

        loop {
            if state.shutting_down {
                return Err(PoolError::ShuttingDown);
            }

            if let Some(mut instance) = state.warm.pop_front() {
                let reason = if instance.age() >= shared.config.max_age() {
                    Some(RetireReason::MaxAge)
                } else if !instance.is_alive() {
                    Some(RetireReason::NotAlive)
                } else {
                    None
                };
                if let Some(reason) = reason {
                    state.draining += 1;
                    drop(state);
                    shared.finish_retire(instance, reason);
                    shared.wake_maintenance();
                    state = shared.lock();
                    continue;
                }
                instance.transition(InstanceState::Busy);
                state.busy += 1;
                state.checkouts += 1;
                return Ok(self.lease(instance));
            }

            if state.total() < shared.config.max_size {
                state.creating += 1;
                drop(state);
                let created = shared.create_instance();
                state = shared.lock();
                state.creating -= 1;
                return match created {
                    Ok(instance) if state.shutting_down => {
                        state.created += 1;
                        state.draining += 1;
                        drop(state);
                        shared.finish_retire(instance, RetireReason::Shutdown);
                        Err(PoolError::ShuttingDown)
                    }
                    Ok(mut instance) => {
                        instance.transition(InstanceState::Busy);
                        state.created += 1;
                        state.busy += 1;
                        state.checkouts += 1;
                        Ok(self.lease(instance))
                    }
                    Err(e) => {
                        state.exhausted += 1;
                        drop(state);
                        shared.available.notify_all();
                        log::warn!("Checkout could not create an instance: {}", e);
                        Err(PoolError::Create(e))
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                state.exhausted += 1;
                return Err(PoolError::Exhausted {
                    waited: started.elapsed(),
                    max_size: shared.config.max_size,
                });
            }
            state = shared
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn lease(&self, instance: SandboxInstance) -> PoolLease {
        PoolLease {
            shared: Arc::clone(&self.shared),
            instance: Some(instance),
        }
    }

    /// Return a lease. Unhealthy instances and anything the reuse policy forbids are destroyed.
    pub fn release(&self, lease: PoolLease, healthy: bool) {
        lease.release(healthy);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            warm: state.warm.len(),
            busy: state.busy,
            creating: state.creating,
            draining: state.draining,
            created: state.created,
            destroyed: state.destroyed,
            checkouts: state.checkouts,
            exhausted: state.exhausted,
        }
    }

    /// Stop maintenance and destroy warm instances. Busy instances die on release.
    pub fn shutdown(&self) {
        let maintenance = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(maintenance) = maintenance else {
            return;
        };

        let warm: Vec<SandboxInstance> = {
            let mut state = self.shared.lock();
            state.shutting_down = true;
            let warm: Vec<_> = state.warm.drain(..).collect();
            state.draining += warm.len();
            warm
        };
        self.shared.available.notify_all();

        // The wake slot may be full; the receiver also stops once every sender is gone
        let _ = maintenance.tx.send_timeout(MaintenanceSignal::Shutdown, Duration::from_millis(100));
        drop(maintenance.tx);
        if maintenance.handle.join().is_err() {
            log::error!("Pool maintenance thread panicked");
        }

        for instance in warm {
            self.shared.finish_retire(instance, RetireReason::Shutdown);
        }
        log::info!("Pool shut down");
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn maintenance_loop(shared: Arc<PoolShared>, wake_rx: Receiver<MaintenanceSignal>, interval: Duration) {
    log::debug!("Pool maintenance thread started");
    loop {
        shared.maintain();
        if shared.lock().shutting_down {
            break;
        }
        match wake_rx.recv_timeout(interval) {
            Ok(MaintenanceSignal::Wake) | Err(RecvTimeoutError::Timeout) => continue,
            Ok(MaintenanceSignal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("Pool maintenance thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ScoreboxError;
    use crate::isolation::Environment;
    use crate::protocol::ExecutionResult;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        created: AtomicUsize,
        destroyed: Arc<AtomicUsize>,
        fail: bool,
    }

    struct Env(Arc<AtomicUsize>, bool);

    impl Environment for Env {
        fn execute(&mut self, _: &ExecutionRequest, _: Duration) -> Execution {
            Execution::healthy(ExecutionResult::success(Vec::new()))
        }
        fn is_alive(&mut self) -> bool {
            !self.1
        }
        fn destroy(&mut self) -> Result<()> {
            if !self.1 {
                self.1 = true;
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    impl IsolationAdapter for Counting {
        fn backend_name(&self) -> &'static str {
            "counting"
        }
        fn create(&self, _: &str) -> Result<Box<dyn crate::isolation::Environment>> {
            if self.fail {
                return Err(ScoreboxError::Environment("no namespaces".to_string()));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Env(Arc::clone(&self.destroyed), false)))
        }
    }

    fn config(min_warm: usize, max_size: usize) -> PoolConfig {
        PoolConfig {
            min_warm,
            max_size,
            checkout_wait_ms: 0,
            maintenance_interval_ms: 3_600_000,
            ..PoolConfig::default()
        }
    }

    #[test]
    fn prefill_reaches_min_warm() {
        let adapter = Arc::new(Counting::default());
        let pool = PoolManager::new(adapter.clone(), config(3, 5));
        pool.prefill().unwrap();
        assert_eq!(pool.stats().warm, 3);
        assert_eq!(adapter.created.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn capacity_counts_every_state() {
        let adapter = Arc::new(Counting::default());
        let pool = PoolManager::new(adapter, config(0, 2));
        let first = pool.checkout().unwrap();
        let second = pool.checkout().unwrap();
        assert!(matches!(pool.checkout(), Err(PoolError::Exhausted { max_size: 2, .. })));
        assert_eq!(pool.stats().exhausted, 1);
        pool.release(first, true);
        assert!(pool.checkout().is_ok());
        pool.release(second, true);
    }

    #[test]
    fn single_use_destroys_on_release() {
        let adapter = Arc::new(Counting::default());
        let pool = PoolManager::new(adapter.clone(), config(0, 2));
        let lease = pool.checkout().unwrap();
        pool.release(lease, true);
        assert_eq!(adapter.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().warm, 0);
    }

    #[test]
    fn dropped_lease_destroys_its_instance() {
        let adapter = Arc::new(Counting::default());
        let pool = PoolManager::new(
            adapter.clone(),
            PoolConfig {
                reuse: ReusePolicy::Recycle,
                ..config(0, 1)
            },
        );
        drop(pool.checkout().unwrap());
        assert_eq!(adapter.destroyed.load(Ordering::SeqCst), 1);
        let stats = pool.stats();
        assert_eq!((stats.busy, stats.draining, stats.warm), (0, 0, 0));
    }

    #[test]
    fn create_failure_surfaces_as_create_error() {
        let adapter = Arc::new(Counting {
            fail: true,
            ..Counting::default()
        });
        let pool = PoolManager::new(adapter, config(0, 1));
        assert!(matches!(pool.checkout(), Err(PoolError::Create(_))));
        assert_eq!(pool.stats().creating, 0);
    }

    /// First create returns at once; later ones block until the gate opens
    struct Gated {
        created: AtomicUsize,
        gate: crossbeam_channel::Receiver<()>,
        destroyed: Arc<AtomicUsize>,
    }

    impl IsolationAdapter for Gated {
        fn backend_name(&self) -> &'static str {
            "gated"
        }
        fn create(&self, _: &str) -> Result<Box<dyn crate::isolation::Environment>> {
            if self.created.fetch_add(1, Ordering::SeqCst) > 0 {
                let _ = self.gate.recv();
            }
            Ok(Box::new(Env(Arc::clone(&self.destroyed), false)))
        }
    }

    #[test]
    fn release_wakes_checkout_even_while_prefill_waits() {
        let (open, gate) = crossbeam_channel::bounded::<()>(0);
        let adapter = Arc::new(Gated {
            created: AtomicUsize::new(0),
            gate,
            destroyed: Arc::new(AtomicUsize::new(0)),
        });
        let pool = Arc::new(PoolManager::new(
            adapter,
            PoolConfig {
                reuse: ReusePolicy::Recycle,
                checkout_wait_ms: 10_000,
                ..config(2, 2)
            },
        ));

        // Maintenance: one instance warm, the second stuck in create
        let settle = Instant::now() + Duration::from_secs(5);
        while (pool.stats().warm, pool.stats().creating) != (1, 1) {
            assert!(Instant::now() < settle, "pool never reached warm=1 creating=1");
            std::thread::sleep(Duration::from_millis(5));
        }
        let held = pool.checkout().unwrap();

        let prefill = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.prefill())
        };
        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                let lease = pool.checkout();
                let woke = Instant::now();
                (lease.map(|lease| pool.release(lease, true)).is_ok(), woke)
            })
        };
        std::thread::sleep(Duration::from_millis(150));

        let released = Instant::now();
        pool.release(held, true);
        let (ok, woke) = waiter.join().unwrap();
        assert!(ok);
        assert!(
            woke.duration_since(released) < Duration::from_secs(2),
            "checkout waited {:?} after release",
            woke.duration_since(released)
        );

        drop(open);
        assert!(prefill.join().unwrap().is_ok());
        pool.shutdown();
    }

    #[test]
    fn shutdown_destroys_warm_and_refuses_checkout() {
        let adapter = Arc::new(Counting::default());
        let pool = PoolManager::new(adapter.clone(), config(2, 2));
        pool.prefill().unwrap();
        pool.shutdown();
        assert_eq!(adapter.destroyed.load(Ordering::SeqCst), 2);
        assert!(matches!(pool.checkout(), Err(PoolError::ShuttingDown)));
        pool.shutdown();
    }
}
