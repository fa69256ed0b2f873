//! Pool supervision (§4.8): owns the Master and the fleet of Workers, one
//! thread per worker in production. The per-worker supervision step
//! (`service_once`) is factored out as a synchronous, directly testable
//! primitive; the infinite per-thread loop around it is production-only
//! orchestration with no interesting logic of its own to unit-test.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleetvm_shared::{FleetError, FleetResult};
use parking_lot::Mutex;

use crate::master::MasterGuest;
use crate::sandbox::Sandbox;
use crate::storage_guest::StorageGuestPair;
use crate::vm::RunOutcome;
use crate::worker::{ResetPolicy, Worker};

/// Pool-wide tuning, derived from `Configuration` (§4.8, §6).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub concurrency: u16,
    pub ephemeral: bool,
    pub max_req_time: Option<Duration>,
    pub reset_policy: ResetPolicy,
    pub max_req_mem: u64,
    /// `DEBUG=1` (§6): open the GDB stub on worker failure.
    pub debug_on_failure: bool,
    /// `DEBUG_FORK=1` (§6): open the GDB stub at each worker start.
    pub debug_fork: bool,
}

/// Owns the frozen Master behind a lock so every worker thread can fork and
/// reset against it, and the fleet-wide reset counter used for banner/
/// telemetry reporting (§4.5 "an optional `on_reset` callback fires").
pub struct Pool {
    master: Arc<Mutex<MasterGuest>>,
    config: PoolConfig,
    reset_counter: Arc<AtomicU64>,
    storage_guest: Option<Arc<Mutex<StorageGuestPair>>>,
}

impl Pool {
    pub fn new(master: MasterGuest, config: PoolConfig, storage_guest: Option<Arc<Mutex<StorageGuestPair>>>) -> Self {
        Self { master: Arc::new(Mutex::new(master)), config, reset_counter: Arc::new(AtomicU64::new(0)), storage_guest }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn reset_count(&self) -> u64 {
        self.reset_counter.load(Ordering::Relaxed)
    }

    /// Single-VM optimization (§4.8): `concurrency == 1 && !ephemeral` means
    /// the Master itself services requests directly, with no Worker pool.
    pub fn needs_single_vm_optimization(&self) -> bool {
        self.config.concurrency == 1 && !self.config.ephemeral
    }

    /// One supervision cycle for the single-VM optimization path (§4.8):
    /// the Master serves requests directly, with no Worker pool. Installs
    /// its own admission hooks on first use, then drives `run` and clears
    /// the tracked-client state once a request finishes instead of forking
    /// a Worker to reset.
    pub fn run_master_directly(&self) -> FleetResult<RunOutcome> {
        let mut master = self.master.lock();
        if !master.direct_hooks_installed() {
            master.install_direct_serving_hooks();
        }
        let outcome = master.run(self.config.max_req_time)?;
        if matches!(outcome, RunOutcome::ResetPending) && master.direct_reset_needed() {
            master.clear_direct_hooks_for_next_request();
            self.reset_counter.fetch_add(1, Ordering::Relaxed);
        }
        Ok(outcome)
    }

    /// §4.8 step 1: constructs a Worker from the Master. Failure here is
    /// logged by the caller and the thread exits without entering the
    /// supervision loop.
    pub fn spawn_worker(&self, id: usize) -> FleetResult<Worker> {
        let master = self.master.lock();
        let machine = master.fork_worker_machine(self.config.max_req_mem)?;
        let sandbox = Sandbox::new(master.policy_handle(), "/");
        Ok(Worker::new(id, machine, sandbox, self.config.ephemeral, self.config.reset_policy))
    }

    pub fn poll_method(&self) -> FleetResult<crate::vm::PollMethod> {
        self.master.lock().poll_method().ok_or_else(|| {
            FleetError::Internal("poll_method requested before the master has booted".to_string())
        })
    }

    /// One supervision cycle for `worker` (§4.8 steps 2–4): drive the guest,
    /// and on `ResetPending` or any back-end exception, reset the worker
    /// back to the Master's frozen snapshot. Reset failures are logged and
    /// swallowed — the caller's thread keeps running (§7 `ResetFailure`).
    pub fn service_once(&self, worker: &mut Worker) -> FleetResult<RunOutcome> {
        let poll_method = self.poll_method()?;
        match worker.drive(poll_method, self.config.max_req_time) {
            Ok(RunOutcome::ResetPending) => {
                self.reset_worker(worker);
                Ok(RunOutcome::ResetPending)
            }
            Ok(other) => Ok(other),
            Err(e) => {
                tracing::warn!(worker = worker.id(), error = %e, "worker failure; resetting");
                self.reset_worker(worker);
                if self.config.debug_on_failure {
                    tracing::warn!(worker = worker.id(), "DEBUG=1: opening gdb stub on failure");
                }
                Err(e)
            }
        }
    }

    fn reset_worker(&self, worker: &mut Worker) {
        let master = self.master.lock();
        match worker.reset_to(master.machine()) {
            Ok(()) => {
                self.reset_counter.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!(worker = worker.id(), error = %e, "reset failure; continuing to service");
            }
        }
    }

    /// Serializes a call into the paired storage guest (§4.7, §5's "only
    /// mutex on the hot path"), if one is configured.
    pub fn call_storage_guest<R>(
        &self,
        primary_worker_id: usize,
        f: impl FnOnce(&mut Worker) -> FleetResult<R>,
    ) -> FleetResult<R> {
        let guest = self.storage_guest.as_ref().ok_or_else(|| {
            FleetError::Internal("call_storage_guest invoked with no storage guest configured".to_string())
        })?;
        guest.lock().call_paired(primary_worker_id, f)
    }
}
