//! A short-lived clone of the Master (§3 `Worker`, §4.5 Worker state
//! machine, §4.6 hook set): forked with copy-on-write memory, serves one
//! client at a time, and resets back to the Master's frozen snapshot when
//! the guest closes the tracked client (or on failure).

use std::sync::Arc;

use fleetvm_shared::{FleetError, FleetResult};
use parking_lot::Mutex;

use crate::sandbox::Sandbox;
use crate::vm::{Machine, ResetOptions, RunOutcome, WorkerHookState, WorkerHooks};

/// Worker lifecycle state (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    PollingInKernel,
    Serving,
    ResetPending,
}

/// Reset tuning, derived once from `Configuration` (§4.5 "reset semantics").
#[derive(Debug, Clone, Copy)]
pub struct ResetPolicy {
    pub reset_free_work_mem: u64,
    pub reset_copy_all_registers: bool,
    pub reset_keep_all_work_memory: bool,
}

impl ResetPolicy {
    fn as_options(&self) -> ResetOptions {
        ResetOptions {
            reset_free_work_mem: self.reset_free_work_mem,
            reset_copy_all_registers: self.reset_copy_all_registers,
            reset_keep_all_work_memory: self.reset_keep_all_work_memory,
        }
    }
}

/// A Worker: holds its own `Machine` forked from the Master, a stable pool
/// index, and shared hook state readable from outside the installed
/// `Box<dyn GuestLifecycleHooks>` (§3 `tracked_client_vfd/fd`,
/// `blocking_connections`, `reset_needed`).
pub struct Worker {
    id: usize,
    machine: Box<dyn Machine>,
    sandbox: Sandbox,
    state: WorkerState,
    ephemeral: bool,
    hook_state: Arc<Mutex<WorkerHookState>>,
    reset_policy: ResetPolicy,
}

impl Worker {
    /// Constructs a Worker from a Master's frozen `Machine` (§4.8 step 1:
    /// "Constructs a Worker from the Master (may fail — log and exit
    /// thread)"). The caller is expected to have obtained `machine` via
    /// `MasterGuest::fork_worker_machine`.
    pub fn new(
        id: usize,
        mut machine: Box<dyn Machine>,
        sandbox: Sandbox,
        ephemeral: bool,
        reset_policy: ResetPolicy,
    ) -> Self {
        let hooks = WorkerHooks::new();
        let hook_state = hooks.shared_state();
        machine.set_hooks(Box::new(hooks));

        Self { id, machine, sandbox, state: WorkerState::Idle, ephemeral, hook_state, reset_policy }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn tracked_client_vfd(&self) -> i32 {
        self.hook_state.lock().tracked_client_vfd
    }

    pub fn tracked_client_fd(&self) -> i32 {
        self.hook_state.lock().tracked_client_fd
    }

    pub fn blocking_connections(&self) -> bool {
        self.hook_state.lock().blocking_connections
    }

    pub fn reset_needed(&self) -> bool {
        self.hook_state.lock().reset_needed
    }

    /// `restart_poll_syscall` then `run`, matching the Pool's per-thread loop
    /// (§4.8 step 2). Returns the outcome so the caller can decide whether a
    /// reset is due.
    pub fn drive(&mut self, poll_method: crate::vm::PollMethod, deadline: Option<std::time::Duration>) -> FleetResult<RunOutcome> {
        match self.state {
            WorkerState::Idle => {
                self.machine.restart_poll_syscall(poll_method);
                self.state = WorkerState::PollingInKernel;
            }
            WorkerState::ResetPending => {
                return Err(FleetError::Internal(
                    "drive() called while a reset is pending".to_string(),
                ));
            }
            _ => {}
        }

        let outcome = self.machine.run(deadline)?;
        match outcome {
            RunOutcome::Serving => self.state = WorkerState::Serving,
            RunOutcome::ResetPending => self.state = WorkerState::ResetPending,
            RunOutcome::WaitingForRequests(_) => self.state = WorkerState::PollingInKernel,
            RunOutcome::Exited(code) => {
                return Err(FleetError::Engine(format!("worker guest exited unexpectedly with code {code}")))
            }
        }
        Ok(outcome)
    }

    /// `reset_to(master)` (§4.5 reset semantics, invariant 3). Valid from any
    /// state — the Pool calls this both on `ResetPending` and after catching
    /// a fault/timeout from `drive`.
    pub fn reset_to(&mut self, master: &dyn Machine) -> FleetResult<()> {
        self.machine.reset_to(master, self.reset_policy.as_options())?;
        self.hook_state.lock().clear_for_reset();
        self.state = WorkerState::Idle;
        Ok(())
    }
}
