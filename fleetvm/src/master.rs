//! The long-lived Master guest (§3, §4.5): booted once, driven to the
//! `WaitingForRequests` quiescent point, optionally warmed up, then frozen as
//! a copy-on-write template that every Worker forks from.

use std::sync::Arc;

use fleetvm_shared::{FleetError, FleetResult};
use parking_lot::Mutex;

use crate::policy::Policy;
use crate::sandbox::Sandbox;
use crate::vm::{BinaryType, Machine, MasterHooks, PollMethod, RunOutcome, WorkerHookState, WorkerHooks};

/// Master lifecycle state (§4.5's state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Booting,
    WaitingForRequests,
    Frozen,
}

/// Owns the Master's `Machine` and tracks the fields in §3's `MasterGuest`.
pub struct MasterGuest {
    machine: Box<dyn Machine>,
    sandbox: Sandbox,
    state: MasterState,
    poll_method: Option<PollMethod>,
    tracked_listener_vfd: i32,
    tracked_listener_fd: i32,
    /// Set once the single-VM optimization (§4.8: `concurrency == 1 &&
    /// !ephemeral`) installs its own admission hooks, letting the Master
    /// serve requests directly with no Worker pool.
    direct_hook_state: Option<Arc<Mutex<WorkerHookState>>>,
}

impl MasterGuest {
    /// Takes ownership of a booted-but-not-yet-driven `Machine` plus the
    /// listener vfd the Sandbox observed during the guest's `listen()` call
    /// (§4.3 `listening_socket`). `tracked_listener_fd` is the matching host
    /// descriptor, recorded the same way.
    pub fn new(
        machine: Box<dyn Machine>,
        sandbox: Sandbox,
        tracked_listener_vfd: i32,
        tracked_listener_fd: i32,
    ) -> Self {
        Self {
            machine,
            sandbox,
            state: MasterState::Booting,
            poll_method: None,
            tracked_listener_vfd,
            tracked_listener_fd,
            direct_hook_state: None,
        }
    }

    pub fn state(&self) -> MasterState {
        self.state
    }

    pub fn poll_method(&self) -> Option<PollMethod> {
        self.poll_method
    }

    pub fn binary_type(&self) -> BinaryType {
        self.machine.binary_type()
    }

    pub fn tracked_listener_vfd(&self) -> i32 {
        self.tracked_listener_vfd
    }

    pub fn tracked_listener_fd(&self) -> i32 {
        self.tracked_listener_fd
    }

    pub fn policy(&self) -> &Policy {
        self.sandbox.policy()
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn machine(&self) -> &dyn Machine {
        self.machine.as_ref()
    }

    /// Drives the guest from `Booting` to `WaitingForRequests` (§4.5): races
    /// the three polling idioms via `MasterHooks` and records whichever fires
    /// first as `poll_method` (invariant 4). `deadline` is `max_boot_time`.
    pub fn boot(&mut self, deadline: Option<std::time::Duration>) -> FleetResult<()> {
        if self.state != MasterState::Booting {
            return Err(FleetError::Internal(
                "boot() called outside the Booting state".to_string(),
            ));
        }

        self.machine.set_hooks(Box::new(MasterHooks::new(self.tracked_listener_vfd)));

        match self.machine.run(deadline)? {
            RunOutcome::WaitingForRequests(method) => {
                self.poll_method = Some(method);
                self.state = MasterState::WaitingForRequests;
                tracing::info!(poll_method = ?method, "master reached quiescent point");
                Ok(())
            }
            RunOutcome::Exited(code) => Err(FleetError::Engine(format!(
                "master guest exited during boot with code {code}"
            ))),
            other => Err(FleetError::Internal(format!(
                "unexpected run outcome during boot: {other:?}"
            ))),
        }
    }

    /// Re-enters the polling syscall the guest stopped inside of, matching
    /// the already-discovered `poll_method` (used between warmup barriers,
    /// §4.4 step 4).
    pub fn restart_poll_syscall(&mut self) -> FleetResult<()> {
        let method = self.poll_method.ok_or_else(|| {
            FleetError::Internal("restart_poll_syscall called before poll_method is known".to_string())
        })?;
        self.machine.restart_poll_syscall(method);
        Ok(())
    }

    pub fn run(&mut self, deadline: Option<std::time::Duration>) -> FleetResult<RunOutcome> {
        self.machine.run(deadline)
    }

    /// Swaps in the warmup hook set (§4.4 step 3), which counts freed
    /// accepted sockets and stops the guest once `expected_freed_sockets` is
    /// reached on re-entry to the already-known `poll_method`.
    pub fn install_warmup_hooks(&mut self, expected_freed_sockets: u32) -> FleetResult<()> {
        let method = self.poll_method.ok_or_else(|| {
            FleetError::Internal("install_warmup_hooks called before poll_method is known".to_string())
        })?;
        self.machine.set_hooks(Box::new(crate::vm::WarmupHooks::new(
            self.tracked_listener_vfd,
            method,
            expected_freed_sockets,
        )));
        Ok(())
    }

    /// Installs the same admission-tracking hooks a Worker would use, so the
    /// single-VM-optimization Master (§4.8) can serve one client at a time
    /// without a separate Worker. Idempotent: later calls replace the
    /// tracked-client state, so callers should install once and then drive
    /// `run`/`direct_reset_needed`/`clear_direct_hooks_for_next_request` in a
    /// loop rather than reinstalling per request.
    pub fn install_direct_serving_hooks(&mut self) {
        let hooks = WorkerHooks::new();
        self.direct_hook_state = Some(hooks.shared_state());
        self.machine.set_hooks(Box::new(hooks));
    }

    pub fn direct_hooks_installed(&self) -> bool {
        self.direct_hook_state.is_some()
    }

    /// Whether the Master's tracked client fd has been freed and it's ready
    /// to serve the next one (mirrors `Worker::reset_needed`).
    pub fn direct_reset_needed(&self) -> bool {
        self.direct_hook_state.as_ref().is_some_and(|s| s.lock().reset_needed)
    }

    /// Clears tracked-client state between requests on the direct-serving
    /// path. No memory/register reset is needed here — the Master never
    /// forked away from itself.
    pub fn clear_direct_hooks_for_next_request(&mut self) {
        if let Some(state) = &self.direct_hook_state {
            state.lock().clear_for_reset();
        }
    }

    /// Freezes the Master as a copy-on-write template (§4.5
    /// `prepare_copy_on_write(0)`). Only valid from `WaitingForRequests`.
    pub fn freeze(&mut self) -> FleetResult<()> {
        if self.state != MasterState::WaitingForRequests {
            return Err(FleetError::Internal(
                "freeze() called outside WaitingForRequests".to_string(),
            ));
        }
        self.machine.prepare_copy_on_write(0);
        self.state = MasterState::Frozen;
        tracing::info!("master frozen as copy-on-write template");
        Ok(())
    }

    /// Forks a Worker's `Machine` from this Master (§4.5 fork semantics).
    /// Only valid once frozen.
    pub fn fork_worker_machine(&self, max_req_mem: u64) -> FleetResult<Box<dyn Machine>> {
        if self.state != MasterState::Frozen {
            return Err(FleetError::Internal(
                "fork_worker_machine called before the master is frozen".to_string(),
            ));
        }
        Ok(self.machine.fork(crate::vm::ForkOptions { max_req_mem }))
    }

    /// Shared, reference-counted handle to this Master's `Policy`, for
    /// Workers that need their own independent `Sandbox` instance wrapping
    /// the same allow-lists (§4.5 "Workers inherit the Master's
    /// connect/bind policies").
    pub fn policy_handle(&self) -> Arc<Policy> {
        self.sandbox.policy_arc()
    }
}
