//! An in-process `Machine` implementation driven by a scripted sequence of
//! guest syscalls. Used by this crate's own tests and as the reference
//! implementation of the [`super::Machine`] contract for a production
//! back-end to follow.

use std::any::Any;
use std::time::{Duration, Instant};

use fleetvm_shared::{FleetError, FleetResult};

use super::{
    Accept4Outcome, BinaryType, FreeFdOutcome, GuestLifecycleHooks, ForkOptions, Machine,
    PollDecision, PollMethod, Registers, ResetOptions, RunOutcome,
};

/// One step of a scripted guest program. A `MockMachine` replays these in
/// order, calling into its installed [`GuestLifecycleHooks`] at each
/// syscall-shaped step and honoring whatever the hook decides.
#[derive(Debug, Clone)]
pub enum GuestAction {
    /// The guest calls `listen()`; records the listener's vfd for
    /// introspection (the hook objects already close over it directly).
    Listen { vfd: i32 },
    EpollWait { registered: Vec<i32> },
    Poll { polled: Vec<i32> },
    Accept4 { listener_vfd: i32, blocking: bool },
    AcceptSocket { host_fd: i32 },
    CloseFd(i32),
    Exit(i32),
}

pub struct MockMachine {
    script: Vec<GuestAction>,
    cursor: usize,
    hooks: Box<dyn GuestLifecycleHooks>,
    registers: Registers,
    binary_type: BinaryType,
    max_address: u64,
    tracked_listener_vfd: Option<i32>,
    frozen_cursor: usize,
    frozen_registers: Registers,
}

impl MockMachine {
    pub fn new(
        script: Vec<GuestAction>,
        binary_type: BinaryType,
        max_address: u64,
        hooks: Box<dyn GuestLifecycleHooks>,
    ) -> Self {
        Self {
            script,
            cursor: 0,
            hooks,
            registers: Registers::default(),
            binary_type,
            max_address,
            tracked_listener_vfd: None,
            frozen_cursor: 0,
            frozen_registers: Registers::default(),
        }
    }

    pub fn tracked_listener_vfd(&self) -> Option<i32> {
        self.tracked_listener_vfd
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Appends further scripted steps; used by tests to extend a master's
    /// script with the actions a forked worker (or a continued warmup) goes
    /// on to perform.
    pub fn extend_script(&mut self, actions: impl IntoIterator<Item = GuestAction>) {
        self.script.extend(actions);
    }
}

impl Machine for MockMachine {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn max_address(&self) -> u64 {
        self.max_address
    }

    fn registers(&self) -> Registers {
        self.registers
    }

    fn set_registers(&mut self, regs: Registers) {
        self.registers = regs;
    }

    fn binary_type(&self) -> BinaryType {
        self.binary_type
    }

    fn set_hooks(&mut self, hooks: Box<dyn GuestLifecycleHooks>) {
        self.hooks = hooks;
    }

    fn prepare_copy_on_write(&mut self, _max_work_mem: u64) {
        self.frozen_cursor = self.cursor;
        self.frozen_registers = self.registers;
    }

    fn run(&mut self, deadline: Option<Duration>) -> FleetResult<RunOutcome> {
        let start = Instant::now();
        loop {
            if let Some(d) = deadline {
                if start.elapsed() > d {
                    return Err(FleetError::MachineTimeout(
                        "guest exceeded its run deadline".to_string(),
                    ));
                }
            }

            let Some(action) = self.script.get(self.cursor).cloned() else {
                return Ok(RunOutcome::Exited(0));
            };

            match action {
                GuestAction::Listen { vfd } => {
                    self.tracked_listener_vfd = Some(vfd);
                    self.cursor += 1;
                }
                GuestAction::EpollWait { registered } => {
                    match self.hooks.epoll_wait(&registered) {
                        PollDecision::Quiescent(method) => {
                            return Ok(RunOutcome::WaitingForRequests(method));
                        }
                        PollDecision::CallSyscall => self.cursor += 1,
                    }
                }
                GuestAction::Poll { polled } => match self.hooks.poll(&polled) {
                    PollDecision::Quiescent(method) => {
                        return Ok(RunOutcome::WaitingForRequests(method));
                    }
                    PollDecision::CallSyscall => self.cursor += 1,
                },
                GuestAction::Accept4 { listener_vfd, blocking } => {
                    match self.hooks.accept4(listener_vfd, blocking) {
                        Accept4Outcome::Quiescent(method) => {
                            return Ok(RunOutcome::WaitingForRequests(method));
                        }
                        Accept4Outcome::Eagain => {
                            self.registers.rax = -(libc::EAGAIN as i64);
                            self.cursor += 1;
                        }
                        Accept4Outcome::CallSyscall => self.cursor += 1,
                    }
                }
                GuestAction::AcceptSocket { host_fd } => {
                    let vfd = self.hooks.accept_socket(host_fd);
                    self.registers.rax = vfd as i64;
                    self.cursor += 1;
                    if vfd >= 0 {
                        return Ok(RunOutcome::Serving);
                    }
                }
                GuestAction::CloseFd(vfd) => match self.hooks.free_fd(vfd) {
                    FreeFdOutcome::StopGuest => {
                        self.cursor += 1;
                        return Ok(RunOutcome::ResetPending);
                    }
                    FreeFdOutcome::Continue => self.cursor += 1,
                },
                GuestAction::Exit(code) => return Ok(RunOutcome::Exited(code)),
            }
        }
    }

    fn restart_poll_syscall(&mut self, _poll_method: PollMethod) {
        // The mock models "restart this syscall" implicitly: a quiescent
        // poll/epoll_wait/accept4 action never advances the cursor, so the
        // next `run` call re-evaluates the same script step against
        // whatever hooks are currently installed.
    }

    fn stop(&mut self) {
        // Suspension is modeled by `run` returning rather than a separate
        // flag; nothing to do for a single-threaded scripted machine.
    }

    fn fork(&self, _opts: ForkOptions) -> Box<dyn Machine> {
        Box::new(MockMachine {
            script: self.script.clone(),
            cursor: self.frozen_cursor,
            hooks: Box::new(super::WorkerHooks::new()),
            registers: self.frozen_registers,
            binary_type: self.binary_type,
            max_address: self.max_address,
            tracked_listener_vfd: self.tracked_listener_vfd,
            frozen_cursor: self.frozen_cursor,
            frozen_registers: self.frozen_registers,
        })
    }

    fn reset_to(&mut self, master: &dyn Machine, _opts: ResetOptions) -> FleetResult<()> {
        let master = master_as_mock(master)?;
        self.script = master.script.clone();
        self.cursor = master.frozen_cursor;
        self.registers = master.frozen_registers;
        Ok(())
    }
}

fn master_as_mock(master: &dyn Machine) -> FleetResult<&MockMachine> {
    master.as_any().downcast_ref::<MockMachine>().ok_or_else(|| {
        FleetError::ResetFailure("reset_to: master is not a MockMachine".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{MasterHooks, WarmupHooks, WorkerHooks};

    fn master_script() -> Vec<GuestAction> {
        vec![
            GuestAction::Listen { vfd: 4 },
            GuestAction::EpollWait { registered: vec![4] },
        ]
    }

    #[test]
    fn master_boot_reaches_waiting_for_requests_via_epoll() {
        let mut m = MockMachine::new(
            master_script(),
            BinaryType::Static,
            1 << 32,
            Box::new(MasterHooks::new(4)),
        );
        let outcome = m.run(None).unwrap();
        assert_eq!(outcome, RunOutcome::WaitingForRequests(PollMethod::Epoll));
    }

    #[test]
    fn warmup_then_worker_cycle_round_trips_through_fork_and_reset() {
        let mut master = MockMachine::new(
            master_script(),
            BinaryType::Static,
            1 << 32,
            Box::new(MasterHooks::new(4)),
        );
        assert_eq!(master.run(None).unwrap(), RunOutcome::WaitingForRequests(PollMethod::Epoll));

        // Warmup drives one freed connection, then re-enters epoll_wait.
        master.set_hooks(Box::new(WarmupHooks::new(4, PollMethod::Epoll, 1)));
        master.script.push(GuestAction::AcceptSocket { host_fd: 10 });
        master.script.push(GuestAction::CloseFd(10));
        master.script.push(GuestAction::EpollWait { registered: vec![4] });
        assert_eq!(master.run(None).unwrap(), RunOutcome::Serving);
        assert_eq!(master.run(None).unwrap(), RunOutcome::WaitingForRequests(PollMethod::Epoll));

        master.prepare_copy_on_write(0);

        let worker_script_tail = vec![
            GuestAction::Accept4 { listener_vfd: 4, blocking: false },
            GuestAction::AcceptSocket { host_fd: 20 },
            GuestAction::CloseFd(3),
        ];
        master.script.extend(worker_script_tail);

        let mut worker = master.fork(ForkOptions { max_req_mem: 1 << 20 });
        worker.set_hooks(Box::new(WorkerHooks::new()));

        assert_eq!(worker.run(None).unwrap(), RunOutcome::Serving);
        let outcome = worker.run(None).unwrap();
        assert_eq!(outcome, RunOutcome::ResetPending);

        worker
            .reset_to(
                master.as_ref(),
                ResetOptions {
                    reset_free_work_mem: 1 << 20,
                    reset_copy_all_registers: true,
                    reset_keep_all_work_memory: false,
                },
            )
            .unwrap();
    }
}
