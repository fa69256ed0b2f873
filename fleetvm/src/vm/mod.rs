//! The `Machine` abstraction: a narrow trait boundary around the
//! virtualization back-end (vCPU execution, memory mapping, syscall dispatch
//! hooks). The back-end itself is out of scope for this crate; [`mock`]
//! provides an in-process implementation used by tests and as a worked
//! example of the trait's contract.

pub mod hooks;
pub mod mock;

use std::time::Duration;

use fleetvm_shared::FleetResult;

pub use hooks::{
    Accept4Outcome, FreeFdOutcome, GuestLifecycleHooks, MasterHooks, PollDecision, PollMethodLatch,
    WarmupHooks, WorkerHookState, WorkerHooks,
};

/// Binary type detected at load time (§3 `MasterGuest::binary_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryType {
    Static,
    StaticPie,
    Dynamic,
}

/// The guest's polling idiom, discovered once during Master initialization
/// and inherited by every Worker (invariant 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMethod {
    Poll,
    Epoll,
    Blocking,
}

/// A host or guest-visible socket endpoint, as observed by a hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    V4 { addr: std::net::Ipv4Addr, port: u16 },
    V6 { addr: std::net::Ipv6Addr, port: u16 },
    Unix { path: std::path::PathBuf },
}

/// Guest general-purpose register file, reduced to what the sandboxing layer
/// and the GDB stub need to observe or mutate (syscall return value and
/// instruction pointer). A real back-end's register file is much larger;
/// this is the slice the policy layer is contractually allowed to touch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub rax: i64,
    pub rip: u64,
}

/// Options for constructing a Worker's `Machine` from the Master's (§4.5
/// "fork semantics").
#[derive(Debug, Clone, Copy)]
pub struct ForkOptions {
    pub max_req_mem: u64,
}

/// Options for `reset_to` (§4.5 "reset semantics").
#[derive(Debug, Clone, Copy)]
pub struct ResetOptions {
    pub reset_free_work_mem: u64,
    pub reset_copy_all_registers: bool,
    pub reset_keep_all_work_memory: bool,
}

/// What happened during one `Machine::run` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The guest reached its quiescent point; the discovered (or already
    /// known) poll method is reported so the caller can mark
    /// `waiting_for_requests`.
    WaitingForRequests(PollMethod),
    /// A worker admitted a client and is now serving it; `run` should be
    /// called again to let the guest continue.
    Serving,
    /// The guest closed its tracked client and is ready for `reset_to`.
    ResetPending,
    /// The guest process exited on its own (unexpected outside boot).
    Exited(i32),
}

/// The out-of-scope virtualization back-end boundary. Everything above this
/// trait (Policy, PathResolver, Sandbox, Master, Worker, Pool) is this
/// crate's actual subject matter; a production implementation would back
/// this trait with real vCPU execution, memory mapping, and syscall dispatch
/// instead of [`mock::MockMachine`].
pub trait Machine: Send {
    /// Lets operations that need another `Machine`'s concrete state (such as
    /// `reset_to`, which must read the master's frozen snapshot) downcast to
    /// it. The trait itself stays otherwise free of backend-specific state.
    fn as_any(&self) -> &dyn std::any::Any;

    fn max_address(&self) -> u64;
    fn registers(&self) -> Registers;
    fn set_registers(&mut self, regs: Registers);
    fn binary_type(&self) -> BinaryType;

    /// Installs the initialization-time or ephemeral hook set. Swapped
    /// wholesale at fork time (§4.5 "Workers install ephemeral-specific
    /// hooks that replace the Master's initialization-time hooks").
    fn set_hooks(&mut self, hooks: Box<dyn GuestLifecycleHooks>);

    /// Marks the Master's working memory as shared, read-only, copy-on-write
    /// (§4.5 `prepare_copy_on_write`). Called with `0` at freeze time.
    fn prepare_copy_on_write(&mut self, max_work_mem: u64);

    /// Runs the guest until it hits a hook-reported stop condition, a fault,
    /// or `deadline` elapses.
    fn run(&mut self, deadline: Option<Duration>) -> FleetResult<RunOutcome>;

    /// Re-enters the polling syscall the guest was stopped inside of,
    /// matching `poll_method` (§4.8 step 2 `restart_poll_syscall`).
    fn restart_poll_syscall(&mut self, poll_method: PollMethod);

    /// Stops guest execution at the next suspension point.
    fn stop(&mut self);

    /// Constructs a copy-on-write clone of this machine (§4.5 fork
    /// semantics).
    fn fork(&self, opts: ForkOptions) -> Box<dyn Machine>;

    /// Restores this machine's memory and registers to `master`'s frozen
    /// state (§4.5 reset semantics).
    fn reset_to(&mut self, master: &dyn Machine, opts: ResetOptions) -> FleetResult<()>;
}
