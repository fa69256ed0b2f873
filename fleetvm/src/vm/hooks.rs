//! Capability objects for the syscall-interception points a [`super::Machine`]
//! dispatches to. One small trait, swapped wholesale between Master
//! initialization, warmup, and ephemeral Worker service, per design note
//! "model each hook as a small trait / capability object".

use super::PollMethod;

/// Outcome of an intercepted `accept4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept4Outcome {
    /// Let the real syscall run.
    CallSyscall,
    /// Synthesize `-EAGAIN` and skip the syscall (ephemeral double-admission
    /// guard, §4.6).
    Eagain,
    /// The guest's polling idiom was just identified; stop the guest.
    Quiescent(PollMethod),
}

/// Outcome of an intercepted `epoll_wait` or `poll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    CallSyscall,
    Quiescent(PollMethod),
}

/// Outcome of an intercepted `free_fd` (fd close).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeFdOutcome {
    Continue,
    StopGuest,
}

/// The hook set a [`super::Machine`] consults at each polling/accept/close
/// syscall. Distinct implementations encode Master-boot quiescence
/// detection, warmup counting, and ephemeral Worker admission without any
/// implementation needing to know about the others.
pub trait GuestLifecycleHooks: Send {
    fn accept4(&mut self, listener_vfd: i32, blocking: bool) -> Accept4Outcome;
    /// `host_fd` is the fd the real `accept()` returned; the hook decides
    /// the guest-visible vfd (or rejects with a negative errno).
    fn accept_socket(&mut self, host_fd: i32) -> i32;
    fn epoll_wait(&mut self, registered: &[i32]) -> PollDecision;
    fn poll(&mut self, polled: &[i32]) -> PollDecision;
    fn free_fd(&mut self, vfd: i32) -> FreeFdOutcome;
}

/// A one-shot latch over {Poll, Epoll, Blocking}, set exactly once per
/// Master and never overwritten (invariant 4). `try_set` returns `false` on
/// a conflicting second idiom; the caller logs and refuses to treat that
/// call as quiescence.
#[derive(Debug, Default)]
pub struct PollMethodLatch {
    method: Option<PollMethod>,
}

impl PollMethodLatch {
    pub fn new() -> Self {
        Self { method: None }
    }

    pub fn try_set(&mut self, method: PollMethod) -> bool {
        match self.method {
            None => {
                self.method = Some(method);
                true
            }
            Some(m) if m == method => true,
            Some(_) => false,
        }
    }

    pub fn get(&self) -> Option<PollMethod> {
        self.method
    }
}

/// Master-boot hooks: race the three polling idioms to discover
/// `poll_method` (§4.5).
pub struct MasterHooks {
    tracked_listener_vfd: i32,
    latch: PollMethodLatch,
}

impl MasterHooks {
    pub fn new(tracked_listener_vfd: i32) -> Self {
        Self { tracked_listener_vfd, latch: PollMethodLatch::new() }
    }

    pub fn poll_method(&self) -> Option<PollMethod> {
        self.latch.get()
    }
}

impl GuestLifecycleHooks for MasterHooks {
    fn accept4(&mut self, listener_vfd: i32, blocking: bool) -> Accept4Outcome {
        // A non-blocking accept4 that would return EAGAIN is not a
        // quiescent point (§8 boundary behavior).
        if listener_vfd == self.tracked_listener_vfd && blocking {
            if self.latch.try_set(PollMethod::Blocking) {
                return Accept4Outcome::Quiescent(PollMethod::Blocking);
            }
            tracing::error!("poll method conflict: blocking accept4 after another idiom already latched");
        }
        Accept4Outcome::CallSyscall
    }

    fn accept_socket(&mut self, host_fd: i32) -> i32 {
        host_fd
    }

    fn epoll_wait(&mut self, registered: &[i32]) -> PollDecision {
        if registered.contains(&self.tracked_listener_vfd) {
            if self.latch.try_set(PollMethod::Epoll) {
                return PollDecision::Quiescent(PollMethod::Epoll);
            }
            tracing::error!("poll method conflict: epoll_wait after another idiom already latched");
        }
        PollDecision::CallSyscall
    }

    fn poll(&mut self, polled: &[i32]) -> PollDecision {
        if polled.contains(&self.tracked_listener_vfd) {
            if self.latch.try_set(PollMethod::Poll) {
                return PollDecision::Quiescent(PollMethod::Poll);
            }
            tracing::error!("poll method conflict: poll() after another idiom already latched");
        }
        PollDecision::CallSyscall
    }

    fn free_fd(&mut self, _vfd: i32) -> FreeFdOutcome {
        FreeFdOutcome::Continue
    }
}

/// Warmup hooks (§4.4): count freed accepted sockets across all warmup
/// client connections; once the count reaches the expected total, stop the
/// guest the next time it re-enters whichever polling syscall matches the
/// already-known `poll_method`.
pub struct WarmupHooks {
    tracked_listener_vfd: i32,
    poll_method: PollMethod,
    freed: u32,
    threshold: u32,
}

impl WarmupHooks {
    pub fn new(tracked_listener_vfd: i32, poll_method: PollMethod, threshold: u32) -> Self {
        Self { tracked_listener_vfd, poll_method, freed: 0, threshold }
    }

    pub fn freed_count(&self) -> u32 {
        self.freed
    }
}

impl GuestLifecycleHooks for WarmupHooks {
    fn accept4(&mut self, listener_vfd: i32, blocking: bool) -> Accept4Outcome {
        if self.poll_method == PollMethod::Blocking
            && listener_vfd == self.tracked_listener_vfd
            && blocking
            && self.freed >= self.threshold
        {
            return Accept4Outcome::Quiescent(PollMethod::Blocking);
        }
        Accept4Outcome::CallSyscall
    }

    fn accept_socket(&mut self, host_fd: i32) -> i32 {
        // Warmup admits arbitrarily many concurrent connections; there is no
        // single tracked client to enforce here.
        host_fd
    }

    fn epoll_wait(&mut self, registered: &[i32]) -> PollDecision {
        if self.poll_method == PollMethod::Epoll
            && registered.contains(&self.tracked_listener_vfd)
            && self.freed >= self.threshold
        {
            return PollDecision::Quiescent(PollMethod::Epoll);
        }
        PollDecision::CallSyscall
    }

    fn poll(&mut self, polled: &[i32]) -> PollDecision {
        if self.poll_method == PollMethod::Poll
            && polled.contains(&self.tracked_listener_vfd)
            && self.freed >= self.threshold
        {
            return PollDecision::Quiescent(PollMethod::Poll);
        }
        PollDecision::CallSyscall
    }

    fn free_fd(&mut self, _vfd: i32) -> FreeFdOutcome {
        self.freed += 1;
        FreeFdOutcome::Continue
    }
}

/// Shared state behind [`WorkerHooks`], mutated by the hook methods as the
/// guest runs and read by [`crate::worker::Worker`] to expose the §3 Worker
/// fields (`tracked_client_vfd/fd`, `blocking_connections`, `reset_needed`)
/// without needing to downcast the installed `Box<dyn GuestLifecycleHooks>`.
#[derive(Debug, Clone, Copy)]
pub struct WorkerHookState {
    pub tracked_client_vfd: i32,
    pub tracked_client_fd: i32,
    pub blocking_connections: bool,
    pub reset_needed: bool,
    next_vfd: i32,
}

impl Default for WorkerHookState {
    fn default() -> Self {
        Self {
            tracked_client_vfd: -1,
            tracked_client_fd: -1,
            blocking_connections: false,
            reset_needed: false,
            next_vfd: 3,
        }
    }
}

impl WorkerHookState {
    /// Clears tracked state after a successful `reset_to` (invariant 3).
    pub fn clear_for_reset(&mut self) {
        self.tracked_client_vfd = -1;
        self.tracked_client_fd = -1;
        self.blocking_connections = false;
        self.reset_needed = false;
    }
}

/// Ephemeral Worker hooks (§4.6): strict one-client-at-a-time admission plus
/// tracked-client-close detection. Holds its state behind an `Arc<Mutex<_>>`
/// so the owning Worker can read (and clear) it from outside the hook
/// object's `&mut self` methods; each Worker runs on one thread, so the lock
/// is uncontended in practice.
pub struct WorkerHooks {
    state: std::sync::Arc<parking_lot::Mutex<WorkerHookState>>,
}

impl WorkerHooks {
    pub fn new() -> Self {
        Self { state: std::sync::Arc::new(parking_lot::Mutex::new(WorkerHookState::default())) }
    }

    pub fn with_shared_state(state: std::sync::Arc<parking_lot::Mutex<WorkerHookState>>) -> Self {
        Self { state }
    }

    pub fn shared_state(&self) -> std::sync::Arc<parking_lot::Mutex<WorkerHookState>> {
        std::sync::Arc::clone(&self.state)
    }

    pub fn tracked_client_vfd(&self) -> i32 {
        self.state.lock().tracked_client_vfd
    }

    pub fn blocking_connections(&self) -> bool {
        self.state.lock().blocking_connections
    }

    pub fn reset_needed(&self) -> bool {
        self.state.lock().reset_needed
    }

    pub fn clear_for_reset(&self) {
        self.state.lock().clear_for_reset();
    }
}

impl Default for WorkerHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestLifecycleHooks for WorkerHooks {
    fn accept4(&mut self, _listener_vfd: i32, _blocking: bool) -> Accept4Outcome {
        if self.state.lock().blocking_connections {
            Accept4Outcome::Eagain
        } else {
            Accept4Outcome::CallSyscall
        }
    }

    fn accept_socket(&mut self, host_fd: i32) -> i32 {
        let mut state = self.state.lock();
        if state.tracked_client_vfd != -1 {
            return -(libc::EAGAIN);
        }
        let vfd = state.next_vfd;
        state.next_vfd += 1;
        state.tracked_client_vfd = vfd;
        state.tracked_client_fd = host_fd;
        state.blocking_connections = true;
        vfd
    }

    fn epoll_wait(&mut self, _registered: &[i32]) -> PollDecision {
        PollDecision::CallSyscall
    }

    fn poll(&mut self, _polled: &[i32]) -> PollDecision {
        PollDecision::CallSyscall
    }

    fn free_fd(&mut self, vfd: i32) -> FreeFdOutcome {
        let mut state = self.state.lock();
        if vfd == state.tracked_client_vfd {
            state.reset_needed = true;
            FreeFdOutcome::StopGuest
        } else {
            FreeFdOutcome::Continue
        }
    }
}
