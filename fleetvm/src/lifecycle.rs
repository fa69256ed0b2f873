//! The top-level orchestration tying Master, Worker, WarmupClient, and Pool
//! together (§4.5): boot the Master, optionally run warmup, freeze it, and
//! hand off to a `Pool` (or the single-VM optimization) ready to serve.

use std::time::{Duration, Instant};

use fleetvm_shared::{FleetError, FleetResult};

use crate::banner::{current_rss_mib, StartupBanner};
use crate::config::Configuration;
use crate::master::MasterGuest;
use crate::pool::{Pool, PoolConfig};
use crate::vm::RunOutcome;
use crate::warmup::{self, WarmupConfig, WarmupTarget};
use crate::worker::ResetPolicy;

/// What `run_lifecycle` hands back once the Master is frozen: a ready-to-run
/// `Pool` plus the rendered startup banner (§6).
pub struct LifecycleOutcome {
    pub banner: StartupBanner,
    pub pool: Pool,
}

/// Drives `master` from `Booting` through an optional warmup to `Frozen`,
/// then constructs the `Pool` that will service requests (§4.5). `target`
/// is the address warmup should connect to; required whenever
/// `config.warmup_requests > 0`.
pub fn run_lifecycle(
    mut master: MasterGuest,
    config: &Configuration,
    warmup_target: Option<WarmupTarget>,
) -> FleetResult<LifecycleOutcome> {
    let boot_deadline = Some(Duration::from_secs_f32(config.max_boot_time));

    let boot_start = Instant::now();
    master.boot(boot_deadline)?;

    let mut warmup_ms = None;
    if config.warmup_requests > 0 {
        let target = warmup_target.ok_or_else(|| {
            FleetError::Config("warmup_requests > 0 but no warmup target was configured".to_string())
        })?;
        let warmup_start = Instant::now();
        run_warmup(&mut master, config, target, boot_deadline)?;
        warmup_ms = Some(warmup_start.elapsed().as_millis() as u64);
    }
    let init_ms = boot_start.elapsed().as_millis() as u64;

    master.freeze()?;

    let reset_policy = ResetPolicy {
        reset_free_work_mem: config.limit_req_mem,
        reset_copy_all_registers: true,
        reset_keep_all_work_memory: config.ephemeral_keep_working_memory,
    };

    let pool_config = PoolConfig {
        concurrency: config.effective_concurrency(),
        ephemeral: config.ephemeral,
        max_req_time: Some(Duration::from_secs_f32(config.max_req_time)),
        reset_policy,
        max_req_mem: config.max_req_mem,
        debug_on_failure: std::env::var("DEBUG").as_deref() == Ok("1"),
        debug_fork: std::env::var("DEBUG_FORK").as_deref() == Ok("1"),
    };

    let banner = StartupBanner {
        program: config.program.clone(),
        poll_method: master.poll_method().ok_or_else(|| {
            FleetError::Internal("master has no poll_method after a successful boot".to_string())
        })?,
        vm_count: pool_config.concurrency,
        ephemeral: config.ephemeral,
        ephemeral_keep_working_memory: config.ephemeral_keep_working_memory,
        hugepages: config.hugepages,
        transparent_hugepages: config.transparent_hugepages,
        init_ms,
        warmup_ms,
        rss_mib: current_rss_mib(),
    };

    let pool = Pool::new(master, pool_config, None);
    Ok(LifecycleOutcome { banner, pool })
}

/// §4.4: swaps in the warmup hooks, spawns the external client threads,
/// drives the Master's run loop until it returns to `WaitingForRequests`
/// (re-entering the polling syscall between barriers, step 4), then joins
/// the warmup threads before returning (step 5).
fn run_warmup(
    master: &mut MasterGuest,
    config: &Configuration,
    target: WarmupTarget,
    deadline: Option<Duration>,
) -> FleetResult<()> {
    let warmup_config = WarmupConfig {
        threads: config.warmup_threads,
        connections_per_thread: config.warmup_requests,
        requests_per_connection: config.warmup_intra_connect_requests,
        path: config.warmup_path.clone(),
    };

    master.install_warmup_hooks(warmup_config.expected_freed_sockets())?;
    let handle = warmup::spawn(target, warmup_config);

    loop {
        match master.run(deadline)? {
            RunOutcome::WaitingForRequests(_) => break,
            RunOutcome::Serving | RunOutcome::ResetPending => {
                master.restart_poll_syscall()?;
            }
            RunOutcome::Exited(code) => {
                return Err(FleetError::Engine(format!(
                    "master guest exited during warmup with code {code}"
                )));
            }
        }
    }

    handle.join()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Policy, RawPathEntry};
    use crate::sandbox::Sandbox;
    use crate::vm::mock::{GuestAction, MockMachine};
    use crate::vm::{BinaryType, MasterHooks};
    use std::sync::Arc;

    fn sandbox() -> Sandbox {
        let raws: Vec<RawPathEntry> = Vec::new();
        let policy = Policy::build(std::path::Path::new("/"), &raws, &[], &[], &[]).unwrap();
        Sandbox::new(Arc::new(policy), "/")
    }

    fn booting_master_machine(extra: Vec<GuestAction>) -> Box<MockMachine> {
        let mut m = MockMachine::new(
            vec![GuestAction::Listen { vfd: 4 }, GuestAction::EpollWait { registered: vec![4] }],
            BinaryType::Static,
            1 << 32,
            Box::new(MasterHooks::new(4)),
        );
        m.extend_script(extra);
        Box::new(m)
    }

    #[test]
    fn run_lifecycle_without_warmup_freezes_and_builds_a_pool() {
        let machine = booting_master_machine(vec![]);
        let master = MasterGuest::new(machine, sandbox(), 4, 10);

        let config = Configuration { program: "/bin/app".to_string(), warmup_requests: 0, ..Configuration::default() };
        let outcome = run_lifecycle(master, &config, None).unwrap();

        assert_eq!(outcome.banner.program, "/bin/app");
        assert!(outcome.banner.warmup_ms.is_none());
        assert_eq!(outcome.pool.reset_count(), 0);
    }

    #[test]
    fn run_lifecycle_requires_a_warmup_target_when_warmup_is_configured() {
        let machine = booting_master_machine(vec![]);
        let master = MasterGuest::new(machine, sandbox(), 4, 10);
        let config = Configuration { warmup_requests: 1, ..Configuration::default() };
        assert!(run_lifecycle(master, &config, None).is_err());
    }

    #[test]
    fn run_lifecycle_with_warmup_drives_through_accept_close_and_reports_warmup_ms() {
        // One warmup thread, one connection — the master's warmup hooks
        // expect exactly one freed accepted socket before re-entering epoll
        // quiescently.
        let machine = booting_master_machine(vec![
            GuestAction::Accept4 { listener_vfd: 4, blocking: false },
            GuestAction::AcceptSocket { host_fd: 30 },
            GuestAction::CloseFd(3),
            GuestAction::EpollWait { registered: vec![4] },
        ]);
        let master = MasterGuest::new(machine, sandbox(), 4, 10);

        let config = Configuration {
            warmup_requests: 1,
            warmup_threads: 1,
            warmup_intra_connect_requests: 1,
            ..Configuration::default()
        };

        // No real listener is bound in this test (the mock backend never
        // opens a socket), so the warmup client thread's connect attempt is
        // expected to fail; what this test verifies is that the master-side
        // quiescence re-detection and hook swap sequence is exercised
        // without panicking, independent of the client thread's outcome.
        let target = WarmupTarget::parse("127.0.0.1:1").unwrap();
        let result = run_lifecycle(master, &config, Some(target));
        assert!(result.is_err(), "expected the unreachable warmup target to surface as an error");
    }
}
