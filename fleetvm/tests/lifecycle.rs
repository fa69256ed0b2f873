//! End-to-end tests driving the public API (`Configuration` → `Policy` →
//! `Sandbox` → `MasterGuest` → `run_lifecycle` → `Pool`) the way a real
//! caller would, using `MockMachine` as the scripted guest in place of a
//! real virtualization back-end.

use std::path::Path;
use std::sync::Arc;

use fleetvm::config::{CliOverrides, Configuration};
use fleetvm::lifecycle::run_lifecycle;
use fleetvm::master::MasterGuest;
use fleetvm::policy::Policy;
use fleetvm::pool::PoolConfig;
use fleetvm::sandbox::Sandbox;
use fleetvm::vm::mock::{GuestAction, MockMachine};
use fleetvm::vm::{BinaryType, MasterHooks};
use fleetvm::vm::RunOutcome;
use fleetvm::worker::{ResetPolicy, WorkerState};

// ============================================================================
// TEST FIXTURES
// ============================================================================

fn config_from_overrides(overrides: CliOverrides) -> Configuration {
    Configuration::from_cli(None, &overrides).expect("overrides alone should always resolve")
}

fn sandbox_for(config: &Configuration) -> Sandbox {
    let policy = Policy::build(
        Path::new("/"),
        &config.raw_path_entries(),
        &config.allow_connect,
        &config.allow_listen,
        &config.allow_env,
    )
    .unwrap();
    Sandbox::new(Arc::new(policy), "/")
}

fn booting_master_with(config: &Configuration, extra: Vec<GuestAction>) -> MasterGuest {
    let mut machine = MockMachine::new(
        vec![GuestAction::Listen { vfd: 4 }, GuestAction::EpollWait { registered: vec![4] }],
        BinaryType::Static,
        1 << 32,
        Box::new(MasterHooks::new(4)),
    );
    machine.extend_script(extra);
    MasterGuest::new(Box::new(machine), sandbox_for(config), 4, 10)
}

fn booting_master(extra: Vec<GuestAction>) -> MasterGuest {
    booting_master_with(&Configuration::default(), extra)
}

// ============================================================================
// SCENARIO A — one ephemeral worker services a request, then resets
// ============================================================================

#[test]
fn scenario_a_ephemeral_worker_serves_one_request_and_resets() {
    let overrides = CliOverrides {
        allow_listen: Some(vec!["127.0.0.1:8080".to_string()]),
        concurrency: Some(1),
        ephemeral: Some(true),
        ..Default::default()
    };
    let config = config_from_overrides(overrides);
    assert!(config.ephemeral);
    assert_eq!(config.effective_concurrency(), 1);

    let master = booting_master_with(&config, vec![
        GuestAction::Accept4 { listener_vfd: 4, blocking: false },
        GuestAction::AcceptSocket { host_fd: 20 },
        GuestAction::CloseFd(3),
    ]);

    let outcome = run_lifecycle(master, &config, None).unwrap();
    assert_eq!(outcome.pool.reset_count(), 0);
    assert!(!outcome.pool.needs_single_vm_optimization(), "ephemeral disables the single-VM optimization");

    let mut worker = outcome.pool.spawn_worker(0).unwrap();
    assert_eq!(outcome.pool.service_once(&mut worker).unwrap(), RunOutcome::Serving);
    assert_eq!(outcome.pool.service_once(&mut worker).unwrap(), RunOutcome::ResetPending);
    assert_eq!(outcome.pool.reset_count(), 1);
    assert_eq!(worker.state(), WorkerState::Idle);

    assert!(outcome.banner.render().starts_with("Program '' loaded. epoll vm=1 ephemeral-kwm"));
}

// ============================================================================
// SINGLE-VM OPTIMIZATION — concurrency=1, non-ephemeral skips the Pool
// ============================================================================

#[test]
fn single_worker_nonephemeral_config_selects_single_vm_optimization() {
    let overrides = CliOverrides { concurrency: Some(1), ephemeral: Some(false), ..Default::default() };
    let config = config_from_overrides(overrides);

    let master = booting_master_with(&config, vec![
        GuestAction::Accept4 { listener_vfd: 4, blocking: false },
        GuestAction::AcceptSocket { host_fd: 20 },
    ]);

    let outcome = run_lifecycle(master, &config, None).unwrap();
    assert!(outcome.pool.needs_single_vm_optimization());
    assert_eq!(outcome.pool.run_master_directly().unwrap(), RunOutcome::Serving);
}

// ============================================================================
// MULTIPLE WORKERS — every worker forked from the same frozen master resets
// independently without disturbing its siblings
// ============================================================================

#[test]
fn two_workers_forked_from_one_master_reset_independently() {
    let config = config_from_overrides(CliOverrides { concurrency: Some(2), ephemeral: Some(true), ..Default::default() });

    let master = booting_master_with(&config, vec![
        GuestAction::Accept4 { listener_vfd: 4, blocking: false },
        GuestAction::AcceptSocket { host_fd: 20 },
        GuestAction::CloseFd(3),
        GuestAction::Accept4 { listener_vfd: 4, blocking: false },
        GuestAction::AcceptSocket { host_fd: 21 },
        GuestAction::CloseFd(3),
    ]);

    let outcome = run_lifecycle(master, &config, None).unwrap();
    let mut worker_a = outcome.pool.spawn_worker(0).unwrap();
    let mut worker_b = outcome.pool.spawn_worker(1).unwrap();

    assert_eq!(outcome.pool.service_once(&mut worker_a).unwrap(), RunOutcome::Serving);
    assert_eq!(outcome.pool.service_once(&mut worker_b).unwrap(), RunOutcome::Serving);
    assert_eq!(outcome.pool.service_once(&mut worker_a).unwrap(), RunOutcome::ResetPending);
    assert_eq!(outcome.pool.service_once(&mut worker_b).unwrap(), RunOutcome::ResetPending);

    assert_eq!(outcome.pool.reset_count(), 2);
}

// ============================================================================
// CONFIG LAYERING — --allow-all short-circuits individual allow flags
// ============================================================================

#[test]
fn allow_all_override_produces_a_policy_permitting_any_path_and_address() {
    let config = config_from_overrides(CliOverrides { allow_all: true, ..Default::default() });
    let sandbox = sandbox_for(&config);

    assert_eq!(
        sandbox.open_for_write("/etc/whatever"),
        fleetvm::sandbox::PathDecision::Allow(std::path::PathBuf::from("/etc/whatever"))
    );
    assert!(sandbox.bind(&fleetvm::vm::Endpoint::V4 {
        addr: std::net::Ipv4Addr::new(0, 0, 0, 0),
        port: 9999,
    }));
}

// ============================================================================
// PoolConfig plumbing — reset policy from Configuration reaches the Worker
// ============================================================================

#[test]
fn reset_policy_from_configuration_reaches_the_worker() {
    let config = config_from_overrides(CliOverrides {
        limit_req_mem_mib: Some(64),
        ephemeral_keep_working_memory: Some(false),
        ..Default::default()
    });

    let master = booting_master(vec![]);
    let outcome = run_lifecycle(master, &config, None).unwrap();
    let reset_policy: ResetPolicy = outcome.pool.config().reset_policy;
    assert_eq!(reset_policy.reset_free_work_mem, 64 * 1024 * 1024);
    assert!(!reset_policy.reset_keep_all_work_memory);
}

#[test]
fn pool_config_defaults_round_trip_through_lifecycle() {
    let config = Configuration::default();
    let master = booting_master(vec![]);
    let outcome = run_lifecycle(master, &config, None).unwrap();
    let pool_config: &PoolConfig = outcome.pool.config();
    assert!(pool_config.ephemeral);
    assert!(!pool_config.debug_on_failure);
    assert!(!pool_config.debug_fork);
}
