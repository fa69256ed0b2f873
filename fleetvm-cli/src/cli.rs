//! CLI definition and argument parsing for fleetvm-cli.
//! This module contains the CLI structure and flag groups, and the
//! translation from parsed flags into `fleetvm::CliOverrides` (§6).

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser};
use fleetvm::config::CliOverrides;

#[derive(Parser, Debug)]
#[command(name = "fleetvm", author, version, about = "FleetVM request server")]
pub struct Cli {
    /// Program binary to load and run.
    pub program: String,

    /// Arguments passed through to the program.
    #[arg(trailing_var_arg = true)]
    pub main_arguments: Vec<String>,

    #[command(flatten)]
    pub execution: ExecutionFlags,

    #[command(flatten)]
    pub verbosity: VerbosityFlags,

    #[command(flatten)]
    pub permissions: PermissionFlags,

    #[command(flatten)]
    pub advanced: AdvancedFlags,

    /// Dump the resolved configuration as TOML and exit.
    #[arg(long)]
    pub print_config: bool,

    /// Layer a TOML configuration file underneath these flags.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,
}

impl Cli {
    pub fn into_overrides(self) -> CliOverrides {
        let mut overrides = CliOverrides {
            program: Some(self.program),
            main_arguments: Some(self.main_arguments),
            verbose_level: Some(self.verbosity.level()),
            ..CliOverrides::default()
        };
        self.execution.apply_to(&mut overrides);
        self.permissions.apply_to(&mut overrides);
        self.advanced.apply_to(&mut overrides);
        overrides
    }
}

// ============================================================================
// EXECUTION FLAGS
// ============================================================================

#[derive(Args, Debug, Clone)]
pub struct ExecutionFlags {
    /// Working directory for the guest program.
    #[arg(long)]
    pub cwd: Option<String>,

    /// Extra environment variables to pass through, `NAME` or `NAME=VALUE`.
    #[arg(long = "env")]
    pub env: Vec<String>,

    /// Worker count; 0 uses the host CPU count.
    #[arg(short = 't', long = "threads", default_value_t = 0)]
    pub threads: u16,

    /// Reset every worker to the frozen template after each request.
    #[arg(short = 'e', long = "ephemeral")]
    pub ephemeral: bool,

    /// Number of warmup connections to drive before serving real requests.
    #[arg(short = 'w', long = "warmup", default_value_t = 0)]
    pub warmup: u32,

    /// Requests sent per warmup connection before the next one opens.
    #[arg(long = "warmup-intra-connect-requests", default_value_t = 1)]
    pub warmup_intra_connect_requests: u32,
}

impl ExecutionFlags {
    fn apply_to(&self, o: &mut CliOverrides) {
        o.cwd = self.cwd.clone();
        if !self.env.is_empty() {
            o.env = Some(self.env.clone());
        }
        o.concurrency = Some(self.threads);
        o.ephemeral = Some(self.ephemeral);
        o.warmup_requests = Some(self.warmup);
        o.warmup_intra_connect_requests = Some(self.warmup_intra_connect_requests);
    }
}

// ============================================================================
// VERBOSITY FLAGS
// ============================================================================

#[derive(Args, Debug, Clone)]
pub struct VerbosityFlags {
    /// -v verbose, -vv also syscall tracing, -vvv also page-table dump.
    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbose: u8,
}

impl VerbosityFlags {
    pub fn level(&self) -> u8 {
        self.verbose
    }
}

// ============================================================================
// PERMISSION FLAGS
// ============================================================================

#[derive(Args, Debug, Clone)]
pub struct PermissionFlags {
    /// Grant every permission; mutually exclusive with the flags below.
    #[arg(long)]
    pub allow_all: bool,

    /// Readable host paths, comma-or-repeat separated.
    #[arg(long = "allow-read", conflicts_with = "allow_all")]
    pub allow_read: Option<Vec<String>>,

    /// Writable host paths.
    #[arg(long = "allow-write", conflicts_with = "allow_all")]
    pub allow_write: Option<Vec<String>>,

    /// Environment variable names passed through from the host.
    #[arg(long = "allow-env", conflicts_with = "allow_all")]
    pub allow_env: Option<Vec<String>>,

    /// Grant both connect and listen on every address.
    #[arg(long = "allow-net", conflicts_with = "allow_all")]
    pub allow_net: bool,

    /// Allowed outbound connect targets, `addr:port`.
    #[arg(long = "allow-connect", conflicts_with = "allow_all")]
    pub allow_connect: Option<Vec<String>>,

    /// Allowed listen addresses, `addr:port`.
    #[arg(long = "allow-listen", conflicts_with = "allow_all")]
    pub allow_listen: Option<Vec<String>>,

    /// Bind-mount a host path into the guest: `host:guest[:rw]`.
    #[arg(long = "volume", conflicts_with = "allow_all")]
    pub volume: Vec<String>,
}

impl PermissionFlags {
    fn apply_to(&self, o: &mut CliOverrides) {
        o.allow_all = self.allow_all;
        o.allow_read = self.allow_read.clone();
        o.allow_write = self.allow_write.clone();
        o.allow_env = self.allow_env.clone();
        o.allow_net = self.allow_net;
        o.allow_connect = self.allow_connect.clone();
        o.allow_listen = self.allow_listen.clone();
        o.volumes = self.volume.clone();
    }
}

// ============================================================================
// ADVANCED FLAGS
// ============================================================================

#[derive(Args, Debug, Clone)]
pub struct AdvancedFlags {
    /// Address space cap, in MiB.
    #[arg(long = "max-address-space")]
    pub max_address_space: Option<u64>,

    /// Main memory cap, in MiB.
    #[arg(long = "max-main-memory")]
    pub max_main_memory: Option<u64>,

    /// Per-request memory cap, in MiB.
    #[arg(long = "max-req-mem")]
    pub max_req_mem: Option<u64>,

    /// Memory reclaimed on reset, in MiB.
    #[arg(long = "limit-req-mem")]
    pub limit_req_mem: Option<u64>,

    /// Maximum seconds to reach the quiescent point during boot.
    #[arg(long = "max-boot-time")]
    pub max_boot_time: Option<f32>,

    /// Maximum seconds a worker may spend on one request.
    #[arg(long = "max-req-time")]
    pub max_req_time: Option<f32>,

    /// Dynamic linker load address hint, in MiB.
    #[arg(long = "dylink-address-hint")]
    pub dylink_address_hint: Option<u32>,

    /// Heap base address hint, in MiB.
    #[arg(long = "heap-address-hint")]
    pub heap_address_hint: Option<u32>,

    #[arg(long)]
    pub hugepages: bool,

    #[arg(long = "transparent-hugepages")]
    pub transparent_hugepages: bool,

    #[arg(long = "no-split-hugepages")]
    pub no_split_hugepages: bool,

    #[arg(long = "no-executable-heap")]
    pub no_executable_heap: bool,

    #[arg(long = "no-relocate-fixed-mmap")]
    pub no_relocate_fixed_mmap: bool,

    #[arg(long = "no-ephemeral-keep-working-memory")]
    pub no_ephemeral_keep_working_memory: bool,

    /// `virt:size(mb)[:phys=0][:rwx]`, repeatable.
    #[arg(long = "remapping")]
    pub remapping: Vec<String>,
}

impl AdvancedFlags {
    fn apply_to(&self, o: &mut CliOverrides) {
        o.max_address_space_mib = self.max_address_space;
        o.max_main_memory_mib = self.max_main_memory;
        o.max_req_mem_mib = self.max_req_mem;
        o.limit_req_mem_mib = self.limit_req_mem;
        o.max_boot_time = self.max_boot_time;
        o.max_req_time = self.max_req_time;
        o.dylink_address_hint_mib = self.dylink_address_hint;
        o.heap_address_hint_mib = self.heap_address_hint;

        if self.hugepages {
            o.hugepages = Some(true);
        }
        if self.transparent_hugepages {
            o.transparent_hugepages = Some(true);
        }
        if self.no_split_hugepages {
            o.split_hugepages = Some(false);
        }
        if self.no_executable_heap {
            o.executable_heap = Some(false);
        }
        if self.no_relocate_fixed_mmap {
            o.relocate_fixed_mmap = Some(false);
        }
        if self.no_ephemeral_keep_working_memory {
            o.ephemeral_keep_working_memory = Some(false);
        }
        o.remappings = self.remapping.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parses_minimal_positional_and_trailing_args() {
        let cli = Cli::parse_from(["fleetvm", "/bin/app", "--", "--flag", "value"]);
        assert_eq!(cli.program, "/bin/app");
        assert_eq!(cli.main_arguments, vec!["--flag".to_string(), "value".to_string()]);
    }

    #[test]
    fn repeated_v_counts_verbosity_level() {
        let cli = Cli::parse_from(["fleetvm", "/bin/app", "-vvv"]);
        assert_eq!(cli.verbosity.level(), 3);
    }

    #[test]
    fn allow_all_conflicts_with_allow_read() {
        let result = Cli::try_parse_from(["fleetvm", "/bin/app", "--allow-all", "--allow-read", "/etc"]);
        assert!(result.is_err());
    }

    #[test]
    fn execution_flags_translate_into_overrides() {
        let cli = Cli::parse_from(["fleetvm", "/bin/app", "-t", "4", "-e", "-w", "200"]);
        let overrides = cli.into_overrides();
        assert_eq!(overrides.concurrency, Some(4));
        assert_eq!(overrides.ephemeral, Some(true));
        assert_eq!(overrides.warmup_requests, Some(200));
    }

    #[test]
    fn volume_and_remapping_pass_through_as_repeatable_lists() {
        let cli = Cli::parse_from([
            "fleetvm",
            "/bin/app",
            "--volume",
            "/host:/guest:rw",
            "--remapping",
            "0x1000:4:phys=0:rwx",
        ]);
        let overrides = cli.into_overrides();
        assert_eq!(overrides.volumes, vec!["/host:/guest:rw".to_string()]);
        assert_eq!(overrides.remappings, vec!["0x1000:4:phys=0:rwx".to_string()]);
    }
}
