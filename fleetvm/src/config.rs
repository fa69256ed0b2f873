//! Layered configuration (§4.9 of the expanded specification): TOML file
//! plus CLI overrides, `$HOME`/`$PWD` expansion, and the MiB-to-bytes
//! conversion pass, ported from the original `Configuration::FromJsonFile`
//! (`examples/original_source/src/config.cpp`) with TOML in place of JSON.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use fleetvm_shared::FleetResult;

use crate::policy::RawPathEntry;

/// One `allowed_paths` entry as it appears in the TOML file or is built up
/// from CLI flags, mirroring the original's `VirtualPath` struct.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PathSpec {
    pub real: String,
    #[serde(rename = "virtual", skip_serializing_if = "Option::is_none")]
    pub virtual_path: Option<String>,
    #[serde(default = "default_true")]
    pub readable: bool,
    #[serde(default)]
    pub writable: bool,
    #[serde(default)]
    pub symlink: bool,
    #[serde(default)]
    pub usable_in_fork: bool,
    /// Carried for round-trip fidelity with the original format; resolution
    /// itself treats every entry as a potential longest-prefix match
    /// uniformly, so this does not change lookup behavior.
    #[serde(default)]
    pub prefix: bool,
}

fn default_true() -> bool {
    true
}

impl From<&PathSpec> for RawPathEntry {
    fn from(spec: &PathSpec) -> Self {
        RawPathEntry {
            real_path: spec.real.clone(),
            virtual_path: spec.virtual_path.clone(),
            readable: spec.readable,
            writable: spec.writable,
            symlink: spec.symlink,
            usable_in_fork: spec.usable_in_fork,
        }
    }
}

/// The fully resolved configuration consumed by Policy construction and the
/// Master/Worker/Pool. Memory-size fields are specified in MiB on the CLI
/// and in the TOML file; [`Configuration::finalize`] converts them to bytes
/// exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub program: String,
    pub main_arguments: Vec<String>,
    pub current_working_directory: String,

    pub concurrency: u16,
    pub ephemeral: bool,
    pub ephemeral_keep_working_memory: bool,

    pub warmup_requests: u32,
    pub warmup_intra_connect_requests: u32,
    pub warmup_path: String,
    pub warmup_threads: u32,

    pub max_boot_time: f32,
    pub max_req_time: f32,

    /// MiB before `finalize`, bytes after.
    pub max_address_space: u64,
    pub max_main_memory: u64,
    pub max_req_mem: u64,
    pub limit_req_mem: u64,
    pub shared_memory: u64,
    pub hugepage_arena_size: u64,
    pub hugepage_requests_arena: u64,

    pub dylink_address_hint: u32,
    pub heap_address_hint: u32,

    pub hugepages: bool,
    pub split_hugepages: bool,
    pub transparent_hugepages: bool,
    pub executable_heap: bool,
    pub relocate_fixed_mmap: bool,

    pub verbose: bool,
    pub verbose_syscalls: bool,
    pub verbose_pagetable: bool,

    pub environ: Vec<String>,

    pub allowed_paths: Vec<PathSpec>,
    pub allow_connect: Vec<String>,
    pub allow_listen: Vec<String>,
    pub allow_env: Vec<String>,

    pub remappings: Vec<String>,

    pub storage_guest: Option<String>,

    #[serde(skip)]
    bytes_finalized: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            program: String::new(),
            main_arguments: Vec::new(),
            current_working_directory: "/".to_string(),
            concurrency: 0,
            ephemeral: true,
            ephemeral_keep_working_memory: true,
            warmup_requests: 0,
            warmup_intra_connect_requests: 1,
            warmup_path: "/".to_string(),
            warmup_threads: 2,
            max_boot_time: 20.0,
            max_req_time: 8.0,
            max_address_space: 0,
            max_main_memory: 1024,
            max_req_mem: 128,
            limit_req_mem: 128,
            shared_memory: 0,
            hugepage_arena_size: 0,
            hugepage_requests_arena: 0,
            dylink_address_hint: 2,
            heap_address_hint: 0,
            hugepages: false,
            split_hugepages: true,
            transparent_hugepages: false,
            executable_heap: false,
            relocate_fixed_mmap: true,
            verbose: false,
            verbose_syscalls: false,
            verbose_pagetable: false,
            environ: vec!["LC_TYPE=C".to_string(), "LC_ALL=C".to_string(), "USER=root".to_string()],
            allowed_paths: Vec::new(),
            allow_connect: Vec::new(),
            allow_listen: Vec::new(),
            allow_env: Vec::new(),
            remappings: Vec::new(),
            storage_guest: None,
            bytes_finalized: false,
        }
    }
}

/// CLI-supplied overrides, applied on top of defaults and any `--config`
/// file (§6, §4.9 — "CLI overrides file"). Every field is optional; `None`
/// means "not explicitly set on the command line".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub program: Option<String>,
    pub main_arguments: Option<Vec<String>>,
    pub cwd: Option<String>,
    /// `NAME` (passed through from the host) or `NAME=VALUE` (§6 `--env`).
    pub env: Option<Vec<String>>,
    pub concurrency: Option<u16>,
    pub ephemeral: Option<bool>,
    pub ephemeral_keep_working_memory: Option<bool>,
    pub warmup_requests: Option<u32>,
    pub warmup_intra_connect_requests: Option<u32>,
    pub verbose_level: Option<u8>,
    pub allow_all: bool,
    pub allow_read: Option<Vec<String>>,
    pub allow_write: Option<Vec<String>>,
    pub allow_env: Option<Vec<String>>,
    pub allow_net: bool,
    pub allow_connect: Option<Vec<String>>,
    pub allow_listen: Option<Vec<String>>,
    pub volumes: Vec<String>,
    pub hugepages: Option<bool>,
    pub transparent_hugepages: Option<bool>,
    pub split_hugepages: Option<bool>,
    pub executable_heap: Option<bool>,
    pub relocate_fixed_mmap: Option<bool>,
    pub remappings: Vec<String>,
    pub max_address_space_mib: Option<u64>,
    pub max_main_memory_mib: Option<u64>,
    pub max_req_mem_mib: Option<u64>,
    pub limit_req_mem_mib: Option<u64>,
    pub max_boot_time: Option<f32>,
    pub max_req_time: Option<f32>,
    pub dylink_address_hint_mib: Option<u32>,
    pub heap_address_hint_mib: Option<u32>,
}

impl Configuration {
    /// Loads defaults, layers an optional TOML file, then layers CLI
    /// overrides on top (CLI wins on conflict, per the resolved Open
    /// Question), then converts MiB fields to bytes exactly once.
    pub fn from_cli(config_path: Option<&std::path::Path>, overrides: &CliOverrides) -> FleetResult<Configuration> {
        let mut config = match config_path {
            Some(path) => Configuration::from_toml_file(path)?,
            None => Configuration::default(),
        };

        config.apply_overrides(overrides);
        config.expand_dollar_vars();
        config.finalize();
        Ok(config)
    }

    pub fn from_toml_file(path: &std::path::Path) -> FleetResult<Configuration> {
        let text = std::fs::read_to_string(path)?;
        let config: Configuration = toml::from_str(&text)?;
        Ok(config)
    }

    fn apply_overrides(&mut self, o: &CliOverrides) {
        if let Some(v) = &o.program {
            self.program = v.clone();
        }
        if let Some(v) = &o.main_arguments {
            self.main_arguments = v.clone();
        }
        if let Some(v) = &o.cwd {
            self.current_working_directory = v.clone();
        }
        if let Some(names) = &o.env {
            for name in names {
                match name.split_once('=') {
                    Some((k, v)) => self.environ.push(format!("{k}={v}")),
                    None => {
                        if let Ok(v) = std::env::var(name) {
                            self.environ.push(format!("{name}={v}"));
                        } else {
                            tracing::warn!(name = %name, "environment variable not found on host, skipping");
                        }
                    }
                }
            }
        }
        if let Some(v) = o.concurrency {
            self.concurrency = v;
        }
        if let Some(v) = o.ephemeral {
            self.ephemeral = v;
        }
        if let Some(v) = o.ephemeral_keep_working_memory {
            self.ephemeral_keep_working_memory = v;
        }
        if let Some(v) = o.warmup_requests {
            self.warmup_requests = v;
        }
        if let Some(v) = o.warmup_intra_connect_requests {
            self.warmup_intra_connect_requests = v;
        }
        match o.verbose_level {
            Some(1) => self.verbose = true,
            Some(2) => {
                self.verbose = true;
                self.verbose_syscalls = true;
            }
            Some(n) if n >= 3 => {
                self.verbose = true;
                self.verbose_syscalls = true;
                self.verbose_pagetable = true;
            }
            _ => {}
        }
        // VERBOSE=1 is the catch-all environment equivalent of -vv (§6).
        if std::env::var("VERBOSE").as_deref() == Ok("1") {
            self.verbose = true;
            self.verbose_syscalls = true;
        }

        if o.allow_all {
            self.allowed_paths = vec![PathSpec {
                real: "/".to_string(),
                virtual_path: None,
                readable: true,
                writable: true,
                symlink: false,
                usable_in_fork: true,
                prefix: true,
            }];
            self.allow_connect = vec!["true".to_string()];
            self.allow_listen = vec!["true".to_string()];
            self.allow_env = vec!["*".to_string()];
        } else {
            if let Some(paths) = &o.allow_read {
                for p in paths {
                    self.allowed_paths.push(PathSpec {
                        real: p.clone(),
                        readable: true,
                        writable: false,
                        prefix: true,
                        ..Default::default()
                    });
                }
            }
            if let Some(paths) = &o.allow_write {
                for p in paths {
                    self.allowed_paths.push(PathSpec {
                        real: p.clone(),
                        readable: true,
                        writable: true,
                        prefix: true,
                        ..Default::default()
                    });
                }
            }
            for v in &o.volumes {
                if let Some(spec) = parse_volume_spec(v) {
                    self.allowed_paths.push(spec);
                }
            }
            if let Some(names) = &o.allow_env {
                self.allow_env.extend(names.clone());
            }
            if o.allow_net {
                self.allow_connect.push("true".to_string());
                self.allow_listen.push("true".to_string());
            }
            if let Some(v) = &o.allow_connect {
                self.allow_connect.extend(v.clone());
            }
            if let Some(v) = &o.allow_listen {
                self.allow_listen.extend(v.clone());
            }
        }

        if let Some(v) = o.hugepages {
            self.hugepages = v;
        }
        if let Some(v) = o.transparent_hugepages {
            self.transparent_hugepages = v;
        }
        if let Some(v) = o.split_hugepages {
            self.split_hugepages = v;
        }
        if let Some(v) = o.executable_heap {
            self.executable_heap = v;
        }
        if let Some(v) = o.relocate_fixed_mmap {
            self.relocate_fixed_mmap = v;
        }
        self.remappings.extend(o.remappings.clone());

        if let Some(v) = o.max_address_space_mib {
            self.max_address_space = v;
        }
        if let Some(v) = o.max_main_memory_mib {
            self.max_main_memory = v;
        }
        if let Some(v) = o.max_req_mem_mib {
            self.max_req_mem = v;
        }
        if let Some(v) = o.limit_req_mem_mib {
            self.limit_req_mem = v;
        }
        if let Some(v) = o.max_boot_time {
            self.max_boot_time = v;
        }
        if let Some(v) = o.max_req_time {
            self.max_req_time = v;
        }
        if let Some(v) = o.dylink_address_hint_mib {
            self.dylink_address_hint = v;
        }
        if let Some(v) = o.heap_address_hint_mib {
            self.heap_address_hint = v;
        }
    }

    /// `$HOME`/`$PWD` expansion in path-like string fields, ported from
    /// `apply_dollar_vars` (`examples/original_source/src/config.cpp`).
    fn expand_dollar_vars(&mut self) {
        self.program = expand_dollar_vars(&self.program);
        self.current_working_directory = expand_dollar_vars(&self.current_working_directory);
        for path in &mut self.allowed_paths {
            path.real = expand_dollar_vars(&path.real);
        }
    }

    /// Converts every MiB-denominated field to bytes, exactly once. Calling
    /// this twice would double-convert, so it is guarded.
    pub fn finalize(&mut self) {
        if self.bytes_finalized {
            return;
        }
        // The address space must be at least as large as main memory
        // (`examples/original_source/src/config.cpp`'s
        // `config.max_address_space = std::max(config.max_address_space, config.max_main_memory)`).
        self.max_address_space = self.max_address_space.max(self.max_main_memory);
        const MIB: u64 = 1024 * 1024;
        self.max_address_space *= MIB;
        self.max_main_memory *= MIB;
        self.max_req_mem *= MIB;
        self.limit_req_mem *= MIB;
        self.shared_memory *= MIB;
        self.hugepage_arena_size *= MIB;
        self.hugepage_requests_arena *= MIB;
        self.bytes_finalized = true;
    }

    /// Raw path entries ready for [`crate::policy::Policy::build`].
    pub fn raw_path_entries(&self) -> Vec<RawPathEntry> {
        self.allowed_paths.iter().map(RawPathEntry::from).collect()
    }

    /// Renders the fully resolved configuration as pretty TOML for
    /// `--print-config`.
    pub fn to_pretty_toml(&self) -> FleetResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Effective worker count: 0 means "use the host CPU count" (§6 `-t/--threads`).
    pub fn effective_concurrency(&self) -> u16 {
        if self.concurrency == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get() as u16)
                .unwrap_or(1)
        } else {
            self.concurrency
        }
    }
}

fn expand_dollar_vars(input: &str) -> String {
    let home = dirs::home_dir().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
    let pwd = std::env::current_dir().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
    input.replace("$HOME", &home).replace("$PWD", &pwd)
}

/// Parses `--volume host:guest[:rw]` into a [`PathSpec`].
fn parse_volume_spec(spec: &str) -> Option<PathSpec> {
    let mut parts = spec.splitn(3, ':');
    let host = parts.next()?;
    let guest = parts.next()?;
    let writable = matches!(parts.next(), Some("rw"));
    Some(PathSpec {
        real: host.to_string(),
        virtual_path: Some(guest.to_string()),
        readable: true,
        writable,
        symlink: false,
        usable_in_fork: true,
        prefix: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_converts_mib_to_bytes_exactly_once() {
        let mut config = Configuration { max_req_mem: 128, ..Configuration::default() };
        config.finalize();
        assert_eq!(config.max_req_mem, 128 * 1024 * 1024);
        config.finalize();
        assert_eq!(config.max_req_mem, 128 * 1024 * 1024);
    }

    #[test]
    fn allow_all_override_clears_and_replaces_allow_lists() {
        let overrides = CliOverrides { allow_all: true, ..Default::default() };
        let mut config = Configuration::default();
        config.apply_overrides(&overrides);
        assert_eq!(config.allow_connect, vec!["true".to_string()]);
        assert_eq!(config.allow_listen, vec!["true".to_string()]);
        assert!(config.allowed_paths[0].writable);
    }

    #[test]
    fn verbose_level_maps_to_syscalls_and_pagetable_flags() {
        let overrides = CliOverrides { verbose_level: Some(3), ..Default::default() };
        let mut config = Configuration::default();
        config.apply_overrides(&overrides);
        assert!(config.verbose && config.verbose_syscalls && config.verbose_pagetable);
    }

    #[test]
    fn volume_spec_parses_rw_suffix() {
        let spec = parse_volume_spec("/host/data:/data:rw").unwrap();
        assert_eq!(spec.real, "/host/data");
        assert_eq!(spec.virtual_path.as_deref(), Some("/data"));
        assert!(spec.writable);

        let ro = parse_volume_spec("/host/data:/data").unwrap();
        assert!(!ro.writable);
    }

    #[test]
    fn env_override_accepts_literal_assignment_and_passthrough() {
        let overrides = CliOverrides {
            env: Some(vec!["KEY=value".to_string(), "UNSET_HOST_VAR".to_string()]),
            ..Default::default()
        };
        let mut config = Configuration::default();
        config.apply_overrides(&overrides);
        assert!(config.environ.contains(&"KEY=value".to_string()));
        assert!(!config.environ.iter().any(|e| e.starts_with("UNSET_HOST_VAR")));
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = Configuration { program: "/bin/app".to_string(), ..Configuration::default() };
        config.finalize();
        let toml_text = config.to_pretty_toml().unwrap();
        let parsed: Configuration = toml::from_str(&toml_text).unwrap();
        assert_eq!(parsed.program, "/bin/app");
    }
}
