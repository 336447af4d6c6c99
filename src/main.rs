use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use nodestream::config::{Backend, Config};
use nodestream::kernel::durable::PersistPolicy;
use nodestream::runner::{self, RunPlan, Variant};

/// Node-aware STREAM memory bandwidth benchmark.
#[derive(Parser)]
#[command(name = "nodestream", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides the config file.
    #[arg(long)]
    log_level: Option<String>,

    /// Variant to run (memory, durable). Repeatable; replaces the
    /// configured variants.
    #[arg(long = "variant")]
    variants: Vec<Variant>,

    /// Persist policy of the durable variant (none, individual, collective).
    #[arg(long)]
    persist: Option<PersistPolicy>,

    /// Run label used in reports and record file names.
    #[arg(long)]
    label: Option<String>,

    /// Rank launcher (local, mpi).
    #[arg(long)]
    backend: Option<Backend>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("nodestream {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    apply_overrides(&mut cfg, &cli);
    cfg.validate().context("invalid configuration")?;

    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        backend = ?cfg.cluster.backend,
        "starting nodestream",
    );

    let plan = RunPlan::from_config(&cfg);

    match cfg.cluster.backend {
        Backend::Local => {
            let cluster = cfg.local_cluster();
            runner::run_local(&cluster, &plan)?;
        }
        Backend::Mpi => run_mpi(&plan)?,
    }

    tracing::info!("nodestream finished");

    Ok(())
}

fn apply_overrides(cfg: &mut Config, cli: &Cli) {
    if !cli.variants.is_empty() {
        cfg.set_variants(&cli.variants);
    }
    if let Some(persist) = cli.persist {
        cfg.variants.durable.persist = persist;
    }
    if let Some(label) = &cli.label {
        cfg.label = label.clone();
    }
    if let Some(backend) = cli.backend {
        cfg.cluster.backend = backend;
    }
}

#[cfg(feature = "mpi")]
fn run_mpi(plan: &RunPlan) -> Result<()> {
    let world = nodestream::comm::mpi::init().context("initializing MPI")?;
    runner::run_rank(world, plan)?;
    Ok(())
}

#[cfg(not(feature = "mpi"))]
fn run_mpi(_plan: &RunPlan) -> Result<()> {
    anyhow::bail!("this build lacks the 'mpi' feature")
}
