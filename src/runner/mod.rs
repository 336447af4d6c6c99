//! Per-rank orchestration of the benchmark variants.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Utc;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::aggregate::{aggregate, AggregateOptions, AggregateOutcome, BenchmarkResult};
use crate::comm::local::LocalCluster;
use crate::comm::Communicator;
use crate::config::{Config, Precision};
use crate::kernel::durable::{run_kernels_durable, DurableSettings, PersistPolicy};
use crate::kernel::{run_kernels, KernelOutcome, KernelSettings, StreamElement};
use crate::report::record::{RecordFormat, RunRecord};
use crate::report::{ConsoleReport, ReportContext};
use crate::topology::{build_topology, Topology};

/// A benchmark variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// Kernels over ordinary process memory.
    Memory,
    /// Kernel writes land in a durable file mapping.
    Durable,
}

impl Variant {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Durable => "durable",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "durable" => Ok(Self::Durable),
            other => Err(format!("unknown variant '{other}' (expected memory or durable)")),
        }
    }
}

/// Everything a rank needs to run, resolved from config and CLI.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub label: String,
    pub variants: Vec<Variant>,
    pub kernel: KernelSettings,
    pub precision: Precision,
    pub persist: PersistPolicy,
    pub durable: DurableSettings,
    /// 0 lets rayon pick one worker per core.
    pub threads_per_process: usize,
    pub record_directory: Option<PathBuf>,
    pub record_format: RecordFormat,
    pub per_node_table: bool,
}

impl RunPlan {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            label: cfg.label.clone(),
            variants: cfg.enabled_variants(),
            kernel: cfg.kernel_settings(),
            precision: cfg.precision,
            persist: cfg.variants.durable.persist,
            durable: cfg.durable_settings(),
            threads_per_process: cfg.threads_per_process,
            record_directory: cfg.output.directory.clone(),
            record_format: cfg.output.format,
            per_node_table: cfg.output.per_node_table,
        }
    }

    fn aggregate_options(&self) -> AggregateOptions {
        AggregateOptions {
            per_node_table: self.per_node_table || self.record_directory.is_some(),
        }
    }

    fn elem_bytes(&self) -> usize {
        match self.precision {
            Precision::Double => <f64 as StreamElement>::BYTES,
            Precision::Single => <f32 as StreamElement>::BYTES,
        }
    }

    fn precision_name(&self) -> &'static str {
        match self.precision {
            Precision::Double => <f64 as StreamElement>::NAME,
            Precision::Single => <f32 as StreamElement>::NAME,
        }
    }
}

/// What the collector keeps from one variant.
#[derive(Debug, Clone)]
pub struct VariantReport {
    pub context: ReportContext,
    pub outcome: AggregateOutcome,
    pub record_path: Option<PathBuf>,
}

/// Runs every planned variant on this rank. The collector (world rank 0)
/// prints the reports and returns them; other ranks return an empty list.
pub fn run_rank<C: Communicator>(world: C, plan: &RunPlan) -> Result<Vec<VariantReport>> {
    let topology = build_topology(world).context("building topology")?;
    let pool = build_pool(plan.threads_per_process, topology.world.rank())?;

    if topology.is_global_root() {
        info!(
            ranks = topology.world.size(),
            nodes = topology.root.size(),
            processes_per_node = topology.node.size(),
            threads_per_process = pool.current_num_threads(),
            variants = ?plan.variants,
            "starting benchmark",
        );
    }

    let mut reports = Vec::new();
    for &variant in &plan.variants {
        if let Some(report) = run_variant(variant, plan, &topology, &pool)
            .with_context(|| format!("running {variant} variant"))?
        {
            reports.push(report);
        }
    }
    Ok(reports)
}

/// Runs `plan` on a thread-per-rank cluster and returns the collector's
/// reports.
pub fn run_local(cluster: &LocalCluster, plan: &RunPlan) -> Result<Vec<VariantReport>> {
    let mut per_rank = cluster.run(|comm| run_rank(comm, plan))?;
    if per_rank.is_empty() {
        return Ok(Vec::new());
    }
    Ok(per_rank.swap_remove(0))
}

fn build_pool(threads: usize, rank: usize) -> Result<ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |i| format!("rank{rank}-worker{i}"))
        .build()
        .context("building worker pool")
}

fn run_variant<C: Communicator>(
    variant: Variant,
    plan: &RunPlan,
    topology: &Topology<C>,
    pool: &ThreadPool,
) -> Result<Option<VariantReport>> {
    let outcome = match plan.precision {
        Precision::Double => execute::<f64, C>(variant, plan, topology, pool)?,
        Precision::Single => execute::<f32, C>(variant, plan, topology, pool)?,
    };

    if !outcome.validation.passed() {
        warn!(rank = topology.world.rank(), variant = %variant, "validation failed, results still reported");
    }

    let host = topology.world.processor_name().to_string();
    let result = BenchmarkResult::from_samples(&host, &outcome.samples);
    debug!(rank = topology.world.rank(), copy_avg = result.stats.copy.avg, "local statistics");

    let Some(aggregated) = aggregate(&result, &outcome.samples, topology, &plan.aggregate_options())? else {
        return Ok(None);
    };

    let context = ReportContext {
        label: plan.label.clone(),
        variant,
        persist: (variant == Variant::Durable).then_some(plan.persist),
        precision: plan.precision_name(),
        array_size: outcome.array_size,
        elem_bytes: plan.elem_bytes(),
        threads_per_process: pool.current_num_threads(),
    };

    println!(
        "{}",
        ConsoleReport {
            ctx: &context,
            outcome: &aggregated,
            show_node_table: plan.per_node_table,
        }
    );

    let record_path = match &plan.record_directory {
        Some(directory) => Some(
            RunRecord::new(&context, &aggregated, Utc::now()).write(directory, plan.record_format)?,
        ),
        None => None,
    };

    info!(variant = %variant, nodes = aggregated.node_count, "variant complete");

    Ok(Some(VariantReport {
        context,
        outcome: aggregated,
        record_path,
    }))
}

fn execute<T: StreamElement, C: Communicator>(
    variant: Variant,
    plan: &RunPlan,
    topology: &Topology<C>,
    pool: &ThreadPool,
) -> Result<KernelOutcome> {
    match variant {
        Variant::Memory => run_kernels::<T, C>(&plan.kernel, topology, pool),
        Variant::Durable => {
            run_kernels_durable::<T, C>(&plan.kernel, plan.persist, &plan.durable, topology, pool)
        }
    }
}
