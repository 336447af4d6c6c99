//! Hierarchical reduction of per-rank timings.
//!
//! Three levels are produced, all collected at world rank 0:
//!
//! - process level: mean of every rank's average time, plus the slowest and
//!   fastest rank (by average) and their hosts;
//! - node level: per repetition, the node's average and its slowest rank,
//!   summarised over repetitions and held by the node leader;
//! - cluster level: node leaders combine their node statistics over the root
//!   group, keeping the worst and best node.

pub mod stat;

pub use self::stat::{BenchmarkResult, PerformanceStat};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::comm::{Communicator, ReduceOp, TAG_HOST_NAME};
use crate::kernel::{Kernel, PerKernel, RawSample};
use crate::topology::Topology;

/// Aggregation switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregateOptions {
    /// Gather every node's record at the collector.
    pub per_node_table: bool,
}

/// Statistics with the hosts responsible for the extremes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateResult {
    pub stats: PerKernel<PerformanceStat>,
    /// Host that produced the maximum time.
    pub slowest: PerKernel<String>,
    /// Host that produced the minimum time.
    pub fastest: PerKernel<String>,
}

/// One node's statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub host: String,
    pub stats: PerKernel<PerformanceStat>,
}

/// Every node's record, ordered by root-group rank.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeTable {
    pub nodes: Vec<NodeRecord>,
}

/// Everything the collector holds after one variant.
#[derive(Debug, Clone)]
pub struct AggregateOutcome {
    pub process: AggregateResult,
    pub node: AggregateResult,
    pub table: Option<NodeTable>,
    pub world_size: usize,
    pub node_count: usize,
    /// Node-group size of the collector.
    pub processes_per_node: usize,
}

/// Runs every reduction for one variant. Returns `Some` on world rank 0 only.
///
/// Must be called by every rank of the world group.
pub fn aggregate<C: Communicator>(
    result: &BenchmarkResult,
    raw: &PerKernel<RawSample>,
    topology: &Topology<C>,
    options: &AggregateOptions,
) -> Result<Option<AggregateOutcome>> {
    let process = summarize(
        &topology.world,
        &result.stats,
        &result.host,
        |s| s.avg,
        |s| s.avg,
    )
    .context("aggregating process statistics")?;

    let node_stats = node_statistics(&topology.node, raw).context("aggregating node statistics")?;

    let mut cluster = None;
    let mut table = None;
    if let Some(stats) = node_stats {
        let record = NodeRecord {
            host: result.host.clone(),
            stats,
        };
        debug!(host = %record.host, copy_max = record.stats.copy.max, "node statistics");

        cluster = summarize(&topology.root, &record.stats, &record.host, |s| s.max, |s| s.min)
            .context("aggregating cluster statistics")?;

        if options.per_node_table {
            table = gather_node_table(&topology.root, &record).context("gathering node table")?;
        }
    }

    if !topology.is_global_root() {
        return Ok(None);
    }

    Ok(Some(AggregateOutcome {
        process: process.context("collector received no process statistics")?,
        node: cluster.context("collector received no cluster statistics")?,
        table,
        world_size: topology.world.size(),
        node_count: topology
            .node_count()
            .context("collector does not lead its node")?,
        processes_per_node: topology.node.size(),
    }))
}

/// Node-level statistics, returned on the node leader only.
///
/// For each measured repetition the node average is the mean over the node's
/// ranks and the node time is its slowest rank. The reported average is the
/// mean of the per-repetition averages; min and max are taken over the
/// per-repetition slowest times.
pub fn node_statistics<C: Communicator>(
    node: &C,
    raw: &PerKernel<RawSample>,
) -> Result<Option<PerKernel<PerformanceStat>>> {
    let mut stats = PerKernel::<PerformanceStat>::default();
    let leader = node.rank() == 0;

    for kernel in Kernel::ALL {
        let measured = raw.get(kernel).measured();
        let sums = node.reduce(measured, ReduceOp::Sum, 0)?;
        let maxima = node.reduce(measured, ReduceOp::Max, 0)?;

        if let (Some(sums), Some(maxima)) = (sums, maxima) {
            *stats.get_mut(kernel) = combine_node_repetitions(&sums, &maxima, node.size());
        }
    }

    Ok(leader.then_some(stats))
}

fn combine_node_repetitions(sums: &[f64], maxima: &[f64], node_size: usize) -> PerformanceStat {
    let averages: Vec<f64> = sums.iter().map(|s| s / node_size as f64).collect();
    let slowest = PerformanceStat::from_values(maxima);
    PerformanceStat {
        avg: PerformanceStat::from_values(&averages).avg,
        min: slowest.min,
        max: slowest.max,
    }
}

/// Mean of `avg` over the group plus located extremes of the two keys.
/// Returns `Some` on group rank 0 only.
fn summarize<C, S, F>(
    group: &C,
    local: &PerKernel<PerformanceStat>,
    host: &str,
    slow_key: S,
    fast_key: F,
) -> Result<Option<AggregateResult>>
where
    C: Communicator,
    S: Fn(&PerformanceStat) -> f64,
    F: Fn(&PerformanceStat) -> f64,
{
    let avgs: Vec<f64> = local.iter().map(|(_, s)| s.avg).collect();
    let sums = group.reduce(&avgs, ReduceOp::Sum, 0)?;

    let mut out = AggregateResult::default();
    for kernel in Kernel::ALL {
        let stat = local.get(kernel);
        let (max, slowest) = located_extreme(group, slow_key(stat), host, ReduceOp::Max, kernel)?;
        let (min, fastest) = located_extreme(group, fast_key(stat), host, ReduceOp::Min, kernel)?;

        let entry = out.stats.get_mut(kernel);
        entry.max = max;
        entry.min = min;
        if let Some(h) = slowest {
            *out.slowest.get_mut(kernel) = h;
        }
        if let Some(h) = fastest {
            *out.fastest.get_mut(kernel) = h;
        }
    }

    let Some(sums) = sums else {
        return Ok(None);
    };
    for (kernel, sum) in Kernel::ALL.into_iter().zip(sums) {
        out.stats.get_mut(kernel).avg = sum / group.size() as f64;
    }
    Ok(Some(out))
}

/// Max- or min-with-location of `local`; the host of the winning rank is
/// delivered to group rank 0.
fn located_extreme<C: Communicator>(
    group: &C,
    local: f64,
    host: &str,
    op: ReduceOp,
    kernel: Kernel,
) -> Result<(f64, Option<String>)> {
    let winner = group.all_reduce_loc(local, op)?;

    if group.rank() == winner.rank {
        if !consistent(local, winner.value) {
            warn!(
                kernel = %kernel,
                op = ?op,
                rank = winner.rank,
                reported = winner.value,
                local,
                "reduction consistency: winning rank holds a different value",
            );
        }
        if winner.rank != 0 {
            group.send_bytes(0, TAG_HOST_NAME, host.as_bytes())?;
        }
    }

    if group.rank() != 0 {
        return Ok((winner.value, None));
    }

    let winner_host = if winner.rank == 0 {
        host.to_string()
    } else {
        let raw = group.recv_bytes(winner.rank, TAG_HOST_NAME)?;
        String::from_utf8_lossy(&raw).into_owned()
    };
    Ok((winner.value, Some(winner_host)))
}

fn consistent(local: f64, reported: f64) -> bool {
    let scale = local.abs().max(reported.abs()).max(1.0);
    (local - reported).abs() <= f64::EPSILON * scale
}

fn gather_node_table<C: Communicator>(root: &C, record: &NodeRecord) -> Result<Option<NodeTable>> {
    let payload = serde_json::to_vec(record).context("encoding node record")?;
    let Some(parts) = root.gather_bytes(&payload, 0)? else {
        return Ok(None);
    };

    let nodes = parts
        .iter()
        .enumerate()
        .map(|(rank, part)| {
            serde_json::from_slice::<NodeRecord>(part)
                .with_context(|| format!("decoding node record from root rank {rank}"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(NodeTable { nodes }))
}
