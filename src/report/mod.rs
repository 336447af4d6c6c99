//! Bandwidth figures and the console report.

pub mod grid;
pub mod record;

use std::fmt;

use crate::aggregate::{AggregateOutcome, AggregateResult, NodeTable, PerformanceStat};
use crate::kernel::durable::PersistPolicy;
use crate::kernel::{Kernel, PerKernel};
use crate::runner::Variant;

use self::grid::grid_shape;

/// Run parameters needed to turn times into rates.
#[derive(Debug, Clone)]
pub struct ReportContext {
    pub label: String,
    pub variant: Variant,
    pub persist: Option<PersistPolicy>,
    pub precision: &'static str,
    pub array_size: usize,
    pub elem_bytes: usize,
    pub threads_per_process: usize,
}

impl ReportContext {
    /// Bytes one process moves per execution of `kernel`.
    pub fn bytes_moved(&self, kernel: Kernel) -> u64 {
        bytes_moved(self.array_size, self.elem_bytes, kernel)
    }
}

/// `array_size * elem_bytes * arrays_touched`
pub fn bytes_moved(array_size: usize, elem_bytes: usize, kernel: Kernel) -> u64 {
    (array_size as u64) * (elem_bytes as u64) * (kernel.arrays_touched() as u64)
}

/// Rate in MB/s; zero for non-positive times.
pub fn rate_mbs(bytes: f64, secs: f64) -> f64 {
    if secs <= 0.0 {
        return 0.0;
    }
    1.0e-6 * bytes / secs
}

/// Best, average and worst rate derived from min, avg and max time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KernelRates {
    pub best: f64,
    pub avg: f64,
    pub worst: f64,
}

impl KernelRates {
    pub fn from_stat(bytes: f64, stat: &PerformanceStat) -> Self {
        Self {
            best: rate_mbs(bytes, stat.min),
            avg: rate_mbs(bytes, stat.avg),
            worst: rate_mbs(bytes, stat.max),
        }
    }
}

/// Rates of a single process.
pub fn process_rates(ctx: &ReportContext, result: &AggregateResult) -> PerKernel<KernelRates> {
    result
        .stats
        .map(|k, stat| KernelRates::from_stat(ctx.bytes_moved(k) as f64, stat))
}

/// Rates of a whole node: every process on it moves its share concurrently.
pub fn node_rates(
    ctx: &ReportContext,
    stats: &PerKernel<PerformanceStat>,
    processes_per_node: usize,
) -> PerKernel<KernelRates> {
    stats.map(|k, stat| {
        let bytes = ctx.bytes_moved(k) as f64 * processes_per_node as f64;
        KernelRates::from_stat(bytes, stat)
    })
}

/// Human-readable summary printed by the collector.
pub struct ConsoleReport<'a> {
    pub ctx: &'a ReportContext,
    pub outcome: &'a AggregateOutcome,
    pub show_node_table: bool,
}

impl fmt::Display for ConsoleReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ctx = self.ctx;
        let outcome = self.outcome;

        write!(f, "{} / {} variant", ctx.label, ctx.variant)?;
        if let Some(policy) = ctx.persist {
            write!(f, " (persist {policy})")?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{} processes per node, {} threads per process, {} nodes, {} processes in total",
            outcome.processes_per_node, ctx.threads_per_process, outcome.node_count, outcome.world_size,
        )?;
        writeln!(
            f,
            "array size {} elements of {} precision ({} bytes per array per process)",
            ctx.array_size,
            ctx.precision,
            ctx.array_size * ctx.elem_bytes,
        )?;

        writeln!(f)?;
        writeln!(f, "Process level")?;
        write_summary(f, &outcome.process, &process_rates(ctx, &outcome.process), "host")?;

        writeln!(f)?;
        writeln!(f, "Node level")?;
        let rates = node_rates(ctx, &outcome.node.stats, outcome.processes_per_node);
        write_summary(f, &outcome.node, &rates, "node")?;

        if let Some(table) = outcome.table.as_ref().filter(|_| self.show_node_table) {
            writeln!(f)?;
            write_node_table(f, ctx, table, outcome.processes_per_node)?;
            writeln!(f)?;
            write_node_grid(f, ctx, table, outcome.processes_per_node)?;
        }
        Ok(())
    }
}

fn write_summary(
    f: &mut fmt::Formatter<'_>,
    result: &AggregateResult,
    rates: &PerKernel<KernelRates>,
    who: &str,
) -> fmt::Result {
    writeln!(
        f,
        "{:<8}{:>14}{:>14}{:>14}{:>12}{:>12}{:>12}  {:<20}{:<20}",
        "Function",
        "Best MB/s",
        "Avg MB/s",
        "Worst MB/s",
        "Avg time",
        "Min time",
        "Max time",
        format!("Slowest {who}"),
        format!("Fastest {who}"),
    )?;
    for kernel in Kernel::ALL {
        let stat = result.stats.get(kernel);
        let rate = rates.get(kernel);
        writeln!(
            f,
            "{:<8}{:>14.1}{:>14.1}{:>14.1}{:>12.6}{:>12.6}{:>12.6}  {:<20}{:<20}",
            format!("{}:", kernel.label()),
            rate.best,
            rate.avg,
            rate.worst,
            stat.avg,
            stat.min,
            stat.max,
            result.slowest.get(kernel),
            result.fastest.get(kernel),
        )?;
    }
    Ok(())
}

fn write_node_table(
    f: &mut fmt::Formatter<'_>,
    ctx: &ReportContext,
    table: &NodeTable,
    processes_per_node: usize,
) -> fmt::Result {
    writeln!(f, "Per node average MB/s")?;
    write!(f, "{:<24}", "Node")?;
    for kernel in Kernel::ALL {
        write!(f, "{:>14}", kernel.label())?;
    }
    writeln!(f)?;

    for node in &table.nodes {
        let rates = node_rates(ctx, &node.stats, processes_per_node);
        write!(f, "{:<24}", node.host)?;
        for kernel in Kernel::ALL {
            write!(f, "{:>14.1}", rates.get(kernel).avg)?;
        }
        writeln!(f)?;
    }
    Ok(())
}

fn write_node_grid(
    f: &mut fmt::Formatter<'_>,
    ctx: &ReportContext,
    table: &NodeTable,
    processes_per_node: usize,
) -> fmt::Result {
    let shape = grid_shape(table.nodes.len());
    writeln!(
        f,
        "Node grid, Copy average MB/s ({} x {})",
        shape.rows, shape.cols
    )?;

    let mut cells = vec!["N/A".to_string(); shape.cells()];
    for (index, node) in table.nodes.iter().enumerate() {
        let Some((row, col)) = shape.position(index) else {
            continue;
        };
        let rate = node_rates(ctx, &node.stats, processes_per_node).copy.avg;
        cells[row * shape.cols + col] = format!("{} {:.0}", node.host, rate);
    }

    if shape.cols == 0 {
        return Ok(());
    }
    for row in cells.chunks(shape.cols) {
        writeln!(f, "| {} |", row.join(" | "))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::NodeRecord;

    fn ctx() -> ReportContext {
        ReportContext {
            label: "unit".to_string(),
            variant: Variant::Memory,
            persist: None,
            precision: "double",
            array_size: 1024,
            elem_bytes: 8,
            threads_per_process: 1,
        }
    }

    fn stat(avg: f64, min: f64, max: f64) -> PerformanceStat {
        PerformanceStat { avg, min, max }
    }

    fn outcome() -> AggregateOutcome {
        let process = AggregateResult {
            stats: PerKernel::from_fn(|_| stat(0.15, 0.1, 0.2)),
            slowest: PerKernel::from_fn(|_| "b".to_string()),
            fastest: PerKernel::from_fn(|_| "a".to_string()),
        };
        AggregateOutcome {
            node: process.clone(),
            process,
            table: Some(NodeTable {
                nodes: vec![
                    NodeRecord {
                        host: "a".to_string(),
                        stats: PerKernel::from_fn(|_| stat(0.1, 0.1, 0.1)),
                    },
                    NodeRecord {
                        host: "b".to_string(),
                        stats: PerKernel::from_fn(|_| stat(0.2, 0.2, 0.2)),
                    },
                ],
            }),
            world_size: 4,
            node_count: 2,
            processes_per_node: 2,
        }
    }

    #[test]
    fn test_bytes_moved() {
        assert_eq!(bytes_moved(1024, 8, Kernel::Copy), 16_384);
        assert_eq!(bytes_moved(1024, 8, Kernel::Triad), 24_576);
        assert_eq!(bytes_moved(10, 4, Kernel::Add), 120);
    }

    #[test]
    fn test_rates_use_min_for_best_and_max_for_worst() {
        let rates = KernelRates::from_stat(1.0e6, &stat(0.5, 0.25, 1.0));
        assert_eq!(rates.best, 4.0);
        assert_eq!(rates.avg, 2.0);
        assert_eq!(rates.worst, 1.0);
        assert_eq!(rate_mbs(100.0, 0.0), 0.0);
    }

    #[test]
    fn test_node_rates_scale_with_processes() {
        let ctx = ctx();
        let stats = PerKernel::from_fn(|_| stat(0.1, 0.1, 0.1));
        let single = node_rates(&ctx, &stats, 1);
        let double = node_rates(&ctx, &stats, 2);
        assert!((double.copy.avg - 2.0 * single.copy.avg).abs() < 1e-9);
    }

    #[test]
    fn test_console_report_lists_hosts_and_grid() {
        let ctx = ctx();
        let outcome = outcome();
        let text = ConsoleReport {
            ctx: &ctx,
            outcome: &outcome,
            show_node_table: true,
        }
        .to_string();

        assert!(text.contains("unit / memory variant"));
        assert!(text.contains("Process level"));
        assert!(text.contains("Node level"));
        assert!(text.contains("Triad:"));
        assert!(text.contains("Per node average MB/s"));
        assert!(text.contains("Node grid"));
        // 2 nodes lay out as a single row.
        assert!(text.contains("| a "));
    }

    #[test]
    fn test_node_grid_pads_prime_counts() {
        let ctx = ctx();
        let mut outcome = outcome();
        if let Some(table) = outcome.table.as_mut() {
            table.nodes.push(NodeRecord {
                host: "c".to_string(),
                stats: PerKernel::from_fn(|_| stat(0.4, 0.4, 0.4)),
            });
        }
        let text = ConsoleReport {
            ctx: &ctx,
            outcome: &outcome,
            show_node_table: true,
        }
        .to_string();

        // 3 nodes fill a 2 x 2 grid row by row, leaving the last cell empty.
        assert!(text.contains("(2 x 2)"));
        let rows: Vec<&str> = text.lines().filter(|l| l.starts_with("| ")).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("| a "));
        assert!(rows[1].starts_with("| c "));
        assert!(rows[1].ends_with("| N/A |"));
    }

    #[test]
    fn test_console_report_hides_table_when_disabled() {
        let ctx = ctx();
        let outcome = outcome();
        let text = ConsoleReport {
            ctx: &ctx,
            outcome: &outcome,
            show_node_table: false,
        }
        .to_string();
        assert!(!text.contains("Per node"));
    }
}
