use nodestream::aggregate::{aggregate, AggregateOptions, AggregateOutcome, BenchmarkResult};
use nodestream::comm::local::LocalCluster;
use nodestream::comm::Communicator;
use nodestream::kernel::{Kernel, PerKernel, RawSample};
use nodestream::report::{node_rates, process_rates, rate_mbs, ReportContext};
use nodestream::runner::Variant;
use nodestream::topology::build_topology;

const WARM_UP: f64 = 9.0;

fn injected_times(world_rank: usize) -> [f64; 3] {
    match world_rank {
        0 => [WARM_UP, 0.10, 0.12],
        1 => [WARM_UP, 0.11, 0.09],
        2 => [WARM_UP, 0.20, 0.18],
        _ => [WARM_UP, 0.19, 0.21],
    }
}

fn context() -> ReportContext {
    ReportContext {
        label: "scenario".to_string(),
        variant: Variant::Memory,
        persist: None,
        precision: "double",
        array_size: 1024,
        elem_bytes: 8,
        threads_per_process: 1,
    }
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-12
}

fn run_scenario(per_node_table: bool) -> AggregateOutcome {
    let cluster = LocalCluster::block(&["A".to_string(), "B".to_string()], 2);
    let mut per_rank = cluster
        .run(|world| {
            let times = injected_times(world.rank());
            let raw = PerKernel::from_fn(|_| RawSample::from_times(times.to_vec()));
            let result = BenchmarkResult::from_samples(world.processor_name(), &raw);
            let topology = build_topology(world)?;
            aggregate(&result, &raw, &topology, &AggregateOptions { per_node_table })
        })
        .expect("cluster run");

    assert_eq!(per_rank.len(), 4);
    assert!(per_rank[1..].iter().all(Option::is_none));
    per_rank.swap_remove(0).expect("collector outcome")
}

#[test]
fn two_hosts_two_ranks_each_node_and_cluster_statistics() {
    let outcome = run_scenario(true);

    assert_eq!(outcome.world_size, 4);
    assert_eq!(outcome.node_count, 2);
    assert_eq!(outcome.processes_per_node, 2);

    let table = outcome.table.as_ref().expect("node table");
    assert_eq!(table.nodes.len(), 2);
    let (a, b) = (&table.nodes[0], &table.nodes[1]);
    assert_eq!(a.host, "A");
    assert_eq!(b.host, "B");

    for kernel in Kernel::ALL {
        // Per repetition the node time is its slowest rank: A sees 0.11 then
        // 0.12, B sees 0.20 then 0.21.
        let node_a = a.stats.get(kernel);
        assert!(close(node_a.max, 0.12), "{kernel}: {node_a:?}");
        assert!(close(node_a.min, 0.11), "{kernel}: {node_a:?}");
        assert!(close(node_a.avg, 0.105), "{kernel}: {node_a:?}");

        let node_b = b.stats.get(kernel);
        assert!(close(node_b.max, 0.21), "{kernel}: {node_b:?}");
        assert!(close(node_b.min, 0.20), "{kernel}: {node_b:?}");
        assert!(close(node_b.avg, 0.195), "{kernel}: {node_b:?}");

        let cluster = outcome.node.stats.get(kernel);
        assert!(close(cluster.max, 0.21));
        assert!(close(cluster.min, 0.11));
        assert!(close(cluster.avg, 0.15));
        assert_eq!(outcome.node.slowest.get(kernel), "B");
        assert_eq!(outcome.node.fastest.get(kernel), "A");
    }
}

#[test]
fn process_level_ranks_by_average_and_skips_warm_up() {
    let outcome = run_scenario(false);
    assert!(outcome.table.is_none());

    // Rank averages: 0.11, 0.10, 0.19, 0.20.
    let triad = outcome.process.stats.triad;
    assert!(close(triad.avg, 0.15));
    assert!(close(triad.max, 0.20));
    assert!(close(triad.min, 0.10));
    assert_eq!(outcome.process.slowest.triad, "B");
    assert_eq!(outcome.process.fastest.triad, "A");
}

#[test]
fn bandwidth_is_bytes_over_time() {
    let outcome = run_scenario(true);
    let ctx = context();

    assert_eq!(ctx.bytes_moved(Kernel::Copy), 16_384);
    assert_eq!(ctx.bytes_moved(Kernel::Add), 24_576);

    let process = process_rates(&ctx, &outcome.process);
    assert!(close(process.copy.best, rate_mbs(16_384.0, 0.10)));
    assert!(close(process.copy.worst, rate_mbs(16_384.0, 0.20)));

    // Two processes per node move their arrays concurrently.
    let node = node_rates(&ctx, &outcome.node.stats, outcome.processes_per_node);
    assert!(close(node.triad.worst, 1.0e-6 * 49_152.0 / 0.21));
    assert!(close(node.triad.best, 1.0e-6 * 49_152.0 / 0.11));
    assert!(close(node.scale.avg, 1.0e-6 * 32_768.0 / 0.15));
}
