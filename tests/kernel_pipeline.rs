use std::fs;
use std::path::Path;

use nodestream::comm::local::LocalCluster;
use nodestream::config::{Config, Precision};
use nodestream::kernel::durable::PersistPolicy;
use nodestream::kernel::Kernel;
use nodestream::report::record::RecordFormat;
use nodestream::runner::{run_local, RunPlan, Variant};
use serial_test::serial;

fn small_config() -> Config {
    Config {
        label: "pipeline".to_string(),
        repetitions: 3,
        cache_floor_elements: 256,
        threads_per_process: 1,
        ..Default::default()
    }
}

fn hosts(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}

fn durable_config(root: &Path, persist: PersistPolicy) -> Config {
    let mut cfg = small_config();
    cfg.set_variants(&[Variant::Durable]);
    cfg.variants.durable.persist = persist;
    cfg.variants.durable.directory = root.join("pmem").display().to_string();
    cfg.variants.durable.socket = 0;
    cfg
}

#[test]
#[serial]
fn memory_variant_writes_xml_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = small_config();
    cfg.output.directory = Some(dir.path().join("records"));
    cfg.output.per_node_table = false;
    cfg.validate().expect("valid config");

    let plan = RunPlan::from_config(&cfg);
    let cluster = LocalCluster::block(&hosts(&["n1", "n2", "n3"]), 2);
    let reports = run_local(&cluster, &plan).expect("local run");

    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.context.variant, Variant::Memory);
    // 256 * 4 / 2 processes per node.
    assert_eq!(report.context.array_size, 512);
    assert_eq!(report.outcome.node_count, 3);

    // Writing a record forces the node table even when it is not printed.
    let table = report.outcome.table.as_ref().expect("node table");
    let names: Vec<&str> = table.nodes.iter().map(|n| n.host.as_str()).collect();
    assert_eq!(names, vec!["n1", "n2", "n3"]);

    let path = report.record_path.as_ref().expect("record path");
    let file_name = path.file_name().and_then(|n| n.to_str()).expect("file name");
    assert!(file_name.starts_with("pipeline_memory_"));
    assert!(file_name.ends_with(".xml"));

    let xml = fs::read_to_string(path).expect("read record");
    assert!(xml.contains("<processes_per_node>2</processes_per_node>"));
    assert!(xml.contains("<threads_per_process>1</threads_per_process>"));
    assert!(xml.contains("<number_of_nodes>3</number_of_nodes>"));
    assert!(xml.contains("<copy_size>8192</copy_size>"));
    assert_eq!(xml.matches("<node>").count(), 3);
}

#[test]
#[serial]
fn single_precision_json_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = small_config();
    cfg.precision = Precision::Single;
    cfg.output.directory = Some(dir.path().to_path_buf());
    cfg.output.format = RecordFormat::Json;

    let plan = RunPlan::from_config(&cfg);
    let cluster = LocalCluster::block(&hosts(&["solo"]), 1);
    let reports = run_local(&cluster, &plan).expect("local run");

    let report = &reports[0];
    assert_eq!(report.context.elem_bytes, 4);
    assert_eq!(report.context.precision, "single");
    assert_eq!(report.context.bytes_moved(Kernel::Triad), 1024 * 4 * 3);

    let path = report.record_path.as_ref().expect("record path");
    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(path).expect("read record")).expect("parse");
    assert_eq!(json["label"], "pipeline");
    assert_eq!(json["precision"], "single");
    assert_eq!(json["number_of_nodes"], 1);
    assert_eq!(json["nodes"][0]["host"], "solo");
    assert!(json["cluster"]["stats"]["copy"]["max"].as_f64().expect("copy max") > 0.0);
}

#[test]
#[serial]
fn durable_variant_cleans_up_mapped_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let device = dir.path().join("pmem0");
    fs::create_dir_all(&device).expect("device directory");

    for persist in [
        PersistPolicy::None,
        PersistPolicy::Individual,
        PersistPolicy::Collective,
    ] {
        let mut cfg = durable_config(dir.path(), persist);
        if persist == PersistPolicy::Individual {
            // One flush per element write.
            cfg.cache_floor_elements = 16;
        }
        cfg.validate().expect("valid config");
        let plan = RunPlan::from_config(&cfg);
        let cluster = LocalCluster::block(&hosts(&["d1", "d2"]), 2);

        let reports = run_local(&cluster, &plan).expect("durable run");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].context.variant, Variant::Durable);
        assert_eq!(reports[0].context.persist, Some(persist));
        assert_eq!(reports[0].outcome.world_size, 4);
        let expected_size = if persist == PersistPolicy::Individual { 32 } else { 512 };
        assert_eq!(reports[0].context.array_size, expected_size);

        let leftovers = fs::read_dir(&device).expect("read device").count();
        assert_eq!(leftovers, 0, "durable files left behind for {persist}");
    }
}

#[test]
#[serial]
fn durable_variant_fails_without_device_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = durable_config(dir.path(), PersistPolicy::Individual);
    let plan = RunPlan::from_config(&cfg);
    let cluster = LocalCluster::block(&hosts(&["d1"]), 2);

    let err = run_local(&cluster, &plan).expect_err("missing device must fail");
    assert!(format!("{err:#}").contains("durable"));
    assert!(!dir.path().join("pmem0").exists());
}
