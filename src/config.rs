use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::comm::local::LocalCluster;
use crate::kernel::durable::{DurableSettings, PersistPolicy, DEFAULT_DIRECTORY};
use crate::kernel::{KernelSettings, DEFAULT_CACHE_FLOOR_ELEMENTS};
use crate::report::record::RecordFormat;
use crate::runner::Variant;
use crate::topology::local_host_name;

/// Top-level benchmark configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Run label, used as the record file name prefix. Default: "nodestream".
    #[serde(default = "default_label")]
    pub label: String,

    /// Repetitions of the four kernels; the first is warm-up. Default: 20.
    #[serde(default = "default_repetitions")]
    pub repetitions: usize,

    /// Elements per node used to size the arrays. Each process gets
    /// `cache_floor_elements * 4 / processes_per_node`. Default: 1,000,000.
    #[serde(default = "default_cache_floor_elements")]
    pub cache_floor_elements: usize,

    /// Padding elements appended to every array. Default: 0.
    #[serde(default)]
    pub offset: usize,

    /// Array element precision. Default: double.
    #[serde(default)]
    pub precision: Precision,

    /// Worker threads per process; 0 uses one per core. Default: 0.
    #[serde(default)]
    pub threads_per_process: usize,

    /// Which benchmark variants to run.
    #[serde(default)]
    pub variants: VariantsConfig,

    /// Console and record output.
    #[serde(default)]
    pub output: OutputConfig,

    /// Process launch configuration.
    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// Array element type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Double,
    Single,
}

/// Benchmark variants.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VariantsConfig {
    /// Plain in-memory arrays.
    #[serde(default)]
    pub memory: MemoryVariantConfig,

    /// Writes through a durable file mapping.
    #[serde(default)]
    pub durable: DurableVariantConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryVariantConfig {
    /// Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DurableVariantConfig {
    /// Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// When durable writes are flushed. Default: none.
    #[serde(default)]
    pub persist: PersistPolicy,

    /// Prefix of the mount point; the socket number is appended.
    /// Default: "/mnt/pmem_fsdax".
    #[serde(default = "default_durable_directory")]
    pub directory: String,

    /// Socket whose durable device is used. Default: 0.
    #[serde(default)]
    pub socket: u32,
}

/// Console and record output.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Directory for run records. No record is written when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Record encoding. Default: xml.
    #[serde(default)]
    pub format: RecordFormat,

    /// Print per-node results and the node grid. Default: true.
    #[serde(default = "default_true")]
    pub per_node_table: bool,
}

/// How ranks are launched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// One thread per rank inside this process.
    #[default]
    Local,
    /// One process per rank under an MPI launcher.
    Mpi,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "mpi" => Ok(Self::Mpi),
            other => Err(format!("unknown backend '{other}' (expected local or mpi)")),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterConfig {
    /// Default: local.
    #[serde(default)]
    pub backend: Backend,

    /// Placement used by the local backend.
    #[serde(default)]
    pub local: LocalClusterConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalClusterConfig {
    /// Simulated host names. Empty means this machine only.
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Ranks started per host. Default: 1.
    #[serde(default = "default_ranks_per_host")]
    pub ranks_per_host: usize,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_label() -> String {
    "nodestream".to_string()
}

fn default_repetitions() -> usize {
    20
}

fn default_cache_floor_elements() -> usize {
    DEFAULT_CACHE_FLOOR_ELEMENTS
}

fn default_true() -> bool {
    true
}

fn default_durable_directory() -> String {
    DEFAULT_DIRECTORY.to_string()
}

fn default_ranks_per_host() -> usize {
    1
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            label: default_label(),
            repetitions: default_repetitions(),
            cache_floor_elements: default_cache_floor_elements(),
            offset: 0,
            precision: Precision::default(),
            threads_per_process: 0,
            variants: VariantsConfig::default(),
            output: OutputConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl Default for MemoryVariantConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for DurableVariantConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            persist: PersistPolicy::default(),
            directory: default_durable_directory(),
            socket: 0,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: RecordFormat::default(),
            per_node_table: true,
        }
    }
}

impl Default for LocalClusterConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            ranks_per_host: default_ranks_per_host(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.repetitions < 2 {
            bail!(
                "repetitions must be at least 2 (the first is warm-up), got {}",
                self.repetitions
            );
        }

        if self.cache_floor_elements == 0 {
            bail!("cache_floor_elements must be positive");
        }

        if self.label.is_empty() {
            bail!("label is required");
        }

        if self.label.contains(std::path::MAIN_SEPARATOR) || self.label.contains('/') {
            bail!("label must not contain path separators: {}", self.label);
        }

        if self.enabled_variants().is_empty() {
            bail!("at least one of variants.memory and variants.durable must be enabled");
        }

        if self.variants.durable.enabled && self.variants.durable.directory.is_empty() {
            bail!("variants.durable.directory is required when the durable variant is enabled");
        }

        if self.cluster.local.ranks_per_host == 0 {
            bail!("cluster.local.ranks_per_host must be positive");
        }

        if self.cluster.backend == Backend::Mpi && !cfg!(feature = "mpi") {
            bail!("cluster.backend is mpi but this build lacks the 'mpi' feature");
        }

        Ok(())
    }

    /// Variants to run, in execution order.
    pub fn enabled_variants(&self) -> Vec<Variant> {
        let mut variants = Vec::with_capacity(2);
        if self.variants.memory.enabled {
            variants.push(Variant::Memory);
        }
        if self.variants.durable.enabled {
            variants.push(Variant::Durable);
        }
        variants
    }

    /// Enables exactly the given variants.
    pub fn set_variants(&mut self, variants: &[Variant]) {
        self.variants.memory.enabled = variants.contains(&Variant::Memory);
        self.variants.durable.enabled = variants.contains(&Variant::Durable);
    }

    pub fn kernel_settings(&self) -> KernelSettings {
        KernelSettings {
            repetitions: self.repetitions,
            cache_floor_elements: self.cache_floor_elements,
            offset: self.offset,
        }
    }

    pub fn durable_settings(&self) -> DurableSettings {
        DurableSettings {
            directory: self.variants.durable.directory.clone(),
            socket: self.variants.durable.socket,
        }
    }

    /// Rank placement for the local backend.
    pub fn local_cluster(&self) -> LocalCluster {
        let local = &self.cluster.local;
        let hosts = if local.hosts.is_empty() {
            vec![local_host_name()]
        } else {
            local.hosts.clone()
        };
        LocalCluster::block(&hosts, local.ranks_per_host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.label, "nodestream");
        assert_eq!(cfg.repetitions, 20);
        assert_eq!(cfg.cache_floor_elements, 1_000_000);
        assert_eq!(cfg.offset, 0);
        assert_eq!(cfg.precision, Precision::Double);
        assert_eq!(cfg.variants.durable.directory, "/mnt/pmem_fsdax");
        assert_eq!(cfg.enabled_variants(), vec![Variant::Memory]);
        assert!(cfg.output.per_node_table);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
log_level: debug
label: rack7
repetitions: 10
cache_floor_elements: 4096
offset: 8
precision: single
threads_per_process: 2
variants:
  memory:
    enabled: false
  durable:
    enabled: true
    persist: collective
    directory: /mnt/pmem
    socket: 1
output:
  directory: /tmp/records
  format: json
  per_node_table: false
cluster:
  backend: local
  local:
    hosts: [a, b]
    ranks_per_host: 2
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("valid yaml");
        cfg.validate().expect("valid config");

        assert_eq!(cfg.precision, Precision::Single);
        assert_eq!(cfg.enabled_variants(), vec![Variant::Durable]);
        assert_eq!(cfg.variants.durable.persist, PersistPolicy::Collective);
        assert_eq!(
            cfg.durable_settings().file_path(3),
            PathBuf::from("/mnt/pmem1/pstream_test_file3")
        );
        assert_eq!(cfg.output.format, RecordFormat::Json);
        assert_eq!(cfg.output.directory, Some(PathBuf::from("/tmp/records")));

        let cluster = cfg.local_cluster();
        assert_eq!(cluster.hosts(), &["a", "a", "b", "b"]);

        let settings = cfg.kernel_settings();
        assert_eq!(settings.repetitions, 10);
        assert_eq!(settings.offset, 8);
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").expect("valid yaml");
        assert_eq!(cfg.repetitions, 20);
        assert_eq!(cfg.cluster.backend, Backend::Local);
        assert_eq!(cfg.cluster.local.ranks_per_host, 1);
    }

    #[test]
    fn test_validate_rejects_single_repetition() {
        let cfg = Config {
            repetitions: 1,
            ..Default::default()
        };
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("repetitions"));
    }

    #[test]
    fn test_validate_rejects_no_variants() {
        let mut cfg = Config::default();
        cfg.set_variants(&[]);
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("variants"));
    }

    #[test]
    fn test_validate_rejects_label_with_separator() {
        let cfg = Config {
            label: "a/b".to_string(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_cache_floor() {
        let cfg = Config {
            cache_floor_elements: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[cfg(not(feature = "mpi"))]
    #[test]
    fn test_validate_rejects_mpi_without_feature() {
        let mut cfg = Config::default();
        cfg.cluster.backend = Backend::Mpi;
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("mpi"));
    }

    #[test]
    fn test_set_variants_overrides_config() {
        let mut cfg = Config::default();
        cfg.set_variants(&[Variant::Durable, Variant::Memory]);
        assert_eq!(cfg.enabled_variants(), vec![Variant::Memory, Variant::Durable]);
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("MPI".parse::<Backend>(), Ok(Backend::Mpi));
        assert!("slurm".parse::<Backend>().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bench.yaml");
        std::fs::write(&path, "label: from-file\nrepetitions: 3\n").expect("write");

        let cfg = Config::load(&path).expect("load");
        assert_eq!(cfg.label, "from-file");
        assert_eq!(cfg.repetitions, 3);

        std::fs::write(&path, "repetitions: 1\n").expect("write");
        assert!(Config::load(&path).is_err());
    }
}
