use serde::{Deserialize, Serialize};

use crate::kernel::{PerKernel, RawSample};
use crate::topology::bounded_host_name;

/// Average, minimum and maximum time in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStat {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

impl PerformanceStat {
    /// Statistics over a raw sample, warm-up repetition excluded.
    pub fn from_sample(sample: &RawSample) -> Self {
        Self::from_values(sample.measured())
    }

    /// Statistics over `values`; all zeros when empty.
    pub fn from_values(values: &[f64]) -> Self {
        let Some((&first, rest)) = values.split_first() else {
            return Self::default();
        };

        let mut stat = Self {
            avg: first,
            min: first,
            max: first,
        };
        for &v in rest {
            stat.avg += v;
            stat.min = stat.min.min(v);
            stat.max = stat.max.max(v);
        }
        stat.avg /= values.len() as f64;
        stat
    }
}

/// One rank's statistics for one variant run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub host: String,
    pub stats: PerKernel<PerformanceStat>,
}

impl BenchmarkResult {
    pub fn from_samples(host: &str, samples: &PerKernel<RawSample>) -> Self {
        Self {
            host: bounded_host_name(host).to_string(),
            stats: samples.map(|_, sample| PerformanceStat::from_sample(sample)),
        }
    }
}
