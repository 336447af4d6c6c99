//! The four streaming kernels and the timed repetition loop.

pub mod durable;
pub mod validate;

use std::fmt;
use std::ops::{Add, Mul};

use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{self, timed};
use crate::comm::Communicator;
use crate::topology::Topology;

use self::validate::ValidationReport;

/// Multiplier used by scale and triad.
pub const SCALAR: f64 = 3.0;

/// Elements per rank when no cache floor is configured.
pub const DEFAULT_CACHE_FLOOR_ELEMENTS: usize = 1_000_000;

/// One of the four streaming kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kernel {
    Copy,
    Scale,
    Add,
    Triad,
}

impl Kernel {
    /// Execution order within a repetition.
    pub const ALL: [Kernel; 4] = [Kernel::Copy, Kernel::Scale, Kernel::Add, Kernel::Triad];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Scale => "scale",
            Self::Add => "add",
            Self::Triad => "triad",
        }
    }

    /// Capitalised name used in reports and records.
    pub fn label(self) -> &'static str {
        match self {
            Self::Copy => "Copy",
            Self::Scale => "Scale",
            Self::Add => "Add",
            Self::Triad => "Triad",
        }
    }

    /// Arrays read or written per element.
    pub fn arrays_touched(self) -> usize {
        match self {
            Self::Copy | Self::Scale => 2,
            Self::Add | Self::Triad => 3,
        }
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerKernel<T> {
    pub copy: T,
    pub scale: T,
    pub add: T,
    pub triad: T,
}

impl<T> PerKernel<T> {
    pub fn from_fn(mut f: impl FnMut(Kernel) -> T) -> Self {
        Self {
            copy: f(Kernel::Copy),
            scale: f(Kernel::Scale),
            add: f(Kernel::Add),
            triad: f(Kernel::Triad),
        }
    }

    pub fn get(&self, kernel: Kernel) -> &T {
        match kernel {
            Kernel::Copy => &self.copy,
            Kernel::Scale => &self.scale,
            Kernel::Add => &self.add,
            Kernel::Triad => &self.triad,
        }
    }

    pub fn get_mut(&mut self, kernel: Kernel) -> &mut T {
        match kernel {
            Kernel::Copy => &mut self.copy,
            Kernel::Scale => &mut self.scale,
            Kernel::Add => &mut self.add,
            Kernel::Triad => &mut self.triad,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Kernel, &T)> {
        Kernel::ALL.into_iter().map(move |k| (k, self.get(k)))
    }

    pub fn map<U>(&self, mut f: impl FnMut(Kernel, &T) -> U) -> PerKernel<U> {
        PerKernel::from_fn(|k| f(k, self.get(k)))
    }
}

/// Array element precision.
pub trait StreamElement:
    bytemuck::Pod
    + Send
    + Sync
    + PartialOrd
    + fmt::Debug
    + Add<Output = Self>
    + Mul<Output = Self>
{
    /// Size of one element in bytes.
    const BYTES: usize;
    /// Relative error tolerated by validation.
    const EPSILON: f64;
    /// Name used in logs and records.
    const NAME: &'static str;

    fn from_f64(value: f64) -> Self;
    fn to_f64(self) -> f64;
}

impl StreamElement for f64 {
    const BYTES: usize = 8;
    const EPSILON: f64 = 1.0e-13;
    const NAME: &'static str = "double";

    fn from_f64(value: f64) -> Self {
        value
    }

    fn to_f64(self) -> f64 {
        self
    }
}

impl StreamElement for f32 {
    const BYTES: usize = 4;
    const EPSILON: f64 = 1.0e-6;
    const NAME: &'static str = "single";

    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

/// Per-repetition timings in seconds for one kernel on one rank.
///
/// Index 0 is the warm-up repetition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSample {
    times: Vec<f64>,
}

impl RawSample {
    pub fn with_repetitions(repetitions: usize) -> Self {
        Self {
            times: vec![0.0; repetitions],
        }
    }

    pub fn from_times(times: Vec<f64>) -> Self {
        Self { times }
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Stores the time of one repetition.
    pub fn record(&mut self, repetition: usize, secs: f64) -> Result<()> {
        let len = self.times.len();
        match self.times.get_mut(repetition) {
            Some(slot) => {
                *slot = secs;
                Ok(())
            }
            None => bail!("repetition {repetition} outside sample of {len}"),
        }
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// Timings that count towards statistics (warm-up excluded).
    pub fn measured(&self) -> &[f64] {
        self.times.get(1..).unwrap_or(&[])
    }
}

/// Parameters of one kernel run.
#[derive(Debug, Clone, Copy)]
pub struct KernelSettings {
    pub repetitions: usize,
    pub cache_floor_elements: usize,
    pub offset: usize,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            repetitions: 20,
            cache_floor_elements: DEFAULT_CACHE_FLOOR_ELEMENTS,
            offset: 0,
        }
    }
}

/// Elements per rank so that a node's working set exceeds four times the
/// cache floor.
pub fn array_size_for(cache_floor_elements: usize, node_group_size: usize) -> Result<usize> {
    if node_group_size == 0 {
        bail!("node group is empty");
    }
    let size = cache_floor_elements
        .checked_mul(4)
        .context("cache floor overflows array size")?
        / node_group_size;
    if size == 0 {
        bail!(
            "cache floor of {cache_floor_elements} elements leaves no work for {node_group_size} processes per node"
        );
    }
    Ok(size)
}

/// The three working arrays of one rank.
///
/// Each vector holds `array_size + offset` elements; kernels operate on the
/// first `array_size`.
#[derive(Debug)]
pub struct StreamArrays<T> {
    pub a: Vec<T>,
    pub b: Vec<T>,
    pub c: Vec<T>,
    active: usize,
}

impl<T: StreamElement> StreamArrays<T> {
    /// Allocates and initializes a=1, b=2, c=0 on the pool's threads.
    pub fn allocate(array_size: usize, offset: usize, pool: &ThreadPool) -> Result<Self> {
        let len = array_size
            .checked_add(offset)
            .context("array size plus offset overflows")?;
        Ok(Self {
            a: filled(len, T::from_f64(1.0), pool)?,
            b: filled(len, T::from_f64(2.0), pool)?,
            c: filled(len, T::from_f64(0.0), pool)?,
            active: array_size,
        })
    }

    /// Number of elements the kernels operate on.
    pub fn len(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    /// Active parts of a, b and c.
    pub fn active(&self) -> (&[T], &[T], &[T]) {
        let n = self.active;
        (&self.a[..n], &self.b[..n], &self.c[..n])
    }

    pub fn active_mut(&mut self) -> (&mut [T], &mut [T], &mut [T]) {
        let n = self.active;
        (&mut self.a[..n], &mut self.b[..n], &mut self.c[..n])
    }
}

fn filled<T: StreamElement>(len: usize, value: T, pool: &ThreadPool) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .with_context(|| format!("allocating {len} elements of {} bytes", T::BYTES))?;
    pool.install(|| v.par_extend((0..len).into_par_iter().map(|_| value)));
    Ok(v)
}

/// c = a
pub fn copy<T: StreamElement>(c: &mut [T], a: &[T]) {
    c.par_iter_mut().zip(a.par_iter()).for_each(|(c, &a)| *c = a);
}

/// b = scalar * c
pub fn scale<T: StreamElement>(b: &mut [T], c: &[T], scalar: T) {
    b.par_iter_mut()
        .zip(c.par_iter())
        .for_each(|(b, &c)| *b = scalar * c);
}

/// c = a + b
pub fn add<T: StreamElement>(c: &mut [T], a: &[T], b: &[T]) {
    c.par_iter_mut()
        .zip(a.par_iter().zip(b.par_iter()))
        .for_each(|(c, (&a, &b))| *c = a + b);
}

/// a = b + scalar * c
pub fn triad<T: StreamElement>(a: &mut [T], b: &[T], c: &[T], scalar: T) {
    a.par_iter_mut()
        .zip(b.par_iter().zip(c.par_iter()))
        .for_each(|(a, (&b, &c))| *a = b + scalar * c);
}

/// Result of one rank's kernel run.
#[derive(Debug, Clone)]
pub struct KernelOutcome {
    pub array_size: usize,
    pub samples: PerKernel<RawSample>,
    pub validation: ValidationReport,
}

/// Doubles `a` once and checks the pass against the clock granularity.
///
/// Returns the pass duration in seconds.
pub fn calibrate<T: StreamElement>(arrays: &mut StreamArrays<T>, pool: &ThreadPool) -> f64 {
    let two = T::from_f64(2.0);
    let (a, _, _) = arrays.active_mut();
    let ((), secs) = timed(|| pool.install(|| a.par_iter_mut().for_each(|x| *x = two * *x)));

    let granularity = clock::granularity();
    let ticks = clock::ticks(secs, granularity);
    debug!(
        calibration_us = secs * 1.0e6,
        granularity_ns = granularity.as_nanos() as u64,
        ticks,
        "calibration pass",
    );
    if ticks < clock::MIN_TICKS_PER_TEST {
        warn!(
            ticks,
            "calibration pass spans fewer than {} clock ticks, increase the array size",
            clock::MIN_TICKS_PER_TEST,
        );
    }
    secs
}

/// Runs the in-memory variant on this rank.
pub fn run_kernels<T, C>(
    settings: &KernelSettings,
    topology: &Topology<C>,
    pool: &ThreadPool,
) -> Result<KernelOutcome>
where
    T: StreamElement,
    C: Communicator,
{
    let array_size = array_size_for(settings.cache_floor_elements, topology.node.size())?;
    let mut arrays = StreamArrays::<T>::allocate(array_size, settings.offset, pool)?;

    if topology.is_global_root() {
        info!(
            array_size,
            offset = settings.offset,
            precision = T::NAME,
            bytes_per_array = array_size * T::BYTES,
            repetitions = settings.repetitions,
            threads = pool.current_num_threads(),
            "running memory kernels",
        );
    }

    calibrate(&mut arrays, pool);

    let scalar = T::from_f64(SCALAR);
    let mut samples = PerKernel::from_fn(|_| RawSample::with_repetitions(settings.repetitions));

    for rep in 0..settings.repetitions {
        topology.node.barrier().context("node barrier")?;
        let (a, b, c) = arrays.active_mut();

        let ((), t) = timed(|| pool.install(|| copy(c, a)));
        samples.copy.record(rep, t)?;

        let ((), t) = timed(|| pool.install(|| scale(b, c, scalar)));
        samples.scale.record(rep, t)?;

        let ((), t) = timed(|| pool.install(|| add(c, a, b)));
        samples.add.record(rep, t)?;

        let ((), t) = timed(|| pool.install(|| triad(a, b, c, scalar)));
        samples.triad.record(rep, t)?;
    }

    let (a, b, c) = arrays.active();
    let validation = validate::validate(a, b, c, settings.repetitions);
    validation.log(topology.world.rank());

    Ok(KernelOutcome {
        array_size,
        samples,
        validation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::local::LocalComm;
    use crate::topology::build_topology;

    fn pool() -> ThreadPool {
        rayon::ThreadPoolBuilder::new()
            .num_threads(2)
            .build()
            .expect("thread pool")
    }

    #[test]
    fn test_array_size_for_divides_by_node_size() {
        assert_eq!(array_size_for(1_000_000, 4).expect("size"), 1_000_000);
        assert_eq!(array_size_for(512, 2).expect("size"), 1024);
        assert!(array_size_for(1, 8).is_err());
        assert!(array_size_for(10, 0).is_err());
    }

    #[test]
    fn test_arrays_touched() {
        let touched: Vec<usize> = Kernel::ALL.iter().map(|k| k.arrays_touched()).collect();
        assert_eq!(touched, vec![2, 2, 3, 3]);
    }

    #[test]
    fn test_raw_sample_bounds() {
        let mut sample = RawSample::with_repetitions(3);
        sample.record(2, 0.5).expect("in range");
        assert!(sample.record(3, 0.5).is_err());
        assert_eq!(sample.measured(), &[0.0, 0.5]);
        assert!(RawSample::default().measured().is_empty());
    }

    #[test]
    fn test_per_kernel_map_and_iter() {
        let p = PerKernel::from_fn(|k| k.arrays_touched());
        let doubled = p.map(|_, v| v * 2);
        assert_eq!(doubled.add, 6);
        let names: Vec<&str> = p.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["copy", "scale", "add", "triad"]);
    }

    #[test]
    fn test_kernels_follow_dependency_chain() {
        let pool = pool();
        let mut arrays = StreamArrays::<f64>::allocate(16, 4, &pool).expect("alloc");
        assert_eq!(arrays.a.len(), 20);

        let (a, b, c) = arrays.active_mut();
        pool.install(|| {
            copy(c, a);
            scale(b, c, 3.0);
            add(c, a, b);
            triad(a, b, c, 3.0);
        });

        // c=1, b=3, c=4, a=3+12.
        assert!(arrays.a[..16].iter().all(|&x| x == 15.0));
        assert!(arrays.b[..16].iter().all(|&x| x == 3.0));
        assert!(arrays.c[..16].iter().all(|&x| x == 4.0));
        // Padding is never touched.
        assert!(arrays.a[16..].iter().all(|&x| x == 1.0));
    }

    #[test]
    fn test_run_kernels_single_rank_validates() {
        let pool = pool();
        let topology = build_topology(LocalComm::solo("solo-host")).expect("topology");
        let settings = KernelSettings {
            repetitions: 4,
            cache_floor_elements: 256,
            offset: 0,
        };

        let outcome = run_kernels::<f64, _>(&settings, &topology, &pool).expect("run");
        assert_eq!(outcome.array_size, 1024);
        assert!(outcome.validation.passed());
        for (_, sample) in outcome.samples.iter() {
            assert_eq!(sample.len(), 4);
            assert!(sample.times().iter().all(|&t| t >= 0.0));
        }
    }

    #[test]
    fn test_run_kernels_single_precision() {
        let pool = pool();
        let topology = build_topology(LocalComm::solo("solo-host")).expect("topology");
        let settings = KernelSettings {
            repetitions: 10,
            cache_floor_elements: 64,
            offset: 3,
        };

        let outcome = run_kernels::<f32, _>(&settings, &topology, &pool).expect("run");
        assert!(outcome.validation.passed());
    }
}
