//! Kernel variant whose writes land in a file-backed durable mapping.
//!
//! Every kernel writes its result into the durable buffer, flushes according
//! to the [`PersistPolicy`], and the buffer is then copied back into the
//! in-memory array so the next kernel reads the value just produced. Only the
//! write and its flushes are timed.

use std::fs::{self, OpenOptions};
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use memmap2::MmapRaw;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{
    array_size_for, calibrate, validate, KernelOutcome, KernelSettings, PerKernel, RawSample,
    StreamArrays, StreamElement, SCALAR,
};
use crate::clock::timed;
use crate::comm::Communicator;
use crate::topology::Topology;

/// Directory prefix used when none is configured. The socket number is
/// appended to it.
pub const DEFAULT_DIRECTORY: &str = "/mnt/pmem_fsdax";

/// File name prefix; the world rank is appended.
const FILE_PREFIX: &str = "pstream_test_file";

/// Errors raised by the durable mapping.
#[derive(Error, Debug)]
pub enum DurableError {
    #[error("creating durable file {path}: {source}")]
    Create { path: PathBuf, source: io::Error },

    #[error("sizing durable file {path} to {bytes} bytes: {source}")]
    Resize {
        path: PathBuf,
        bytes: u64,
        source: io::Error,
    },

    #[error("mapping durable file {path}: {source}")]
    Map { path: PathBuf, source: io::Error },

    #[error("durable region of {elements} elements per buffer is too large")]
    TooLarge { elements: usize },

    #[error("durable mapping is not usable for {elem_bytes}-byte elements")]
    Layout { elem_bytes: usize },

    #[error("flushing {len} bytes at offset {offset}: {source}")]
    Flush {
        offset: usize,
        len: usize,
        source: io::Error,
    },
}

/// When durable writes are flushed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistPolicy {
    /// Never flush explicitly.
    #[default]
    None,
    /// Flush after every element write.
    Individual,
    /// Flush the whole buffer once at the end of each kernel.
    Collective,
}

impl PersistPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Individual => "individual",
            Self::Collective => "collective",
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::None => "not persisting data",
            Self::Individual => "persisting individual writes",
            Self::Collective => "persisting writes at the end of each kernel",
        }
    }
}

impl std::fmt::Display for PersistPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PersistPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "individual" => Ok(Self::Individual),
            "collective" => Ok(Self::Collective),
            other => Err(format!(
                "unknown persist policy '{other}' (expected none, individual or collective)"
            )),
        }
    }
}

/// Makes a byte range of the durable region durable.
pub trait Persist: Sync {
    fn persist(&self, offset: usize, len: usize) -> Result<(), DurableError>;
}

impl Persist for MmapRaw {
    fn persist(&self, offset: usize, len: usize) -> Result<(), DurableError> {
        self.flush_range(offset, len)
            .map_err(|source| DurableError::Flush {
                offset,
                len,
                source,
            })
    }
}

/// Where the durable file lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableSettings {
    /// Prefix the socket number is appended to.
    pub directory: String,
    pub socket: u32,
}

impl Default for DurableSettings {
    fn default() -> Self {
        Self {
            directory: DEFAULT_DIRECTORY.to_string(),
            socket: 0,
        }
    }
}

impl DurableSettings {
    /// `<directory><socket>/pstream_test_file<rank>`
    pub fn file_path(&self, world_rank: usize) -> PathBuf {
        PathBuf::from(format!("{}{}", self.directory, self.socket))
            .join(format!("{FILE_PREFIX}{world_rank}"))
    }
}

/// Byte offsets of the three buffers inside the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    /// Elements per buffer, padding included.
    pub buffer_len: usize,
    pub elem_bytes: usize,
}

impl BufferLayout {
    /// Offset of element `index` of buffer `buffer` (0 = a, 1 = b, 2 = c).
    pub fn element(&self, buffer: usize, index: usize) -> usize {
        (buffer * self.buffer_len + index) * self.elem_bytes
    }

    pub fn buffer_start(&self, buffer: usize) -> usize {
        self.element(buffer, 0)
    }
}

/// Mutable views of the durable a, b and c buffers.
pub struct DurableBuffers<'a, T> {
    pub a: &'a mut [T],
    pub b: &'a mut [T],
    pub c: &'a mut [T],
}

/// Exclusively created, mapped file holding three buffers. The mapping is
/// released and the file removed on drop.
pub struct DurableRegion<T> {
    path: PathBuf,
    map: MmapRaw,
    layout: BufferLayout,
    _elem: PhantomData<T>,
}

impl<T> std::fmt::Debug for DurableRegion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableRegion")
            .field("path", &self.path)
            .field("layout", &self.layout)
            .finish()
    }
}

impl<T: StreamElement> DurableRegion<T> {
    /// Creates `path` (failing if it exists), sizes it for three buffers of
    /// `buffer_len` elements and maps it.
    pub fn create(path: &Path, buffer_len: usize) -> Result<Self, DurableError> {
        let bytes = buffer_len
            .checked_mul(T::BYTES)
            .and_then(|b| b.checked_mul(3))
            .ok_or(DurableError::TooLarge {
                elements: buffer_len,
            })?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| DurableError::Create {
                path: path.to_path_buf(),
                source,
            })?;

        let mapped = file
            .set_len(bytes as u64)
            .map_err(|source| DurableError::Resize {
                path: path.to_path_buf(),
                bytes: bytes as u64,
                source,
            })
            .and_then(|()| {
                MmapRaw::map_raw(&file).map_err(|source| DurableError::Map {
                    path: path.to_path_buf(),
                    source,
                })
            });

        let map = match mapped {
            Ok(map) => map,
            Err(e) => {
                remove_quietly(path);
                return Err(e);
            }
        };

        if map.len() < bytes || map.as_ptr().align_offset(std::mem::align_of::<T>()) != 0 {
            remove_quietly(path);
            return Err(DurableError::Layout {
                elem_bytes: T::BYTES,
            });
        }

        debug!(path = %path.display(), bytes, "durable region mapped");

        Ok(Self {
            path: path.to_path_buf(),
            map,
            layout: BufferLayout {
                buffer_len,
                elem_bytes: T::BYTES,
            },
            _elem: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> BufferLayout {
        self.layout
    }

    /// The three buffers together with the flusher for the mapping.
    pub fn split(&mut self) -> Result<(DurableBuffers<'_, T>, &MmapRaw), DurableError> {
        let total = self.layout.buffer_len * 3;
        let byte_len = total * T::BYTES;
        // SAFETY: the mapping is at least `byte_len` bytes and aligned for T
        // (checked in `create`), it lives as long as `self`, and `&mut self`
        // guarantees no other view of the memory exists.
        let bytes: &mut [u8] = unsafe { std::slice::from_raw_parts_mut(self.map.as_mut_ptr(), byte_len) };
        let elems: &mut [T] = bytemuck::try_cast_slice_mut(bytes).map_err(|_| DurableError::Layout {
            elem_bytes: T::BYTES,
        })?;

        let (a, rest) = elems.split_at_mut(self.layout.buffer_len);
        let (b, c) = rest.split_at_mut(self.layout.buffer_len);
        Ok((DurableBuffers { a, b, c }, &self.map))
    }
}

impl<T> Drop for DurableRegion<T> {
    fn drop(&mut self) {
        remove_quietly(&self.path);
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "removing durable file");
    }
}

/// Writes `f(j)` into every element of `out`, flushing per `policy`.
fn durable_write<T, P, F>(
    out: &mut [T],
    buffer: usize,
    layout: BufferLayout,
    policy: PersistPolicy,
    persist: &P,
    pool: &ThreadPool,
    f: F,
) -> Result<(), DurableError>
where
    T: StreamElement,
    P: Persist + ?Sized,
    F: Fn(usize) -> T + Sync,
{
    pool.install(|| match policy {
        PersistPolicy::Individual => out.par_iter_mut().enumerate().try_for_each(|(j, slot)| {
            *slot = f(j);
            persist.persist(layout.element(buffer, j), T::BYTES)
        }),
        PersistPolicy::Collective => {
            out.par_iter_mut().enumerate().for_each(|(j, slot)| *slot = f(j));
            persist.persist(layout.buffer_start(buffer), out.len() * T::BYTES)
        }
        PersistPolicy::None => {
            out.par_iter_mut().enumerate().for_each(|(j, slot)| *slot = f(j));
            Ok(())
        }
    })
}

fn copy_back<T: StreamElement>(dst: &mut [T], src: &[T], pool: &ThreadPool) {
    pool.install(|| super::copy(dst, src));
}

/// Initializes the durable buffers to a=1, b=2, c=0 and persists them once
/// unless the policy is [`PersistPolicy::None`].
pub fn initialize_durable<T, P>(
    buffers: &mut DurableBuffers<'_, T>,
    layout: BufferLayout,
    policy: PersistPolicy,
    persist: &P,
    pool: &ThreadPool,
) -> Result<(), DurableError>
where
    T: StreamElement,
    P: Persist + ?Sized,
{
    let (one, two, zero) = (T::from_f64(1.0), T::from_f64(2.0), T::from_f64(0.0));
    pool.install(|| {
        buffers.a.par_iter_mut().for_each(|x| *x = one);
        buffers.b.par_iter_mut().for_each(|x| *x = two);
        buffers.c.par_iter_mut().for_each(|x| *x = zero);
    });

    if policy != PersistPolicy::None {
        let len = layout.buffer_len * T::BYTES;
        for buffer in 0..3 {
            persist.persist(layout.buffer_start(buffer), len)?;
        }
    }
    Ok(())
}

/// The timed repetition loop of the durable variant.
///
/// `arrays` and `durable` must have the same active length. Reads come from
/// the in-memory arrays, writes go to the durable buffers and are copied back.
#[allow(clippy::too_many_arguments)]
pub fn durable_repetitions<T, C, P>(
    arrays: &mut StreamArrays<T>,
    durable: &mut DurableBuffers<'_, T>,
    layout: BufferLayout,
    policy: PersistPolicy,
    persist: &P,
    node: &C,
    repetitions: usize,
    pool: &ThreadPool,
) -> Result<PerKernel<RawSample>>
where
    T: StreamElement,
    C: Communicator,
    P: Persist + ?Sized,
{
    let n = arrays.len();
    let scalar = T::from_f64(SCALAR);
    let mut samples = PerKernel::from_fn(|_| RawSample::with_repetitions(repetitions));

    let a_w = durable.a.get_mut(..n).context("durable buffer a shorter than arrays")?;
    let b_w = durable.b.get_mut(..n).context("durable buffer b shorter than arrays")?;
    let c_w = durable.c.get_mut(..n).context("durable buffer c shorter than arrays")?;

    for rep in 0..repetitions {
        node.barrier().context("node barrier")?;

        let (a, b, c) = arrays.active_mut();
        let (result, t) = timed(|| durable_write(&mut *c_w, 2, layout, policy, persist, pool, |j| a[j]));
        result?;
        samples.copy.record(rep, t)?;
        copy_back(c, c_w, pool);

        let (result, t) = timed(|| durable_write(&mut *b_w, 1, layout, policy, persist, pool, |j| scalar * c[j]));
        result?;
        samples.scale.record(rep, t)?;
        copy_back(b, b_w, pool);

        let (result, t) = timed(|| durable_write(&mut *c_w, 2, layout, policy, persist, pool, |j| a[j] + b[j]));
        result?;
        samples.add.record(rep, t)?;
        copy_back(c, c_w, pool);

        let (result, t) = timed(|| {
            durable_write(&mut *a_w, 0, layout, policy, persist, pool, |j| b[j] + scalar * c[j])
        });
        result?;
        samples.triad.record(rep, t)?;
        copy_back(a, a_w, pool);
    }

    Ok(samples)
}

/// Runs the durable variant on this rank.
pub fn run_kernels_durable<T, C>(
    settings: &KernelSettings,
    policy: PersistPolicy,
    durable: &DurableSettings,
    topology: &Topology<C>,
    pool: &ThreadPool,
) -> Result<KernelOutcome>
where
    T: StreamElement,
    C: Communicator,
{
    let array_size = array_size_for(settings.cache_floor_elements, topology.node.size())?;
    let mut arrays = StreamArrays::<T>::allocate(array_size, settings.offset, pool)?;

    let path = durable.file_path(topology.world.rank());
    if topology.is_global_root() {
        info!(
            file = %durable.file_path(0).with_file_name(FILE_PREFIX).display(),
            policy = %policy,
            "using durable file per rank, {}",
            policy.describe(),
        );
    }

    let mut region = DurableRegion::<T>::create(&path, array_size + settings.offset)
        .with_context(|| format!("rank {} durable setup", topology.world.rank()))?;
    debug!(
        rank = topology.world.rank(),
        path = %region.path().display(),
        buffer_len = region.layout().buffer_len,
        "durable region ready",
    );
    let layout = region.layout();
    let (mut buffers, flusher) = region.split()?;

    initialize_durable(&mut buffers, layout, policy, flusher, pool)?;
    calibrate(&mut arrays, pool);

    let samples = durable_repetitions(
        &mut arrays,
        &mut buffers,
        layout,
        policy,
        flusher,
        &topology.node,
        settings.repetitions,
        pool,
    )?;

    let validation = validate::validate(
        &buffers.a[..array_size],
        &buffers.b[..array_size],
        &buffers.c[..array_size],
        settings.repetitions,
    );
    validation.log(topology.world.rank());

    Ok(KernelOutcome {
        array_size,
        samples,
        validation,
    })
}
