//! Process-group communication.
//!
//! [`Communicator`] is the seam between the benchmark and whatever runs the
//! ranks. Every collective is blocking and group-wide: no rank returns until
//! the whole group has arrived. Reductions combine contributions in ascending
//! rank order so sums are reproducible and location selections break ties
//! toward the lowest rank.

pub mod local;

#[cfg(feature = "mpi")]
pub mod mpi;

use thiserror::Error;

/// Tag used when forwarding host identifiers to the collector.
pub const TAG_HOST_NAME: u32 = 17;

/// Errors raised by the group primitive.
#[derive(Error, Debug)]
pub enum CommError {
    #[error("group split failed: {reason}")]
    Split { reason: String },

    #[error("rank {rank} is outside group of size {size}")]
    InvalidRank { rank: usize, size: usize },

    #[error("payload from rank {rank} is malformed: expected {expected} bytes, got {actual}")]
    Malformed {
        rank: usize,
        expected: usize,
        actual: usize,
    },

    #[error("reduction over {values} values returned {returned}")]
    LengthMismatch { values: usize, returned: usize },

    #[error("location reduction does not support {op:?}")]
    UnsupportedOp { op: ReduceOp },

    #[error("collective over an empty group")]
    EmptyGroup,

    #[error("communication aborted: a peer rank failed")]
    Aborted,

    #[error("MPI error: {0}")]
    Mpi(String),
}

/// Reduction operator applied elementwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

impl ReduceOp {
    /// Combine an accumulated value with the next contribution.
    pub fn apply(self, acc: f64, value: f64) -> f64 {
        match self {
            Self::Sum => acc + value,
            Self::Max => {
                if value > acc {
                    value
                } else {
                    acc
                }
            }
            Self::Min => {
                if value < acc {
                    value
                } else {
                    acc
                }
            }
        }
    }

    /// Returns true when `candidate` strictly beats `current`.
    ///
    /// Strictness keeps the earliest (lowest-rank) winner on ties.
    fn beats(self, candidate: f64, current: f64) -> bool {
        match self {
            Self::Max => candidate > current,
            Self::Min => candidate < current,
            Self::Sum => false,
        }
    }
}

/// Winning value of a location reduction and the rank that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Located {
    pub value: f64,
    pub rank: usize,
}

/// Blocking process-group primitive.
///
/// Implementors provide the byte-level core (split, barrier, gather,
/// point-to-point). The numeric collectives have portable default
/// implementations built on the gathers; backends with native reductions
/// override them.
pub trait Communicator {
    /// Rank of the calling process within this group.
    fn rank(&self) -> usize;

    /// Number of processes in this group.
    fn size(&self) -> usize;

    /// Host identifier of the calling process.
    fn processor_name(&self) -> &str;

    /// Partition the group: processes passing the same key form a new group,
    /// ordered by their rank in this group.
    fn split(&self, key: u32) -> Result<Self, CommError>
    where
        Self: Sized;

    /// Block until every member of the group has called `barrier`.
    fn barrier(&self) -> Result<(), CommError>;

    /// Every member contributes a payload; every member receives all of them
    /// indexed by rank.
    fn all_gather_bytes(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>, CommError>;

    /// Every member contributes a payload; only `root` receives them.
    fn gather_bytes(&self, payload: &[u8], root: usize)
        -> Result<Option<Vec<Vec<u8>>>, CommError>;

    /// Blocking tagged send to `dest`.
    fn send_bytes(&self, dest: usize, tag: u32, payload: &[u8]) -> Result<(), CommError>;

    /// Blocking tagged receive from `source`.
    fn recv_bytes(&self, source: usize, tag: u32) -> Result<Vec<u8>, CommError>;

    /// Elementwise reduction delivered to `root` only.
    fn reduce(
        &self,
        values: &[f64],
        op: ReduceOp,
        root: usize,
    ) -> Result<Option<Vec<f64>>, CommError> {
        let gathered = self.gather_bytes(&encode_f64s(values), root)?;
        match gathered {
            Some(parts) => Ok(Some(fold_parts(&parts, values.len(), op)?)),
            None => Ok(None),
        }
    }

    /// Elementwise reduction delivered to every member.
    fn all_reduce(&self, values: &[f64], op: ReduceOp) -> Result<Vec<f64>, CommError> {
        let parts = self.all_gather_bytes(&encode_f64s(values))?;
        fold_parts(&parts, values.len(), op)
    }

    /// Value-with-location selection (max or min) delivered to every member.
    fn all_reduce_loc(&self, value: f64, op: ReduceOp) -> Result<Located, CommError> {
        if op == ReduceOp::Sum {
            return Err(CommError::UnsupportedOp { op });
        }
        let parts = self.all_gather_bytes(&encode_f64s(&[value]))?;
        let mut values = Vec::with_capacity(parts.len());
        for (rank, part) in parts.iter().enumerate() {
            let decoded = decode_f64s(part, 1, rank)?;
            values.push(decoded[0]);
        }
        select_located(&values, op).ok_or(CommError::EmptyGroup)
    }
}

/// Picks the winning value and its rank, lowest rank first on ties.
pub fn select_located(values: &[f64], op: ReduceOp) -> Option<Located> {
    let (first, rest) = values.split_first()?;
    let mut best = Located {
        value: *first,
        rank: 0,
    };
    for (offset, &value) in rest.iter().enumerate() {
        if op.beats(value, best.value) {
            best = Located {
                value,
                rank: offset + 1,
            };
        }
    }
    Some(best)
}

/// Little-endian encoding used for numeric payloads.
pub fn encode_f64s(values: &[f64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 8);
    for value in values {
        buf.extend_from_slice(&value.to_le_bytes());
    }
    buf
}

/// Decodes a payload produced by [`encode_f64s`].
pub fn decode_f64s(payload: &[u8], expected: usize, rank: usize) -> Result<Vec<f64>, CommError> {
    if payload.len() != expected * 8 {
        return Err(CommError::Malformed {
            rank,
            expected: expected * 8,
            actual: payload.len(),
        });
    }
    Ok(payload
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            f64::from_le_bytes(raw)
        })
        .collect())
}

fn fold_parts(parts: &[Vec<u8>], len: usize, op: ReduceOp) -> Result<Vec<f64>, CommError> {
    let mut acc: Option<Vec<f64>> = None;
    for (rank, part) in parts.iter().enumerate() {
        let values = decode_f64s(part, len, rank)?;
        acc = Some(match acc {
            None => values,
            Some(mut current) => {
                for (slot, value) in current.iter_mut().zip(values) {
                    *slot = op.apply(*slot, value);
                }
                current
            }
        });
    }
    acc.ok_or(CommError::EmptyGroup)
}
