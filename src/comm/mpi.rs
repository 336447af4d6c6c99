//! MPI process groups via rsmpi.

use std::rc::Rc;

use mpi::collective::SystemOperation;
use mpi::datatype::PartitionMut;
use mpi::environment::Universe;
use mpi::topology::{Color, SimpleCommunicator};
use mpi::traits::*;
use mpi::Count;
use tracing::debug;

use super::{CommError, Communicator, ReduceOp};

/// Initializes MPI and returns the world group.
///
/// MPI is finalized when the last [`MpiComm`] derived from it is dropped.
pub fn init() -> Result<MpiComm, CommError> {
    let universe = mpi::initialize().ok_or_else(|| CommError::Mpi("MPI already initialized".into()))?;
    let host = mpi::environment::processor_name()
        .map_err(|e| CommError::Mpi(format!("processor name is not UTF-8: {e}")))?;
    let comm = universe.world();

    debug!(rank = comm.rank(), size = comm.size(), host = %host, "MPI initialized");

    Ok(MpiComm {
        comm,
        universe: Rc::new(universe),
        host,
    })
}

/// One process's handle on an MPI communicator.
///
/// Fields drop in declaration order: `comm` must be freed before the last
/// `universe` handle finalizes MPI.
pub struct MpiComm {
    comm: SimpleCommunicator,
    universe: Rc<Universe>,
    host: String,
}

impl MpiComm {
    fn to_mpi_rank(&self, rank: usize) -> Result<i32, CommError> {
        if rank >= self.size() {
            return Err(CommError::InvalidRank {
                rank,
                size: self.size(),
            });
        }
        i32::try_from(rank).map_err(|_| CommError::InvalidRank {
            rank,
            size: self.size(),
        })
    }

    fn payload_count(payload: &[u8]) -> Result<Count, CommError> {
        Count::try_from(payload.len())
            .map_err(|_| CommError::Mpi(format!("payload of {} bytes exceeds MPI count", payload.len())))
    }
}

fn system_op(op: ReduceOp) -> SystemOperation {
    match op {
        ReduceOp::Sum => SystemOperation::sum(),
        ReduceOp::Max => SystemOperation::max(),
        ReduceOp::Min => SystemOperation::min(),
    }
}

/// Splits a flat receive buffer back into per-rank payloads.
fn unpack(buf: &[u8], counts: &[Count]) -> Vec<Vec<u8>> {
    let mut parts = Vec::with_capacity(counts.len());
    let mut start = 0usize;
    for &count in counts {
        let end = start + count.max(0) as usize;
        parts.push(buf.get(start..end).map(<[u8]>::to_vec).unwrap_or_default());
        start = end;
    }
    parts
}

fn displacements(counts: &[Count]) -> Vec<Count> {
    counts
        .iter()
        .scan(0, |offset, &count| {
            let current = *offset;
            *offset += count;
            Some(current)
        })
        .collect()
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.comm.rank() as usize
    }

    fn size(&self) -> usize {
        self.comm.size() as usize
    }

    fn processor_name(&self) -> &str {
        &self.host
    }

    fn split(&self, key: u32) -> Result<Self, CommError> {
        let colour = i32::try_from(key).map_err(|_| CommError::Split {
            reason: format!("key {key} is not a valid MPI colour"),
        })?;
        let comm = self
            .comm
            .split_by_color(Color::with_value(colour))
            .ok_or_else(|| CommError::Split {
                reason: format!("MPI returned no communicator for colour {colour}"),
            })?;
        Ok(Self {
            comm,
            universe: Rc::clone(&self.universe),
            host: self.host.clone(),
        })
    }

    fn barrier(&self) -> Result<(), CommError> {
        self.comm.barrier();
        Ok(())
    }

    fn all_gather_bytes(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>, CommError> {
        let count = Self::payload_count(payload)?;
        let mut counts = vec![0 as Count; self.size()];
        self.comm.all_gather_into(&count, &mut counts[..]);

        let displs = displacements(&counts);
        let total: usize = counts.iter().map(|&c| c.max(0) as usize).sum();
        let mut buf = vec![0u8; total];
        {
            let mut partition = PartitionMut::new(&mut buf[..], &counts[..], &displs[..]);
            self.comm.all_gather_varcount_into(payload, &mut partition);
        }
        Ok(unpack(&buf, &counts))
    }

    fn gather_bytes(
        &self,
        payload: &[u8],
        root: usize,
    ) -> Result<Option<Vec<Vec<u8>>>, CommError> {
        let root_rank = self.to_mpi_rank(root)?;
        let root_process = self.comm.process_at_rank(root_rank);
        let count = Self::payload_count(payload)?;

        if self.rank() != root {
            root_process.gather_into(&count);
            root_process.gather_varcount_into(payload);
            return Ok(None);
        }

        let mut counts = vec![0 as Count; self.size()];
        root_process.gather_into_root(&count, &mut counts[..]);

        let displs = displacements(&counts);
        let total: usize = counts.iter().map(|&c| c.max(0) as usize).sum();
        let mut buf = vec![0u8; total];
        {
            let mut partition = PartitionMut::new(&mut buf[..], &counts[..], &displs[..]);
            root_process.gather_varcount_into_root(payload, &mut partition);
        }
        Ok(Some(unpack(&buf, &counts)))
    }

    fn send_bytes(&self, dest: usize, tag: u32, payload: &[u8]) -> Result<(), CommError> {
        let dest = self.to_mpi_rank(dest)?;
        self.comm
            .process_at_rank(dest)
            .send_with_tag(payload, tag as i32);
        Ok(())
    }

    fn recv_bytes(&self, source: usize, tag: u32) -> Result<Vec<u8>, CommError> {
        let source = self.to_mpi_rank(source)?;
        let (payload, _status) = self
            .comm
            .process_at_rank(source)
            .receive_vec_with_tag::<u8>(tag as i32);
        Ok(payload)
    }

    fn reduce(
        &self,
        values: &[f64],
        op: ReduceOp,
        root: usize,
    ) -> Result<Option<Vec<f64>>, CommError> {
        let root_process = self.comm.process_at_rank(self.to_mpi_rank(root)?);
        if self.rank() == root {
            let mut out = vec![0.0f64; values.len()];
            root_process.reduce_into_root(values, &mut out[..], system_op(op));
            Ok(Some(out))
        } else {
            root_process.reduce_into(values, system_op(op));
            Ok(None)
        }
    }

    fn all_reduce(&self, values: &[f64], op: ReduceOp) -> Result<Vec<f64>, CommError> {
        let mut out = vec![0.0f64; values.len()];
        self.comm.all_reduce_into(values, &mut out[..], system_op(op));
        Ok(out)
    }

    // rsmpi exposes no MAXLOC/MINLOC system operation, so `all_reduce_loc`
    // keeps the all-gather default and its lowest-rank tie rule.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_displacements_are_prefix_sums() {
        assert_eq!(displacements(&[3, 0, 2, 5]), vec![0, 3, 3, 5]);
    }

    #[test]
    fn test_unpack_splits_by_counts() {
        let parts = unpack(&[1, 2, 3, 4, 5], &[2, 0, 3]);
        assert_eq!(parts, vec![vec![1, 2], Vec::new(), vec![3, 4, 5]]);
    }
}
