//! In-process cluster with one thread per rank.
//!
//! Used for single-host runs, for simulating several hosts on one machine and
//! for tests. Collectives rendezvous on a per-group exchange; point-to-point
//! messages go through per-rank mailboxes. A rank that fails (error return or
//! panic) aborts the fabric so that peers blocked in a collective return
//! [`CommError::Aborted`] instead of waiting forever.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use super::{CommError, Communicator};

/// How often blocked ranks re-check the abort flag.
const ABORT_POLL: Duration = Duration::from_millis(50);

/// Placement of ranks onto (possibly simulated) hosts.
#[derive(Debug, Clone)]
pub struct LocalCluster {
    /// Host identifier of each rank, indexed by world rank.
    hosts: Vec<String>,
}

impl LocalCluster {
    /// Creates a cluster with an explicit host per rank.
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts }
    }

    /// Block placement: the first `ranks_per_host` ranks on the first host,
    /// the next block on the second host, and so on.
    pub fn block(host_names: &[String], ranks_per_host: usize) -> Self {
        let mut hosts = Vec::with_capacity(host_names.len() * ranks_per_host);
        for name in host_names {
            for _ in 0..ranks_per_host {
                hosts.push(name.clone());
            }
        }
        Self { hosts }
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.hosts.len()
    }

    /// Host identifier per world rank.
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Runs `f` once per rank, each on its own thread, and returns the
    /// per-rank results in world-rank order.
    ///
    /// The first failing rank's error is returned; errors that merely report
    /// the resulting abort are only returned when nothing better is known.
    pub fn run<T, F>(&self, f: F) -> Result<Vec<T>>
    where
        F: Fn(LocalComm) -> Result<T> + Sync,
        T: Send,
    {
        if self.hosts.is_empty() {
            bail!("local cluster needs at least one rank");
        }

        let fabric = Arc::new(Fabric::new(self.hosts.len()));
        let world = fabric.world_group();

        debug!(ranks = self.hosts.len(), "launching local cluster");

        let joined: Vec<Result<T>> = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.hosts.len());
            let mut spawn_error = None;

            for (rank, host) in self.hosts.iter().enumerate() {
                let comm = LocalComm {
                    fabric: Arc::clone(&fabric),
                    group: Arc::clone(&world),
                    rank,
                    world_rank: rank,
                    host: Arc::from(host.as_str()),
                    splits: Cell::new(0),
                };
                let fabric_ref: &Fabric = &fabric;
                let f = &f;

                let spawned = thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn_scoped(scope, move || {
                        let _guard = AbortOnPanic(fabric_ref);
                        let outcome = f(comm);
                        if outcome.is_err() {
                            fabric_ref.abort();
                        }
                        outcome
                    });

                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        fabric.abort();
                        spawn_error = Some(anyhow!("spawning rank {rank}: {e}"));
                        break;
                    }
                }
            }

            let mut results: Vec<Result<T>> = handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow!("rank {rank} panicked")))
                })
                .collect();

            if let Some(e) = spawn_error {
                results.push(Err(e));
            }
            results
        });

        let mut values = Vec::with_capacity(joined.len());
        let mut root_cause: Option<anyhow::Error> = None;
        let mut abort_report: Option<anyhow::Error> = None;

        for (rank, outcome) in joined.into_iter().enumerate() {
            match outcome {
                Ok(value) => values.push(value),
                Err(e) if is_abort(&e) => {
                    abort_report.get_or_insert(e);
                }
                Err(e) => {
                    error!(rank, error = %e, "rank failed");
                    root_cause.get_or_insert(e);
                }
            }
        }

        if let Some(e) = root_cause.or(abort_report) {
            return Err(e);
        }

        Ok(values)
    }
}

fn is_abort(e: &anyhow::Error) -> bool {
    e.chain()
        .any(|cause| matches!(cause.downcast_ref::<CommError>(), Some(CommError::Aborted)))
}

/// Marks the fabric aborted if the owning rank unwinds.
struct AbortOnPanic<'a>(&'a Fabric);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.abort();
        }
    }
}

/// Cluster-wide shared state.
struct Fabric {
    mailboxes: Vec<Mailbox>,
    groups: Mutex<HashMap<GroupKey, Arc<GroupState>>>,
    next_group_id: AtomicU64,
    aborted: AtomicBool,
}

impl Fabric {
    fn new(size: usize) -> Self {
        Self {
            mailboxes: (0..size).map(|_| Mailbox::default()).collect(),
            groups: Mutex::new(HashMap::new()),
            next_group_id: AtomicU64::new(1),
            aborted: AtomicBool::new(false),
        }
    }

    fn world_group(&self) -> Arc<GroupState> {
        Arc::new(GroupState::new(0, (0..self.mailboxes.len()).collect()))
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Returns the group created by a split, creating it on first arrival.
    fn group_for(&self, key: GroupKey, members: Vec<usize>) -> Result<Arc<GroupState>, CommError> {
        let mut groups = self.groups.lock();
        if let Some(existing) = groups.get(&key) {
            if existing.members != members {
                return Err(CommError::Split {
                    reason: format!(
                        "members disagree for key {}: {:?} vs {:?}",
                        key.key, existing.members, members
                    ),
                });
            }
            return Ok(Arc::clone(existing));
        }

        let id = self.next_group_id.fetch_add(1, Ordering::Relaxed);
        let group = Arc::new(GroupState::new(id, members));
        groups.insert(key, Arc::clone(&group));
        Ok(group)
    }
}

/// Identifies one outcome of one split call on one parent group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GroupKey {
    parent: u64,
    split_seq: u64,
    key: u32,
}

struct GroupState {
    id: u64,
    /// World ranks of the members, indexed by group rank.
    members: Vec<usize>,
    exchange: Exchange,
}

impl GroupState {
    fn new(id: u64, members: Vec<usize>) -> Self {
        let size = members.len();
        Self {
            id,
            members,
            exchange: Exchange::new(size),
        }
    }
}

/// Generation-counted rendezvous: every member deposits a payload, the last
/// arrival publishes the full round and wakes the others.
struct Exchange {
    state: Mutex<ExchangeState>,
    cond: Condvar,
}

struct ExchangeState {
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Vec<u8>>>,
    published: Arc<Vec<Vec<u8>>>,
}

impl Exchange {
    fn new(size: usize) -> Self {
        Self {
            state: Mutex::new(ExchangeState {
                generation: 0,
                arrived: 0,
                slots: vec![None; size],
                published: Arc::new(Vec::new()),
            }),
            cond: Condvar::new(),
        }
    }

    fn round(
        &self,
        rank: usize,
        payload: Vec<u8>,
        fabric: &Fabric,
    ) -> Result<Arc<Vec<Vec<u8>>>, CommError> {
        let mut state = self.state.lock();
        let generation = state.generation;
        let size = state.slots.len();

        match state.slots.get_mut(rank) {
            Some(slot) => *slot = Some(payload),
            None => return Err(CommError::InvalidRank { rank, size }),
        }
        state.arrived += 1;

        if state.arrived == size {
            let round: Vec<Vec<u8>> = state
                .slots
                .iter_mut()
                .map(|slot| slot.take().unwrap_or_default())
                .collect();
            state.published = Arc::new(round);
            state.arrived = 0;
            state.generation = generation.wrapping_add(1);
            self.cond.notify_all();
            return Ok(Arc::clone(&state.published));
        }

        // The next round cannot complete without this rank, so `published`
        // still holds this round when the generation moves on.
        while state.generation == generation {
            if fabric.is_aborted() {
                return Err(CommError::Aborted);
            }
            self.cond.wait_for(&mut state, ABORT_POLL);
        }

        Ok(Arc::clone(&state.published))
    }
}

struct Envelope {
    group: u64,
    source: usize,
    tag: u32,
    payload: Vec<u8>,
}

#[derive(Default)]
struct Mailbox {
    queue: Mutex<Vec<Envelope>>,
    cond: Condvar,
}

impl Mailbox {
    fn deliver(&self, envelope: Envelope) {
        self.queue.lock().push(envelope);
        self.cond.notify_all();
    }

    fn take(&self, group: u64, source: usize, tag: u32, fabric: &Fabric) -> Result<Vec<u8>, CommError> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(pos) = queue
                .iter()
                .position(|e| e.group == group && e.source == source && e.tag == tag)
            {
                return Ok(queue.remove(pos).payload);
            }
            if fabric.is_aborted() {
                return Err(CommError::Aborted);
            }
            self.cond.wait_for(&mut queue, ABORT_POLL);
        }
    }
}

/// One rank's handle on one group of a [`LocalCluster`].
pub struct LocalComm {
    fabric: Arc<Fabric>,
    group: Arc<GroupState>,
    rank: usize,
    world_rank: usize,
    host: Arc<str>,
    splits: Cell<u64>,
}

impl std::fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalComm")
            .field("group", &self.group.id)
            .field("rank", &self.rank)
            .field("size", &self.group.members.len())
            .field("host", &self.host)
            .finish()
    }
}

impl LocalComm {
    /// A single-rank world, for running without a cluster launcher.
    pub fn solo(host: &str) -> Self {
        let fabric = Arc::new(Fabric::new(1));
        let group = fabric.world_group();
        Self {
            fabric,
            group,
            rank: 0,
            world_rank: 0,
            host: Arc::from(host),
            splits: Cell::new(0),
        }
    }

    fn check_rank(&self, rank: usize) -> Result<usize, CommError> {
        self.group
            .members
            .get(rank)
            .copied()
            .ok_or(CommError::InvalidRank {
                rank,
                size: self.group.members.len(),
            })
    }

    fn round(&self, payload: Vec<u8>) -> Result<Arc<Vec<Vec<u8>>>, CommError> {
        self.group.exchange.round(self.rank, payload, &self.fabric)
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.group.members.len()
    }

    fn processor_name(&self) -> &str {
        &self.host
    }

    fn split(&self, key: u32) -> Result<Self, CommError> {
        let split_seq = self.splits.get();
        self.splits.set(split_seq + 1);

        let keys = self.round(key.to_le_bytes().to_vec())?;

        let mut members = Vec::new();
        let mut new_rank = None;
        for (rank, raw) in keys.iter().enumerate() {
            let bytes: [u8; 4] = raw.as_slice().try_into().map_err(|_| CommError::Malformed {
                rank,
                expected: 4,
                actual: raw.len(),
            })?;
            if u32::from_le_bytes(bytes) != key {
                continue;
            }
            if rank == self.rank {
                new_rank = Some(members.len());
            }
            members.push(self.check_rank(rank)?);
        }

        let rank = new_rank.ok_or_else(|| CommError::Split {
            reason: "caller missing from its own partition".to_string(),
        })?;

        let group = self.fabric.group_for(
            GroupKey {
                parent: self.group.id,
                split_seq,
                key,
            },
            members,
        )?;

        Ok(Self {
            fabric: Arc::clone(&self.fabric),
            group,
            rank,
            world_rank: self.world_rank,
            host: Arc::clone(&self.host),
            splits: Cell::new(0),
        })
    }

    fn barrier(&self) -> Result<(), CommError> {
        self.round(Vec::new()).map(|_| ())
    }

    fn all_gather_bytes(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>, CommError> {
        let round = self.round(payload.to_vec())?;
        Ok(round.as_ref().clone())
    }

    fn gather_bytes(
        &self,
        payload: &[u8],
        root: usize,
    ) -> Result<Option<Vec<Vec<u8>>>, CommError> {
        self.check_rank(root)?;
        let round = self.round(payload.to_vec())?;
        if self.rank == root {
            Ok(Some(round.as_ref().clone()))
        } else {
            Ok(None)
        }
    }

    fn send_bytes(&self, dest: usize, tag: u32, payload: &[u8]) -> Result<(), CommError> {
        let world = self.check_rank(dest)?;
        let mailbox = self.fabric.mailboxes.get(world).ok_or(CommError::InvalidRank {
            rank: world,
            size: self.fabric.mailboxes.len(),
        })?;
        mailbox.deliver(Envelope {
            group: self.group.id,
            source: self.rank,
            tag,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn recv_bytes(&self, source: usize, tag: u32) -> Result<Vec<u8>, CommError> {
        self.check_rank(source)?;
        let mailbox = self
            .fabric
            .mailboxes
            .get(self.world_rank)
            .ok_or(CommError::InvalidRank {
                rank: self.world_rank,
                size: self.fabric.mailboxes.len(),
            })?;
        mailbox.take(self.group.id, source, tag, &self.fabric)
    }
}
