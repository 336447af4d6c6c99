//! Process topology: world, per-host node groups and the node-leader group.

use std::fs;

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::comm::Communicator;

/// Host identifiers longer than this are truncated.
pub const MAX_HOST_NAME_BYTES: usize = 255;

/// Base of the rolling hash over host identifier bytes.
const HASH_BASE: i32 = 131;

/// The three groups every rank participates in.
///
/// `root` is only meaningful on node leaders. Other ranks hold a sibling
/// group formed from their node rank that is never used for aggregation.
#[derive(Debug)]
pub struct Topology<C> {
    pub world: C,
    pub node: C,
    pub root: C,
}

impl<C: Communicator> Topology<C> {
    /// Node-group rank 0.
    pub fn is_node_leader(&self) -> bool {
        self.node.rank() == 0
    }

    /// World rank 0, the collector of every result.
    pub fn is_global_root(&self) -> bool {
        self.world.rank() == 0
    }

    /// Number of nodes, as seen by a node leader.
    pub fn node_count(&self) -> Option<usize> {
        self.is_node_leader().then(|| self.root.size())
    }
}

/// Maps a host identifier to a non-negative grouping key.
///
/// Polynomial rolling hash over the identifier bytes. Arithmetic overflow is
/// detected and resolved by negating the accumulator and finishing that step
/// with wrapping arithmetic, so the result is the same on every platform.
pub fn derive_group_key(host: &str) -> u32 {
    let mut acc: i32 = 0;
    for &byte in host.as_bytes() {
        let byte = i32::from(byte);
        acc = match acc
            .checked_mul(HASH_BASE)
            .and_then(|v| v.checked_add(byte))
        {
            Some(next) => next,
            None => acc
                .wrapping_neg()
                .wrapping_mul(HASH_BASE)
                .wrapping_add(byte),
        };
    }
    acc.saturating_abs() as u32
}

/// Partitions `world` into node groups by host and node leaders into the
/// root group.
pub fn build_topology<C: Communicator>(world: C) -> Result<Topology<C>> {
    let host = world.processor_name().to_string();
    let key = derive_group_key(&host);

    let node = world
        .split(key)
        .with_context(|| format!("building node group for host {host}"))?;

    let node_rank = u32::try_from(node.rank()).context("node rank exceeds key range")?;
    let root = world.split(node_rank).context("building root group")?;

    debug!(
        world_rank = world.rank(),
        world_size = world.size(),
        node_rank = node.rank(),
        node_size = node.size(),
        root_rank = root.rank(),
        root_size = root.size(),
        key,
        host = %host,
        "topology built",
    );

    let topology = Topology { world, node, root };

    if topology.is_global_root() {
        if !topology.is_node_leader() {
            bail!("world rank 0 is not its node's leader");
        }
        if topology.root.rank() != 0 {
            bail!(
                "world rank 0 holds root rank {} instead of 0",
                topology.root.rank()
            );
        }
    }

    Ok(topology)
}

/// Host identifier of this machine.
pub fn local_host_name() -> String {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "localhost".to_string())
}

/// Truncates a host identifier to [`MAX_HOST_NAME_BYTES`] on a char boundary.
pub fn bounded_host_name(name: &str) -> &str {
    if name.len() <= MAX_HOST_NAME_BYTES {
        return name;
    }
    let mut end = MAX_HOST_NAME_BYTES;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::local::LocalCluster;

    #[test]
    fn test_group_key_is_pure() {
        assert_eq!(derive_group_key("node-017"), derive_group_key("node-017"));
    }

    #[test]
    fn test_group_key_small_input() {
        // 'a' = 97, 'b' = 98: 97 * 131 + 98.
        assert_eq!(derive_group_key("ab"), 12_805);
        assert_eq!(derive_group_key(""), 0);
    }

    #[test]
    fn test_group_key_sequential_suffixes_differ() {
        let keys: Vec<u32> = (0..64)
            .map(|i| derive_group_key(&format!("compute-node-{i:03}")))
            .collect();
        let mut unique = keys.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), keys.len());
    }

    #[test]
    fn test_group_key_long_names_stay_in_range() {
        for name in [
            "a-very-long-host-name.rack-42.datacenter-west.example.org",
            "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz",
            "\u{00ff}\u{00fe}\u{00fd}\u{00fc}\u{00fb}\u{00fa}",
        ] {
            let key = derive_group_key(name);
            assert!(key <= i32::MAX as u32, "{name} -> {key}");
            assert_eq!(key, derive_group_key(name));
        }
    }

    #[test]
    fn test_bounded_host_name_respects_char_boundary() {
        let short = "host-a";
        assert_eq!(bounded_host_name(short), short);

        let long = "é".repeat(200); // 400 bytes
        let bounded = bounded_host_name(&long);
        assert!(bounded.len() <= MAX_HOST_NAME_BYTES);
        assert_eq!(bounded.len(), 254);
    }

    #[test]
    fn test_local_host_name_is_not_empty() {
        assert!(!local_host_name().is_empty());
    }

    #[test]
    fn test_build_topology_groups_by_host() {
        let hosts: Vec<String> = ["a", "a", "b", "b", "b"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        let cluster = LocalCluster::new(hosts);

        let out = cluster
            .run(|world| {
                let topo = build_topology(world)?;
                Ok((
                    topo.node.rank(),
                    topo.node.size(),
                    topo.root.rank(),
                    topo.root.size(),
                    topo.is_node_leader(),
                    topo.node_count(),
                ))
            })
            .expect("cluster run");

        assert_eq!(out[0], (0, 2, 0, 2, true, Some(2)));
        assert_eq!(out[1], (1, 2, 0, 2, false, None));
        assert_eq!(out[2], (0, 3, 1, 2, true, Some(2)));
        assert_eq!(out[3], (1, 3, 1, 2, false, None));
        // Node rank 2 exists only on host b.
        assert_eq!(out[4], (2, 3, 0, 1, false, None));
    }
}
