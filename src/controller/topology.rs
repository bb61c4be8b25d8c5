//! Desired per-rack node and seed counts

use crate::crd::CassandraDatacenter;

/// Desired shape of one rack for the current pass. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RackInformation {
    pub rack_name: String,
    pub node_count: i32,
    pub seed_count: i32,
}

/// Spread `node_count` over `rack_count` racks as evenly as possible.
///
/// Racks at index `< node_count % rack_count` get one extra node, so the
/// result is stable across passes for the same inputs.
pub fn split(node_count: i32, rack_count: usize) -> Vec<i32> {
    assert!(rack_count >= 1, "split needs at least one rack");
    let racks = rack_count as i32;
    let per_rack = node_count / racks;
    let extra = node_count % racks;

    (0..racks)
        .map(|i| if i < extra { per_rack + 1 } else { per_rack })
        .collect()
}

/// Number of seeds for the whole datacenter
pub fn seed_count(size: i32, rack_count: usize) -> i32 {
    if size < 3 {
        size
    } else if rack_count > 3 {
        rack_count as i32
    } else {
        3
    }
}

/// Desired rack layout for a datacenter. A stopped datacenter wants zero
/// nodes everywhere.
pub fn calculate_rack_information(dc: &CassandraDatacenter) -> Vec<RackInformation> {
    let racks = dc.racks();
    let node_count = if dc.spec.stopped { 0 } else { dc.spec.size.max(0) };

    let nodes = split(node_count, racks.len());
    let seeds = split(seed_count(node_count, racks.len()), racks.len());

    racks
        .into_iter()
        .zip(nodes.into_iter().zip(seeds))
        .map(|(rack, (node_count, seed_count))| RackInformation {
            rack_name: rack.name,
            node_count,
            seed_count,
        })
        .collect()
}
