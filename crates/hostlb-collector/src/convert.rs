//! Provider records to snapshot model.
//!
//! Applies the cluster filters from [`BalancerConfig`] (offline and ignored
//! nodes, stopped guests, kind and name exclusions, maintenance overrides,
//! capacity reservations) and checks referential integrity before the
//! [`ClusterState`] is built.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use hostlb_core::{
    BalancerConfig, ClusterState, Group, GroupKind, GroupRecord, Guest, GuestRecord, Node,
    NodeCapacity, NodeRecord, Resource, StateError,
};

use crate::error::CollectionResult;

/// Counts reported after each collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionSummary {
    pub nodes: usize,
    pub maintenance_nodes: Vec<String>,
    pub skipped_nodes: usize,
    pub guests: usize,
    pub pinned_guests: usize,
    pub ignored_guests: usize,
    pub stopped_guests: usize,
    pub groups: usize,
}

/// Build a validated snapshot from raw provider records.
pub fn build_state(
    nodes: Vec<NodeRecord>,
    guests: Vec<GuestRecord>,
    groups: Vec<GroupRecord>,
    config: &BalancerConfig,
    timestamp: u64,
) -> CollectionResult<(ClusterState, CollectionSummary)> {
    let mut summary = CollectionSummary::default();
    let known_nodes: BTreeSet<String> = nodes.iter().map(|n| n.id.clone()).collect();
    let known_guests: BTreeSet<String> = guests.iter().map(|g| g.id.clone()).collect();

    let mut kept_nodes: BTreeMap<String, Node> = BTreeMap::new();
    for record in nodes {
        if !record.online {
            debug!(node = %record.id, "skipping offline node");
            summary.skipped_nodes += 1;
            continue;
        }
        if config.cluster.ignore_nodes.contains(&record.id) {
            debug!(node = %record.id, "skipping ignored node");
            summary.skipped_nodes += 1;
            continue;
        }
        let node = to_node(record, config);
        if node.maintenance {
            summary.maintenance_nodes.push(node.id.clone());
        }
        kept_nodes.insert(node.id.clone(), node);
    }

    let mut kept_guests: Vec<Guest> = Vec::new();
    for record in guests {
        if !known_nodes.contains(&record.node) {
            return Err(StateError::UnknownNode {
                guest: record.id,
                node: record.node,
            }
            .into());
        }
        if !kept_nodes.contains_key(&record.node) {
            continue;
        }
        if !record.running {
            summary.stopped_guests += 1;
            continue;
        }
        let guest = to_guest(record, config);
        if guest.ignore {
            summary.ignored_guests += 1;
        } else if guest.pinned {
            summary.pinned_guests += 1;
        }
        kept_guests.push(guest);
    }

    // Assigned consumption is derived from the guests each node hosts.
    for guest in kept_guests.iter().filter(|g| !g.ignore) {
        if let Some(node) = kept_nodes.get_mut(&guest.node) {
            for resource in Resource::ALL {
                node.capacity.get_mut(resource).assigned += guest.allocation.get(resource);
            }
        }
    }

    let kept_guest_ids: BTreeSet<&str> = kept_guests.iter().map(|g| g.id.as_str()).collect();
    let mut model_groups = Vec::with_capacity(groups.len());
    for record in groups {
        model_groups.push(to_group(
            record,
            &known_nodes,
            &known_guests,
            &kept_nodes,
            &kept_guest_ids,
        )?);
    }

    summary.nodes = kept_nodes.len();
    summary.guests = kept_guests.len();
    summary.groups = model_groups.len();

    let state = ClusterState::new(
        kept_nodes.into_values().collect(),
        kept_guests,
        model_groups,
        timestamp,
    )?;
    Ok((state, summary))
}

fn to_node(record: NodeRecord, config: &BalancerConfig) -> Node {
    let mut capacity = NodeCapacity {
        memory: record.memory,
        cpu: record.cpu,
        storage: record.storage,
    };
    // Assigned is recomputed from hosted guests.
    for resource in Resource::ALL {
        capacity.get_mut(resource).assigned = 0.0;
    }

    let reserve = config.balancing.node_reserve.for_node(&record.id);
    for resource in Resource::ALL {
        let amount = reserve.get(resource);
        if amount <= 0.0 {
            continue;
        }
        let metric = capacity.get_mut(resource);
        if amount >= metric.total {
            warn!(
                node = %record.id,
                resource = %resource,
                reserve = amount,
                total = metric.total,
                "reservation exceeds node capacity; not applied"
            );
            continue;
        }
        metric.total -= amount;
    }

    let maintenance = record.maintenance || config.cluster.maintenance_nodes.contains(&record.id);
    Node {
        id: record.id,
        capacity,
        maintenance,
        groups: BTreeSet::new(),
        guests: BTreeSet::new(),
        pressure: record.pressure,
    }
}

fn to_guest(record: GuestRecord, config: &BalancerConfig) -> Guest {
    let name = if record.name.is_empty() {
        record.id.clone()
    } else {
        record.name
    };
    let pinned = record.pinned
        || !config.balancing.balances_kind(record.kind)
        || config.cluster.ignores_guest(&name);
    Guest {
        id: record.id,
        name,
        kind: record.kind,
        usage: record.usage,
        allocation: record.allocation,
        node: record.node,
        pinned,
        ignore: record.ignore,
        migratable: record.migratable,
        groups: BTreeSet::new(),
        pressure: record.pressure,
    }
}

/// Members unknown to the provider are structural errors; members that
/// were filtered out of this snapshot (stopped guests, ignored nodes) are
/// dropped from the group.
fn to_group(
    record: GroupRecord,
    known_nodes: &BTreeSet<String>,
    known_guests: &BTreeSet<String>,
    kept_nodes: &BTreeMap<String, Node>,
    kept_guests: &BTreeSet<&str>,
) -> CollectionResult<Group> {
    let (guest_members, node_members) = match record.kind {
        GroupKind::NodeRestriction => (record.guests, record.members),
        GroupKind::Affinity | GroupKind::AntiAffinity => (record.members, Vec::new()),
    };

    let mut guests = BTreeSet::new();
    for member in guest_members {
        if !known_guests.contains(&member) {
            return Err(StateError::UnknownGroupMember {
                group: record.id,
                member,
            }
            .into());
        }
        if kept_guests.contains(member.as_str()) {
            guests.insert(member);
        }
    }

    let mut nodes = BTreeSet::new();
    for member in node_members {
        if !known_nodes.contains(&member) {
            return Err(StateError::UnknownGroupMember {
                group: record.id,
                member,
            }
            .into());
        }
        if kept_nodes.contains_key(&member) {
            nodes.insert(member);
        }
    }

    Ok(Group {
        id: record.id,
        kind: record.kind,
        strictness: record.strictness,
        guests,
        nodes,
    })
}
