//! NUMA node registry.
//!
//! One global ticket-lock-guarded state owns every node, the pool of
//! memory-range objects and the physical-allocation metadata table. The
//! lock nests outside range-level state and inside per-CPU queue locks.
//! Nodes carry their neighbor list sorted ascending by distance, so
//! allocation fallback is a plain front-to-back walk.

use heapless::Vec as FixedVec;

use crate::boot::{NumaTopology, NUMA_UNREACHABLE};
use crate::collections::pool::PoolId;
use crate::collections::StaticPool;
use crate::config::{MAX_MEMORY_RANGES, MAX_NUMA_NODES, MAX_RANGES_PER_NODE};
use crate::error::{Error, Result};
use crate::mm::heap::HeapNodeState;
use crate::mm::phys::{PhysMetaTable, PhysSlub};
use crate::mm::{PhysAddr, PhysWindow};
use crate::sync::{SpinGuard, SpinLock};

pub type NumaId = u8;
pub type RangeId = PoolId;

/// One physical memory range `[base, base + length)`, owned by a node.
/// Created at boot, never destroyed.
pub struct MemoryRange {
    pub node: NumaId,
    pub hotpluggable: bool,
    pub slub: PhysSlub,
}

pub struct NumaNode {
    pub id: NumaId,
    /// Reachable nodes (self included) ascending by distance. Ties keep
    /// insertion order.
    pub neighbors: FixedVec<NumaId, MAX_NUMA_NODES>,
    pub permanent_ranges: FixedVec<RangeId, MAX_RANGES_PER_NODE>,
    pub hotplug_ranges: FixedVec<RangeId, MAX_RANGES_PER_NODE>,
    /// Per-node heap slub state, guarded by the registry lock.
    pub heap: HeapNodeState,
}

const NO_NODE: u8 = u8::MAX;

pub struct NumaState {
    nodes: FixedVec<NumaNode, MAX_NUMA_NODES>,
    /// Node id -> index into `nodes`.
    index: [u8; MAX_NUMA_NODES],
    pub ranges: StaticPool<MemoryRange, MAX_MEMORY_RANGES>,
    pub meta: Option<PhysMetaTable>,
    pub window: PhysWindow,
    pub boot_node: NumaId,
}

pub struct Numa {
    state: SpinLock<NumaState>,
}

impl Numa {
    pub const fn new() -> Self {
        Numa {
            state: SpinLock::new(NumaState {
                nodes: FixedVec::new(),
                index: [NO_NODE; MAX_NUMA_NODES],
                ranges: StaticPool::new(),
                meta: None,
                window: PhysWindow::new(0),
                boot_node: 0,
            }),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_, NumaState> {
        self.state.lock()
    }

    /// Register every domain from the topology and build the sorted
    /// neighbor lists. Called once at boot, before any range exists.
    pub fn init_nodes(&self, topo: &NumaTopology, window: PhysWindow) {
        let mut st = self.state.lock();
        assert!(st.nodes.is_empty(), "NUMA nodes registered twice");
        st.window = window;
        st.boot_node = topo.boot_domain;
        for &id in topo.domains.iter() {
            if st.index[id as usize] != NO_NODE {
                continue;
            }
            crate::info!("numa", "registering node {}", id);
            let idx = st.nodes.len() as u8;
            st.nodes
                .push(NumaNode {
                    id,
                    neighbors: FixedVec::new(),
                    permanent_ranges: FixedVec::new(),
                    hotplug_ranges: FixedVec::new(),
                    heap: HeapNodeState::new(),
                })
                .ok()
                .expect("NUMA node capacity exceeded");
            st.index[id as usize] = idx;
        }
        let ids: FixedVec<NumaId, MAX_NUMA_NODES> = st.nodes.iter().map(|n| n.id).collect();
        for node in st.nodes.iter_mut() {
            node.neighbors = sorted_neighbors(node.id, &ids, topo);
            crate::info!(
                "numa",
                "node {} neighbors (closest first): {:?}",
                node.id,
                &node.neighbors[..]
            );
        }
        crate::success!("numa", "{} node(s) online", st.nodes.len());
    }
}

impl Default for Numa {
    fn default() -> Self {
        Self::new()
    }
}

/// All reachable neighbors of `id`, self first, then ascending by distance.
/// Unreachable nodes (SLIT 0xff) are cut off.
fn sorted_neighbors(
    id: NumaId,
    all: &FixedVec<NumaId, MAX_NUMA_NODES>,
    topo: &NumaTopology,
) -> FixedVec<NumaId, MAX_NUMA_NODES> {
    let mut list: FixedVec<NumaId, MAX_NUMA_NODES> = FixedVec::new();
    let _ = list.push(id);
    for &other in all.iter() {
        if other != id {
            let _ = list.push(other);
        }
    }
    // Insertion sort: stable on equal distances, no allocator this early,
    // and the lists are tiny.
    let len = list.len();
    for i in 1..len {
        let mut j = i;
        while j > 0 && topo.distance(id, list[j - 1]) > topo.distance(id, list[j]) {
            list.swap(j - 1, j);
            j -= 1;
        }
    }
    // Cut at the first unreachable entry.
    let reachable = list
        .iter()
        .position(|&n| topo.distance(id, n) == NUMA_UNREACHABLE)
        .unwrap_or(len);
    list.truncate(reachable);
    list
}

impl NumaState {
    pub fn node(&self, id: NumaId) -> Option<&NumaNode> {
        let idx = self.index[id as usize];
        if idx == NO_NODE {
            return None;
        }
        self.nodes.get(idx as usize)
    }

    pub fn node_mut(&mut self, id: NumaId) -> Option<&mut NumaNode> {
        let idx = self.index[id as usize];
        if idx == NO_NODE {
            return None;
        }
        self.nodes.get_mut(idx as usize)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NumaNode> {
        self.nodes.iter()
    }

    pub fn first_node_id(&self) -> NumaId {
        self.nodes.first().map(|n| n.id).unwrap_or(0)
    }

    /// Attach a memory range to its owning node. The range's slub covers
    /// `[base, base + length)` through the registry's window.
    pub fn register_range(
        &mut self,
        node_id: NumaId,
        base: PhysAddr,
        length: usize,
        hotpluggable: bool,
    ) -> Result<RangeId> {
        let window = self.window;
        if self.node(node_id).is_none() {
            return Err(Error::InvalidHandle);
        }
        let range_id = self
            .ranges
            .alloc(MemoryRange {
                node: node_id,
                hotpluggable,
                slub: PhysSlub::new(base, length, window),
            })
            .ok_or(Error::OutOfMemory)?;
        let node = self.node_mut(node_id).expect("checked above");
        let list = if hotpluggable {
            &mut node.hotplug_ranges
        } else {
            &mut node.permanent_ranges
        };
        list.push(range_id).map_err(|_| Error::OutOfMemory)?;
        crate::info!(
            "numa",
            "node {}: range {:#x}..{:#x}{}",
            node_id,
            base,
            base + length,
            if hotpluggable { " (hotplug)" } else { "" }
        );
        Ok(range_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topo_three() -> NumaTopology {
        let mut t = NumaTopology::new(&[0, 1, 2], 0);
        for i in 0..3 {
            t.set_distance(i, i, 10);
        }
        t.set_distance(0, 1, 20);
        t.set_distance(1, 0, 20);
        t.set_distance(0, 2, 30);
        t.set_distance(2, 0, 30);
        t.set_distance(1, 2, 20);
        t.set_distance(2, 1, 20);
        t
    }

    #[test]
    fn neighbors_sorted_by_distance_self_first() {
        let numa = Box::new(Numa::new());
        numa.init_nodes(&topo_three(), PhysWindow::new(0));
        let st = numa.lock();
        let n0 = st.node(0).unwrap();
        assert_eq!(&n0.neighbors[..], &[0, 1, 2]);
        let n2 = st.node(2).unwrap();
        assert_eq!(&n2.neighbors[..], &[2, 1, 0]);
    }

    #[test]
    fn unreachable_nodes_are_cut() {
        let mut t = NumaTopology::new(&[0, 1], 0);
        t.set_distance(0, 0, 10);
        t.set_distance(1, 1, 10);
        // 1 is unreachable from 0; the reverse path exists.
        t.set_distance(1, 0, 20);
        let numa = Box::new(Numa::new());
        numa.init_nodes(&t, PhysWindow::new(0));
        let st = numa.lock();
        assert_eq!(&st.node(0).unwrap().neighbors[..], &[0]);
        assert_eq!(&st.node(1).unwrap().neighbors[..], &[1, 0]);
    }

    #[test]
    fn ranges_land_on_their_node_lists() {
        let numa = Box::new(Numa::new());
        numa.init_nodes(&topo_three(), PhysWindow::new(0));
        let mut st = numa.lock();
        let a = st.register_range(1, 0x100000, 0x100000, false).unwrap();
        let b = st.register_range(1, 0x300000, 0x100000, true).unwrap();
        let node = st.node(1).unwrap();
        assert_eq!(&node.permanent_ranges[..], &[a]);
        assert_eq!(&node.hotplug_ranges[..], &[b]);
        assert!(st.register_range(9, 0, 0x1000, false).is_err());
    }

    #[test]
    fn neighbor_tie_keeps_insertion_order() {
        let mut t = NumaTopology::new(&[0, 1, 2], 0);
        for i in 0..3 {
            t.set_distance(i, i, 10);
        }
        t.set_distance(0, 1, 20);
        t.set_distance(0, 2, 20);
        t.set_distance(1, 0, 20);
        t.set_distance(1, 2, 20);
        t.set_distance(2, 0, 20);
        t.set_distance(2, 1, 20);
        let numa = Box::new(Numa::new());
        numa.init_nodes(&t, PhysWindow::new(0));
        let st = numa.lock();
        assert_eq!(&st.node(0).unwrap().neighbors[..], &[0, 1, 2]);
    }
}
