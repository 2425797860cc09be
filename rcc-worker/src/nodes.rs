// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Local view of the nodes this worker owns
//!
//! Owned nodes live in three maps, one per connection method, because the
//! multiplexer configures each method differently and the mountain budget
//! spans two of them.  Everything here is pure bookkeeping; the callers
//! hold the worker-wide lock.

use rcc_common::api::ConnectionMethod;
use rcc_common::api::NodeInfo;
use rcc_common::targets::PartialTargets;
use std::collections::BTreeMap;

/// The three ownership maps plus the per-class targets read from the
/// shared targets file.  Targets are `None` until the file has been read
/// successfully; no claims or evictions happen before then.
#[derive(Debug, Default)]
pub struct NodeSets {
    /// River nodes, connected over IPMI
    pub river: BTreeMap<String, NodeInfo>,
    /// Mountain and Hill nodes, connected over key-based ssh
    pub key_ssh: BTreeMap<String, NodeInfo>,
    /// Paradise nodes, connected over password ssh
    pub password_ssh: BTreeMap<String, NodeInfo>,
    pub target_river: Option<u64>,
    pub target_mountain: Option<u64>,
}

impl NodeSets {
    pub fn new() -> NodeSets {
        NodeSets::default()
    }

    /// File a claimed node into the map its connection method dictates.
    pub fn insert(&mut self, node: NodeInfo) {
        let map = match node.class.connection_method() {
            ConnectionMethod::IpmiDirect => &mut self.river,
            ConnectionMethod::KeySsh => &mut self.key_ssh,
            ConnectionMethod::PasswordSsh => &mut self.password_ssh,
        };
        map.insert(node.node_name.clone(), node);
    }

    pub fn remove(&mut self, name: &str) -> Option<NodeInfo> {
        self.river
            .remove(name)
            .or_else(|| self.key_ssh.remove(name))
            .or_else(|| self.password_ssh.remove(name))
    }

    pub fn river_count(&self) -> usize {
        self.river.len()
    }

    /// Paradise nodes count toward the mountain budget.
    pub fn mountain_count(&self) -> usize {
        self.key_ssh.len() + self.password_ssh.len()
    }

    pub fn total(&self) -> usize {
        self.river.len() + self.key_ssh.len() + self.password_ssh.len()
    }

    pub fn all_nodes(&self) -> Vec<NodeInfo> {
        self.river
            .values()
            .chain(self.key_ssh.values())
            .chain(self.password_ssh.values())
            .cloned()
            .collect()
    }

    /// Update targets from a (possibly partial) read of the targets file,
    /// keeping previous values for anything missing.
    pub fn apply_targets(&mut self, targets: PartialTargets) {
        if let Some(river) = targets.river {
            self.target_river = Some(river);
        }
        if let Some(mountain) = targets.mountain {
            self.target_mountain = Some(mountain);
        }
    }

    /// How many more nodes of each budget this worker should ask for,
    /// clamped to the per-cycle acquisition caps.  (mountain, river)
    pub fn shortfall(
        &self,
        max_acquire_mountain: u64,
        max_acquire_river: u64,
    ) -> (u64, u64) {
        let want = |target: Option<u64>, current: usize, cap: u64| {
            target
                .map(|t| t.saturating_sub(current as u64).min(cap))
                .unwrap_or(0)
        };
        (
            want(self.target_mountain, self.mountain_count(), max_acquire_mountain),
            want(self.target_river, self.river_count(), max_acquire_river),
        )
    }

    /// Evict nodes until both budgets are back within target, returning
    /// the evicted records.  The mountain budget drains whichever of its
    /// two maps is larger, one node at a time.
    pub fn rebalance(&mut self) -> Vec<NodeInfo> {
        let mut evicted = Vec::new();

        if let Some(target) = self.target_river {
            while self.river.len() as u64 > target {
                let name = self.river.keys().next().cloned().unwrap();
                evicted.push(self.river.remove(&name).unwrap());
            }
        }

        if let Some(target) = self.target_mountain {
            while self.mountain_count() as u64 > target {
                let pool = if self.key_ssh.len() > self.password_ssh.len() {
                    &mut self.key_ssh
                } else {
                    &mut self.password_ssh
                };
                let Some(name) = pool.keys().next().cloned() else {
                    break;
                };
                evicted.push(pool.remove(&name).unwrap());
            }
        }

        evicted
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rcc_common::api::NodeClass;

    fn node(name: &str, class: NodeClass) -> NodeInfo {
        NodeInfo {
            node_name: name.to_string(),
            bmc_name: format!("{}b", name),
            bmc_fqdn: format!("{}b.local", name),
            class,
            nid: 1,
            role: "Compute".to_string(),
            node_console_name: String::new(),
        }
    }

    fn sets_with(counts: &[(NodeClass, usize)]) -> NodeSets {
        let mut sets = NodeSets::new();
        for (class, count) in counts {
            for i in 0..*count {
                sets.insert(node(&format!("x{}s{}", class, i), *class));
            }
        }
        sets
    }

    #[test]
    fn nodes_land_in_the_map_matching_their_method() {
        let sets = sets_with(&[
            (NodeClass::River, 2),
            (NodeClass::Mountain, 1),
            (NodeClass::Hill, 1),
            (NodeClass::Paradise, 3),
        ]);
        assert_eq!(sets.river.len(), 2);
        assert_eq!(sets.key_ssh.len(), 2);
        assert_eq!(sets.password_ssh.len(), 3);
        assert_eq!(sets.mountain_count(), 5);
        // every entry's class matches its map
        assert!(sets.river.values().all(|n| n.class == NodeClass::River));
        assert!(sets.key_ssh.values().all(|n| matches!(
            n.class,
            NodeClass::Mountain | NodeClass::Hill
        )));
        assert!(sets
            .password_ssh
            .values()
            .all(|n| n.class == NodeClass::Paradise));
    }

    #[test]
    fn shortfall_respects_targets_and_caps() {
        let mut sets = sets_with(&[(NodeClass::River, 3)]);
        // no targets read yet: ask for nothing
        assert_eq!(sets.shortfall(200, 500), (0, 0));

        sets.apply_targets(PartialTargets {
            river: Some(10),
            mountain: Some(4),
        });
        assert_eq!(sets.shortfall(200, 500), (4, 7));

        // per-cycle cap kicks in
        assert_eq!(sets.shortfall(2, 5), (2, 5));

        // over target asks for nothing rather than underflowing
        sets.apply_targets(PartialTargets {
            river: Some(1),
            mountain: None,
        });
        assert_eq!(sets.shortfall(200, 500).1, 0);
    }

    #[test]
    fn rebalance_evicts_down_to_target() {
        let mut sets = sets_with(&[(NodeClass::Mountain, 10)]);
        sets.apply_targets(PartialTargets {
            river: Some(0),
            mountain: Some(6),
        });
        let evicted = sets.rebalance();
        assert_eq!(evicted.len(), 4);
        assert_eq!(sets.mountain_count(), 6);
        // a second pass has nothing left to do
        assert!(sets.rebalance().is_empty());
    }

    #[test]
    fn mountain_eviction_drains_the_larger_pool() {
        let mut sets = sets_with(&[
            (NodeClass::Mountain, 6),
            (NodeClass::Paradise, 2),
        ]);
        sets.apply_targets(PartialTargets {
            river: Some(0),
            mountain: Some(4),
        });
        let evicted = sets.rebalance();
        assert_eq!(evicted.len(), 4);
        // key-ssh pool was larger throughout this eviction
        assert!(evicted.iter().all(|n| n.class == NodeClass::Mountain));
        assert_eq!(sets.key_ssh.len(), 2);
        assert_eq!(sets.password_ssh.len(), 2);
    }

    #[test]
    fn rebalance_without_targets_is_a_no_op() {
        let mut sets = sets_with(&[(NodeClass::River, 5)]);
        assert!(sets.rebalance().is_empty());
        assert_eq!(sets.river_count(), 5);
    }

    #[test]
    fn remove_searches_all_maps() {
        let mut sets = sets_with(&[
            (NodeClass::River, 1),
            (NodeClass::Paradise, 1),
        ]);
        let paradise_name = sets.password_ssh.keys().next().cloned().unwrap();
        assert!(sets.remove(&paradise_name).is_some());
        assert!(sets.remove(&paradise_name).is_none());
        assert_eq!(sets.total(), 1);
    }
}
