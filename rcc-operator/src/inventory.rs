// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Inventory reconciliation
//!
//! Periodically reads the HSM, diffs the result against the last
//! successfully synced view, and pushes the difference into the ownership
//! registry.  Every pass also recomputes the fleet scale and queues newly
//! discovered Key-SSH nodes for public-key deployment.

use futures::FutureExt;
use futures::future::BoxFuture;
use rcc_common::api::ConnectionMethod;
use rcc_common::api::NodeInfo;
use rcc_common::background::BackgroundTask;
use slog::Logger;
use slog::info;
use slog::warn;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::autoscaler::Autoscaler;
use crate::context::OperatorStatus;
use crate::hsm::Hsm;
use crate::hsm::assemble_nodes;

/// Every this-many cycles the full inventory is pushed, not just the
/// delta, to heal any drift in the registry.
const FORCE_SYNC_EVERY: u32 = 10;

pub struct Reconciler {
    hsm: Arc<dyn Hsm>,
    data: rcc_data_client::Client,
    autoscaler: Autoscaler,
    key_deploy: mpsc::Sender<NodeInfo>,
    status: Arc<Mutex<OperatorStatus>>,
    /// the last HSM view successfully synced to the registry
    cache: BTreeMap<String, NodeInfo>,
    /// counts down to the next full sync; zero means "this cycle"
    force_countdown: u32,
}

impl Reconciler {
    pub fn new(
        hsm: Arc<dyn Hsm>,
        data: rcc_data_client::Client,
        autoscaler: Autoscaler,
        key_deploy: mpsc::Sender<NodeInfo>,
        status: Arc<Mutex<OperatorStatus>>,
    ) -> Reconciler {
        Reconciler {
            hsm,
            data,
            autoscaler,
            key_deploy,
            status,
            cache: BTreeMap::new(),
            force_countdown: 0,
        }
    }

    async fn fetch_nodes(
        &self,
        log: &Logger,
    ) -> Option<Vec<NodeInfo>> {
        let redfish = match self.hsm.redfish_endpoints().await {
            Ok(redfish) => redfish,
            Err(error) => {
                warn!(log, "could not fetch redfish endpoints";
                    "error" => %error);
                return None;
            }
        };
        let components = match self.hsm.state_components().await {
            Ok(components) => components,
            Err(error) => {
                warn!(log, "could not fetch state components";
                    "error" => %error);
                return None;
            }
        };
        // Paradise detection failing is non-fatal: most systems have none
        let paradise = match self.hsm.paradise_nodes().await {
            Ok(paradise) => paradise,
            Err(error) => {
                warn!(log, "could not identify Paradise nodes";
                    "error" => %error);
                Default::default()
            }
        };
        Some(assemble_nodes(log, &redfish, &components, &paradise))
    }

    async fn run_once(&mut self, log: &Logger) {
        self.status.lock().unwrap().hardware_update_time =
            Some(chrono::Utc::now());

        // an HSM failure skips the cycle entirely: no cache mutation
        let Some(current) = self.fetch_nodes(log).await else {
            return;
        };
        let current_map: BTreeMap<String, NodeInfo> = current
            .iter()
            .map(|n| (n.node_name.clone(), n.clone()))
            .collect();

        let added: Vec<NodeInfo> = current
            .iter()
            .filter(|n| !self.cache.contains_key(&n.node_name))
            .cloned()
            .collect();
        let removed: Vec<NodeInfo> = self
            .cache
            .values()
            .filter(|n| !current_map.contains_key(&n.node_name))
            .cloned()
            .collect();

        let full_sync = self.force_countdown == 0;
        let to_send: Vec<NodeInfo> = {
            let candidates =
                if full_sync { current.iter() } else { added.iter() };
            // rows the registry's own schema would reject (e.g. a
            // non-compute node with no nid) are dropped here with a log
            candidates
                .filter(|n| match n.validate() {
                    Ok(()) => true,
                    Err(error) => {
                        warn!(log, "skipping unstorable node";
                            "node" => &n.node_name, "error" => %error);
                        false
                    }
                })
                .cloned()
                .collect()
        };

        let mut sync_ok = true;
        if to_send.is_empty() {
            info!(log, "no new nodes to add");
        } else {
            match self.data.upsert_inventory(&to_send).await {
                Ok(created) => {
                    info!(log, "inventory synced";
                        "offered" => to_send.len(),
                        "created" => created,
                        "full_sync" => full_sync);
                }
                Err(error) => {
                    warn!(log, "inventory sync failed"; "error" => %error);
                    sync_ok = false;
                }
            }
        }

        if !removed.is_empty() {
            match self.data.delete_inventory(&removed).await {
                Ok(deleted) => {
                    info!(log, "removed departed nodes";
                        "offered" => removed.len(), "deleted" => deleted);
                }
                Err(error) => {
                    warn!(log, "inventory delete failed";
                        "error" => %error);
                }
            }
        }

        if sync_ok {
            self.cache = current_map;
            self.status.lock().unwrap().console_count =
                Some(self.cache.len());
        }

        // recompute scale every pass; replica counts can change under us
        let num_mountain = self
            .cache
            .values()
            .filter(|n| n.class.counts_as_mountain())
            .count() as u64;
        let num_river = self.cache.len() as u64 - num_mountain;
        self.autoscaler.update(log, num_mountain, num_river).await;

        // deploy keys only for genuinely new nodes, never the full-sync
        // batch
        if sync_ok {
            for node in added {
                if node.class.connection_method() == ConnectionMethod::KeySsh
                {
                    if let Err(error) = self.key_deploy.try_send(node) {
                        warn!(log, "key deployment queue full";
                            "error" => %error);
                        break;
                    }
                }
            }
        }

        // a failed sync forces the next cycle to push everything
        self.force_countdown = if !sync_ok {
            0
        } else if full_sync {
            FORCE_SYNC_EVERY
        } else {
            self.force_countdown - 1
        };
    }
}

impl BackgroundTask for Reconciler {
    fn activate<'a>(&'a mut self, log: &'a Logger) -> BoxFuture<'a, ()> {
        self.run_once(log).boxed()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::autoscaler::compute_scale;
    use rcc_common::api::NodeClass;

    // The reconciler's interesting logic is the diff; exercised here as
    // plain data manipulation mirroring run_once.
    fn diff(
        cache: &BTreeMap<String, NodeInfo>,
        current: &[NodeInfo],
    ) -> (Vec<String>, Vec<String>) {
        let current_map: BTreeMap<&str, &NodeInfo> =
            current.iter().map(|n| (n.node_name.as_str(), n)).collect();
        let added = current
            .iter()
            .filter(|n| !cache.contains_key(&n.node_name))
            .map(|n| n.node_name.clone())
            .collect();
        let removed = cache
            .values()
            .filter(|n| !current_map.contains_key(n.node_name.as_str()))
            .map(|n| n.node_name.clone())
            .collect();
        (added, removed)
    }

    fn node(name: &str, class: NodeClass) -> NodeInfo {
        NodeInfo {
            node_name: name.to_string(),
            bmc_name: "b".to_string(),
            bmc_fqdn: "b.local".to_string(),
            class,
            nid: 1,
            role: "Compute".to_string(),
            node_console_name: String::new(),
        }
    }

    #[test]
    fn diff_finds_added_and_removed() {
        let mut cache = BTreeMap::new();
        for name in ["a", "b", "c"] {
            cache.insert(name.to_string(), node(name, NodeClass::River));
        }
        let current = vec![
            node("b", NodeClass::River),
            node("c", NodeClass::River),
            node("d", NodeClass::River),
        ];
        let (added, removed) = diff(&cache, &current);
        assert_eq!(added, vec!["d"]);
        assert_eq!(removed, vec!["a"]);
    }

    #[test]
    fn class_counts_feed_the_autoscaler() {
        let nodes = vec![
            node("a", NodeClass::River),
            node("b", NodeClass::Mountain),
            node("c", NodeClass::Hill),
            node("d", NodeClass::Paradise),
        ];
        let mountain =
            nodes.iter().filter(|n| n.class.counts_as_mountain()).count()
                as u64;
        let river = nodes.len() as u64 - mountain;
        assert_eq!(mountain, 3);
        assert_eq!(river, 1);
        let (replicas, _) = compute_scale(mountain, river, 750, 2000, 0);
        assert_eq!(replicas, 2);
    }
}
