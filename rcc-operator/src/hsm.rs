// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hardware State Manager interface
//!
//! The HSM is the read-only source of truth for what hardware exists.
//! Three views are combined into console inventory: redfish endpoints
//! (BMC addresses), state components (node class/nid/role), and the
//! hardware inventory filtered to Foxconn nodes (Paradise detection).

use async_trait::async_trait;
use rcc_common::api::NodeClass;
use rcc_common::api::NodeInfo;
use serde::Deserialize;
use slog::Logger;
use slog::warn;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;

/// Models that identify a Paradise (XD224) node.  A limited number of
/// units shipped with the second, incorrect model string.
const PARADISE_MODELS: [&str; 2] =
    ["HPE Cray Supercomputing XD224", "1A62WCB00-600-G"];

#[derive(Debug, thiserror::Error)]
pub enum HsmError {
    #[error("request to HSM failed")]
    Request(#[from] reqwest::Error),
}

#[derive(Clone, Debug, Deserialize)]
pub struct RedfishEndpoint {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "FQDN", default)]
    pub fqdn: String,
    #[serde(rename = "User", default)]
    pub user: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StateComponent {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Type")]
    pub component_type: String,
    #[serde(rename = "Class", default)]
    pub class: String,
    #[serde(rename = "NID", default)]
    pub nid: i32,
    #[serde(rename = "Role", default)]
    pub role: String,
}

/// Read-only hardware discovery.
#[async_trait]
pub trait Hsm: Send + Sync {
    async fn redfish_endpoints(&self)
        -> Result<Vec<RedfishEndpoint>, HsmError>;
    async fn state_components(&self)
        -> Result<Vec<StateComponent>, HsmError>;
    /// Node ids whose FRU identifies them as Paradise hardware.
    async fn paradise_nodes(&self) -> Result<BTreeSet<String>, HsmError>;
}

pub struct HttpHsm {
    base_url: String,
    client: reqwest::Client,
}

impl HttpHsm {
    pub fn new(base_url: &str) -> HttpHsm {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build HTTP client");
        HttpHsm { base_url: base_url.trim_end_matches('/').to_string(), client }
    }
}

#[async_trait]
impl Hsm for HttpHsm {
    async fn redfish_endpoints(
        &self,
    ) -> Result<Vec<RedfishEndpoint>, HsmError> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(rename = "RedfishEndpoints", default)]
            redfish_endpoints: Vec<RedfishEndpoint>,
        }
        let url =
            format!("{}/hsm/v2/Inventory/RedfishEndpoints", self.base_url);
        let response: Response = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.redfish_endpoints)
    }

    async fn state_components(
        &self,
    ) -> Result<Vec<StateComponent>, HsmError> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(rename = "Components", default)]
            components: Vec<StateComponent>,
        }
        let url = format!("{}/hsm/v2/State/Components", self.base_url);
        let response: Response = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.components)
    }

    async fn paradise_nodes(&self) -> Result<BTreeSet<String>, HsmError> {
        #[derive(Deserialize)]
        struct FruInfo {
            #[serde(rename = "Model", default)]
            model: String,
        }
        #[derive(Deserialize)]
        struct PopulatedFru {
            #[serde(rename = "NodeFRUInfo", default)]
            node_fru_info: Option<FruInfo>,
        }
        #[derive(Deserialize)]
        struct InventoryItem {
            #[serde(rename = "ID")]
            id: String,
            #[serde(rename = "PopulatedFRU", default)]
            populated_fru: Option<PopulatedFru>,
        }
        // server-side filtering narrows this to Foxconn node FRUs
        let url = format!(
            "{}/hsm/v2/Inventory/Hardware?Manufacturer=Foxconn&Type=Node",
            self.base_url
        );
        let items: Vec<InventoryItem> = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(items
            .into_iter()
            .filter(|item| {
                item.populated_fru
                    .as_ref()
                    .and_then(|fru| fru.node_fru_info.as_ref())
                    .map(|info| {
                        PARADISE_MODELS.contains(&info.model.as_str())
                    })
                    .unwrap_or(false)
            })
            .map(|item| item.id)
            .collect())
    }
}

/// Combine the three HSM views into console inventory.
///
/// Every state component of type `Node` whose BMC (the id truncated at the
/// last `n`) has a redfish endpoint becomes a node record; ids in the
/// Paradise set have their class overridden.
pub fn assemble_nodes(
    log: &Logger,
    redfish: &[RedfishEndpoint],
    components: &[StateComponent],
    paradise: &BTreeSet<String>,
) -> Vec<NodeInfo> {
    let redfish_by_id: BTreeMap<&str, &RedfishEndpoint> =
        redfish.iter().map(|rf| (rf.id.as_str(), rf)).collect();

    let mut nodes = Vec::new();
    for component in components {
        if component.component_type != "Node" {
            continue;
        }
        let Some(last_n) = component.id.rfind('n') else {
            warn!(log, "node id has no BMC separator";
                "node" => &component.id);
            continue;
        };
        let bmc_name = &component.id[..last_n];
        let Some(endpoint) = redfish_by_id.get(bmc_name) else {
            warn!(log, "node with no BMC present";
                "node" => &component.id, "bmc" => bmc_name);
            continue;
        };
        let class = if paradise.contains(&component.id) {
            NodeClass::Paradise
        } else {
            match component.class.parse::<NodeClass>() {
                Ok(class) => class,
                Err(error) => {
                    warn!(log, "skipping node with unknown class";
                        "node" => &component.id, "error" => %error);
                    continue;
                }
            }
        };
        nodes.push(NodeInfo {
            node_name: component.id.clone(),
            bmc_name: bmc_name.to_string(),
            bmc_fqdn: endpoint.fqdn.clone(),
            class,
            nid: component.nid,
            role: component.role.clone(),
            node_console_name: String::new(),
        });
    }
    nodes
}

/// Fixed inventory used under `DEBUG=TRUE`.
pub struct FakeHsm {
    pub redfish: Vec<RedfishEndpoint>,
    pub components: Vec<StateComponent>,
    pub paradise: BTreeSet<String>,
}

#[async_trait]
impl Hsm for FakeHsm {
    async fn redfish_endpoints(
        &self,
    ) -> Result<Vec<RedfishEndpoint>, HsmError> {
        Ok(self.redfish.clone())
    }

    async fn state_components(
        &self,
    ) -> Result<Vec<StateComponent>, HsmError> {
        Ok(self.components.clone())
    }

    async fn paradise_nodes(&self) -> Result<BTreeSet<String>, HsmError> {
        Ok(self.paradise.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use slog::o;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn endpoint(id: &str) -> RedfishEndpoint {
        RedfishEndpoint {
            id: id.to_string(),
            fqdn: format!("{}.local", id),
            user: "root".to_string(),
        }
    }

    fn component(id: &str, class: &str) -> StateComponent {
        StateComponent {
            id: id.to_string(),
            component_type: "Node".to_string(),
            class: class.to_string(),
            nid: 42,
            role: "Compute".to_string(),
        }
    }

    #[test]
    fn bmc_name_is_id_up_to_last_n() {
        let redfish = vec![endpoint("x3000c0s1b0")];
        let components = vec![component("x3000c0s1b0n0", "River")];
        let nodes = assemble_nodes(
            &test_logger(),
            &redfish,
            &components,
            &BTreeSet::new(),
        );
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].bmc_name, "x3000c0s1b0");
        assert_eq!(nodes[0].bmc_fqdn, "x3000c0s1b0.local");
    }

    #[test]
    fn paradise_set_overrides_class() {
        let redfish = vec![endpoint("x9000c1s0b0")];
        let components = vec![component("x9000c1s0b0n0", "River")];
        let paradise: BTreeSet<String> =
            ["x9000c1s0b0n0".to_string()].into_iter().collect();
        let nodes =
            assemble_nodes(&test_logger(), &redfish, &components, &paradise);
        assert_eq!(nodes[0].class, NodeClass::Paradise);
    }

    #[test]
    fn nodes_without_endpoints_or_class_are_skipped() {
        let redfish = vec![endpoint("x3000c0s1b0")];
        let components = vec![
            component("x3000c0s1b0n0", "River"),
            // no matching redfish endpoint
            component("x3000c0s9b0n0", "River"),
            // class HSM doesn't normally produce
            component("x3000c0s1b0n1", "Submarine"),
            // not a node at all
            StateComponent {
                component_type: "NodeBMC".to_string(),
                ..component("x3000c0s1b0", "River")
            },
        ];
        let nodes = assemble_nodes(
            &test_logger(),
            &redfish,
            &components,
            &BTreeSet::new(),
        );
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_name, "x3000c0s1b0n0");
    }
}
