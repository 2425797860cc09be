// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire types shared by the ownership registry and its clients

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Hardware class of a node, which dictates how the multiplexer connects
/// to its console.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    JsonSchema,
)]
pub enum NodeClass {
    /// Commodity rack hardware, IPMI serial-over-lan via the BMC
    River,
    /// Liquid-cooled rack hardware, ssh to the BMC with a deployed key
    Mountain,
    /// Freestanding variant of Mountain hardware, also key-based ssh
    Hill,
    /// Foxconn XD224 hardware, ssh to the BMC with a password
    Paradise,
}

/// How the multiplexer reaches a node's console.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionMethod {
    IpmiDirect,
    KeySsh,
    PasswordSsh,
}

impl NodeClass {
    pub fn connection_method(&self) -> ConnectionMethod {
        match self {
            NodeClass::River => ConnectionMethod::IpmiDirect,
            NodeClass::Mountain | NodeClass::Hill => ConnectionMethod::KeySsh,
            NodeClass::Paradise => ConnectionMethod::PasswordSsh,
        }
    }

    /// Mountain, Hill, and Paradise nodes all count against the mountain
    /// budget: their console connections run through helper scripts that
    /// are more expensive than a direct IPMI connection.
    pub fn counts_as_mountain(&self) -> bool {
        !matches!(self, NodeClass::River)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeClass::River => "River",
            NodeClass::Mountain => "Mountain",
            NodeClass::Hill => "Hill",
            NodeClass::Paradise => "Paradise",
        }
    }
}

impl fmt::Display for NodeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("unknown node class {0:?}")]
pub struct UnknownNodeClass(pub String);

impl FromStr for NodeClass {
    type Err = UnknownNodeClass;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "River" => Ok(NodeClass::River),
            "Mountain" => Ok(NodeClass::Mountain),
            "Hill" => Ok(NodeClass::Hill),
            "Paradise" => Ok(NodeClass::Paradise),
            other => Err(UnknownNodeClass(other.to_string())),
        }
    }
}

/// Everything needed to form a console connection to one node.
///
/// This is the basic unit of inventory: produced by the operator from
/// hardware discovery, stored by the registry, and handed to workers on
/// claim.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct NodeInfo {
    /// node hardware identifier (xname)
    #[serde(rename = "nodename")]
    pub node_name: String,
    /// BMC hardware identifier
    #[serde(rename = "bmcname")]
    pub bmc_name: String,
    /// resolvable name of the BMC
    #[serde(rename = "bmcfqdn")]
    pub bmc_fqdn: String,
    /// hardware class
    pub class: NodeClass,
    /// node id number
    pub nid: i32,
    /// role of the node (e.g. "Compute")
    pub role: String,
    /// id of the worker currently serving this node's console, empty if
    /// unassigned
    #[serde(rename = "nodeconsolename", default)]
    pub node_console_name: String,
}

/// Reasons a [`NodeInfo`] is rejected at the inventory boundary.
#[derive(Clone, Debug, thiserror::Error)]
pub enum InvalidNodeInfo {
    #[error("field {0:?} must not be empty")]
    EmptyField(&'static str),
    #[error("node {node:?}: nid must be positive, got {nid}")]
    BadNid { node: String, nid: i32 },
    #[error("node name {0:?} contains a quote character")]
    QuotedName(String),
}

impl NodeInfo {
    /// Validate a node record received from outside the service.
    ///
    /// Names containing quote characters are rejected outright rather than
    /// passed to the database layer.
    pub fn validate(&self) -> Result<(), InvalidNodeInfo> {
        for (field, value) in [
            ("nodename", &self.node_name),
            ("bmcname", &self.bmc_name),
            ("bmcfqdn", &self.bmc_fqdn),
            ("role", &self.role),
        ] {
            if value.is_empty() {
                return Err(InvalidNodeInfo::EmptyField(field));
            }
        }
        if self.nid < 1 {
            return Err(InvalidNodeInfo::BadNid {
                node: self.node_name.clone(),
                nid: self.nid,
            });
        }
        for name in [&self.node_name, &self.bmc_name] {
            if name.contains('\'') || name.contains('"') {
                return Err(InvalidNodeInfo::QuotedName(name.clone()));
            }
        }
        Ok(())
    }
}

/// Request body for a worker claim call.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct AcquireRequest {
    /// requested number of mountain-budget nodes
    pub nummtn: u32,
    /// requested number of river nodes
    pub numrvr: u32,
    /// xname of the node the worker runs on, if known
    #[serde(default)]
    pub xname: String,
    /// alias of the node the worker runs on, if known
    #[serde(default)]
    pub alias: String,
}

/// Request body for a worker heartbeat call.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct HeartbeatRequest {
    /// every node the worker believes it owns
    #[serde(rename = "CurrNodes")]
    pub curr_nodes: Vec<NodeInfo>,
    /// xname of the node the worker runs on (self-monitor detection)
    #[serde(rename = "PodLocation", default)]
    pub pod_location: String,
}

/// Count of workers that have recently claimed or heartbeated.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct ActiveWorkers {
    pub numactivepods: u64,
}

/// Generic `{message}` response body.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct Message {
    pub message: String,
}
