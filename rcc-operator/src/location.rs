// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Location service interface: xname to alias mapping
//!
//! The orchestrator reports worker placement as a node alias; the
//! self-monitor policy needs the xname.  The location service holds the
//! mapping.

use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LocationError {
    #[error("request to location service failed")]
    Request(#[from] reqwest::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XnameAlias {
    pub xname: String,
    pub alias: String,
}

#[async_trait]
pub trait LocationSource: Send + Sync {
    async fn xname_aliases(&self) -> Result<Vec<XnameAlias>, LocationError>;
}

pub struct HttpLocationSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpLocationSource {
    pub fn new(base_url: &str) -> HttpLocationSource {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build HTTP client");
        HttpLocationSource {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl LocationSource for HttpLocationSource {
    async fn xname_aliases(&self) -> Result<Vec<XnameAlias>, LocationError> {
        let url = format!("{}/v1/hardware", self.base_url);
        let entries: Vec<serde_json::Value> = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(parse_hardware_entries(&entries))
    }
}

// The hardware dump is deeply nested; only Xname and the first alias
// matter here.
fn parse_hardware_entries(entries: &[serde_json::Value]) -> Vec<XnameAlias> {
    let mut mappings = Vec::new();
    for entry in entries {
        let Some(xname) = entry.get("Xname").and_then(|x| x.as_str()) else {
            continue;
        };
        let Some(alias) = entry
            .get("ExtraProperties")
            .and_then(|ep| ep.get("Aliases"))
            .and_then(|aliases| aliases.as_array())
            .and_then(|aliases| aliases.first())
            .and_then(|alias| alias.as_str())
        else {
            continue;
        };
        if xname.is_empty() || alias.is_empty() {
            continue;
        }
        mappings.push(XnameAlias {
            xname: xname.to_string(),
            alias: alias.to_string(),
        });
    }
    mappings
}

/// Fixed mapping for `DEBUG=TRUE` and tests.
pub struct FakeLocationSource(pub Vec<XnameAlias>);

#[async_trait]
impl LocationSource for FakeLocationSource {
    async fn xname_aliases(&self) -> Result<Vec<XnameAlias>, LocationError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_aliases_out_of_hardware_dump() {
        let entries = vec![
            json!({
                "Xname": "x3000c0s17b1n0",
                "Type": "comptype_node",
                "ExtraProperties": {"Aliases": ["nid000001", "extra"]},
            }),
            // no aliases
            json!({"Xname": "x3000c0s18b0n0", "ExtraProperties": {}}),
            // not a node record at all
            json!({"Parent": "x3000"}),
        ];
        let mappings = parse_hardware_entries(&entries);
        assert_eq!(
            mappings,
            vec![XnameAlias {
                xname: "x3000c0s17b1n0".to_string(),
                alias: "nid000001".to_string(),
            }]
        );
    }
}
