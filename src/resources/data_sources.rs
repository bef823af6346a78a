/// Read-only lookups: servers and vSwitches
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::robot::error::Result;
use crate::robot::models::{Server, VSwitch};
use crate::robot::RobotClient;

/// A named query in the manifest's `data` block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataSourceSpec {
    /// All servers, or only the listed ids
    Servers {
        #[serde(default)]
        ids: Vec<u64>,
    },
    /// All vSwitches, or only the listed ids
    Vswitches {
        #[serde(default)]
        ids: Vec<u64>,
    },
}

/// Servers sorted by number; an empty id list means every server
pub async fn query_servers(client: &RobotClient, ids: &[u64]) -> Result<Vec<Server>> {
    let mut servers = if ids.is_empty() {
        client.list_servers().await?
    } else {
        client.fetch_servers_by_ids(ids).await?
    };
    servers.sort_by_key(|s| s.number);
    debug!(count = servers.len(), "Fetched servers");
    Ok(servers)
}

/// vSwitches sorted by id; an empty id list means every vSwitch
pub async fn query_vswitches(client: &RobotClient, ids: &[u64]) -> Result<Vec<VSwitch>> {
    let mut vswitches = if ids.is_empty() {
        client.list_vswitches().await?
    } else {
        client.fetch_vswitches_by_ids(ids).await?
    };
    vswitches.sort_by_key(|v| v.id);
    debug!(count = vswitches.len(), "Fetched vSwitches");
    Ok(vswitches)
}

/// Run a query and return its result as JSON
pub async fn query(client: &RobotClient, spec: &DataSourceSpec) -> Result<serde_json::Value> {
    let value = match spec {
        DataSourceSpec::Servers { ids } => serde_json::to_value(query_servers(client, ids).await?)?,
        DataSourceSpec::Vswitches { ids } => {
            serde_json::to_value(query_vswitches(client, ids).await?)?
        }
    };
    Ok(value)
}
