/// Bulk server naming
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::{Diagnostic, Diagnostics, Outcome, Resource};
use crate::robot::error::{Result, RobotError};
use crate::robot::server::FETCH_CONCURRENCY;
use crate::robot::{RobotClient, ServerTarget};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerBulkSpec {
    pub servers: Vec<ServerTarget>,
}

/// Server ids must be unique and names non-empty
pub(crate) fn validate_targets(servers: &[ServerTarget]) -> Result<()> {
    if servers.is_empty() {
        return Err(RobotError::InvalidInput("at least one server is required".to_string()));
    }
    let mut seen = BTreeSet::new();
    for target in servers {
        if target.name.trim().is_empty() {
            return Err(RobotError::InvalidInput(format!(
                "server {} has an empty name",
                target.id
            )));
        }
        if !seen.insert(target.id) {
            return Err(RobotError::InvalidInput(format!(
                "server {} is listed twice",
                target.id
            )));
        }
    }
    Ok(())
}

impl ServerBulkSpec {
    pub fn validate(&self) -> Result<()> {
        validate_targets(&self.servers)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerBulkState {
    pub servers: Vec<ServerTarget>,
}

pub struct ServerBulkResource {
    client: RobotClient,
}

impl ServerBulkResource {
    pub fn new(client: RobotClient) -> Self {
        Self { client }
    }

    /// Rename the given targets; returns the ones that now carry their name
    async fn rename_all(&self, targets: Vec<ServerTarget>) -> (Vec<ServerTarget>, Diagnostics) {
        let results: Vec<(ServerTarget, Result<bool>)> = stream::iter(targets)
            .map(|target| async move {
                let result = self.client.rename_server(target.id, &target.name).await;
                (target, result)
            })
            .buffer_unordered(FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut renamed = Vec::new();
        let mut diagnostics = Diagnostics::new();
        for (target, result) in results {
            match result {
                Ok(_) => renamed.push(target),
                Err(e) => diagnostics.push(Diagnostic::error(
                    format!("Failed to rename server {} to {}", target.id, target.name),
                    e,
                )),
            }
        }
        renamed.sort_by_key(|t| t.id);
        (renamed, diagnostics)
    }
}

#[async_trait]
impl Resource for ServerBulkResource {
    type Spec = ServerBulkSpec;
    type State = ServerBulkState;

    const TYPE_NAME: &'static str = "server_bulk";

    async fn create(&self, spec: &ServerBulkSpec) -> Outcome<ServerBulkState> {
        let (servers, diagnostics) = self.rename_all(spec.servers.clone()).await;
        let state = (!servers.is_empty()).then_some(ServerBulkState { servers });
        Outcome::with(state, diagnostics)
    }

    async fn read(&self, state: &ServerBulkState) -> Outcome<ServerBulkState> {
        let ids: Vec<u64> = state.servers.iter().map(|t| t.id).collect();
        match self.client.fetch_servers_by_ids(&ids).await {
            Ok(servers) => Outcome::ok(ServerBulkState {
                servers: servers
                    .into_iter()
                    .map(|s| ServerTarget::new(s.number, s.name))
                    .collect(),
            }),
            Err(e) => Outcome::with(
                Some(state.clone()),
                Diagnostic::warning("Failed to refresh server names", e).into(),
            ),
        }
    }

    async fn update(&self, spec: &ServerBulkSpec, state: &ServerBulkState) -> Outcome<ServerBulkState> {
        let current: BTreeMap<u64, &str> = state
            .servers
            .iter()
            .map(|t| (t.id, t.name.as_str()))
            .collect();
        let changed: Vec<ServerTarget> = spec
            .servers
            .iter()
            .filter(|t| current.get(&t.id) != Some(&t.name.as_str()))
            .cloned()
            .collect();

        let (renamed, diagnostics) = self.rename_all(changed).await;
        let renamed: BTreeMap<u64, ServerTarget> = renamed.into_iter().map(|t| (t.id, t)).collect();

        // Unchanged or renamed targets take the desired name; failed ones keep the old one
        let mut servers: Vec<ServerTarget> = spec
            .servers
            .iter()
            .filter_map(|t| match (renamed.get(&t.id), current.get(&t.id)) {
                (Some(done), _) => Some(done.clone()),
                (None, Some(name)) => Some(ServerTarget::new(t.id, *name)),
                (None, None) => None,
            })
            .collect();
        servers.sort_by_key(|t| t.id);
        Outcome::with(Some(ServerBulkState { servers }), diagnostics)
    }

    async fn delete(&self, _state: &ServerBulkState) -> Diagnostics {
        Diagnostics::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::robot::client::test_support::setup;
    use serde_json::{json, Value};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn server_json(number: u64, name: &str) -> Value {
        json!({"server": {
            "server_ip": format!("10.0.0.{number}"), "server_number": number,
            "server_name": name, "product": "AX41", "dc": "FSN1",
            "status": "ready", "cancelled": false
        }})
    }

    async fn mount_server(mock_server: &MockServer, number: u64, name: &str, expected_posts: u64) {
        Mock::given(method("GET"))
            .and(path(format!("/server/{number}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(server_json(number, name)))
            .mount(mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/server/{number}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(server_json(number, name)))
            .expect(expected_posts)
            .mount(mock_server)
            .await;
    }

    #[test]
    fn test_validation_rejects_duplicates() {
        let spec = ServerBulkSpec {
            servers: vec![ServerTarget::new(1, "a"), ServerTarget::new(1, "b")],
        };
        assert!(spec.validate().is_err());
        assert!(ServerBulkSpec { servers: vec![] }.validate().is_err());
    }

    #[tokio::test]
    async fn test_create_renames_only_changed() {
        let (mock_server, client) = setup().await;
        mount_server(&mock_server, 1, "node-1", 0).await;
        mount_server(&mock_server, 2, "old", 1).await;

        let spec = ServerBulkSpec {
            servers: vec![ServerTarget::new(2, "node-2"), ServerTarget::new(1, "node-1")],
        };
        let outcome = ServerBulkResource::new(client).create(&spec).await;

        assert!(outcome.diagnostics.is_empty());
        assert_eq!(
            outcome.state.unwrap().servers,
            vec![ServerTarget::new(1, "node-1"), ServerTarget::new(2, "node-2")]
        );
    }

    #[tokio::test]
    async fn test_update_keeps_old_name_on_failure() {
        let (mock_server, client) = setup().await;
        Mock::given(method("GET"))
            .and(path("/server/3"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&mock_server)
            .await;

        let state = ServerBulkState {
            servers: vec![ServerTarget::new(3, "before")],
        };
        let spec = ServerBulkSpec {
            servers: vec![ServerTarget::new(3, "after")],
        };
        let outcome = ServerBulkResource::new(client).update(&spec, &state).await;

        assert!(outcome.diagnostics.has_errors());
        assert_eq!(outcome.state.unwrap(), state);
    }

    #[tokio::test]
    async fn test_read_reports_current_names() {
        let (mock_server, client) = setup().await;
        mount_server(&mock_server, 1, "renamed-elsewhere", 0).await;

        let state = ServerBulkState {
            servers: vec![ServerTarget::new(1, "node-1")],
        };
        let outcome = ServerBulkResource::new(client).read(&state).await;
        assert_eq!(outcome.state.unwrap().servers[0].name, "renamed-elsewhere");
    }
}
