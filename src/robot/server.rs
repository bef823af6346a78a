/// Server endpoints: listing, lookup, rename and reset
use futures::stream::{self, StreamExt};
use tracing::{debug, info};

use super::client::{form, RobotClient};
use super::error::{Result, RobotError};
use super::models::{ResetType, Server, ServerEnvelope};

/// Parallel lookups issued by [`RobotClient::fetch_servers_by_ids`]
pub const FETCH_CONCURRENCY: usize = 10;

impl RobotClient {
    /// List every server of the account
    pub async fn list_servers(&self) -> Result<Vec<Server>> {
        let servers: Vec<ServerEnvelope> = self.get("/server").await?;
        Ok(servers.into_iter().map(|s| s.server).collect())
    }

    /// Fetch a single server
    pub async fn get_server(&self, id: u64) -> Result<Server> {
        let envelope: ServerEnvelope = self.get(&format!("/server/{id}")).await?;
        Ok(envelope.server)
    }

    /// Rename a server; returns false when the name already matches
    pub async fn rename_server(&self, id: u64, name: &str) -> Result<bool> {
        let current = self.get_server(id).await?;
        if current.name == name {
            debug!(server_id = id, name = %name, "name unchanged, skipping rename");
            return Ok(false);
        }

        let _: ServerEnvelope = self
            .post_form(&format!("/server/{id}"), &form([("server_name", name)]))
            .await?;
        info!(server_id = id, from = %current.name, to = %name, "Renamed server");
        Ok(true)
    }

    /// Trigger a reset of the given type
    pub async fn reset_server(&self, id: u64, reset_type: ResetType) -> Result<()> {
        info!(server_id = id, reset_type = %reset_type, "Resetting server");
        self.post_form_empty(
            &format!("/reset/{id}"),
            &form([("type", reset_type.as_str())]),
        )
        .await
    }

    /// Fetch several servers concurrently, sorted by server number.
    ///
    /// All lookups run to completion; failures are folded into one error.
    pub async fn fetch_servers_by_ids(&self, ids: &[u64]) -> Result<Vec<Server>> {
        let results: Vec<Result<Server>> = stream::iter(ids.iter().copied())
            .map(|id| async move {
                self.get_server(id)
                    .await
                    .map_err(|e| RobotError::Aggregate(format!("server {id}: {e}")))
            })
            .buffer_unordered(FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut servers = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(server) => servers.push(server),
                Err(e) => errors.push(e),
            }
        }

        if let Some(err) = RobotError::aggregate(errors) {
            return Err(err);
        }

        servers.sort_by_key(|s| s.number);
        Ok(servers)
    }
}

#[cfg(test)]
mod tests {
    use super::super::client::test_support::{form_pairs, setup};
    use super::*;
    use serde_json::{json, Value};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    fn server_json(number: u64, name: &str) -> Value {
        json!({
            "server": {
                "server_ip": format!("10.0.0.{number}"),
                "server_ipv6_net": null,
                "server_number": number,
                "server_name": name,
                "product": "AX41",
                "dc": "FSN1-DC5",
                "traffic": "unlimited",
                "status": "ready",
                "cancelled": false,
                "paid_until": "2026-12-31"
            }
        })
    }

    #[tokio::test]
    async fn test_list_servers_unwraps_envelopes() {
        let (mock_server, client) = setup().await;
        Mock::given(method("GET"))
            .and(path("/server"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([server_json(1, "a"), server_json(2, "b")])),
            )
            .mount(&mock_server)
            .await;

        let servers = client.list_servers().await.unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].name, "b");
    }

    #[tokio::test]
    async fn test_rename_same_name_skips_post() {
        let (mock_server, client) = setup().await;
        Mock::given(method("GET"))
            .and(path("/server/321"))
            .respond_with(ResponseTemplate::new(200).set_body_json(server_json(321, "node-1")))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/server/321"))
            .respond_with(ResponseTemplate::new(200).set_body_json(server_json(321, "node-1")))
            .expect(0)
            .mount(&mock_server)
            .await;

        let renamed = client.rename_server(321, "node-1").await.unwrap();
        assert!(!renamed);
    }

    #[tokio::test]
    async fn test_rename_posts_new_name() {
        let (mock_server, client) = setup().await;
        Mock::given(method("GET"))
            .and(path("/server/321"))
            .respond_with(ResponseTemplate::new(200).set_body_json(server_json(321, "old")))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/server/321"))
            .respond_with(ResponseTemplate::new(200).set_body_json(server_json(321, "new")))
            .expect(1)
            .mount(&mock_server)
            .await;

        assert!(client.rename_server(321, "new").await.unwrap());

        let requests = mock_server.received_requests().await.unwrap();
        let post = requests.iter().find(|r| r.method.as_str() == "POST").unwrap();
        assert_eq!(
            form_pairs(post),
            vec![("server_name".to_string(), "new".to_string())]
        );
    }

    #[tokio::test]
    async fn test_reset_sends_type() {
        let (mock_server, client) = setup().await;
        Mock::given(method("POST"))
            .and(path("/reset/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"reset": {}})))
            .mount(&mock_server)
            .await;

        client.reset_server(7, ResetType::PowerLong).await.unwrap();

        let requests = mock_server.received_requests().await.unwrap();
        assert_eq!(
            form_pairs(&requests[0]),
            vec![("type".to_string(), "power_long".to_string())]
        );
    }

    #[tokio::test]
    async fn test_fetch_by_ids_sorts_results() {
        let (mock_server, client) = setup().await;
        for id in [3u64, 1, 2] {
            Mock::given(method("GET"))
                .and(path(format!("/server/{id}")))
                .respond_with(
                    ResponseTemplate::new(200).set_body_json(server_json(id, &format!("s{id}"))),
                )
                .mount(&mock_server)
                .await;
        }

        let servers = client.fetch_servers_by_ids(&[3, 1, 2]).await.unwrap();
        let numbers: Vec<u64> = servers.iter().map(|s| s.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_fetch_by_ids_aggregates_failures() {
        let (mock_server, client) = setup().await;
        Mock::given(method("GET"))
            .and(path("/server/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(server_json(1, "ok")))
            .mount(&mock_server)
            .await;
        for id in 10..17u64 {
            Mock::given(method("GET"))
                .and(path(format!("/server/{id}")))
                .respond_with(ResponseTemplate::new(404).set_body_string("SERVER_NOT_FOUND"))
                .mount(&mock_server)
                .await;
        }

        let ids: Vec<u64> = std::iter::once(1).chain(10..17).collect();
        let message = client.fetch_servers_by_ids(&ids).await.unwrap_err().to_string();
        assert!(message.starts_with("errors occurred:"));
        assert!(message.ends_with("(and 2 more)"));
    }
}
