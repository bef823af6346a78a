/// Firewall resource: the full input rule list of one server
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Diagnostic, Diagnostics, Outcome, Resource};
use crate::robot::error::{Result, RobotError};
use crate::robot::firewall::{Firewall, FirewallRule, FirewallStatus};
use crate::robot::RobotClient;

/// Input rules Robot accepts per firewall
pub const MAX_RULES: usize = 10;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallSpec {
    pub server_id: u64,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub whitelist_hos: bool,
    #[serde(default)]
    pub rules: Vec<FirewallRule>,
}

impl FirewallSpec {
    pub fn validate(&self) -> Result<()> {
        if self.server_id == 0 {
            return Err(RobotError::InvalidInput("server_id is required".to_string()));
        }
        if self.rules.len() > MAX_RULES {
            return Err(RobotError::InvalidInput(format!(
                "at most {MAX_RULES} input rules are allowed, got {}",
                self.rules.len()
            )));
        }
        for rule in &self.rules {
            if !matches!(rule.ip_version.as_str(), "" | "ipv4" | "ipv6") {
                return Err(RobotError::InvalidInput(format!(
                    "rule {:?}: ip_version must be ipv4 or ipv6",
                    rule.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallState {
    pub server_id: u64,
    pub server_ip: String,
    pub status: FirewallStatus,
    pub whitelist_hos: bool,
    pub rules: Vec<FirewallRule>,
}

impl From<Firewall> for FirewallState {
    fn from(firewall: Firewall) -> Self {
        Self {
            server_id: firewall.server_number,
            server_ip: firewall.server_ip,
            status: firewall.status,
            whitelist_hos: firewall.whitelist_hos,
            rules: firewall.rules.input,
        }
    }
}

pub struct FirewallResource {
    client: RobotClient,
}

impl FirewallResource {
    pub fn new(client: RobotClient) -> Self {
        Self { client }
    }

    /// Firewalls are addressed by the server's main IP
    async fn apply(&self, spec: &FirewallSpec) -> Result<FirewallState> {
        let server = self.client.get_server(spec.server_id).await?;
        let firewall = self
            .client
            .set_firewall(&server.ip, spec.active, spec.whitelist_hos, &spec.rules)
            .await?;
        Ok(firewall.into())
    }

    async fn fetch(&self, server_id: u64) -> Result<Firewall> {
        let server = self.client.get_server(server_id).await?;
        self.client.get_firewall(&server.ip).await
    }
}

#[async_trait]
impl Resource for FirewallResource {
    type Spec = FirewallSpec;
    type State = FirewallState;

    const TYPE_NAME: &'static str = "firewall";

    async fn create(&self, spec: &FirewallSpec) -> Outcome<FirewallState> {
        match self.apply(spec).await {
            Ok(state) => Outcome::ok(state),
            Err(e) => Outcome::from_error(
                format!("Failed to configure firewall of server {}", spec.server_id),
                e,
            ),
        }
    }

    async fn read(&self, state: &FirewallState) -> Outcome<FirewallState> {
        match self.client.get_firewall(&state.server_ip).await {
            Ok(firewall) => Outcome::ok(firewall.into()),
            Err(e) if e.is_not_found() => {
                warn!(server_id = state.server_id, "Firewall no longer exists, removing from state");
                Outcome::removed()
            }
            Err(e) => Outcome::from_error(
                format!("Failed to read firewall of server {}", state.server_id),
                e,
            ),
        }
    }

    async fn update(&self, spec: &FirewallSpec, _state: &FirewallState) -> Outcome<FirewallState> {
        self.create(spec).await
    }

    async fn delete(&self, state: &FirewallState) -> Diagnostics {
        match self.client.reset_firewall(&state.server_ip).await {
            Ok(_) => Diagnostics::new(),
            Err(e) if e.is_not_found() => Diagnostics::new(),
            Err(e) => Diagnostic::error(
                format!("Failed to reset firewall of server {}", state.server_id),
                e,
            )
            .into(),
        }
    }

    async fn import(&self, server_id: u64) -> Outcome<(FirewallSpec, FirewallState)> {
        match self.fetch(server_id).await {
            Ok(firewall) => {
                let state = FirewallState::from(firewall);
                let spec = FirewallSpec {
                    server_id,
                    active: state.status != FirewallStatus::Disabled,
                    whitelist_hos: state.whitelist_hos,
                    rules: state.rules.clone(),
                };
                Outcome::ok((spec, state))
            }
            Err(e) => Outcome::from_error(format!("Failed to import firewall of server {server_id}"), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::robot::client::test_support::{form_pairs, setup};
    use crate::robot::firewall::{rules_from_form_fields, FirewallAction};
    use serde_json::{json, Value};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ssh_rule() -> FirewallRule {
        FirewallRule {
            name: "ssh".to_string(),
            dst_port: "22".to_string(),
            protocol: "tcp".to_string(),
            ..FirewallRule::new(FirewallAction::Accept)
        }
    }

    fn firewall_json(status: &str) -> Value {
        json!({
            "firewall": {
                "server_ip": "1.2.3.4",
                "server_number": 321,
                "status": status,
                "whitelist_hos": true,
                "port": "main",
                "rules": {"input": [
                    {"ip_version": "ipv4", "name": "ssh", "dst_ip": null, "src_ip": null,
                     "dst_port": "22", "src_port": null, "protocol": "tcp",
                     "tcp_flags": null, "action": "accept"}
                ]}
            }
        })
    }

    async fn mount_server(mock_server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/server/321"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "server": {
                    "server_ip": "1.2.3.4", "server_number": 321, "server_name": "web",
                    "product": "AX41", "dc": "FSN1", "status": "ready", "cancelled": false
                }
            })))
            .mount(mock_server)
            .await;
    }

    #[test]
    fn test_spec_validation() {
        let spec = FirewallSpec {
            server_id: 321,
            active: true,
            whitelist_hos: false,
            rules: vec![ssh_rule(); 11],
        };
        assert!(spec.validate().is_err());

        let spec = FirewallSpec {
            rules: vec![FirewallRule {
                ip_version: "ipx".to_string(),
                ..ssh_rule()
            }],
            ..spec
        };
        assert!(spec.validate().is_err());
    }

    #[tokio::test]
    async fn test_create_resolves_ip_and_posts_rules() {
        let (mock_server, client) = setup().await;
        mount_server(&mock_server).await;
        Mock::given(method("POST"))
            .and(path("/firewall/1.2.3.4"))
            .respond_with(ResponseTemplate::new(202).set_body_json(firewall_json("in process")))
            .mount(&mock_server)
            .await;

        let spec = FirewallSpec {
            server_id: 321,
            active: true,
            whitelist_hos: true,
            rules: vec![ssh_rule()],
        };
        let outcome = FirewallResource::new(client).create(&spec).await;
        let state = outcome.state.unwrap();
        assert_eq!(state.server_ip, "1.2.3.4");
        assert_eq!(state.rules, vec![ssh_rule()]);

        let requests = mock_server.received_requests().await.unwrap();
        let post = requests.iter().find(|r| r.method.as_str() == "POST").unwrap();
        let sent = form_pairs(post);
        assert!(sent.contains(&("whitelist_hos".to_string(), "true".to_string())));
        assert_eq!(rules_from_form_fields(&sent).unwrap(), vec![ssh_rule()]);
    }

    #[tokio::test]
    async fn test_import_uses_server_ip() {
        let (mock_server, client) = setup().await;
        mount_server(&mock_server).await;
        Mock::given(method("GET"))
            .and(path("/firewall/1.2.3.4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(firewall_json("disabled")))
            .mount(&mock_server)
            .await;

        let (spec, state) = FirewallResource::new(client).import(321).await.state.unwrap();
        assert!(!spec.active);
        assert!(spec.whitelist_hos);
        assert_eq!(state.rules.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_resets_to_allow_all() {
        let (mock_server, client) = setup().await;
        Mock::given(method("POST"))
            .and(path("/firewall/1.2.3.4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(firewall_json("active")))
            .expect(1)
            .mount(&mock_server)
            .await;

        let state = FirewallState {
            server_id: 321,
            server_ip: "1.2.3.4".to_string(),
            status: FirewallStatus::Active,
            whitelist_hos: true,
            rules: vec![ssh_rule()],
        };
        let diagnostics = FirewallResource::new(client).delete(&state).await;
        assert!(diagnostics.is_empty());

        let requests = mock_server.received_requests().await.unwrap();
        let rules = rules_from_form_fields(&form_pairs(&requests[0])).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "Allow all");
    }
}
