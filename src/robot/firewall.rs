/// Per-server firewall: rule model, form encoding and endpoints
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::info;

use super::client::RobotClient;
use super::error::{Result, RobotError};

const DEFAULT_IP_VERSION: &str = "ipv4";
const RULE_FIELDS: [&str; 8] = [
    "name",
    "ip_version",
    "src_ip",
    "src_port",
    "dst_ip",
    "dst_port",
    "protocol",
    "tcp_flags",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallAction {
    Accept,
    Discard,
}

impl FirewallAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirewallAction::Accept => "accept",
            FirewallAction::Discard => "discard",
        }
    }
}

impl fmt::Display for FirewallAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FirewallAction {
    type Err = RobotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "accept" => Ok(FirewallAction::Accept),
            "discard" => Ok(FirewallAction::Discard),
            other => Err(RobotError::InvalidInput(format!(
                "firewall action must be accept or discard, got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirewallStatus {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "disabled")]
    Disabled,
    #[serde(rename = "in process")]
    InProcess,
}

impl FirewallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirewallStatus::Active => "active",
            FirewallStatus::Disabled => "disabled",
            FirewallStatus::InProcess => "in process",
        }
    }
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn default_ip_version() -> String {
    DEFAULT_IP_VERSION.to_string()
}

/// One input rule. Empty strings mean "any" and are not sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    #[serde(default, deserialize_with = "null_as_empty", skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default = "default_ip_version", deserialize_with = "null_as_empty")]
    pub ip_version: String,
    #[serde(default, deserialize_with = "null_as_empty", skip_serializing_if = "String::is_empty")]
    pub src_ip: String,
    #[serde(default, deserialize_with = "null_as_empty", skip_serializing_if = "String::is_empty")]
    pub src_port: String,
    #[serde(default, deserialize_with = "null_as_empty", skip_serializing_if = "String::is_empty")]
    pub dst_ip: String,
    #[serde(default, deserialize_with = "null_as_empty", skip_serializing_if = "String::is_empty")]
    pub dst_port: String,
    #[serde(default, deserialize_with = "null_as_empty", skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(default, deserialize_with = "null_as_empty", skip_serializing_if = "String::is_empty")]
    pub tcp_flags: String,
    pub action: FirewallAction,
}

impl FirewallRule {
    /// IPv4 rule matching everything
    pub fn new(action: FirewallAction) -> Self {
        Self {
            name: String::new(),
            ip_version: default_ip_version(),
            src_ip: String::new(),
            src_port: String::new(),
            dst_ip: String::new(),
            dst_port: String::new(),
            protocol: String::new(),
            tcp_flags: String::new(),
            action,
        }
    }

    fn field(&self, field: &str) -> &str {
        match field {
            "name" => self.name.as_str(),
            "ip_version" if self.ip_version.is_empty() => DEFAULT_IP_VERSION,
            "ip_version" => self.ip_version.as_str(),
            "src_ip" => self.src_ip.as_str(),
            "src_port" => self.src_port.as_str(),
            "dst_ip" => self.dst_ip.as_str(),
            "dst_port" => self.dst_port.as_str(),
            "protocol" => self.protocol.as_str(),
            "tcp_flags" => self.tcp_flags.as_str(),
            _ => "",
        }
    }

    fn set_field(&mut self, field: &str, value: String) -> Result<()> {
        match field {
            "name" => self.name = value,
            "ip_version" => self.ip_version = value,
            "src_ip" => self.src_ip = value,
            "src_port" => self.src_port = value,
            "dst_ip" => self.dst_ip = value,
            "dst_port" => self.dst_port = value,
            "protocol" => self.protocol = value,
            "tcp_flags" => self.tcp_flags = value,
            "action" => self.action = value.parse()?,
            other => {
                return Err(RobotError::InvalidInput(format!(
                    "unknown firewall rule field {other:?}"
                )))
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRules {
    #[serde(default)]
    pub input: Vec<FirewallRule>,
}

/// Firewall of one server as returned by `/firewall/{ip}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Firewall {
    pub server_ip: String,
    pub server_number: u64,
    pub status: FirewallStatus,
    #[serde(default)]
    pub whitelist_hos: bool,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub rules: FirewallRules,
}

#[derive(Debug, Deserialize)]
struct FirewallEnvelope {
    firewall: Firewall,
}

/// Encode rules as `rules[input][i][field]` pairs, in rule order.
///
/// Empty fields are left out; `action` is always present.
pub fn rule_form_fields(rules: &[FirewallRule]) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    for (i, rule) in rules.iter().enumerate() {
        for field in RULE_FIELDS {
            let value = rule.field(field);
            if !value.is_empty() {
                fields.push((format!("rules[input][{i}][{field}]"), value.to_string()));
            }
        }
        fields.push((
            format!("rules[input][{i}][action]"),
            rule.action.as_str().to_string(),
        ));
    }
    fields
}

fn parse_rule_key(key: &str) -> Option<(usize, &str)> {
    let rest = key.strip_prefix("rules[input][")?;
    let (index, rest) = rest.split_once("][")?;
    let field = rest.strip_suffix(']')?;
    Some((index.parse().ok()?, field))
}

/// Inverse of [`rule_form_fields`]. Keys outside `rules[input]` are ignored.
#[allow(dead_code)]
pub fn rules_from_form_fields(fields: &[(String, String)]) -> Result<Vec<FirewallRule>> {
    let mut rules: BTreeMap<usize, (FirewallRule, bool)> = BTreeMap::new();
    for (key, value) in fields {
        let Some((index, field)) = parse_rule_key(key) else {
            continue;
        };
        let (rule, has_action) = rules.entry(index).or_insert_with(|| {
            let mut rule = FirewallRule::new(FirewallAction::Accept);
            rule.ip_version.clear();
            (rule, false)
        });
        rule.set_field(field, value.clone())?;
        *has_action |= field == "action";
    }

    rules
        .into_iter()
        .map(|(index, (rule, has_action))| {
            if has_action {
                Ok(rule)
            } else {
                Err(RobotError::InvalidInput(format!(
                    "firewall rule {index} has no action"
                )))
            }
        })
        .collect()
}

/// Full form for `POST /firewall/{ip}`
pub fn firewall_form(active: bool, whitelist_hos: bool, rules: &[FirewallRule]) -> Vec<(String, String)> {
    let status = if active {
        FirewallStatus::Active
    } else {
        FirewallStatus::Disabled
    };
    let mut fields = vec![
        ("status".to_string(), status.as_str().to_string()),
        ("whitelist_hos".to_string(), whitelist_hos.to_string()),
    ];
    fields.extend(rule_form_fields(rules));
    fields
}

/// Single rule accepting all traffic
pub fn allow_all_rule() -> FirewallRule {
    FirewallRule {
        name: "Allow all".to_string(),
        ..FirewallRule::new(FirewallAction::Accept)
    }
}

impl RobotClient {
    pub async fn get_firewall(&self, server_ip: &str) -> Result<Firewall> {
        let envelope: FirewallEnvelope = self.get(&format!("/firewall/{server_ip}")).await?;
        Ok(envelope.firewall)
    }

    /// Replace status, host whitelist flag and the full input rule list
    pub async fn set_firewall(
        &self,
        server_ip: &str,
        active: bool,
        whitelist_hos: bool,
        rules: &[FirewallRule],
    ) -> Result<Firewall> {
        let envelope: FirewallEnvelope = self
            .post_form(
                &format!("/firewall/{server_ip}"),
                &firewall_form(active, whitelist_hos, rules),
            )
            .await?;
        info!(server_ip = %server_ip, rules = rules.len(), active, "Firewall updated");
        Ok(envelope.firewall)
    }

    /// Leave the firewall active with one "Allow all" rule
    pub async fn reset_firewall(&self, server_ip: &str) -> Result<Firewall> {
        self.set_firewall(server_ip, true, false, &[allow_all_rule()])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::client::test_support::{form_pairs, setup};
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    fn sample_rules() -> Vec<FirewallRule> {
        vec![
            FirewallRule {
                name: "ssh".to_string(),
                src_ip: "203.0.113.0/24".to_string(),
                dst_port: "22".to_string(),
                protocol: "tcp".to_string(),
                ..FirewallRule::new(FirewallAction::Accept)
            },
            FirewallRule {
                name: "syn".to_string(),
                protocol: "tcp".to_string(),
                tcp_flags: "syn".to_string(),
                ..FirewallRule::new(FirewallAction::Discard)
            },
            FirewallRule::new(FirewallAction::Accept),
        ]
    }

    #[test]
    fn test_form_fields_omit_empty_values() {
        let fields = rule_form_fields(&sample_rules()[..1]);
        let keys: Vec<&str> = fields.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "rules[input][0][name]",
                "rules[input][0][ip_version]",
                "rules[input][0][src_ip]",
                "rules[input][0][dst_port]",
                "rules[input][0][protocol]",
                "rules[input][0][action]",
            ]
        );
    }

    #[test]
    fn test_empty_ip_version_defaults_to_ipv4() {
        let mut rule = FirewallRule::new(FirewallAction::Discard);
        rule.ip_version.clear();
        let fields = rule_form_fields(&[rule]);
        assert!(fields.contains(&("rules[input][0][ip_version]".to_string(), "ipv4".to_string())));
        assert!(fields.contains(&("rules[input][0][action]".to_string(), "discard".to_string())));
    }

    #[test]
    fn test_form_round_trip_preserves_order() {
        let rules = sample_rules();
        let parsed = rules_from_form_fields(&rule_form_fields(&rules)).unwrap();
        assert_eq!(parsed, rules);
    }

    #[test]
    fn test_parse_ignores_foreign_keys_and_requires_action() {
        let fields = vec![
            ("status".to_string(), "active".to_string()),
            ("rules[input][0][name]".to_string(), "x".to_string()),
        ];
        assert!(rules_from_form_fields(&fields).is_err());

        let fields = vec![("rules[input][0][colour]".to_string(), "red".to_string())];
        assert!(rules_from_form_fields(&fields).is_err());
    }

    #[test]
    fn test_json_read_maps_nulls_to_empty() {
        let json = json!({
            "firewall": {
                "server_ip": "1.2.3.4",
                "server_number": 321,
                "status": "in process",
                "filter_ipv6": false,
                "whitelist_hos": true,
                "port": "main",
                "rules": {"input": [
                    {"ip_version": "ipv4", "name": "ssh", "dst_ip": null,
                     "src_ip": "203.0.113.0/24", "dst_port": "22", "src_port": null,
                     "protocol": "tcp", "tcp_flags": null, "action": "accept"},
                    {"ip_version": "ipv4", "name": "syn", "dst_ip": null, "src_ip": null,
                     "dst_port": null, "src_port": null, "protocol": "tcp",
                     "tcp_flags": "syn", "action": "discard"},
                    {"ip_version": "ipv4", "name": null, "dst_ip": null, "src_ip": null,
                     "dst_port": null, "src_port": null, "protocol": null,
                     "tcp_flags": null, "action": "accept"}
                ]}
            }
        });

        let envelope: FirewallEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(envelope.firewall.status, FirewallStatus::InProcess);
        assert_eq!(envelope.firewall.rules.input, sample_rules());
    }

    #[tokio::test]
    async fn test_reset_sets_single_allow_all_rule() {
        let (mock_server, client) = setup().await;
        Mock::given(method("POST"))
            .and(path("/firewall/1.2.3.4"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "firewall": {
                    "server_ip": "1.2.3.4",
                    "server_number": 321,
                    "status": "in process",
                    "whitelist_hos": false,
                    "port": "main",
                    "rules": {"input": [{"ip_version": "ipv4", "name": "Allow all", "action": "accept"}]}
                }
            })))
            .mount(&mock_server)
            .await;

        let firewall = client.reset_firewall("1.2.3.4").await.unwrap();
        assert_eq!(firewall.rules.input, vec![allow_all_rule()]);

        let requests = mock_server.received_requests().await.unwrap();
        let sent = form_pairs(&requests[0]);
        assert_eq!(sent[0], ("status".to_string(), "active".to_string()));
        assert_eq!(sent[1], ("whitelist_hos".to_string(), "false".to_string()));
        assert_eq!(rules_from_form_fields(&sent).unwrap(), vec![allow_all_rule()]);
    }
}
