/// Hetzner Robot webservice data models
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::RobotError;

/// Dedicated server as reported by `/server`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    #[serde(rename = "server_ip")]
    pub ip: String,
    #[serde(rename = "server_ipv6_net", default)]
    pub ipv6_net: Option<String>,
    #[serde(rename = "server_number")]
    pub number: u64,
    #[serde(rename = "server_name", default)]
    pub name: String,
    #[serde(default)]
    pub product: String,
    #[serde(rename = "dc", default)]
    pub datacenter: String,
    #[serde(default)]
    pub traffic: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub paid_until: Option<String>,
}

impl Server {
    /// Robot reports "ready" once a server accepts new jobs
    pub fn is_ready(&self) -> bool {
        self.status == "ready"
    }
}

/// `{"server": {...}}` wrapper used by every server endpoint
#[derive(Debug, Deserialize)]
pub struct ServerEnvelope {
    pub server: Server,
}

/// Desired name for a server, the unit of bulk operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTarget {
    pub id: u64,
    pub name: String,
}

impl ServerTarget {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// vSwitch resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VSwitch {
    pub id: u64,
    pub name: String,
    pub vlan: u16,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(rename = "server", alias = "servers", default)]
    pub servers: Vec<VSwitchServer>,
    #[serde(rename = "subnet", alias = "subnets", default)]
    pub subnets: Vec<VSwitchSubnet>,
    #[serde(rename = "cloud_network", alias = "cloud_networks", default)]
    pub cloud_networks: Vec<VSwitchCloudNetwork>,
}

/// Server attachment of a vSwitch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VSwitchServer {
    pub server_number: u64,
    #[serde(default)]
    pub server_ip: Option<String>,
    #[serde(default)]
    pub server_ipv6_net: Option<String>,
    /// "ready", "processing" or "failed"
    #[serde(default)]
    pub status: String,
}

impl VSwitchServer {
    pub fn is_processing(&self) -> bool {
        self.status == "processing" || self.status == "in process"
    }

    pub fn is_failed(&self) -> bool {
        self.status == "failed"
    }
}

/// Subnet routed to a vSwitch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VSwitchSubnet {
    pub ip: String,
    pub mask: u8,
    #[serde(default)]
    pub gateway: Option<String>,
}

/// Cloud network coupled to a vSwitch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VSwitchCloudNetwork {
    pub id: u64,
    pub ip: String,
    pub mask: u8,
    #[serde(default)]
    pub gateway: Option<String>,
}

/// Rescue system details as returned by `/boot/{id}/rescue`
#[derive(Debug, Deserialize)]
pub struct RescueEnvelope {
    pub rescue: RescueDetails,
}

#[derive(Debug, Deserialize)]
pub struct RescueDetails {
    pub server_ip: String,
    #[serde(default)]
    pub server_ipv6_net: Option<String>,
    pub server_number: u64,
    /// A string once activated, the list of available systems otherwise
    #[serde(default)]
    pub os: serde_json::Value,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub password: Option<String>,
}

/// One-time credentials of an activated rescue system.
///
/// The password is generated by Robot on every activation and is only
/// exposed when handed to the SSH executor or written into results.
#[derive(Debug)]
pub struct RescueCredentials {
    pub server_ip: String,
    pub password: SecretString,
}

impl RescueDetails {
    /// Name of the activated system; before activation Robot sends a list
    pub fn os_name(&self) -> String {
        match &self.os {
            serde_json::Value::String(os) => os.clone(),
            other => other.to_string(),
        }
    }
}

impl TryFrom<RescueDetails> for RescueCredentials {
    type Error = RobotError;

    fn try_from(details: RescueDetails) -> Result<Self, Self::Error> {
        let password = details.password.ok_or_else(|| {
            RobotError::InvalidInput(format!(
                "rescue system of server {} returned no password",
                details.server_number
            ))
        })?;

        Ok(Self {
            server_ip: details.server_ip,
            password: SecretString::from(password),
        })
    }
}

/// Reset flavours accepted by `/reset/{id}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetType {
    /// CTRL+ALT+DEL
    Sw,
    /// Hardware reset
    Hw,
    /// Short press of the power button
    Power,
    /// Long press of the power button
    PowerLong,
    /// Manual reset by a technician
    Man,
}

impl ResetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetType::Sw => "sw",
            ResetType::Hw => "hw",
            ResetType::Power => "power",
            ResetType::PowerLong => "power_long",
            ResetType::Man => "man",
        }
    }

    /// Power button presses switch the machine off; it needs a second press
    pub fn is_power_button(&self) -> bool {
        matches!(self, ResetType::Power | ResetType::PowerLong)
    }
}

impl fmt::Display for ResetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResetType {
    type Err = RobotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sw" => Ok(ResetType::Sw),
            "hw" => Ok(ResetType::Hw),
            "power" => Ok(ResetType::Power),
            "power_long" => Ok(ResetType::PowerLong),
            "man" => Ok(ResetType::Man),
            other => Err(RobotError::InvalidInput(format!("unknown reset type: {other}"))),
        }
    }
}
