/// vSwitch resource: VLAN, name and server membership
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

use super::{Diagnostic, Diagnostics, Outcome, Resource};
use crate::robot::error::{Result, RobotError};
use crate::robot::models::VSwitch;
use crate::robot::vswitch::validate_cancellation_date;
use crate::robot::RobotClient;

const MAX_VLAN: u16 = 4095;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VSwitchSpec {
    pub name: String,
    /// Picked from the free pool when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
    #[serde(default)]
    pub servers: Vec<u64>,
    /// "now" (default) or YYYY-MM-DD, applied on destroy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_date: Option<String>,
}

impl VSwitchSpec {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RobotError::InvalidInput("vSwitch name cannot be empty".to_string()));
        }
        if let Some(vlan) = self.vlan {
            if vlan > MAX_VLAN {
                return Err(RobotError::InvalidInput(format!(
                    "VLAN must be between 0 and {MAX_VLAN}, got {vlan}"
                )));
            }
        }
        if let Some(date) = &self.cancellation_date {
            validate_cancellation_date(date)?;
        }
        Ok(())
    }

    /// Desired members, de-duplicated
    fn server_set(&self) -> BTreeSet<u64> {
        self.servers.iter().copied().collect()
    }
}

/// Attached server whose vSwitch setup failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub server_number: u64,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VSwitchState {
    pub id: u64,
    pub name: String,
    pub vlan: u16,
    pub cancelled: bool,
    pub servers: Vec<u64>,
    #[serde(default)]
    pub incidents: Vec<Incident>,
    pub cancellation_date: String,
}

impl VSwitchState {
    fn from_remote(vswitch: VSwitch, cancellation_date: String) -> Self {
        let servers: BTreeSet<u64> = vswitch.servers.iter().map(|s| s.server_number).collect();
        let incidents = vswitch
            .servers
            .iter()
            .filter(|s| s.is_failed())
            .map(|s| Incident {
                server_number: s.server_number,
                status: s.status.clone(),
            })
            .collect();

        Self {
            id: vswitch.id,
            name: vswitch.name,
            vlan: vswitch.vlan,
            cancelled: vswitch.cancelled,
            servers: servers.into_iter().collect(),
            incidents,
            cancellation_date,
        }
    }

    fn incident_warnings(&self) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();
        for incident in &self.incidents {
            diagnostics.push(Diagnostic::warning(
                format!("vSwitch {} attachment failed", self.id),
                format!("server {} has status {}", incident.server_number, incident.status),
            ));
        }
        diagnostics
    }
}

pub struct VSwitchResource {
    client: RobotClient,
}

impl VSwitchResource {
    pub fn new(client: RobotClient) -> Self {
        Self { client }
    }

    async fn create_remote(&self, spec: &VSwitchSpec) -> Result<VSwitch> {
        let vlan = match spec.vlan {
            Some(vlan) => vlan,
            None => self.client.pick_random_free_vlan().await?,
        };
        self.client.create_vswitch(&spec.name, vlan).await
    }

    /// Attach the desired servers to a freshly created vSwitch
    async fn attach_members(&self, created: VSwitch, spec: &VSwitchSpec) -> Result<VSwitch> {
        let members: Vec<u64> = spec.server_set().into_iter().collect();
        if members.is_empty() {
            return Ok(created);
        }
        self.client.add_vswitch_servers(created.id, &members).await?;
        self.client.wait_vswitch_ready(created.id).await
    }

    /// Name, VLAN and membership are compared against the live vSwitch
    async fn update_inner(&self, spec: &VSwitchSpec, state: &VSwitchState) -> Result<VSwitchState> {
        let id = state.id;
        let live = self.client.get_vswitch(id).await?;
        let vlan = spec.vlan.unwrap_or(live.vlan);
        let vlan_changed = vlan != live.vlan;
        if spec.name != live.name || vlan_changed {
            self.client.update_vswitch(id, &spec.name, vlan).await?;
        }

        let desired = spec.server_set();
        let current: BTreeSet<u64> = live.servers.iter().map(|s| s.server_number).collect();
        let to_remove: Vec<u64> = current.difference(&desired).copied().collect();
        let to_add: Vec<u64> = desired.difference(&current).copied().collect();

        self.client.remove_vswitch_servers(id, &to_remove).await?;
        self.client.add_vswitch_servers(id, &to_add).await?;

        let remote = if vlan_changed || !to_remove.is_empty() || !to_add.is_empty() {
            self.client.wait_vswitch_ready(id).await?
        } else if spec.name != live.name {
            self.client.get_vswitch(id).await?
        } else {
            live
        };
        Ok(VSwitchState::from_remote(remote, cancellation_date(spec)))
    }
}

fn cancellation_date(spec: &VSwitchSpec) -> String {
    spec.cancellation_date
        .clone()
        .unwrap_or_else(|| "now".to_string())
}

#[async_trait]
impl Resource for VSwitchResource {
    type Spec = VSwitchSpec;
    type State = VSwitchState;

    const TYPE_NAME: &'static str = "vswitch";

    /// Once the vSwitch exists it is always returned, tainted by any later failure
    async fn create(&self, spec: &VSwitchSpec) -> Outcome<VSwitchState> {
        let summary = format!("Failed to create vSwitch {}", spec.name);
        let created = match self.create_remote(spec).await {
            Ok(created) => created,
            Err(e) => return Outcome::from_error(summary, e),
        };

        let partial = VSwitchState::from_remote(created.clone(), cancellation_date(spec));
        match self.attach_members(created, spec).await {
            Ok(current) => {
                let state = VSwitchState::from_remote(current, cancellation_date(spec));
                let warnings = state.incident_warnings();
                Outcome::with(Some(state), warnings)
            }
            Err(e) => {
                warn!(vswitch_id = partial.id, error = %e, "vSwitch created but setup failed");
                Outcome::with(Some(partial), Diagnostic::error(summary, e).into())
            }
        }
    }

    async fn read(&self, state: &VSwitchState) -> Outcome<VSwitchState> {
        match self.client.get_vswitch(state.id).await {
            Ok(remote) => {
                let state = VSwitchState::from_remote(remote, state.cancellation_date.clone());
                let warnings = state.incident_warnings();
                Outcome::with(Some(state), warnings)
            }
            Err(e) if e.is_not_found() => {
                warn!(vswitch_id = state.id, "vSwitch no longer exists, removing from state");
                Outcome::removed()
            }
            Err(e) => Outcome::from_error(format!("Failed to read vSwitch {}", state.id), e),
        }
    }

    async fn update(&self, spec: &VSwitchSpec, state: &VSwitchState) -> Outcome<VSwitchState> {
        match self.update_inner(spec, state).await {
            Ok(state) => {
                let warnings = state.incident_warnings();
                Outcome::with(Some(state), warnings)
            }
            Err(e) => Outcome::from_error(format!("Failed to update vSwitch {}", state.id), e),
        }
    }

    async fn delete(&self, state: &VSwitchState) -> Diagnostics {
        match self
            .client
            .cancel_vswitch(state.id, &state.cancellation_date)
            .await
        {
            Ok(()) => Diagnostics::new(),
            Err(e) if e.is_not_found() => {
                info!(vswitch_id = state.id, "vSwitch already gone");
                Diagnostics::new()
            }
            Err(e) => Diagnostic::error(format!("Failed to cancel vSwitch {}", state.id), e).into(),
        }
    }

    async fn import(&self, id: u64) -> Outcome<(VSwitchSpec, VSwitchState)> {
        match self.client.get_vswitch(id).await {
            Ok(remote) => {
                let state = VSwitchState::from_remote(remote, "now".to_string());
                let spec = VSwitchSpec {
                    name: state.name.clone(),
                    vlan: Some(state.vlan),
                    servers: state.servers.clone(),
                    cancellation_date: None,
                };
                Outcome::ok((spec, state))
            }
            Err(e) => Outcome::from_error(format!("Failed to import vSwitch {id}"), e),
        }
    }
}
