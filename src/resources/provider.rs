/// Provider: routes manifest entries to their resource implementation
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use super::boot_installer::BootInstallerResource;
use super::data_sources::{self, DataSourceSpec};
use super::firewall::FirewallResource;
use super::server_bulk::ServerBulkResource;
use super::vswitch::VSwitchResource;
use super::{Diagnostic, Diagnostics, Outcome, Resource, ResourceSpec};
use crate::config::RescueAccess;
use crate::robot::error::Result;
use crate::robot::RobotClient;
use crate::ssh::SshExecutor;
use crate::state::Driver;
use crate::utils::probe::NetworkProber;

pub struct Provider {
    client: RobotClient,
    vswitch: VSwitchResource,
    firewall: FirewallResource,
    server_bulk: ServerBulkResource,
    boot_installer: BootInstallerResource<RobotClient, NetworkProber, SshExecutor>,
}

impl Provider {
    pub fn new(client: RobotClient, rescue: &RescueAccess) -> Result<Self> {
        let boot_installer = BootInstallerResource::new(
            Arc::new(client.clone()),
            Arc::new(rescue.prober()),
            Arc::new(rescue.executor()),
        )?;
        Ok(Self {
            vswitch: VSwitchResource::new(client.clone()),
            firewall: FirewallResource::new(client.clone()),
            server_bulk: ServerBulkResource::new(client.clone()),
            boot_installer,
            client,
        })
    }
}

fn encode<S: Serialize>(outcome: Outcome<S>) -> Outcome<Value> {
    let Outcome {
        state,
        mut diagnostics,
    } = outcome;
    let state = match state.map(serde_json::to_value).transpose() {
        Ok(state) => state,
        Err(e) => {
            diagnostics.push(Diagnostic::error("Failed to encode resource state", e));
            None
        }
    };
    Outcome::with(state, diagnostics)
}

fn decode<S: DeserializeOwned>(type_name: &str, state: &Value) -> std::result::Result<S, Diagnostic> {
    serde_json::from_value(state.clone()).map_err(|e| {
        Diagnostic::error(format!("Stored {type_name} state is unreadable"), e)
    })
}

async fn create_with<R: Resource>(resource: &R, spec: &R::Spec) -> Outcome<Value> {
    encode(resource.create(spec).await)
}

async fn read_with<R: Resource>(resource: &R, state: &Value) -> Outcome<Value> {
    match decode::<R::State>(R::TYPE_NAME, state) {
        Ok(state) => encode(resource.read(&state).await),
        Err(diagnostic) => Outcome::failed(diagnostic),
    }
}

async fn update_with<R: Resource>(resource: &R, spec: &R::Spec, state: &Value) -> Outcome<Value> {
    match decode::<R::State>(R::TYPE_NAME, state) {
        Ok(state) => encode(resource.update(spec, &state).await),
        Err(diagnostic) => Outcome::failed(diagnostic),
    }
}

async fn delete_with<R: Resource>(resource: &R, state: &Value) -> Diagnostics {
    match decode::<R::State>(R::TYPE_NAME, state) {
        Ok(state) => resource.delete(&state).await,
        Err(diagnostic) => diagnostic.into(),
    }
}

async fn import_with<R, F>(resource: &R, id: u64, wrap: F) -> Outcome<(ResourceSpec, Value)>
where
    R: Resource,
    F: FnOnce(R::Spec) -> ResourceSpec,
{
    let Outcome { state, diagnostics } = resource.import(id).await;
    let Some((spec, state)) = state else {
        return Outcome::with(None, diagnostics);
    };
    encode(Outcome::with(Some(state), diagnostics)).map(|value| (wrap(spec), value))
}

#[async_trait]
impl Driver for Provider {
    async fn create(&self, spec: &ResourceSpec) -> Outcome<Value> {
        match spec {
            ResourceSpec::Vswitch(spec) => create_with(&self.vswitch, spec).await,
            ResourceSpec::Firewall(spec) => create_with(&self.firewall, spec).await,
            ResourceSpec::ServerBulk(spec) => create_with(&self.server_bulk, spec).await,
            ResourceSpec::BootInstaller(spec) => create_with(&self.boot_installer, spec).await,
        }
    }

    async fn read(&self, spec: &ResourceSpec, state: &Value) -> Outcome<Value> {
        match spec {
            ResourceSpec::Vswitch(_) => read_with(&self.vswitch, state).await,
            ResourceSpec::Firewall(_) => read_with(&self.firewall, state).await,
            ResourceSpec::ServerBulk(_) => read_with(&self.server_bulk, state).await,
            ResourceSpec::BootInstaller(_) => read_with(&self.boot_installer, state).await,
        }
    }

    async fn update(&self, spec: &ResourceSpec, state: &Value) -> Outcome<Value> {
        match spec {
            ResourceSpec::Vswitch(spec) => update_with(&self.vswitch, spec, state).await,
            ResourceSpec::Firewall(spec) => update_with(&self.firewall, spec, state).await,
            ResourceSpec::ServerBulk(spec) => update_with(&self.server_bulk, spec, state).await,
            ResourceSpec::BootInstaller(spec) => {
                update_with(&self.boot_installer, spec, state).await
            }
        }
    }

    async fn delete(&self, spec: &ResourceSpec, state: &Value) -> Diagnostics {
        match spec {
            ResourceSpec::Vswitch(_) => delete_with(&self.vswitch, state).await,
            ResourceSpec::Firewall(_) => delete_with(&self.firewall, state).await,
            ResourceSpec::ServerBulk(_) => delete_with(&self.server_bulk, state).await,
            ResourceSpec::BootInstaller(_) => delete_with(&self.boot_installer, state).await,
        }
    }

    async fn import(&self, kind: &ResourceSpec, id: u64) -> Outcome<(ResourceSpec, Value)> {
        match kind {
            ResourceSpec::Vswitch(_) => import_with(&self.vswitch, id, ResourceSpec::Vswitch).await,
            ResourceSpec::Firewall(_) => {
                import_with(&self.firewall, id, ResourceSpec::Firewall).await
            }
            ResourceSpec::ServerBulk(_) => {
                import_with(&self.server_bulk, id, ResourceSpec::ServerBulk).await
            }
            ResourceSpec::BootInstaller(_) => {
                import_with(&self.boot_installer, id, ResourceSpec::BootInstaller).await
            }
        }
    }

    async fn query(&self, spec: &DataSourceSpec) -> std::result::Result<Value, Diagnostics> {
        data_sources::query(&self.client, spec)
            .await
            .map_err(|e| Diagnostic::error("Failed to read data source", e).into())
    }
}
