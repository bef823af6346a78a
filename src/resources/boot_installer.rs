/// Boot installer resource: reinstall servers through the rescue system
use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::server_bulk::validate_targets;
use super::{Diagnostic, Diagnostics, Outcome, Resource};
use crate::provision::script::InstallAction;
use crate::provision::{
    BulkOptions, BulkReport, Orchestrator, RobotApi, ServerFailure, Timeouts, DEFAULT_CONCURRENCY,
    DEFAULT_RESCUE_OS,
};
use crate::robot::error::{Result, RobotError};
use crate::robot::models::ResetType;
use crate::robot::ServerTarget;
use crate::ssh::RemoteExecutor;
use crate::utils::probe::HostProber;

pub const TYPE_NAME: &str = "boot_installer";

fn default_rescue_os() -> String {
    DEFAULT_RESCUE_OS.to_string()
}

fn default_reset_type() -> ResetType {
    ResetType::Hw
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

/// Overrides of the waiting steps, in seconds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_settle_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ready_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_down_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_reachable_secs: Option<u64>,
}

impl TimeoutSettings {
    fn is_default(&self) -> bool {
        self == &Self::default()
    }

    fn apply(&self, mut timeouts: Timeouts) -> Timeouts {
        let fields = [
            (self.reset_settle_secs, &mut timeouts.reset_settle),
            (self.server_ready_secs, &mut timeouts.server_ready),
            (self.host_down_secs, &mut timeouts.host_down),
            (self.host_reachable_secs, &mut timeouts.host_reachable),
        ];
        for (secs, target) in fields {
            if let Some(secs) = secs {
                *target = Duration::from_secs(secs);
            }
        }
        timeouts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootInstallerSpec {
    pub servers: Vec<ServerTarget>,
    #[serde(default = "default_rescue_os")]
    pub rescue_os: String,
    /// Fingerprints of SSH keys stored in Robot
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    pub action: InstallAction,
    #[serde(default = "default_reset_type")]
    pub reset_type: ResetType,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default, skip_serializing_if = "TimeoutSettings::is_default")]
    pub timeouts: TimeoutSettings,
}

impl BootInstallerSpec {
    pub fn validate(&self) -> Result<()> {
        validate_targets(&self.servers)?;
        if self.concurrency == 0 {
            return Err(RobotError::InvalidInput("concurrency must be at least 1".to_string()));
        }
        if self.reset_type == ResetType::Man {
            return Err(RobotError::InvalidInput(
                "manual reset cannot be used to boot into rescue".to_string(),
            ));
        }
        self.action.validate()
    }

    /// Anything but a rename means installing again
    pub fn requires_reinstall(&self, prior: &BootInstallerSpec) -> bool {
        let ids = |spec: &BootInstallerSpec| {
            let mut ids: Vec<u64> = spec.servers.iter().map(|t| t.id).collect();
            ids.sort_unstable();
            ids
        };
        ids(self) != ids(prior)
            || self.rescue_os != prior.rescue_os
            || self.ssh_keys != prior.ssh_keys
            || self.action != prior.action
    }

    fn options(&self) -> BulkOptions {
        BulkOptions {
            rescue_os: self.rescue_os.clone(),
            ssh_keys: self.ssh_keys.clone(),
            reset_type: self.reset_type,
            concurrency: self.concurrency,
            fail_fast: self.fail_fast,
            timeouts: self.timeouts.apply(Timeouts::default()),
            ..BulkOptions::new(self.action.clone())
        }
    }
}

/// A server that went through the full workflow.
///
/// `password` is the one-time rescue password used for the install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledServer {
    pub id: u64,
    pub name: String,
    pub ip: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootInstallerState {
    pub results: Vec<InstalledServer>,
}

fn failure_diagnostic(failure: &ServerFailure) -> Diagnostic {
    let summary = format!("Server {} ({})", failure.server_id, failure.name);
    if failure.is_cancelled() {
        Diagnostic::warning(summary, format!("skipped at {}: {}", failure.step, failure.error))
    } else {
        Diagnostic::error(summary, format!("failed at {}: {}", failure.step, failure.error))
    }
}

fn report_outcome(report: BulkReport) -> Outcome<BootInstallerState> {
    let mut diagnostics = Diagnostics::new();
    for failure in &report.failures {
        diagnostics.push(failure_diagnostic(failure));
    }
    let results: Vec<InstalledServer> = report
        .results
        .into_iter()
        .map(|r| InstalledServer {
            id: r.server_id,
            name: r.name,
            ip: r.ip,
            password: r.password.expose_secret().to_owned(),
        })
        .collect();

    let state = (!results.is_empty()).then_some(BootInstallerState { results });
    Outcome::with(state, diagnostics)
}

pub struct BootInstallerResource<A, P, E> {
    api: Arc<A>,
    orchestrator: Orchestrator<A, P, E>,
}

impl<A, P, E> BootInstallerResource<A, P, E>
where
    A: RobotApi + 'static,
    P: HostProber + 'static,
    E: RemoteExecutor + 'static,
{
    pub fn new(api: Arc<A>, prober: Arc<P>, executor: Arc<E>) -> Result<Self> {
        let orchestrator = Orchestrator::new(Arc::clone(&api), prober, executor)?;
        Ok(Self { api, orchestrator })
    }
}

#[async_trait]
impl<A, P, E> Resource for BootInstallerResource<A, P, E>
where
    A: RobotApi + 'static,
    P: HostProber + 'static,
    E: RemoteExecutor + 'static,
{
    type Spec = BootInstallerSpec;
    type State = BootInstallerState;

    const TYPE_NAME: &'static str = TYPE_NAME;

    async fn create(&self, spec: &BootInstallerSpec) -> Outcome<BootInstallerState> {
        match self.orchestrator.run(spec.servers.clone(), spec.options()).await {
            Ok(report) => report_outcome(report),
            Err(e) => Outcome::from_error("Failed to start provisioning", e),
        }
    }

    /// Installs cannot be observed remotely; the stored results stand
    async fn read(&self, state: &BootInstallerState) -> Outcome<BootInstallerState> {
        Outcome::ok(state.clone())
    }

    async fn update(&self, spec: &BootInstallerSpec, state: &BootInstallerState) -> Outcome<BootInstallerState> {
        let desired: BTreeMap<u64, &str> = spec
            .servers
            .iter()
            .map(|t| (t.id, t.name.as_str()))
            .collect();

        let mut diagnostics = Diagnostics::new();
        let mut results = state.results.clone();
        for server in results.iter_mut() {
            let Some(name) = desired.get(&server.id).copied() else {
                continue;
            };
            if server.name == name {
                continue;
            }
            match self.api.rename_server(server.id, name).await {
                Ok(_) => {
                    info!(server_id = server.id, name = %name, "Renamed provisioned server");
                    server.name = name.to_string();
                }
                Err(e) => diagnostics.push(Diagnostic::error(
                    format!("Failed to rename server {}", server.id),
                    e,
                )),
            }
        }

        Outcome::with(Some(BootInstallerState { results }), diagnostics)
    }

    async fn delete(&self, state: &BootInstallerState) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();
        for server in &state.results {
            if let Err(e) = self.api.reset_server(server.id, ResetType::Hw).await {
                diagnostics.push(Diagnostic::error(
                    format!("Failed to reset server {}", server.id),
                    e,
                ));
            }
        }
        diagnostics
    }
}
