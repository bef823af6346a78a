/// Managed resources and data sources on top of the Robot client
pub mod boot_installer;
pub mod data_sources;
pub mod firewall;
pub mod provider;
pub mod server_bulk;
pub mod vswitch;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::robot::RobotError;

pub use boot_installer::BootInstallerSpec;
pub use data_sources::DataSourceSpec;
pub use firewall::FirewallSpec;
pub use provider::Provider;
pub use server_bulk::ServerBulkSpec;
pub use vswitch::VSwitchSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// A user-facing problem report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    pub detail: String,
}

impl Diagnostic {
    pub fn error(summary: impl Into<String>, detail: impl fmt::Display) -> Self {
        Self {
            severity: Severity::Error,
            summary: summary.into(),
            detail: detail.to_string(),
        }
    }

    pub fn warning(summary: impl Into<String>, detail: impl fmt::Display) -> Self {
        Self {
            severity: Severity::Warning,
            summary: summary.into(),
            detail: detail.to_string(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{level}: {}: {}", self.summary, self.detail)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.0.push(diagnostic);
    }

    pub fn has_errors(&self) -> bool {
        self.0.iter().any(|d| d.severity == Severity::Error)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter()
    }
}

impl From<Diagnostic> for Diagnostics {
    fn from(diagnostic: Diagnostic) -> Self {
        Self(vec![diagnostic])
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        f.write_str(&lines.join("\n"))
    }
}

/// Result of a resource operation.
///
/// `state: None` after a read means the remote object is gone and the
/// resource should be dropped from state.
#[derive(Debug)]
pub struct Outcome<S> {
    pub state: Option<S>,
    pub diagnostics: Diagnostics,
}

impl<S> Outcome<S> {
    pub fn ok(state: S) -> Self {
        Self {
            state: Some(state),
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn removed() -> Self {
        Self {
            state: None,
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn failed(diagnostic: Diagnostic) -> Self {
        Self {
            state: None,
            diagnostics: diagnostic.into(),
        }
    }

    pub fn with(state: Option<S>, diagnostics: Diagnostics) -> Self {
        Self { state, diagnostics }
    }

    /// Turn an error into a failed outcome with the given summary
    pub fn from_error(summary: impl Into<String>, error: RobotError) -> Self {
        Self::failed(Diagnostic::error(summary, error))
    }

    pub fn map<T>(self, f: impl FnOnce(S) -> T) -> Outcome<T> {
        Outcome {
            state: self.state.map(f),
            diagnostics: self.diagnostics,
        }
    }
}

/// Create/read/update/delete lifecycle of one resource type
#[async_trait]
pub trait Resource: Send + Sync {
    type Spec: Serialize + DeserializeOwned + Send + Sync;
    type State: Serialize + DeserializeOwned + Send + Sync;

    const TYPE_NAME: &'static str;

    async fn create(&self, spec: &Self::Spec) -> Outcome<Self::State>;

    async fn read(&self, state: &Self::State) -> Outcome<Self::State>;

    async fn update(&self, spec: &Self::Spec, state: &Self::State) -> Outcome<Self::State>;

    async fn delete(&self, state: &Self::State) -> Diagnostics;

    /// Adopt an existing remote object by its Robot id
    async fn import(&self, _id: u64) -> Outcome<(Self::Spec, Self::State)> {
        Outcome::failed(Diagnostic::error(
            "Import not supported",
            format!("{} resources cannot be imported", Self::TYPE_NAME),
        ))
    }
}

/// Any resource the manifest can declare
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceSpec {
    Vswitch(VSwitchSpec),
    Firewall(FirewallSpec),
    ServerBulk(ServerBulkSpec),
    BootInstaller(BootInstallerSpec),
}

impl ResourceSpec {
    pub fn type_name(&self) -> &'static str {
        match self {
            ResourceSpec::Vswitch(_) => vswitch::VSwitchResource::TYPE_NAME,
            ResourceSpec::Firewall(_) => firewall::FirewallResource::TYPE_NAME,
            ResourceSpec::ServerBulk(_) => server_bulk::ServerBulkResource::TYPE_NAME,
            ResourceSpec::BootInstaller(_) => boot_installer::TYPE_NAME,
        }
    }

    pub fn validate(&self) -> Result<(), RobotError> {
        match self {
            ResourceSpec::Vswitch(spec) => spec.validate(),
            ResourceSpec::Firewall(spec) => spec.validate(),
            ResourceSpec::ServerBulk(spec) => spec.validate(),
            ResourceSpec::BootInstaller(spec) => spec.validate(),
        }
    }

    /// Whether moving from `prior` to `self` needs destroy-then-create
    pub fn requires_replace(&self, prior: &ResourceSpec) -> bool {
        match (self, prior) {
            (ResourceSpec::Vswitch(_), ResourceSpec::Vswitch(_)) => false,
            (ResourceSpec::Firewall(new), ResourceSpec::Firewall(old)) => {
                new.server_id != old.server_id
            }
            (ResourceSpec::ServerBulk(_), ResourceSpec::ServerBulk(_)) => false,
            (ResourceSpec::BootInstaller(new), ResourceSpec::BootInstaller(old)) => {
                new.requires_reinstall(old)
            }
            _ => true,
        }
    }
}
