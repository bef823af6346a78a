/// State file and reconcile engine
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::config::Manifest;
use crate::resources::{DataSourceSpec, Diagnostics, Outcome, ResourceSpec, Severity};

pub const STATE_VERSION: u32 = 1;

/// Executes resource operations on untyped state
#[async_trait]
pub trait Driver: Send + Sync {
    async fn create(&self, spec: &ResourceSpec) -> Outcome<Value>;

    async fn read(&self, spec: &ResourceSpec, state: &Value) -> Outcome<Value>;

    async fn update(&self, spec: &ResourceSpec, state: &Value) -> Outcome<Value>;

    async fn delete(&self, spec: &ResourceSpec, state: &Value) -> Diagnostics;

    /// `kind` only selects the resource type; its fields are ignored
    async fn import(&self, kind: &ResourceSpec, id: u64) -> Outcome<(ResourceSpec, Value)>;

    async fn query(&self, spec: &DataSourceSpec) -> std::result::Result<Value, Diagnostics>;
}

/// What was applied for one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub spec: ResourceSpec,
    pub state: Value,
    /// Created with errors; the next apply replaces it
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tainted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u32,
    /// Bumped on every save
    pub serial: u64,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRecord>,
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            resources: BTreeMap::new(),
            data: BTreeMap::new(),
        }
    }
}

impl StateFile {
    /// Load state; a missing file is an empty state
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file {}", path.display()))?;
        let state: StateFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file {}", path.display()))?;
        if state.version != STATE_VERSION {
            bail!(
                "state file {} has version {}, expected {}",
                path.display(),
                state.version,
                STATE_VERSION
            );
        }
        Ok(state)
    }

    /// Write to a sibling temp file, then rename over the old state
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.serial += 1;
        let content = serde_json::to_string_pretty(self).context("Failed to encode state")?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace state file {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Create,
    Update,
    Replace,
    Delete,
    NoChange,
}

impl ChangeAction {
    fn symbol(&self) -> &'static str {
        match self {
            ChangeAction::Create => "+",
            ChangeAction::Update => "~",
            ChangeAction::Replace => "-/+",
            ChangeAction::Delete => "-",
            ChangeAction::NoChange => " ",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub name: String,
    pub type_name: &'static str,
    pub action: ChangeAction,
}

/// Ordered changes: deletions first, then the manifest in name order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub changes: Vec<Change>,
}

impl Plan {
    pub fn count(&self, action: ChangeAction) -> usize {
        self.changes.iter().filter(|c| c.action == action).count()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.iter().all(|c| c.action == ChangeAction::NoChange)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for change in self.changes.iter().filter(|c| c.action != ChangeAction::NoChange) {
            writeln!(f, "  {} {} ({})", change.action.symbol(), change.name, change.type_name)?;
        }
        write!(
            f,
            "Plan: {} to create, {} to update, {} to replace, {} to destroy.",
            self.count(ChangeAction::Create),
            self.count(ChangeAction::Update),
            self.count(ChangeAction::Replace),
            self.count(ChangeAction::Delete)
        )
    }
}

/// Diff the manifest against recorded state
pub fn plan(manifest: &Manifest, state: &StateFile) -> Plan {
    let mut changes: Vec<Change> = state
        .resources
        .iter()
        .filter(|(name, _)| !manifest.resources.contains_key(*name))
        .map(|(name, record)| Change {
            name: name.clone(),
            type_name: record.spec.type_name(),
            action: ChangeAction::Delete,
        })
        .collect();

    for (name, spec) in &manifest.resources {
        let action = match state.resources.get(name) {
            None => ChangeAction::Create,
            Some(record) if record.tainted || spec.requires_replace(&record.spec) => {
                ChangeAction::Replace
            }
            Some(record) if record.spec == *spec => ChangeAction::NoChange,
            Some(_) => ChangeAction::Update,
        };
        changes.push(Change {
            name: name.clone(),
            type_name: spec.type_name(),
            action,
        });
    }

    Plan { changes }
}

fn log_diagnostics(name: &str, diagnostics: &Diagnostics) {
    for diagnostic in diagnostics.iter() {
        match diagnostic.severity {
            Severity::Error => error!(resource = %name, "{}: {}", diagnostic.summary, diagnostic.detail),
            Severity::Warning => warn!(resource = %name, "{}: {}", diagnostic.summary, diagnostic.detail),
        }
    }
}

/// Reconciles a manifest with the state file through a [`Driver`]
pub struct Engine<D> {
    driver: D,
    state_path: PathBuf,
}

impl<D: Driver> Engine<D> {
    pub fn new(driver: D, state_path: impl Into<PathBuf>) -> Self {
        Self {
            driver,
            state_path: state_path.into(),
        }
    }

    pub fn load_state(&self) -> Result<StateFile> {
        StateFile::load(&self.state_path)
    }

    pub fn plan(&self, manifest: &Manifest) -> Result<Plan> {
        Ok(plan(manifest, &self.load_state()?))
    }

    /// Apply the plan, saving state after every resource
    pub async fn apply(&self, manifest: &Manifest) -> Result<Plan> {
        let mut state = self.load_state()?;
        let plan = plan(manifest, &state);
        let mut failed = 0usize;

        for change in &plan.changes {
            let name = change.name.as_str();
            let spec = manifest.resources.get(name);
            let diagnostics = match (change.action, spec) {
                (ChangeAction::NoChange, _) => continue,
                (ChangeAction::Delete, _) => self.delete_resource(&mut state, name).await,
                (ChangeAction::Create, Some(spec)) => self.create_resource(&mut state, name, spec).await,
                (ChangeAction::Update, Some(spec)) => self.update_resource(&mut state, name, spec).await,
                (_, None) => continue,
                (ChangeAction::Replace, Some(spec)) => {
                    let deleted = self.delete_resource(&mut state, name).await;
                    if deleted.has_errors() {
                        deleted
                    } else {
                        self.create_resource(&mut state, name, spec).await
                    }
                }
            };
            log_diagnostics(name, &diagnostics);
            if diagnostics.has_errors() {
                failed += 1;
            }
            state.save(&self.state_path)?;
        }

        failed += self.query_data(manifest, &mut state).await;
        state.save(&self.state_path)?;

        if failed > 0 {
            bail!("apply finished with errors in {failed} item(s)");
        }
        Ok(plan)
    }

    /// Delete every recorded resource, in reverse name order
    pub async fn destroy(&self) -> Result<usize> {
        let mut state = self.load_state()?;
        let names: Vec<String> = state.resources.keys().rev().cloned().collect();
        let mut failed = 0usize;

        for name in &names {
            let diagnostics = self.delete_resource(&mut state, name).await;
            log_diagnostics(name, &diagnostics);
            if diagnostics.has_errors() {
                failed += 1;
            }
            state.save(&self.state_path)?;
        }
        state.data.clear();
        state.save(&self.state_path)?;

        if failed > 0 {
            bail!("destroy left {failed} resource(s) in state");
        }
        Ok(names.len())
    }

    /// Re-read every resource and data source; vanished resources leave state
    pub async fn refresh(&self, manifest: &Manifest) -> Result<StateFile> {
        let mut state = self.load_state()?;
        let names: Vec<String> = state.resources.keys().cloned().collect();
        let mut failed = 0usize;

        for name in &names {
            let Some(record) = state.resources.get(name).cloned() else {
                continue;
            };
            let Outcome {
                state: refreshed,
                diagnostics,
            } = self.driver.read(&record.spec, &record.state).await;
            log_diagnostics(name, &diagnostics);

            if diagnostics.has_errors() {
                failed += 1;
            } else if let Some(value) = refreshed {
                if let Some(record) = state.resources.get_mut(name) {
                    record.state = value;
                }
            } else {
                warn!(resource = %name, "Resource is gone, removing from state");
                state.resources.remove(name);
            }
        }

        failed += self.query_data(manifest, &mut state).await;
        state.save(&self.state_path)?;

        if failed > 0 {
            bail!("refresh finished with errors in {failed} item(s)");
        }
        Ok(state)
    }

    /// Adopt an existing remote object under a manifest name
    pub async fn import(&self, manifest: &Manifest, name: &str, id: u64) -> Result<()> {
        let mut state = self.load_state()?;
        if state.resources.contains_key(name) {
            bail!("resource {name} is already managed");
        }
        let kind = manifest
            .resources
            .get(name)
            .with_context(|| format!("resource {name} is not declared in the manifest"))?;

        let Outcome {
            state: imported,
            diagnostics,
        } = self.driver.import(kind, id).await;
        log_diagnostics(name, &diagnostics);
        let Some((spec, value)) = imported else {
            bail!("failed to import {} {id} as {name}", kind.type_name());
        };

        info!(resource = %name, id, "Imported");
        state.resources.insert(
            name.to_string(),
            ResourceRecord {
                spec,
                state: value,
                tainted: false,
            },
        );
        state.save(&self.state_path)
    }

    async fn create_resource(&self, state: &mut StateFile, name: &str, spec: &ResourceSpec) -> Diagnostics {
        info!(resource = %name, kind = spec.type_name(), "Creating");
        let Outcome {
            state: created,
            diagnostics,
        } = self.driver.create(spec).await;
        if let Some(value) = created {
            state.resources.insert(
                name.to_string(),
                ResourceRecord {
                    spec: spec.clone(),
                    state: value,
                    tainted: diagnostics.has_errors(),
                },
            );
        }
        diagnostics
    }

    /// A failed update keeps the prior spec so the change is retried
    async fn update_resource(&self, state: &mut StateFile, name: &str, spec: &ResourceSpec) -> Diagnostics {
        let Some(record) = state.resources.get_mut(name) else {
            return Diagnostics::new();
        };
        info!(resource = %name, kind = spec.type_name(), "Updating");
        let Outcome {
            state: updated,
            diagnostics,
        } = self.driver.update(spec, &record.state).await;
        if let Some(value) = updated {
            record.state = value;
            if !diagnostics.has_errors() {
                record.spec = spec.clone();
            }
        }
        diagnostics
    }

    async fn delete_resource(&self, state: &mut StateFile, name: &str) -> Diagnostics {
        let Some(record) = state.resources.get(name) else {
            return Diagnostics::new();
        };
        info!(resource = %name, kind = record.spec.type_name(), "Destroying");
        let diagnostics = self.driver.delete(&record.spec, &record.state).await;
        if !diagnostics.has_errors() {
            state.resources.remove(name);
        }
        diagnostics
    }

    /// Returns the number of failed queries
    async fn query_data(&self, manifest: &Manifest, state: &mut StateFile) -> usize {
        state.data.retain(|name, _| manifest.data.contains_key(name));
        let mut failed = 0usize;
        for (name, spec) in &manifest.data {
            match self.driver.query(spec).await {
                Ok(value) => {
                    state.data.insert(name.clone(), value);
                }
                Err(diagnostics) => {
                    log_diagnostics(name, &diagnostics);
                    failed += 1;
                }
            }
        }
        failed
    }
}
