/// robot-provision - declarative provisioning for Hetzner Robot
///
/// Manages vSwitches, server firewalls, server names and rescue-mode OS
/// installs on dedicated servers from a YAML manifest.
mod config;
mod provision;
mod resources;
mod robot;
mod ssh;
mod state;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Manifest, ProviderSettings, RobotConfig};
use crate::resources::data_sources::{query_servers, query_vswitches};
use crate::resources::Provider;
use crate::robot::RobotClient;
use crate::state::Engine;

#[derive(Parser)]
#[command(name = "robot-provision")]
#[command(about = "Provision Hetzner dedicated servers through the Robot API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Manifest file path
    #[arg(short, long, global = true, default_value = "robot.yaml")]
    manifest: PathBuf,

    /// State file path
    #[arg(short, long, global = true, default_value = "robot.state.json")]
    state: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an example manifest
    Init,

    /// Show the changes apply would make
    Plan,

    /// Create, update and delete resources to match the manifest
    Apply,

    /// Delete every resource recorded in state
    Destroy,

    /// Re-read resources and data sources into state
    Refresh,

    /// Adopt an existing vSwitch or firewall
    Import {
        /// Resource name in the manifest
        name: String,

        /// vSwitch id, or server number for a firewall
        id: u64,
    },

    /// List servers
    Servers {
        /// Only these server numbers
        #[arg(long = "id")]
        ids: Vec<u64>,
    },

    /// List vSwitches
    Vswitches {
        /// Only these vSwitch ids
        #[arg(long = "id")]
        ids: Vec<u64>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("robot_provision={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Init => init_manifest(&cli).await,
        Commands::Plan => show_plan(&cli),
        Commands::Apply => apply(&cli).await,
        Commands::Destroy => destroy(&cli).await,
        Commands::Refresh => refresh(&cli).await,
        Commands::Import { ref name, id } => import(&cli, name, id).await,
        Commands::Servers { ref ids } => list_servers(&cli, ids).await,
        Commands::Vswitches { ref ids } => list_vswitches(&cli, ids).await,
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_manifest(cli: &Cli) -> Result<Manifest> {
    Manifest::from_file(&cli.manifest)
        .with_context(|| format!("Failed to load manifest {}", cli.manifest.display()))
}

/// Provider settings from the manifest when present, else the environment alone
fn provider_settings(cli: &Cli) -> Result<ProviderSettings> {
    if cli.manifest.exists() {
        Ok(load_manifest(cli)?.provider)
    } else {
        Ok(ProviderSettings::default())
    }
}

fn robot_client(settings: &ProviderSettings) -> Result<RobotClient> {
    let config = RobotConfig::resolve(settings).context("Failed to resolve Robot credentials")?;
    let client = RobotClient::new(config).context("Failed to create Robot client")?;
    debug!(base_url = client.base_url(), "Robot client ready");
    Ok(client)
}

fn engine(cli: &Cli, manifest: &Manifest) -> Result<Engine<Provider>> {
    let client = robot_client(&manifest.provider)?;
    let provider = Provider::new(client, &manifest.provider.rescue).context("Failed to set up provider")?;
    Ok(Engine::new(provider, &cli.state))
}

async fn init_manifest(cli: &Cli) -> Result<()> {
    if cli.manifest.exists() {
        anyhow::bail!("Manifest already exists: {}", cli.manifest.display());
    }

    let yaml = serde_yaml::to_string(&Manifest::example())?;
    tokio::fs::write(&cli.manifest, yaml)
        .await
        .context("Failed to write manifest")?;

    info!("Example manifest created: {}", cli.manifest.display());
    info!("");
    info!("Next steps:");
    info!("  1. Replace the example server numbers with your own");
    info!("  2. Set your Robot webservice credentials:");
    info!("     export HETZNERROBOT_USERNAME=your-user");
    info!("     export HETZNERROBOT_PASSWORD=your-password");
    info!("  3. Review and apply:");
    info!("     robot-provision plan && robot-provision apply");

    Ok(())
}

fn show_plan(cli: &Cli) -> Result<()> {
    let manifest = load_manifest(cli)?;
    let state = state::StateFile::load(&cli.state)?;
    let plan = state::plan(&manifest, &state);

    if plan.is_empty() {
        info!("No changes. Resources match the manifest.");
    } else {
        println!("{plan}");
    }
    Ok(())
}

async fn apply(cli: &Cli) -> Result<()> {
    let manifest = load_manifest(cli)?;
    let engine = engine(cli, &manifest)?;

    let plan = engine.plan(&manifest)?;
    if plan.is_empty() && manifest.data.is_empty() {
        info!("No changes. Resources match the manifest.");
        return Ok(());
    }

    let applied = engine.apply(&manifest).await?;
    info!(
        "Apply complete: {} created, {} updated, {} replaced, {} destroyed",
        applied.count(state::ChangeAction::Create),
        applied.count(state::ChangeAction::Update),
        applied.count(state::ChangeAction::Replace),
        applied.count(state::ChangeAction::Delete)
    );
    Ok(())
}

async fn destroy(cli: &Cli) -> Result<()> {
    let manifest = load_manifest(cli)?;
    let destroyed = engine(cli, &manifest)?.destroy().await?;
    info!("Destroy complete: {} resource(s) destroyed", destroyed);
    Ok(())
}

async fn refresh(cli: &Cli) -> Result<()> {
    let manifest = load_manifest(cli)?;
    let state = engine(cli, &manifest)?.refresh(&manifest).await?;
    info!(
        "Refreshed {} resource(s) and {} data source(s)",
        state.resources.len(),
        state.data.len()
    );
    Ok(())
}

async fn import(cli: &Cli, name: &str, id: u64) -> Result<()> {
    let manifest = load_manifest(cli)?;
    engine(cli, &manifest)?.import(&manifest, name, id).await?;
    info!("Imported {} as {}", id, name);
    Ok(())
}

async fn list_servers(cli: &Cli, ids: &[u64]) -> Result<()> {
    let client = robot_client(&provider_settings(cli)?)?;
    let servers = query_servers(&client, ids)
        .await
        .context("Failed to fetch servers")?;

    if servers.is_empty() {
        info!("No servers found");
        return Ok(());
    }
    for server in servers {
        info!(
            "  - {} (ID: {}, IP: {}, Product: {}, DC: {}, Status: {})",
            server.name, server.number, server.ip, server.product, server.datacenter, server.status
        );
    }
    Ok(())
}

async fn list_vswitches(cli: &Cli, ids: &[u64]) -> Result<()> {
    let client = robot_client(&provider_settings(cli)?)?;
    let vswitches = query_vswitches(&client, ids)
        .await
        .context("Failed to fetch vSwitches")?;

    if vswitches.is_empty() {
        info!("No vSwitches found");
        return Ok(());
    }
    for vswitch in vswitches {
        let members: Vec<String> = vswitch
            .servers
            .iter()
            .map(|s| format!("{} ({})", s.server_number, s.status))
            .collect();
        info!(
            "  - {} (ID: {}, VLAN: {}, Cancelled: {}, Servers: [{}])",
            vswitch.name,
            vswitch.id,
            vswitch.vlan,
            vswitch.cancelled,
            members.join(", ")
        );
    }
    Ok(())
}
