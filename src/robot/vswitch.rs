/// vSwitch endpoints and VLAN selection
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::client::{form, RobotClient};
use super::error::{Result, RobotError};
use super::models::VSwitch;
use super::server::FETCH_CONCURRENCY;
use crate::utils::polling::PollingConfig;

/// Lowest VLAN handed out by the picker
pub const VLAN_MIN: u16 = 4000;
/// Highest VLAN handed out by the picker
pub const VLAN_MAX: u16 = 4091;

/// Readiness polling: attempts and first interval
pub const READY_MAX_ATTEMPTS: u32 = 20;
const READY_INTERVAL: Duration = Duration::from_secs(15);
const READY_MAX_INTERVAL: Duration = Duration::from_secs(60);

/// VLANs of the pool not present in `used`
pub fn free_vlans(used: &BTreeSet<u16>) -> Vec<u16> {
    (VLAN_MIN..=VLAN_MAX).filter(|v| !used.contains(v)).collect()
}

/// Pick a free VLAN uniformly at random
pub fn pick_free_vlan<R: Rng + ?Sized>(used: &BTreeSet<u16>, rng: &mut R) -> Result<u16> {
    free_vlans(used)
        .choose(rng)
        .copied()
        .ok_or(RobotError::VlanPoolExhausted {
            min: VLAN_MIN,
            max: VLAN_MAX,
        })
}

/// Validate a cancellation date: "now" or YYYY-MM-DD
pub fn validate_cancellation_date(date: &str) -> Result<()> {
    if date == "now" {
        return Ok(());
    }
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|e| {
            RobotError::InvalidInput(format!(
                "cancellation_date must be \"now\" or YYYY-MM-DD, got {date:?}: {e}"
            ))
        })
}

fn server_form(servers: &[u64]) -> Vec<(String, String)> {
    servers
        .iter()
        .map(|id| ("server[]".to_string(), id.to_string()))
        .collect()
}

impl RobotClient {
    pub async fn list_vswitches(&self) -> Result<Vec<VSwitch>> {
        self.get("/vswitch").await
    }

    pub async fn get_vswitch(&self, id: u64) -> Result<VSwitch> {
        self.get(&format!("/vswitch/{id}")).await
    }

    /// Pick a VLAN no vSwitch of the account uses.
    ///
    /// Two concurrent callers can still pick the same VLAN.
    pub async fn pick_random_free_vlan(&self) -> Result<u16> {
        let used: BTreeSet<u16> = self
            .list_vswitches()
            .await?
            .iter()
            .map(|v| v.vlan)
            .collect();
        let vlan = pick_free_vlan(&used, &mut rand::thread_rng())?;
        debug!(vlan, used = used.len(), "Picked free VLAN");
        Ok(vlan)
    }

    pub async fn create_vswitch(&self, name: &str, vlan: u16) -> Result<VSwitch> {
        let vswitch: VSwitch = self
            .post_form("/vswitch", &form([("name", name.to_string()), ("vlan", vlan.to_string())]))
            .await?;
        info!(vswitch_id = vswitch.id, name = %name, vlan, "Created vSwitch");
        Ok(vswitch)
    }

    pub async fn update_vswitch(&self, id: u64, name: &str, vlan: u16) -> Result<()> {
        self.post_form_empty(
            &format!("/vswitch/{id}"),
            &form([("name", name.to_string()), ("vlan", vlan.to_string())]),
        )
        .await?;
        info!(vswitch_id = id, name = %name, vlan, "Updated vSwitch");
        Ok(())
    }

    pub async fn add_vswitch_servers(&self, id: u64, servers: &[u64]) -> Result<()> {
        if servers.is_empty() {
            return Ok(());
        }
        self.post_form_empty(&format!("/vswitch/{id}/server"), &server_form(servers))
            .await?;
        info!(vswitch_id = id, servers = ?servers, "Attached servers to vSwitch");
        Ok(())
    }

    pub async fn remove_vswitch_servers(&self, id: u64, servers: &[u64]) -> Result<()> {
        if servers.is_empty() {
            return Ok(());
        }
        self.delete(&format!("/vswitch/{id}/server"), Some(&server_form(servers)))
            .await?;
        info!(vswitch_id = id, servers = ?servers, "Detached servers from vSwitch");
        Ok(())
    }

    /// Cancel a vSwitch now or at the given date
    pub async fn cancel_vswitch(&self, id: u64, cancellation_date: &str) -> Result<()> {
        validate_cancellation_date(cancellation_date)?;
        self.delete(
            &format!("/vswitch/{id}"),
            Some(&form([("cancellation_date", cancellation_date)])),
        )
        .await?;
        info!(vswitch_id = id, cancellation_date = %cancellation_date, "Cancelled vSwitch");
        Ok(())
    }

    /// Wait until no attached server is still being processed
    pub async fn wait_vswitch_ready(&self, id: u64) -> Result<VSwitch> {
        let polling = PollingConfig::from_durations(
            READY_MAX_INTERVAL * READY_MAX_ATTEMPTS,
            READY_INTERVAL,
            format!("Waiting for vSwitch {id} to become ready"),
        )
        .with_backoff(1.5, READY_MAX_INTERVAL)
        .with_max_attempts(READY_MAX_ATTEMPTS);
        self.wait_vswitch_ready_with(id, &polling).await
    }

    pub(crate) async fn wait_vswitch_ready_with(
        &self,
        id: u64,
        polling: &PollingConfig,
    ) -> Result<VSwitch> {
        polling
            .poll(|| async move {
                let vswitch = self.get_vswitch(id).await?;
                let pending = vswitch.servers.iter().filter(|s| s.is_processing()).count();
                if pending > 0 {
                    debug!(vswitch_id = id, pending, "vSwitch servers still processing");
                    return Ok(None);
                }
                for failed in vswitch.servers.iter().filter(|s| s.is_failed()) {
                    warn!(vswitch_id = id, server_id = failed.server_number, "vSwitch attachment failed");
                }
                Ok(Some(vswitch))
            })
            .await
    }

    /// Fetch several vSwitches concurrently, sorted by id
    pub async fn fetch_vswitches_by_ids(&self, ids: &[u64]) -> Result<Vec<VSwitch>> {
        let results: Vec<Result<VSwitch>> = stream::iter(ids.iter().copied())
            .map(|id| async move {
                self.get_vswitch(id)
                    .await
                    .map_err(|e| RobotError::Aggregate(format!("vswitch {id}: {e}")))
            })
            .buffer_unordered(FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut vswitches = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(vswitch) => vswitches.push(vswitch),
                Err(e) => errors.push(e),
            }
        }

        if let Some(err) = RobotError::aggregate(errors) {
            return Err(err);
        }

        vswitches.sort_by_key(|v| v.id);
        Ok(vswitches)
    }
}
