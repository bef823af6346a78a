/// Shell scripts run inside the rescue system
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::robot::error::{Result, RobotError};

const DEFAULT_DISK: &str = "/dev/nvme0n1";

const WIPE_DISKS: &str = r#"for disk in $(lsblk -dn -o NAME,TYPE | awk '$2 == "disk" {print $1}'); do
  echo "Wiping disk /dev/$disk..."
  mdadm --zero-superblock "/dev/$disk" || true
  wipefs --all --force "/dev/$disk"
  dd if=/dev/zero of="/dev/$disk" bs=1M count=10 || true
done
sync
"#;

const IMAGE_INSTALL_TEMPLATE: &str = r#"#!/usr/bin/env bash
set -eux

mdadm --stop --scan || true
{{> wipe}}
cd /tmp
wget -q "{{image_url}}" -O image.raw.zst
zstd -d -f image.raw.zst -o image.raw
dd if=image.raw of="{{disk}}" bs=4M
sync

# reboot once the session has returned
nohup sh -c 'sleep 2; reboot' >/dev/null 2>&1 &
"#;

const WIPE_TEMPLATE: &str = r#"#!/usr/bin/env bash
set -eux

mdadm --stop --scan || true
{{> wipe}}"#;

const PROBE_TEMPLATE: &str = r#"mkdir -p "{{dir}}""#;

fn default_disk() -> String {
    DEFAULT_DISK.to_string()
}

/// What to do once the rescue system answers over SSH
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstallAction {
    /// Wipe every disk, then write a zstd-compressed raw image to `disk` and reboot
    Image {
        image_url: String,
        #[serde(default = "default_disk")]
        disk: String,
    },
    /// Wipe every disk reported by lsblk
    WipeDisks,
    /// Create a directory; proves SSH access without touching disks
    Probe { dir: String },
}

fn is_safe_path(path: &str) -> bool {
    path.starts_with('/')
        && path.len() > 1
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '.'))
}

impl InstallAction {
    /// Reject values that would break out of the quoted shell arguments
    pub fn validate(&self) -> Result<()> {
        match self {
            InstallAction::Image { image_url, disk } => {
                let parsed = url::Url::parse(image_url).map_err(|e| {
                    RobotError::InvalidInput(format!("invalid image_url {image_url:?}: {e}"))
                })?;
                if !matches!(parsed.scheme(), "http" | "https")
                    || image_url.contains(&['"', '$', '`', '\\'][..])
                {
                    return Err(RobotError::InvalidInput(format!(
                        "image_url must be a plain http(s) URL: {image_url:?}"
                    )));
                }
                if !disk.starts_with("/dev/") || !is_safe_path(disk) {
                    return Err(RobotError::InvalidInput(format!(
                        "disk must be a device path under /dev: {disk:?}"
                    )));
                }
            }
            InstallAction::WipeDisks => {}
            InstallAction::Probe { dir } => {
                if !is_safe_path(dir) {
                    return Err(RobotError::InvalidInput(format!(
                        "probe dir must be an absolute path: {dir:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Short label for logs and diagnostics
    pub fn describe(&self) -> &'static str {
        match self {
            InstallAction::Image { .. } => "image install",
            InstallAction::WipeDisks => "disk wipe",
            InstallAction::Probe { .. } => "probe",
        }
    }
}

/// Renders [`InstallAction`]s into shell scripts
pub struct ScriptRenderer {
    registry: Handlebars<'static>,
}

impl ScriptRenderer {
    pub fn new() -> Result<Self> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);

        let templates = [
            ("image", IMAGE_INSTALL_TEMPLATE),
            ("wipe_disks", WIPE_TEMPLATE),
            ("probe", PROBE_TEMPLATE),
        ];
        registry
            .register_partial("wipe", WIPE_DISKS)
            .map_err(|e| RobotError::InvalidInput(format!("bad script template: {e}")))?;
        for (name, template) in templates {
            registry
                .register_template_string(name, template)
                .map_err(|e| RobotError::InvalidInput(format!("bad script template {name}: {e}")))?;
        }

        Ok(Self { registry })
    }

    /// Validate the action and produce the script to execute
    pub fn render(&self, action: &InstallAction) -> Result<String> {
        action.validate()?;
        let (name, data) = match action {
            InstallAction::Image { image_url, disk } => {
                ("image", json!({"image_url": image_url, "disk": disk}))
            }
            InstallAction::WipeDisks => ("wipe_disks", json!({})),
            InstallAction::Probe { dir } => ("probe", json!({"dir": dir})),
        };

        self.registry
            .render(name, &data)
            .map_err(|e| RobotError::InvalidInput(format!("failed to render {name} script: {e}")))
    }
}
