//! Host-side networking for microVMs: one shared bridge, one tap per VM.

use blueprint_sdk::{debug, info};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::process::Command;

use crate::error::{Result, SandboxError};

const ARP_TABLE: &str = "/proc/net/arp";

/// `tap-` plus 10 hex chars stays within IFNAMSIZ (15).
pub fn tap_name(vm_id: &str) -> String {
    let digest = Sha256::digest(vm_id.as_bytes());
    format!("tap-{}", &hex::encode(digest)[..10])
}

/// Locally administered unicast MAC derived from the VM ID, stable across restarts.
pub fn mac_address(vm_id: &str) -> String {
    let digest = Sha256::digest(vm_id.as_bytes());
    let mut octets = [0u8; 6];
    octets.copy_from_slice(&digest[..6]);
    octets[0] = (octets[0] | 0x02) & 0xfe;
    octets
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Find the IPv4 address the host has learned for `mac` in a `/proc/net/arp` dump.
pub fn parse_arp_table(table: &str, mac: &str) -> Option<String> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [ip, _hw_type, _flags, hw_addr, ..] if hw_addr.eq_ignore_ascii_case(mac) => {
                Some((*ip).to_string())
            }
            _ => None,
        }
    })
}

/// Bridge and tap plumbing on the host.
#[async_trait::async_trait]
pub trait HostNetwork: Send + Sync {
    /// Create the bridge if missing and bring it up. Idempotent.
    async fn ensure_bridge(&self) -> Result<()>;

    /// Create a tap device attached to the bridge and bring it up.
    async fn create_tap(&self, name: &str) -> Result<()>;

    async fn delete_tap(&self, name: &str) -> Result<()>;

    /// Address the guest obtained, if the host has seen it yet.
    async fn lookup_ip(&self, mac: &str) -> Option<String>;
}

/// [`HostNetwork`] backed by the `ip` command.
pub struct IpNetwork {
    bridge: String,
    arp_table: PathBuf,
}

impl IpNetwork {
    pub fn new(bridge: impl Into<String>) -> Self {
        Self {
            bridge: bridge.into(),
            arp_table: PathBuf::from(ARP_TABLE),
        }
    }

    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    async fn ip(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("ip")
            .args(args)
            .output()
            .await
            .map_err(|e| SandboxError::Network(format!("failed to run ip {}: {e}", args.join(" "))))?;
        if !output.status.success() {
            return Err(SandboxError::Network(format!(
                "ip {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn bridge_exists(&self) -> bool {
        Command::new("ip")
            .args(["link", "show", &self.bridge])
            .output()
            .await
            .is_ok_and(|output| output.status.success())
    }
}

#[async_trait::async_trait]
impl HostNetwork for IpNetwork {
    async fn ensure_bridge(&self) -> Result<()> {
        if !self.bridge_exists().await {
            info!("microvm: creating bridge {}", self.bridge);
            if let Err(err) = self.ip(&["link", "add", &self.bridge, "type", "bridge"]).await {
                // Another caller may have created it concurrently.
                if !self.bridge_exists().await {
                    return Err(err);
                }
            }
        }
        self.ip(&["link", "set", &self.bridge, "up"]).await
    }

    async fn create_tap(&self, name: &str) -> Result<()> {
        self.ensure_bridge().await?;
        // A tap left behind by a crashed run would make `tuntap add` fail.
        let _ = self.ip(&["link", "delete", name]).await;
        self.ip(&["tuntap", "add", name, "mode", "tap"]).await?;
        let attached = async {
            self.ip(&["link", "set", name, "master", &self.bridge]).await?;
            self.ip(&["link", "set", name, "up"]).await
        };
        if let Err(err) = attached.await {
            let _ = self.ip(&["link", "delete", name]).await;
            return Err(err);
        }
        debug!("microvm: tap {name} attached to {}", self.bridge);
        Ok(())
    }

    async fn delete_tap(&self, name: &str) -> Result<()> {
        self.ip(&["link", "delete", name]).await
    }

    async fn lookup_ip(&self, mac: &str) -> Option<String> {
        let table = tokio::fs::read_to_string(&self.arp_table).await.ok()?;
        parse_arp_table(&table, mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_name_is_stable_and_short() {
        let name = tap_name("vm-t1-dev");
        assert_eq!(name, tap_name("vm-t1-dev"));
        assert_ne!(name, tap_name("vm-t1-other"));
        assert!(name.starts_with("tap-"));
        assert_eq!(name.len(), 14);
    }

    #[test]
    fn mac_is_locally_administered_unicast() {
        for id in ["vm-a-b", "vm-t1-dev", "vm-tenant-with-a-long-name"] {
            let mac = mac_address(id);
            assert_eq!(mac, mac_address(id));
            assert_eq!(mac.split(':').count(), 6);
            let first = u8::from_str_radix(&mac[..2], 16).unwrap();
            assert_eq!(first & 0x02, 0x02, "{mac} not locally administered");
            assert_eq!(first & 0x01, 0x00, "{mac} is multicast");
        }
    }

    #[test]
    fn arp_lookup_matches_mac_case_insensitively() {
        let table = "\
IP address       HW type     Flags       HW address            Mask     Device
172.16.0.5       0x1         0x2         02:ab:cd:ef:01:23     *        sandbox-br0
172.16.0.9       0x1         0x2         06:00:00:00:00:01     *        sandbox-br0
";
        assert_eq!(
            parse_arp_table(table, "02:AB:CD:EF:01:23").as_deref(),
            Some("172.16.0.5")
        );
        assert_eq!(parse_arp_table(table, "06:00:00:00:00:02"), None);
        assert_eq!(parse_arp_table("", "06:00:00:00:00:01"), None);
    }
}
