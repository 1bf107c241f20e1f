//! Discovery publisher: mDNS on `local.` plus optional wide-area records
//! under `clawdbot.internal.`.
//!
//! The wide-area side produces plain DNS-SD record tuples written to a
//! records file under the state directory; the local DNS server that serves
//! `clawdbot.internal.` is an external collaborator consuming that file.

use crate::discovery::beacon::{encode_dnssd_escapes, Beacon};
use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const SERVICE_TYPE: &str = "_clawdbot-bridge._tcp.local.";
pub const WIDE_AREA_DOMAIN: &str = "clawdbot.internal.";

/// Re-verify cadence for the announcement.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

/// Soft backoff before retrying under a conflict-suffixed name.
const CONFLICT_BACKOFF: Duration = Duration::from_secs(2);

/// Nth attempt name for an instance conflict: `Name`, `Name (2)`, ….
pub fn conflict_name(base: &str, attempt: u32) -> String {
    if attempt <= 1 {
        base.to_string()
    } else {
        format!("{base} ({attempt})")
    }
}

/// One wide-area DNS-SD record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WideAreaRecord {
    pub name: String,
    pub rtype: String,
    pub value: String,
}

/// The PTR/SRV/TXT triplet for a beacon under `clawdbot.internal.`.
pub fn wide_area_records(beacon: &Beacon) -> Vec<WideAreaRecord> {
    let service = format!("_clawdbot-bridge._tcp.{WIDE_AREA_DOMAIN}");
    let instance = format!(
        "{}.{service}",
        encode_dnssd_escapes(&beacon.instance_name)
    );
    let host = beacon
        .lan_host
        .clone()
        .unwrap_or_else(|| "localhost".to_string());
    let port = beacon.bridge_port.unwrap_or(0);

    let mut records = vec![
        WideAreaRecord {
            name: service.clone(),
            rtype: "PTR".to_string(),
            value: instance.clone(),
        },
        WideAreaRecord {
            name: instance.clone(),
            rtype: "SRV".to_string(),
            value: format!("0 0 {port} {host}."),
        },
    ];
    let txt = beacon
        .to_txt()
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ");
    records.push(WideAreaRecord {
        name: instance,
        rtype: "TXT".to_string(),
        value: txt,
    });
    records
}

pub struct DiscoveryPublisher {
    beacon: Beacon,
    wide_area: bool,
    state_dir: PathBuf,
}

impl DiscoveryPublisher {
    pub fn new(beacon: Beacon, wide_area: bool, state_dir: PathBuf) -> Self {
        Self {
            beacon,
            wide_area,
            state_dir,
        }
    }

    /// Announce until cancelled. Instance conflicts back off and retry with
    /// an ` (N)` suffix; a watchdog re-registers every 30 s.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let daemon = ServiceDaemon::new().context("Failed to start mDNS daemon")?;

        let mut attempt: u32 = 1;
        let mut fullname = loop {
            let name = conflict_name(&self.beacon.instance_name, attempt);
            match self.register(&daemon, &name) {
                Ok(fullname) => break fullname,
                Err(err) => {
                    attempt += 1;
                    tracing::warn!(
                        instance = %name,
                        "mDNS registration failed ({err:#}); retrying as '{}'",
                        conflict_name(&self.beacon.instance_name, attempt)
                    );
                    tokio::select! {
                        () = tokio::time::sleep(CONFLICT_BACKOFF) => {}
                        () = cancel.cancelled() => return Ok(()),
                    }
                }
            }
        };
        tracing::info!(instance = %fullname, "Discovery beacon announced");

        if self.wide_area {
            self.write_wide_area_records()?;
        }

        let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            // Refresh the announcement; a daemon that lost the record (sleep,
            // interface change) re-announces here.
            let name = conflict_name(&self.beacon.instance_name, attempt);
            match self.register(&daemon, &name) {
                Ok(registered) => fullname = registered,
                Err(err) => {
                    tracing::warn!("mDNS watchdog re-register failed: {err:#}");
                }
            }
        }

        let _ = daemon.unregister(&fullname);
        let _ = daemon.shutdown();
        Ok(())
    }

    fn register(&self, daemon: &ServiceDaemon, instance_name: &str) -> Result<String> {
        let txt: HashMap<String, String> = self.beacon.to_txt().into_iter().collect();
        let host = self
            .beacon
            .lan_host
            .clone()
            .unwrap_or_else(|| "localhost.local.".to_string());
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            instance_name,
            &host,
            (),
            self.beacon.bridge_port.unwrap_or(0),
            txt,
        )
        .context("Invalid mDNS service info")?
        .enable_addr_auto();
        let fullname = info.get_fullname().to_string();
        daemon
            .register(info)
            .context("mDNS registration rejected")?;
        Ok(fullname)
    }

    fn write_wide_area_records(&self) -> Result<()> {
        let records = wide_area_records(&self.beacon);
        let path = self.state_dir.join("discovery").join("wide-area.json");
        let payload =
            serde_json::to_string_pretty(&records).context("Failed to encode DNS records")?;
        crate::util::write_atomic(&path, &payload)?;
        tracing::info!(
            records = records.len(),
            "Wide-area DNS-SD records written to {}",
            path.display()
        );
        Ok(())
    }
}
