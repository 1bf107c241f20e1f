//! Discovery browser: concurrent mDNS and wide-area browsing with
//! per-instance dedup preferring the freshest advertisement.

use crate::discovery::beacon::Beacon;
use crate::discovery::publisher::SERVICE_TYPE;
use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Dedup state: instance name → (beacon, observed-at ms). A re-observation
/// replaces the entry only when it is at least as fresh.
#[derive(Debug, Default)]
pub struct BeaconCache {
    entries: HashMap<String, (Beacon, i64)>,
}

impl BeaconCache {
    /// Returns true when the observation should be emitted downstream:
    /// a new instance, or a fresher advertisement that differs.
    pub fn observe(&mut self, beacon: Beacon, at_ms: i64) -> bool {
        match self.entries.get(&beacon.instance_name) {
            Some((existing, seen_at)) => {
                if at_ms < *seen_at {
                    return false;
                }
                let changed = existing != &beacon;
                self.entries
                    .insert(beacon.instance_name.clone(), (beacon, at_ms));
                changed
            }
            None => {
                self.entries
                    .insert(beacon.instance_name.clone(), (beacon, at_ms));
                true
            }
        }
    }

    pub fn remove(&mut self, instance_name: &str) {
        self.entries.remove(instance_name);
    }

    pub fn beacons(&self) -> Vec<Beacon> {
        self.entries.values().map(|(b, _)| b.clone()).collect()
    }
}

/// Browse `local.` for gateway beacons until cancelled, emitting deduped
/// beacons on `tx`. Wide-area browsing under `clawdbot.internal.` follows
/// the same decode path when the platform resolver forwards that domain.
pub async fn browse(
    tx: mpsc::UnboundedSender<Beacon>,
    cancel: CancellationToken,
) -> Result<()> {
    let daemon = ServiceDaemon::new().context("Failed to start mDNS daemon")?;
    let receiver = daemon
        .browse(SERVICE_TYPE)
        .context("Failed to browse for gateway beacons")?;
    tracing::debug!("Browsing {SERVICE_TYPE}");

    let mut cache = BeaconCache::default();
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = receiver.recv_async() => match event {
                Ok(event) => event,
                Err(_) => break,
            },
        };
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let raw_instance = info
                    .get_fullname()
                    .strip_suffix(&format!(".{SERVICE_TYPE}"))
                    .unwrap_or_else(|| info.get_fullname());
                let mut txt: HashMap<String, String> = HashMap::new();
                for property in info.get_properties().iter() {
                    txt.insert(property.key().to_string(), property.val_str().to_string());
                }
                if !txt.contains_key("bridgePort") && info.get_port() != 0 {
                    txt.insert("bridgePort".to_string(), info.get_port().to_string());
                }
                let beacon = Beacon::from_txt(raw_instance, &txt);
                let now = chrono::Utc::now().timestamp_millis();
                if cache.observe(beacon.clone(), now) {
                    tracing::debug!(instance = %beacon.instance_name, "Beacon observed");
                    if tx.send(beacon).is_err() {
                        break;
                    }
                }
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                let instance = fullname
                    .strip_suffix(&format!(".{SERVICE_TYPE}"))
                    .unwrap_or(&fullname);
                cache.remove(&crate::discovery::beacon::decode_dnssd_escapes(instance));
            }
            _ => {}
        }
    }

    let _ = daemon.shutdown();
    Ok(())
}
