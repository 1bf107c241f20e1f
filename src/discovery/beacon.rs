//! Beacon records and the DNS-SD TXT codec.
//!
//! A beacon describes one reachable gateway instance. On the wire it is an
//! instance name (DNS-SD escaped) plus TXT key/values; readers decode
//! `\DDD` escapes as a byte stream and UTF-8-decode the whole result.

use std::collections::HashMap;

/// TXT keys, wire-level.
const KEY_ROLE: &str = "role";
const KEY_DISPLAY_NAME: &str = "displayName";
const KEY_LAN_HOST: &str = "lanHost";
const KEY_GATEWAY_PORT: &str = "gatewayPort";
const KEY_BRIDGE_PORT: &str = "bridgePort";
const KEY_CANVAS_PORT: &str = "canvasPort";
const KEY_SSH_PORT: &str = "sshPort";
const KEY_TRANSPORT: &str = "transport";
const KEY_CLI_PATH: &str = "cliPath";
const KEY_TAILNET_DNS: &str = "tailnetDns";

/// One advertised gateway instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub role: String,
    pub instance_name: String,
    pub display_name: String,
    pub transport: String,
    pub lan_host: Option<String>,
    pub gateway_port: Option<u16>,
    pub bridge_port: Option<u16>,
    pub canvas_port: Option<u16>,
    pub ssh_port: Option<u16>,
    pub tailnet_dns: Option<String>,
    pub cli_path: Option<String>,
}

impl Beacon {
    /// A gateway beacon with the fixed role/transport markers.
    pub fn gateway(instance_name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            role: "gateway".to_string(),
            instance_name: instance_name.into(),
            display_name: display_name.into(),
            transport: "bridge".to_string(),
            lan_host: None,
            gateway_port: None,
            bridge_port: None,
            canvas_port: None,
            ssh_port: None,
            tailnet_dns: None,
            cli_path: None,
        }
    }

    /// Fill ports and paths from the `CLAWDBOT_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(port) = env_port("CLAWDBOT_GATEWAY_PORT") {
            self.gateway_port = Some(port);
        }
        if let Some(port) = env_port("CLAWDBOT_BRIDGE_PORT") {
            self.bridge_port = Some(port);
        }
        if let Some(port) = env_port("CLAWDBOT_SSH_PORT") {
            self.ssh_port = Some(port);
        }
        if let Some(value) = env_string("CLAWDBOT_TAILNET_DNS") {
            self.tailnet_dns = Some(value);
        }
        if let Some(value) = env_string("CLAWDBOT_CLI_PATH") {
            self.cli_path = Some(value);
        }
        self
    }

    /// TXT records for the advertisement.
    pub fn to_txt(&self) -> Vec<(String, String)> {
        let mut txt = vec![
            (KEY_ROLE.to_string(), self.role.clone()),
            (KEY_DISPLAY_NAME.to_string(), self.display_name.clone()),
            (KEY_TRANSPORT.to_string(), self.transport.clone()),
        ];
        let mut push_opt = |key: &str, value: &Option<String>| {
            if let Some(value) = value {
                txt.push((key.to_string(), value.clone()));
            }
        };
        push_opt(KEY_LAN_HOST, &self.lan_host);
        push_opt(KEY_TAILNET_DNS, &self.tailnet_dns);
        push_opt(KEY_CLI_PATH, &self.cli_path);
        let mut push_port = |key: &str, value: Option<u16>| {
            if let Some(port) = value {
                txt.push((key.to_string(), port.to_string()));
            }
        };
        push_port(KEY_GATEWAY_PORT, self.gateway_port);
        push_port(KEY_BRIDGE_PORT, self.bridge_port);
        push_port(KEY_CANVAS_PORT, self.canvas_port);
        push_port(KEY_SSH_PORT, self.ssh_port);
        txt
    }

    /// Rebuild a beacon from a (possibly escaped) instance name and TXT
    /// properties. Unknown keys are ignored; a missing role defaults to
    /// `gateway` since only gateways advertise this service type.
    pub fn from_txt(raw_instance_name: &str, txt: &HashMap<String, String>) -> Self {
        let instance_name = decode_dnssd_escapes(raw_instance_name);
        let display_name = txt
            .get(KEY_DISPLAY_NAME)
            .cloned()
            .unwrap_or_else(|| instance_name.clone());
        Self {
            role: txt
                .get(KEY_ROLE)
                .cloned()
                .unwrap_or_else(|| "gateway".to_string()),
            display_name,
            transport: txt
                .get(KEY_TRANSPORT)
                .cloned()
                .unwrap_or_else(|| "bridge".to_string()),
            lan_host: txt.get(KEY_LAN_HOST).cloned(),
            gateway_port: parse_port(txt.get(KEY_GATEWAY_PORT)),
            bridge_port: parse_port(txt.get(KEY_BRIDGE_PORT)),
            canvas_port: parse_port(txt.get(KEY_CANVAS_PORT)),
            ssh_port: parse_port(txt.get(KEY_SSH_PORT)),
            tailnet_dns: txt.get(KEY_TAILNET_DNS).cloned(),
            cli_path: txt.get(KEY_CLI_PATH).cloned(),
            instance_name,
        }
    }
}

fn parse_port(raw: Option<&String>) -> Option<u16> {
    raw.and_then(|s| s.trim().parse().ok())
}

fn env_port(key: &str) -> Option<u16> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Decode DNS-SD `\DDD` escapes (and `\X` literal escapes) into bytes, then
/// UTF-8-decode the whole result. Consecutive `\DDD` escapes that form one
/// multi-byte UTF-8 sequence decode to that character.
pub fn decode_dnssd_escapes(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            let tail = &bytes[i + 1..];
            if tail.len() >= 3 && tail[..3].iter().all(u8::is_ascii_digit) {
                let value = (u32::from(tail[0] - b'0')) * 100
                    + (u32::from(tail[1] - b'0')) * 10
                    + u32::from(tail[2] - b'0');
                if value <= 255 {
                    out.push(value as u8);
                    i += 4;
                    continue;
                }
            }
            out.push(bytes[i + 1]);
            i += 2;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Escape an instance name for the wire: bytes outside the DNS-SD-safe set
/// become `\DDD`.
pub fn encode_dnssd_escapes(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for &byte in name.as_bytes() {
        let safe = byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_');
        if safe {
            out.push(byte as char);
        } else {
            out.push_str(&format!("\\{byte:03}"));
        }
    }
    out
}
