//! Per-session capture configuration.
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

/// Settings for one capture session. Never modified once the session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Only keep frames to or from this host.
    pub target_ip: Option<Ipv4Addr>,
    /// Interface to capture on. `None` picks the first usable interface.
    pub interface: Option<String>,
    /// Backend filter expression, e.g. `tcp port 80`.
    pub filter: Option<String>,
    /// Run backends elevated (`sudo -n` on Unix).
    pub admin: bool,
    pub promiscuous: bool,
    /// Skip wire capture and only run the local activity monitor.
    pub local_monitor: bool,
    /// Start the local activity monitor when every backend fails.
    pub fallback_to_local: bool,
    /// Populate the store with the demonstration set when every backend fails.
    pub demo_on_failure: bool,
    /// Use the TLS record sniffer instead of the no-op decryption hook.
    pub detect_encryption: bool,
    pub startup_timeout_ms: u64,
    pub monitor_interval_ms: u64,
    pub store_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_ip: None,
            interface: None,
            filter: None,
            admin: false,
            promiscuous: true,
            local_monitor: false,
            fallback_to_local: false,
            demo_on_failure: false,
            detect_encryption: false,
            startup_timeout_ms: 5000,
            monitor_interval_ms: 2000,
            store_capacity: crate::store::DEFAULT_CAPACITY,
        }
    }
}

impl CaptureConfig {
    /// Loads a config from a JSON file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// The filter handed to backends.
    ///
    /// An explicit filter wins; otherwise a target host becomes `host <ip>`.
    pub fn effective_filter(&self) -> Option<String> {
        match (&self.filter, self.target_ip) {
            (Some(f), _) if !f.trim().is_empty() => Some(f.trim().to_string()),
            (_, Some(ip)) => Some(format!("host {ip}")),
            _ => None,
        }
    }
}
