use std::collections::HashSet;
use std::net::IpAddr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::device::{ValidationError, ValidationResult};

/// MAC address format (XX:XX:XX:XX:XX:XX or XX-XX-...)
static MAC_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})$").unwrap());

/// One discovery pass's raw sighting of a host, before any
/// classification. Strongly typed at the Discovery Adapter boundary so
/// nothing dictionary-shaped leaks into the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// IP address the host answered from
    pub ip_address: IpAddr,

    /// MAC address if the adapter could resolve one
    pub mac_address: Option<String>,

    /// Hostname if the adapter could resolve one
    pub hostname: Option<String>,

    /// Ports that responded during the probe
    pub open_ports: HashSet<u16>,

    /// Optional OS fingerprint supplied by the adapter
    pub os_hint: Option<String>,
}

impl Observation {
    pub fn new(ip_address: IpAddr) -> Self {
        Self {
            ip_address,
            mac_address: None,
            hostname: None,
            open_ports: HashSet::new(),
            os_hint: None,
        }
    }

    /// Normalized MAC for this observation, if one was captured
    pub fn normalized_mac(&self) -> Option<ValidationResult<String>> {
        self.mac_address.as_deref().map(normalize_mac)
    }
}

/// Normalize a MAC address to uppercase colon-separated form, rejecting
/// anything that does not look like one.
pub fn normalize_mac(raw: &str) -> ValidationResult<String> {
    let trimmed = raw.trim();
    if !MAC_REGEX.is_match(trimmed) {
        return Err(ValidationError::InvalidMacAddress(raw.to_string()));
    }
    Ok(trimmed.to_uppercase().replace('-', ":"))
}
