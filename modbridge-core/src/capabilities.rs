// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Module capabilities and negotiation
//!
//! A module declares the capabilities it needs in its manifest. Loading
//! succeeds only when every declared capability is offered by the import
//! table; at call time imports check the granted set.

use crate::error::{CoreError, CoreResult, LoadError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Individual capability a module may declare
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// Tagged value parsing and traversal
    Json,
    /// Network access (any host)
    Network,
    /// Network access to one host
    NetworkHost(String),
    /// Guest logging
    Log,
    /// Capability of a custom host function
    Custom(String),
}

impl Capability {
    pub fn description(&self) -> &'static str {
        match self {
            Capability::Json => "Parse and traverse tagged values",
            Capability::Network => "Full network access",
            Capability::NetworkHost(_) => "Network access to a specific host",
            Capability::Log => "Write to the host log",
            Capability::Custom(_) => "Custom host function",
        }
    }

    /// Whether offering `self` satisfies a declaration of `declared`.
    pub fn satisfies(&self, declared: &Capability) -> bool {
        match (self, declared) {
            (Capability::Network, Capability::NetworkHost(_)) => true,
            (offered, declared) => offered == declared,
        }
    }
}

impl FromStr for Capability {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let cap = match s {
            "" => {
                return Err(LoadError::InvalidManifest(
                    "empty capability name".to_string(),
                ))
            }
            "json" => Capability::Json,
            "network" => Capability::Network,
            "log" => Capability::Log,
            other => match other.strip_prefix("network:") {
                Some("") => {
                    return Err(LoadError::InvalidManifest(
                        "network capability with empty host".to_string(),
                    ))
                }
                Some(host) => Capability::NetworkHost(host.to_ascii_lowercase()),
                None => Capability::Custom(other.to_string()),
            },
        };
        Ok(cap)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Json => f.write_str("json"),
            Capability::Network => f.write_str("network"),
            Capability::NetworkHost(host) => write!(f, "network:{}", host),
            Capability::Log => f.write_str("log"),
            Capability::Custom(name) => f.write_str(name),
        }
    }
}

impl Serialize for Capability {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Capability {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A set of capabilities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet {
    capabilities: BTreeSet<Capability>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse manifest capability strings.
    pub fn parse<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self, LoadError> {
        let mut set = Self::new();
        for name in names {
            set.add(name.parse()?);
        }
        Ok(set)
    }

    pub fn add(&mut self, cap: Capability) {
        self.capabilities.insert(cap);
    }

    pub fn remove(&mut self, cap: &Capability) {
        self.capabilities.remove(cap);
    }

    pub fn has(&self, cap: &Capability) -> bool {
        self.capabilities.contains(cap)
    }

    pub fn all(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Declared capabilities this (offered) set does not cover.
    pub fn missing_from<'a>(&self, declared: &'a CapabilitySet) -> Vec<&'a Capability> {
        declared
            .all()
            .filter(|want| !self.all().any(|have| have.satisfies(want)))
            .collect()
    }

    /// Fail the load when any declared capability is not offered.
    pub fn negotiate(&self, declared: &CapabilitySet) -> Result<(), LoadError> {
        let missing = self.missing_from(declared);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(LoadError::UnsupportedCapability(
                missing.iter().map(|c| c.to_string()).collect(),
            ))
        }
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self {
            capabilities: iter.into_iter().collect(),
        }
    }
}

/// Capabilities granted to a loaded module
#[derive(Debug, Clone)]
pub struct GrantedCapabilities {
    module_id: String,
    granted: CapabilitySet,
    /// Host-level allow-list; empty allows any host.
    allowed_hosts: Vec<String>,
}

impl GrantedCapabilities {
    pub fn new(module_id: impl Into<String>, granted: CapabilitySet) -> Self {
        Self {
            module_id: module_id.into(),
            granted,
            allowed_hosts: Vec::new(),
        }
    }

    pub fn with_allowed_hosts(mut self, hosts: Vec<String>) -> Self {
        self.allowed_hosts = hosts.into_iter().map(|h| h.to_ascii_lowercase()).collect();
        self
    }

    /// Whether a host function guarded by `cap` may run. `json` is implied
    /// for every module; network capabilities pass here and are decided per
    /// request by [`GrantedCapabilities::can_network`].
    pub fn check(&self, cap: &Capability) -> CoreResult<()> {
        let implied = matches!(
            cap,
            Capability::Json | Capability::Network | Capability::NetworkHost(_)
        );
        if implied || self.granted.has(cap) {
            Ok(())
        } else {
            Err(CoreError::CapabilityDenied(format!(
                "Module '{}' does not have capability: {}",
                self.module_id, cap
            )))
        }
    }

    /// Whether the module may reach `host`.
    pub fn can_network(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        let declared = self.granted.has(&Capability::Network)
            || self.granted.has(&Capability::NetworkHost(host.clone()));
        declared
            && (self.allowed_hosts.is_empty()
                || self.allowed_hosts.iter().any(|allowed| host_matches(allowed, &host)))
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    pub fn all_granted(&self) -> &CapabilitySet {
        &self.granted
    }
}

/// Exact match, or `host` is a subdomain of `allowed`.
fn host_matches(allowed: &str, host: &str) -> bool {
    host == allowed
        || host
            .strip_suffix(allowed)
            .map(|prefix| prefix.ends_with('.'))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_capabilities() {
        let set = CapabilitySet::parse(["json", "network:API.example.com", "log", "cache"]).unwrap();
        assert!(set.has(&Capability::Json));
        assert!(set.has(&Capability::NetworkHost("api.example.com".into())));
        assert!(set.has(&Capability::Custom("cache".into())));
        assert!(CapabilitySet::parse(["network:"]).is_err());
    }

    #[test]
    fn test_negotiation() {
        let offered: CapabilitySet = [Capability::Json, Capability::Network, Capability::Log]
            .into_iter()
            .collect();

        let declared = CapabilitySet::parse(["json", "network:example.com"]).unwrap();
        assert!(offered.negotiate(&declared).is_ok());

        let declared = CapabilitySet::parse(["json", "filesystem"]).unwrap();
        match offered.negotiate(&declared) {
            Err(LoadError::UnsupportedCapability(missing)) => {
                assert_eq!(missing, vec!["filesystem".to_string()])
            }
            other => panic!("unexpected negotiation result: {:?}", other),
        }
    }

    #[test]
    fn test_network_grants() {
        let granted = GrantedCapabilities::new(
            "m",
            CapabilitySet::parse(["network:example.com"]).unwrap(),
        );
        assert!(granted.can_network("example.com"));
        assert!(!granted.can_network("evil.com"));
        assert!(granted.check(&Capability::Log).is_err());
        assert!(granted.check(&Capability::Json).is_ok());
        assert!(granted.check(&Capability::Network).is_ok());

        let open = GrantedCapabilities::new("m", CapabilitySet::parse(["network"]).unwrap())
            .with_allowed_hosts(vec!["example.com".into()]);
        assert!(open.can_network("api.example.com"));
        assert!(!open.can_network("notexample.com"));
    }

    #[test]
    fn test_serde_as_strings() {
        let set = CapabilitySet::parse(["network", "json"]).unwrap();
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json, serde_json::json!(["json", "network"]));
        let back: CapabilitySet = serde_json::from_value(json).unwrap();
        assert_eq!(back, set);
    }
}
