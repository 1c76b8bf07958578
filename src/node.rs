//! Endpoint identity: address, weight and the canonical name.
//!
//! A [`Node`] is one upstream HTTP server. Equality is defined over the
//! canonical name `"IP:Port_wWEIGHT"`, so two nodes sharing an address but
//! carrying different weights are different identities and force a pool
//! rebuild on reconciliation.

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{LazyLock, OnceLock};

static NODE_INFO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([\d.]+)(?::(\d+))?(?:[\t ]+weight[\t ]*=[\t ]*(\d+))?").unwrap()
});

/// Port used when a node line carries no `:PORT` suffix.
const DEFAULT_PORT: u16 = 80;
/// Weight used when a node line carries no parseable `weight=N` clause.
///
/// Nodes written as struct literals or descriptor tables take the separate
/// validation default of 100 instead; both paths are kept on purpose so
/// existing descriptors keep their meaning.
const DEFAULT_WEIGHT: u16 = 1;

fn default_weight() -> u16 {
    100
}

/// One upstream endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Node {
    /// Endpoint IP address.
    pub ip: String,
    /// Endpoint port.
    pub port: u16,
    /// Selection weight. Zero is normalized to 100 during validation.
    #[serde(default = "default_weight")]
    pub weight: u16,
    #[serde(skip)]
    name: OnceLock<String>,
}

impl Node {
    /// Create a node from its parts.
    #[must_use]
    pub fn new(ip: impl Into<String>, port: u16, weight: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            weight,
            name: OnceLock::new(),
        }
    }

    /// Parse a node line of the form `IP[:Port][ weight=N]`.
    ///
    /// A missing port defaults to 80 and a missing or unparseable weight
    /// defaults to 1.
    pub fn parse(info: &str) -> Result<Self> {
        let captures = NODE_INFO_RE
            .captures(info)
            .ok_or_else(|| Error::InvalidNode(info.to_string()))?;
        let ip = captures
            .get(1)
            .ok_or_else(|| Error::InvalidNode(info.to_string()))?
            .as_str()
            .to_string();
        let port = captures
            .get(2)
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        let weight = captures
            .get(3)
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .unwrap_or(DEFAULT_WEIGHT);
        Ok(Self::new(ip, port, weight))
    }

    /// Service address, e.g. `10.85.101.122:8080`.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Canonical name, e.g. `10.85.101.122:8080_w100`.
    ///
    /// Computed once and cached; used as the identity key for pool reuse.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name
            .get_or_init(|| format!("{}:{}_w{}", self.ip, self.port, self.weight))
    }

    /// Normalize and check the node after deserialization or literal
    /// construction: the IP is required and a zero weight becomes 100.
    pub(crate) fn validate(&mut self) -> Result<()> {
        if self.ip.is_empty() {
            return Err(Error::Config("node ip is required".to_string()));
        }
        if self.weight == 0 {
            self.weight = default_weight();
        }
        Ok(())
    }
}

impl Clone for Node {
    fn clone(&self) -> Self {
        // The cached name is recomputed on demand by the clone.
        Self::new(self.ip.clone(), self.port, self.weight)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port && self.weight == other.weight
    }
}

impl Eq for Node {}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
