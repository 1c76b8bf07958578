//! Balanced-service descriptors and validation.

use crate::error::{Error, Result};
use crate::node::Node;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::LazyLock;
use std::time::Duration;

static DNS_SERVER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([\d.]+):(\d+)$").unwrap());

/// Selection strategy for a balanced service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LbStrategy {
    /// Rotate through the client set.
    RoundRobin = 1,
    /// Uniform random pick.
    Random = 2,
    /// Smooth weighted rotation.
    WeightedRoundRobin = 3,
    /// Fewest in-flight requests, ties broken by fewest completed.
    #[default]
    LeastConnection = 4,
}

/// Endpoint discovery source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// A fixed node list from the descriptor.
    Static,
    /// A or SRV records for a domain.
    Dns,
    /// Healthy instances of a Consul service.
    Consul,
}

/// HTTP transport tuning shared by every endpoint pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Opts {
    /// Connection cap per endpoint pool.
    pub max_conns_per_host: usize,

    /// Speak TLS to the endpoints.
    pub is_tls: bool,

    /// Dial timeout for new connections.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,

    /// Response read timeout, also the base for the least-connection
    /// balancer's default request timeout.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Option<Duration>,

    /// Request write timeout. Bounds each attempt together with
    /// `read_timeout`; this transport does not time the two phases apart.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Option<Duration>,

    /// Advisory cap on the lifetime of a pooled connection. The pool
    /// recycles connections by idle age, so only `max_idle_conn_duration`
    /// is enforced.
    #[serde(with = "humantime_serde")]
    pub max_conn_duration: Option<Duration>,

    /// Keep-alive window for idle pooled connections.
    #[serde(with = "humantime_serde")]
    pub max_idle_conn_duration: Duration,

    /// Attempts per idempotent request, including the first.
    pub max_call_attempts: usize,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            max_conns_per_host: 2,
            is_tls: false,
            connect_timeout: None,
            read_timeout: None,
            write_timeout: None,
            max_conn_duration: None,
            max_idle_conn_duration: Duration::from_secs(10),
            max_call_attempts: 1,
        }
    }
}

impl Opts {
    /// Combined per-attempt I/O bound, when any is configured.
    pub(crate) fn io_timeout(&self) -> Option<Duration> {
        match (self.read_timeout, self.write_timeout) {
            (Some(read), Some(write)) => Some(read + write),
            (Some(read), None) => Some(read),
            (None, Some(write)) => Some(write),
            (None, None) => None,
        }
    }
}

/// DNS discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsConfig {
    /// Domain to resolve.
    pub domain: String,

    /// Record type to query.
    #[serde(default, rename = "type")]
    pub record: DnsRecordType,

    /// Port assigned to every A answer. SRV answers carry their own.
    #[serde(default = "default_dns_port")]
    pub port: u16,

    /// Resolver-config file consulted when no `dns_server` is set.
    #[serde(default = "default_resolv_file")]
    pub resolv_file: String,

    /// Explicit resolver, `IP:PORT`. Overrides `resolv_file`.
    #[serde(default)]
    pub dns_server: Option<String>,

    #[serde(skip)]
    server: Option<SocketAddr>,
}

/// DNS record type used for discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DnsRecordType {
    /// Address records; every answer gets the configured port and weight 100.
    #[default]
    #[serde(alias = "a")]
    A,
    /// Service records; every answer carries its own port and weight.
    #[serde(alias = "srv")]
    SRV,
}

fn default_dns_port() -> u16 {
    80
}

fn default_resolv_file() -> String {
    "/etc/resolv.conf".to_string()
}

impl DnsConfig {
    /// Resolver address established during validation.
    pub(crate) fn server(&self) -> Option<SocketAddr> {
        self.server
    }

    fn validate(&mut self) -> Result<()> {
        if self.domain.is_empty() {
            return Err(Error::Config("dns domain is required".to_string()));
        }
        self.server = Some(match &self.dns_server {
            Some(raw) => {
                let captures = DNS_SERVER_RE
                    .captures(raw)
                    .ok_or_else(|| Error::InvalidDnsServer(raw.clone()))?;
                let ip: IpAddr = captures[1]
                    .parse()
                    .map_err(|_| Error::InvalidDnsServer(raw.clone()))?;
                let port: u16 = captures[2]
                    .parse()
                    .map_err(|_| Error::InvalidDnsServer(raw.clone()))?;
                SocketAddr::new(ip, port)
            }
            None => first_nameserver(&self.resolv_file)?,
        });
        Ok(())
    }
}

/// First nameserver from a resolver-config file, on the standard DNS port.
fn first_nameserver(path: &str) -> Result<SocketAddr> {
    let contents = std::fs::read(path)?;
    let parsed = resolv_conf::Config::parse(&contents)
        .map_err(|err| Error::Config(format!("cannot parse {path}: {err}")))?;
    let ip = parsed
        .nameservers
        .first()
        .map(|ns| match ns {
            resolv_conf::ScopedIp::V4(v4) => IpAddr::V4(*v4),
            resolv_conf::ScopedIp::V6(v6, _) => IpAddr::V6(*v6),
        })
        .ok_or_else(|| Error::Config(format!("no nameservers in {path}")))?;
    Ok(SocketAddr::new(ip, 53))
}

/// Consul discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsulConfig {
    /// Agent address.
    #[serde(default = "default_consul_agent")]
    pub agent: String,

    /// Service to discover.
    pub service_name: String,

    /// Optional tag filter.
    #[serde(default)]
    pub tag: String,

    /// ACL token passed with every query.
    #[serde(default)]
    pub token: String,
}

fn default_consul_agent() -> String {
    "127.0.0.1:8500".to_string()
}

impl ConsulConfig {
    fn validate(&self) -> Result<()> {
        if self.service_name.is_empty() {
            return Err(Error::Config("consul service_name is required".to_string()));
        }
        if self.agent.is_empty() {
            return Err(Error::Config("consul agent is required".to_string()));
        }
        Ok(())
    }
}

/// Descriptor for one balanced service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Selection strategy.
    #[serde(default)]
    pub lb_strategy: LbStrategy,

    /// Where endpoints come from.
    #[serde(rename = "type")]
    pub source: SourceType,

    /// Consul settings, required when `type = "consul"`.
    #[serde(default)]
    pub consul: Option<ConsulConfig>,

    /// DNS settings, required when `type = "dns"`.
    #[serde(default)]
    pub dns: Option<DnsConfig>,

    /// Node lines, `IP[:Port][ weight=N]` each. Converted into `node_list`
    /// during validation; also the fallback set for discovery sources.
    #[serde(default)]
    pub ip_list: Vec<String>,

    /// Structured node list.
    #[serde(default)]
    pub node_list: Vec<Node>,

    /// HTTP transport tuning.
    #[serde(default)]
    pub opts: Opts,
}

impl Config {
    /// Parse a TOML descriptor.
    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Validate the descriptor and return its normalized form.
    ///
    /// Converts `ip_list` lines into nodes, checks the per-source
    /// requirements and resolves the DNS server address.
    pub fn validate(mut self) -> Result<Self> {
        self.convert_ip_list()?;
        match self.source {
            SourceType::Static => {
                if self.node_list.is_empty() {
                    return Err(Error::EmptyNodeList);
                }
                for node in &mut self.node_list {
                    node.validate()?;
                }
            }
            SourceType::Dns => {
                self.dns
                    .as_mut()
                    .ok_or(Error::MissingDnsConfig)?
                    .validate()?;
            }
            SourceType::Consul => {
                self.consul
                    .as_ref()
                    .ok_or(Error::MissingConsulConfig)?
                    .validate()?;
            }
        }
        Ok(self)
    }

    fn convert_ip_list(&mut self) -> Result<()> {
        if self.ip_list.is_empty() || !self.node_list.is_empty() {
            return Ok(());
        }
        self.node_list = self
            .ip_list
            .iter()
            .map(|line| Node::parse(line))
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }
}
