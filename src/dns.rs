//! Endpoint resolution from DNS A and SRV records.

use crate::config::{DnsConfig, DnsRecordType};
use crate::error::Result;
use crate::node::Node;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::{RData, Record};
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Weight assigned to A answers, where the record carries none.
const A_RECORD_WEIGHT: u16 = 100;

/// One reusable resolver bound to the configured DNS server.
pub(crate) struct DnsSource {
    resolver: TokioAsyncResolver,
}

impl DnsSource {
    pub(crate) fn new(server: SocketAddr) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(&[server.ip()], server.port(), true);
        let config = ResolverConfig::from_parts(None, Vec::new(), group);
        Self {
            resolver: TokioAsyncResolver::tokio(config, ResolverOpts::default()),
        }
    }

    /// Resolve the configured domain into a node list.
    pub(crate) async fn lookup(&self, config: &DnsConfig) -> Result<Vec<Node>> {
        let fqdn = format!("{}.", config.domain.trim_end_matches('.'));
        match config.record {
            DnsRecordType::A => self.lookup_a(&fqdn, config.port).await,
            DnsRecordType::SRV => self.lookup_srv(&fqdn).await,
        }
    }

    /// A answers share the configured port and a uniform weight.
    async fn lookup_a(&self, fqdn: &str, port: u16) -> Result<Vec<Node>> {
        let lookup = self.resolver.ipv4_lookup(fqdn).await?;
        Ok(lookup
            .iter()
            .map(|a| Node::new(a.to_string(), port, A_RECORD_WEIGHT))
            .collect())
    }

    /// SRV answers carry their own port and weight; targets are mapped to
    /// addresses through the A records returned alongside the answer.
    async fn lookup_srv(&self, fqdn: &str) -> Result<Vec<Node>> {
        let lookup = self.resolver.srv_lookup(fqdn).await?;
        Ok(srv_nodes(lookup.as_lookup().records()))
    }
}

/// Join SRV answers with the accompanying A records.
///
/// A target without an A record in the same response yields a node with an
/// empty address; such an endpoint fails at request time rather than being
/// silently dropped.
pub(crate) fn srv_nodes(records: &[Record]) -> Vec<Node> {
    let mut target_ips: HashMap<String, String> = HashMap::new();
    for record in records {
        if let Some(RData::A(a)) = record.data() {
            target_ips.insert(record.name().to_string(), a.to_string());
        }
    }

    let mut nodes = Vec::new();
    for record in records {
        if let Some(RData::SRV(srv)) = record.data() {
            let ip = target_ips
                .get(&srv.target().to_string())
                .cloned()
                .unwrap_or_default();
            nodes.push(Node::new(ip, srv.port(), srv.weight()));
        }
    }
    nodes
}
