//! Discovery watcher: resolves the live endpoint set from the configured
//! source and tracks the last-known answer.
//!
//! Resolution never propagates errors. A failed or empty answer leaves the
//! last-known set in place and the balancer's next tick retries, so callers
//! keep routing to the endpoints that were healthy before the source broke.

use crate::config::{Config, SourceType};
use crate::consul::ConsulSource;
use crate::dns::DnsSource;
use crate::node::Node;
use tracing::{info, warn};

pub(crate) struct Watcher {
    /// Last resolved node set, seeded with the configured fallback list.
    nodes: Vec<Node>,
    dns: Option<DnsSource>,
    consul: Option<ConsulSource>,
}

impl Watcher {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            nodes: config.node_list.clone(),
            dns: None,
            consul: None,
        }
    }

    /// Resolve the current endpoint set. The config is taken per call so a
    /// replaced descriptor takes effect on the next tick.
    pub(crate) async fn resolve(&mut self, config: &Config) -> Vec<Node> {
        match config.source {
            SourceType::Static => self.nodes.clone(),
            SourceType::Dns => self.resolve_dns(config).await,
            SourceType::Consul => self.resolve_consul(config).await,
        }
    }

    async fn resolve_dns(&mut self, config: &Config) -> Vec<Node> {
        let Some(dns) = config.dns.as_ref() else {
            return self.nodes.clone();
        };
        if self.dns.is_none() {
            let Some(server) = dns.server() else {
                warn!(domain = %dns.domain, "dns server not resolved, keeping previous endpoints");
                return self.nodes.clone();
            };
            self.dns = Some(DnsSource::new(server));
        }
        let Some(source) = self.dns.as_ref() else {
            return self.nodes.clone();
        };

        match source.lookup(dns).await {
            Ok(nodes) => {
                if self.same_set(&nodes) {
                    self.nodes.clone()
                } else {
                    info!(domain = %dns.domain, nodes = nodes.len(), "dns endpoints changed");
                    self.nodes = nodes;
                    self.nodes.clone()
                }
            }
            Err(err) => {
                warn!(domain = %dns.domain, error = %err, "dns resolution failed, keeping previous endpoints");
                self.nodes.clone()
            }
        }
    }

    async fn resolve_consul(&mut self, config: &Config) -> Vec<Node> {
        let Some(consul) = config.consul.as_ref() else {
            return self.nodes.clone();
        };
        let source = self
            .consul
            .get_or_insert_with(|| ConsulSource::new(consul));

        match source.healthy_nodes(consul).await {
            Ok(nodes) if nodes.is_empty() => self.nodes.clone(),
            Ok(nodes) => {
                self.nodes = nodes;
                self.nodes.clone()
            }
            Err(err) => {
                warn!(service = %consul.service_name, error = %err, "registry query failed, keeping previous endpoints");
                self.nodes.clone()
            }
        }
    }

    /// A new set equals the stored one when both hold the same canonical
    /// names regardless of order. An empty set always compares equal, so a
    /// briefly empty source cannot clear the pools.
    fn same_set(&self, nodes: &[Node]) -> bool {
        if nodes.is_empty() {
            return true;
        }
        if nodes.len() != self.nodes.len() {
            return false;
        }
        let mut new_names: Vec<&str> = nodes.iter().map(Node::name).collect();
        let mut old_names: Vec<&str> = self.nodes.iter().map(Node::name).collect();
        new_names.sort_unstable();
        old_names.sort_unstable();
        new_names == old_names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LbStrategy, Opts};

    fn static_config(lines: &[&str]) -> Config {
        Config {
            lb_strategy: LbStrategy::RoundRobin,
            source: SourceType::Static,
            consul: None,
            dns: None,
            ip_list: lines.iter().map(|s| s.to_string()).collect(),
            node_list: Vec::new(),
            opts: Opts::default(),
        }
        .validate()
        .unwrap()
    }

    #[tokio::test]
    async fn test_static_source_returns_configured_nodes() {
        let config = static_config(&["10.0.0.1:8080", "10.0.0.2:8080"]);
        let mut watcher = Watcher::new(&config);

        let nodes = watcher.resolve(&config).await;
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name(), "10.0.0.1:8080_w1");

        // Stable across ticks.
        let again = watcher.resolve(&config).await;
        assert_eq!(nodes, again);
    }

    #[test]
    fn test_same_set_is_order_insensitive() {
        let config = static_config(&["10.0.0.1:80", "10.0.0.2:80"]);
        let watcher = Watcher::new(&config);

        let reordered = vec![Node::new("10.0.0.2", 80, 1), Node::new("10.0.0.1", 80, 1)];
        assert!(watcher.same_set(&reordered));
    }

    #[test]
    fn test_same_set_empty_means_unchanged() {
        let config = static_config(&["10.0.0.1:80"]);
        let watcher = Watcher::new(&config);
        assert!(watcher.same_set(&[]));
    }

    #[test]
    fn test_same_set_detects_weight_change() {
        let config = static_config(&["10.0.0.1:80"]);
        let watcher = Watcher::new(&config);

        assert!(!watcher.same_set(&[Node::new("10.0.0.1", 80, 2)]));
        assert!(watcher.same_set(&[Node::new("10.0.0.1", 80, 1)]));
    }

    #[test]
    fn test_same_set_detects_membership_change() {
        let config = static_config(&["10.0.0.1:80"]);
        let watcher = Watcher::new(&config);

        assert!(!watcher.same_set(&[
            Node::new("10.0.0.1", 80, 1),
            Node::new("10.0.0.2", 80, 1),
        ]));
    }
}
