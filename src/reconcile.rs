//! Pool-set reconciliation against a freshly resolved node list.

use crate::client::HostClient;
use crate::config::Opts;
use crate::node::Node;
use std::collections::HashMap;
use std::sync::Arc;

/// Produce the pool list for a new node set, reusing pools whose canonical
/// name is unchanged.
///
/// Returns the new list and whether anything changed. An empty node set
/// never changes anything; a name-for-name match (in any order) keeps the
/// old list and its live connections.
pub(crate) fn reconcile(
    old: &[Arc<HostClient>],
    nodes: &[Node],
    opts: &Opts,
) -> (Vec<Arc<HostClient>>, bool) {
    if nodes.is_empty() {
        return (old.to_vec(), false);
    }
    if old.is_empty() {
        return (create_clients(nodes, opts), true);
    }
    if same_name_multiset(old, nodes) {
        return (old.to_vec(), false);
    }

    let by_name: HashMap<&str, &Arc<HostClient>> =
        old.iter().map(|client| (client.name(), client)).collect();
    let merged = nodes
        .iter()
        .map(|node| match by_name.get(node.name()) {
            Some(existing) => Arc::clone(existing),
            None => Arc::new(HostClient::new(node.clone(), opts)),
        })
        .collect();
    (merged, true)
}

/// Build a fresh pool per node.
pub(crate) fn create_clients(nodes: &[Node], opts: &Opts) -> Vec<Arc<HostClient>> {
    nodes
        .iter()
        .map(|node| Arc::new(HostClient::new(node.clone(), opts)))
        .collect()
}

fn same_name_multiset(old: &[Arc<HostClient>], nodes: &[Node]) -> bool {
    if old.len() != nodes.len() {
        return false;
    }
    let mut old_names: Vec<&str> = old.iter().map(|client| client.name()).collect();
    let mut new_names: Vec<&str> = nodes.iter().map(|node| node.name()).collect();
    old_names.sort_unstable();
    new_names.sort_unstable();
    old_names == new_names
}
