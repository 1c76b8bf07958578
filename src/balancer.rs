//! Strategy-driven balancer over a dynamically reconciled pool set.

use crate::client::HostClient;
use crate::config::{Config, LbStrategy};
use crate::error::{Error, Result};
use crate::lb_client::{HealthCheck, LbClient};
use crate::node::Node;
use crate::reconcile::{create_clients, reconcile};
use crate::strategy::StrategyContainer;
use crate::watcher::Watcher;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Pause between discovery ticks.
const WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// The pool list and its selection wrappers, swapped together under the
/// balancer's lock so readers never see a torn pair.
struct PoolSet {
    clients: Vec<Arc<HostClient>>,
    cs: Vec<Arc<LbClient>>,
}

struct Inner {
    config: Config,
    strategy: StrategyContainer,
    health_check: Option<HealthCheck>,
    timeout: Option<Duration>,
    pools: RwLock<PoolSet>,
}

/// Client-side load balancer over one upstream service.
///
/// Construction resolves the endpoint set once, then a background task
/// re-resolves every five seconds and swaps the pool list when it changed.
/// Selection takes a shared lock only; pools survive reconciliation as long
/// as their endpoint's canonical name does. Dropping the balancer stops the
/// background task.
pub struct Balancer {
    inner: Arc<Inner>,
    watch_task: JoinHandle<()>,
}

impl Balancer {
    /// Build a balancer from a descriptor, validating it first.
    pub async fn new(config: Config) -> Result<Self> {
        Self::builder(config).build().await
    }

    /// Start configuring a balancer.
    #[must_use]
    pub fn builder(config: Config) -> BalancerBuilder {
        BalancerBuilder {
            config,
            health_check: None,
            timeout: None,
        }
    }

    /// Pick one client under the configured strategy.
    ///
    /// The returned client is safe to use after the call; it keeps its pool
    /// alive even if a reconciliation drops the endpoint meanwhile. `None`
    /// only occurs for a weighted strategy whose every weight is zero.
    #[must_use]
    pub fn get(&self) -> Option<Arc<LbClient>> {
        let pools = self.inner.pools.read().expect("pool lock poisoned");
        self.inner.strategy.select(&pools.cs)
    }

    /// Send through a freshly selected client, applying the balancer's
    /// default timeout when one is set.
    pub async fn send(&self, req: &Request<Full<Bytes>>) -> Result<Response<Bytes>> {
        let client = self.get().ok_or(Error::NoClients)?;
        match self.inner.timeout {
            Some(timeout) => client.send_timeout(req, timeout).await,
            None => client.send(req).await,
        }
    }

    /// Send through a freshly selected client with a relative timeout.
    pub async fn send_timeout(
        &self,
        req: &Request<Full<Bytes>>,
        timeout: Duration,
    ) -> Result<Response<Bytes>> {
        let client = self.get().ok_or(Error::NoClients)?;
        client.send_timeout(req, timeout).await
    }

    /// Send through a freshly selected client with an absolute deadline.
    pub async fn send_deadline(
        &self,
        req: &Request<Full<Bytes>>,
        deadline: Instant,
    ) -> Result<Response<Bytes>> {
        let client = self.get().ok_or(Error::NoClients)?;
        client.send_deadline(req, deadline).await
    }

    /// Number of endpoint pools currently held.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.inner
            .pools
            .read()
            .expect("pool lock poisoned")
            .clients
            .len()
    }

    #[cfg(test)]
    pub(crate) fn clients_snapshot(&self) -> Vec<Arc<HostClient>> {
        self.inner
            .pools
            .read()
            .expect("pool lock poisoned")
            .clients
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn apply_nodes(&self, nodes: &[Node]) {
        self.inner.swap(nodes, false);
    }
}

impl Drop for Balancer {
    fn drop(&mut self) {
        self.watch_task.abort();
    }
}

impl std::fmt::Debug for Balancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Balancer")
            .field("strategy", &self.inner.config.lb_strategy)
            .field("pools", &self.pool_count())
            .finish()
    }
}

/// Configures health checking and the default request timeout before the
/// balancer starts.
pub struct BalancerBuilder {
    config: Config,
    health_check: Option<HealthCheck>,
    timeout: Option<Duration>,
}

impl BalancerBuilder {
    /// Health predicate consulted after every request.
    #[must_use]
    pub fn health_check(mut self, check: HealthCheck) -> Self {
        self.health_check = Some(check);
        self
    }

    /// Default timeout applied by [`Balancer::send`]. Least-connection
    /// balancers otherwise default to twice the configured read timeout;
    /// other strategies apply none.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validate the descriptor, perform the first resolution and start the
    /// watch task.
    pub async fn build(self) -> Result<Balancer> {
        let config = self.config.validate()?;
        let strategy = StrategyContainer::new(config.lb_strategy);
        let timeout = self.timeout.or_else(|| default_timeout(&config));
        let clients = create_clients(&config.node_list, &config.opts);

        let inner = Arc::new(Inner {
            strategy,
            health_check: self.health_check,
            timeout,
            pools: RwLock::new(PoolSet {
                clients,
                cs: Vec::new(),
            }),
            config,
        });

        let mut watcher = Watcher::new(&inner.config);
        let nodes = watcher.resolve(&inner.config).await;
        inner.swap(&nodes, true);
        info!(
            strategy = ?inner.config.lb_strategy,
            pools = inner.pools.read().expect("pool lock poisoned").clients.len(),
            "balancer started"
        );

        let watch_task = tokio::spawn(watch_loop(Arc::clone(&inner), watcher));
        Ok(Balancer { inner, watch_task })
    }
}

fn default_timeout(config: &Config) -> Option<Duration> {
    match config.lb_strategy {
        LbStrategy::LeastConnection => config.opts.read_timeout.map(|timeout| timeout * 2),
        _ => None,
    }
}

async fn watch_loop(inner: Arc<Inner>, mut watcher: Watcher) {
    loop {
        tokio::time::sleep(WATCH_INTERVAL).await;
        let nodes = watcher.resolve(&inner.config).await;
        inner.swap(&nodes, false);
    }
}

impl Inner {
    /// Reconcile the pool list against a resolved node set and swap it in.
    ///
    /// Resolution and reconciliation run outside the lock; only the swap
    /// itself takes it, so a slow discovery source never blocks selection.
    /// `force` rebuilds the selection wrappers even without a change, which
    /// the initial fetch needs to populate them.
    fn swap(&self, nodes: &[Node], force: bool) {
        // Single writer: the constructor, then the watch task.
        let old = self
            .pools
            .read()
            .expect("pool lock poisoned")
            .clients
            .clone();
        let (clients, changed) = reconcile(&old, nodes, &self.config.opts);
        if !changed && !force {
            return;
        }
        assert!(
            !clients.is_empty(),
            "BUG: balancer pool set must not be empty after reconciliation"
        );

        let cs = clients
            .iter()
            .map(|client| {
                Arc::new(LbClient::new(
                    Arc::clone(client),
                    self.health_check.clone(),
                ))
            })
            .collect();

        let mut pools = self.pools.write().expect("pool lock poisoned");
        self.strategy.rebuild(&clients);
        if changed {
            debug!(pools = clients.len(), "pool set swapped");
        }
        pools.clients = clients;
        pools.cs = cs;
    }
}
