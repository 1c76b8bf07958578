//! Pool wrapper carrying the load-shifting penalty state.

use crate::client::HostClient;
use crate::error::{Error, Result};
use crate::node::Node;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Ceiling for the decaying penalty score.
const MAX_PENALTY: u32 = 300;

/// Time for one accepted penalty unit to decay.
const PENALTY_DURATION: Duration = Duration::from_secs(1);

/// Health predicate called after every request with the request, the
/// response (on success) and the error (on failure). When unset, a request
/// is healthy exactly when it returned without error.
pub type HealthCheck = Arc<
    dyn Fn(&Request<Full<Bytes>>, Option<&Response<Bytes>>, Option<&Error>) -> bool + Send + Sync,
>;

/// A [`HostClient`] wrapper that biases selection away from failing
/// endpoints.
///
/// Each unhealthy call bumps a bounded penalty score that decays one unit
/// per second; [`LbClient::pending_requests`] reports pool pending plus the
/// current penalty, so strategies reading it naturally shift load without
/// ever ejecting the endpoint.
pub struct LbClient {
    client: Arc<HostClient>,
    health_check: Option<HealthCheck>,
    penalty: Arc<AtomicU32>,
    total: AtomicU64,
}

impl LbClient {
    pub(crate) fn new(client: Arc<HostClient>, health_check: Option<HealthCheck>) -> Self {
        Self {
            client,
            health_check,
            penalty: Arc::new(AtomicU32::new(0)),
            total: AtomicU64::new(0),
        }
    }

    /// Send a request through the wrapped pool.
    pub async fn send(&self, req: &Request<Full<Bytes>>) -> Result<Response<Bytes>> {
        let result = self.client.send(req).await;
        self.settle(req, &result);
        result
    }

    /// Send with a relative timeout.
    pub async fn send_timeout(
        &self,
        req: &Request<Full<Bytes>>,
        timeout: Duration,
    ) -> Result<Response<Bytes>> {
        let result = self.client.send_timeout(req, timeout).await;
        self.settle(req, &result);
        result
    }

    /// Send with an absolute deadline.
    pub async fn send_deadline(
        &self,
        req: &Request<Full<Bytes>>,
        deadline: Instant,
    ) -> Result<Response<Bytes>> {
        let result = self.client.send_deadline(req, deadline).await;
        self.settle(req, &result);
        result
    }

    /// Composite load metric: pool pending plus the current penalty.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.client.pending_requests() + self.penalty.load(Ordering::Acquire) as usize
    }

    /// Canonical name of the wrapped endpoint.
    #[must_use]
    pub fn name(&self) -> &str {
        self.client.name()
    }

    /// The wrapped endpoint.
    #[must_use]
    pub fn node(&self) -> &Node {
        self.client.node()
    }

    /// Completed healthy requests, monotonic.
    pub(crate) fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    fn settle(&self, req: &Request<Full<Bytes>>, result: &Result<Response<Bytes>>) {
        if !self.is_healthy(req, result) && self.inc_penalty() {
            // One decrement per accepted increment, a second later, so the
            // next requests route to other clients while this one recovers.
            let penalty = Arc::clone(&self.penalty);
            tokio::spawn(async move {
                tokio::time::sleep(PENALTY_DURATION).await;
                penalty.fetch_sub(1, Ordering::AcqRel);
            });
        } else {
            self.total.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn is_healthy(&self, req: &Request<Full<Bytes>>, result: &Result<Response<Bytes>>) -> bool {
        match &self.health_check {
            Some(check) => match result {
                Ok(resp) => check(req, Some(resp), None),
                Err(err) => check(req, None, Some(err)),
            },
            None => result.is_ok(),
        }
    }

    /// Bump the penalty, rolling back when it would pass the ceiling.
    /// Returns whether the increment was accepted.
    fn inc_penalty(&self) -> bool {
        let value = self.penalty.fetch_add(1, Ordering::AcqRel) + 1;
        if value > MAX_PENALTY {
            self.penalty.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn penalize(&self) {
        let unhealthy: Result<Response<Bytes>> = Err(Error::Timeout);
        let req = Request::builder()
            .uri("http://test/")
            .body(Full::new(Bytes::new()))
            .unwrap();
        self.settle(&req, &unhealthy);
    }

    #[cfg(test)]
    pub(crate) fn add_total(&self, n: u64) {
        self.total.fetch_add(n, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for LbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LbClient")
            .field("name", &self.name())
            .field("penalty", &self.penalty)
            .field("total", &self.total)
            .finish()
    }
}
