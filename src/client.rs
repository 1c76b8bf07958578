//! Per-endpoint HTTP connection pool adapter.

use crate::config::Opts;
use crate::error::{Error, Result};
use crate::node::Node;
use bytes::Bytes;
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{Method, Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

type Pool = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// A long-lived HTTP connection pool targeting one endpoint.
///
/// Every request routed through the client has its URI rewritten to the
/// endpoint address; the scheme follows the `is_tls` option. The pool is
/// immutable once constructed and is reused across reconciliations as long
/// as the node's canonical name is unchanged.
pub struct HostClient {
    node: Node,
    scheme: Scheme,
    pool: Pool,
    pending: AtomicUsize,
    max_call_attempts: usize,
    io_timeout: Option<Duration>,
}

impl HostClient {
    /// Build a pool for one node from the shared transport options.
    #[must_use]
    pub(crate) fn new(node: Node, opts: &Opts) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(opts.connect_timeout);
        connector.enforce_http(false);
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .wrap_connector(connector);
        let pool = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(opts.max_conns_per_host)
            .pool_idle_timeout(opts.max_idle_conn_duration)
            .pool_timer(TokioTimer::new())
            .build(connector);

        Self {
            node,
            scheme: if opts.is_tls {
                Scheme::HTTPS
            } else {
                Scheme::HTTP
            },
            pool,
            pending: AtomicUsize::new(0),
            max_call_attempts: opts.max_call_attempts.max(1),
            io_timeout: opts.io_timeout(),
        }
    }

    /// Canonical name of the endpoint this pool targets.
    #[must_use]
    pub fn name(&self) -> &str {
        self.node.name()
    }

    /// The endpoint this pool targets.
    #[must_use]
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Requests currently in flight through this pool.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Send a request to the endpoint.
    ///
    /// Idempotent requests are retried on connect failures, up to
    /// `max_call_attempts` in total.
    pub async fn send(&self, req: &Request<Full<Bytes>>) -> Result<Response<Bytes>> {
        let _pending = PendingGuard::enter(&self.pending);
        let uri = self.target_uri(req.uri())?;
        let attempts = if is_idempotent(req.method()) {
            self.max_call_attempts
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.exchange(req, &uri).await {
                Ok(resp) => return Ok(resp),
                Err(err) if attempt < attempts && is_retryable(&err) => {
                    debug!(endpoint = self.name(), attempt, error = %err, "retrying request");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Send with a relative timeout covering the whole exchange.
    pub async fn send_timeout(
        &self,
        req: &Request<Full<Bytes>>,
        timeout: Duration,
    ) -> Result<Response<Bytes>> {
        match tokio::time::timeout(timeout, self.send(req)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Send with an absolute deadline covering the whole exchange.
    pub async fn send_deadline(
        &self,
        req: &Request<Full<Bytes>>,
        deadline: Instant,
    ) -> Result<Response<Bytes>> {
        match tokio::time::timeout_at(deadline, self.send(req)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn exchange(&self, req: &Request<Full<Bytes>>, uri: &Uri) -> Result<Response<Bytes>> {
        let out = rebuild_request(req, uri)?;
        let exchange = async {
            let resp = self.pool.request(out).await?;
            let (parts, body) = resp.into_parts();
            let bytes = body.collect().await?.to_bytes();
            Ok(Response::from_parts(parts, bytes))
        };
        match self.io_timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| Error::Timeout)?,
            None => exchange.await,
        }
    }

    /// Rewrite a request URI so it targets this pool's endpoint.
    fn target_uri(&self, orig: &Uri) -> Result<Uri> {
        let authority = Authority::try_from(self.node.addr().as_str())?;
        let mut parts = orig.clone().into_parts();
        parts.scheme = Some(self.scheme.clone());
        parts.authority = Some(authority);
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(PathAndQuery::from_static("/"));
        }
        Ok(Uri::from_parts(parts)?)
    }

    #[cfg(test)]
    pub(crate) fn add_pending(&self, n: usize) {
        self.pending.fetch_add(n, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for HostClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostClient")
            .field("node", &self.node)
            .field("pending", &self.pending)
            .finish()
    }
}

/// Tracks one in-flight request, releasing the slot even when the caller's
/// future is cancelled by a timeout.
struct PendingGuard<'a>(&'a AtomicUsize);

impl<'a> PendingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn rebuild_request(req: &Request<Full<Bytes>>, uri: &Uri) -> Result<Request<Full<Bytes>>> {
    let mut out = Request::builder()
        .method(req.method().clone())
        .uri(uri.clone())
        .version(req.version())
        .body(req.body().clone())?;
    *out.headers_mut() = req.headers().clone();
    Ok(out)
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE
    )
}

fn is_retryable(err: &Error) -> bool {
    matches!(err, Error::Transport(e) if e.is_connect())
}
