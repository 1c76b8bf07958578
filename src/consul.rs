//! Endpoint discovery through Consul's health API.
//!
//! Talks to the agent's `/v1/health/service/<name>` endpoint directly with
//! the crate's own HTTP client. Queries are blocking: the wait index from
//! the previous answer is passed back so the agent holds the request until
//! the service changes or its own timeout fires.

use crate::config::ConsulConfig;
use crate::error::{Error, Result};
use crate::node::Node;
use bytes::Bytes;
use http::{Method, Request};
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;

/// One entry of a health-filtered service query.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ServiceEntry {
    pub(crate) service: ServiceInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ServiceInfo {
    pub(crate) address: String,
    pub(crate) port: u32,
    #[serde(default)]
    pub(crate) weights: ServiceWeights,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ServiceWeights {
    pub(crate) passing: u32,
}

/// Client for one agent, carrying the blocking-query wait index.
pub(crate) struct ConsulSource {
    agent: String,
    token: String,
    wait_index: u64,
    http: Client<HttpConnector, Empty<Bytes>>,
}

impl ConsulSource {
    pub(crate) fn new(config: &ConsulConfig) -> Self {
        Self {
            agent: config.agent.clone(),
            token: config.token.clone(),
            wait_index: 0,
            http: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// Long-poll the healthy instances of the configured service.
    ///
    /// The wait index advances only after a successful, non-empty answer,
    /// so a failed or empty poll is retried from the same point.
    pub(crate) async fn healthy_nodes(&mut self, config: &ConsulConfig) -> Result<Vec<Node>> {
        let mut uri = format!(
            "http://{}/v1/health/service/{}?passing=1&index={}",
            self.agent, config.service_name, self.wait_index
        );
        if !config.tag.is_empty() {
            uri.push_str("&tag=");
            uri.push_str(&config.tag);
        }

        let mut builder = Request::builder().method(Method::GET).uri(uri);
        if !self.token.is_empty() {
            builder = builder.header("X-Consul-Token", &self.token);
        }
        let req = builder.body(Empty::new())?;

        let resp = self.http.request(req).await?;
        if !resp.status().is_success() {
            return Err(Error::Registry(format!(
                "agent returned status {}",
                resp.status()
            )));
        }
        let last_index = resp
            .headers()
            .get("X-Consul-Index")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());

        let body = resp.into_body().collect().await?.to_bytes();
        let entries: Vec<ServiceEntry> =
            serde_json::from_slice(&body).map_err(|err| Error::Registry(err.to_string()))?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(index) = last_index {
            self.wait_index = index;
        }
        Ok(entries.iter().map(entry_node).collect())
    }

    #[cfg(test)]
    pub(crate) fn wait_index(&self) -> u64 {
        self.wait_index
    }
}

pub(crate) fn entry_node(entry: &ServiceEntry) -> Node {
    Node::new(
        entry.service.address.clone(),
        entry.service.port as u16,
        entry.service.weights.passing as u16,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Response;
    use http_body_util::Full;
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    const HEALTH_PAYLOAD: &str = r#"[
        {
            "Node": {"Node": "worker-1", "Address": "10.0.0.1"},
            "Service": {
                "ID": "web-1",
                "Service": "web",
                "Address": "10.0.0.1",
                "Port": 7780,
                "Weights": {"Passing": 50, "Warning": 1}
            },
            "Checks": []
        },
        {
            "Service": {
                "Address": "10.0.0.2",
                "Port": 7781,
                "Weights": {"Passing": 100, "Warning": 1}
            }
        }
    ]"#;

    #[test]
    fn test_entries_decode_and_map_to_nodes() {
        let entries: Vec<ServiceEntry> = serde_json::from_str(HEALTH_PAYLOAD).unwrap();
        assert_eq!(entries.len(), 2);

        let nodes: Vec<Node> = entries.iter().map(entry_node).collect();
        assert_eq!(nodes[0].name(), "10.0.0.1:7780_w50");
        assert_eq!(nodes[1].name(), "10.0.0.2:7781_w100");
    }

    #[test]
    fn test_missing_weights_default_to_zero() {
        let raw = r#"[{"Service": {"Address": "10.0.0.3", "Port": 80}}]"#;
        let entries: Vec<ServiceEntry> = serde_json::from_str(raw).unwrap();
        let node = entry_node(&entries[0]);
        assert_eq!(node.name(), "10.0.0.3:80_w0");
    }

    /// A fake agent answering `/v1/health/service/*`: one instance on the
    /// first poll (index 7), two on every later poll (index 11).
    async fn spawn_fake_agent() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let agent = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        let polls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&polls);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let service = service_fn(move |_req: hyper::Request<Incoming>| {
                        let poll = counter.fetch_add(1, Ordering::AcqRel);
                        async move {
                            let (body, index) = if poll == 0 {
                                (
                                    r#"[{"Service": {"Address": "10.0.0.1", "Port": 7780,
                                        "Weights": {"Passing": 50}}}]"#,
                                    "7",
                                )
                            } else {
                                (
                                    r#"[{"Service": {"Address": "10.0.0.1", "Port": 7780,
                                        "Weights": {"Passing": 50}}},
                                        {"Service": {"Address": "10.0.0.2", "Port": 7781,
                                        "Weights": {"Passing": 100}}}]"#,
                                    "11",
                                )
                            };
                            let resp = Response::builder()
                                .header("X-Consul-Index", index)
                                .body(Full::new(Bytes::from_static(body.as_bytes())))
                                .unwrap();
                            Ok::<_, Infallible>(resp)
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        (agent, polls)
    }

    #[tokio::test]
    async fn test_long_poll_advances_wait_index() {
        let (agent, _polls) = spawn_fake_agent().await;
        let config = ConsulConfig {
            agent,
            service_name: "web".to_string(),
            tag: String::new(),
            token: "secret".to_string(),
        };
        let mut source = ConsulSource::new(&config);
        assert_eq!(source.wait_index(), 0);

        let first = source.healthy_nodes(&config).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].name(), "10.0.0.1:7780_w50");
        assert_eq!(source.wait_index(), 7);

        let second = source.healthy_nodes(&config).await.unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[1].name(), "10.0.0.2:7781_w100");
        assert_eq!(source.wait_index(), 11);
    }
}
