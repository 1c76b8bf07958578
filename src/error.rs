//! Crate error types.

use thiserror::Error;

/// Errors surfaced by the balancer and its discovery sources.
#[derive(Debug, Error)]
pub enum Error {
    /// A node line did not match the `IP[:Port][ weight=N]` grammar.
    #[error("node info [{0}] with wrong format, expected \"IP[:Port][ weight=N]\"")]
    InvalidNode(String),

    /// A `dns_server` value did not match the `IP:PORT` grammar.
    #[error("dns_server [{0}] with wrong format, expected \"IP:Port\"")]
    InvalidDnsServer(String),

    /// Static source configured without any nodes.
    #[error("type=static requires a non-empty ip_list or node_list")]
    EmptyNodeList,

    /// DNS source configured without a dns section.
    #[error("type=dns requires a dns config")]
    MissingDnsConfig,

    /// Consul source configured without a consul section.
    #[error("type=consul requires a consul config")]
    MissingConsulConfig,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Descriptor parse failure.
    #[error("invalid descriptor: {0}")]
    Descriptor(#[from] toml::de::Error),

    /// No client available for selection.
    #[error("no clients available for selection")]
    NoClients,

    /// Request deadline exceeded.
    #[error("request deadline exceeded")]
    Timeout,

    /// Transport-level failure while dialing or exchanging a request.
    #[error("transport error: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),

    /// Failure while reading a response body.
    #[error("body error: {0}")]
    Body(#[from] hyper::Error),

    /// Invalid request construction.
    #[error("http error: {0}")]
    Http(#[from] http::Error),

    /// The endpoint address does not form a valid URI authority.
    #[error("invalid endpoint authority: {0}")]
    Authority(#[from] http::uri::InvalidUri),

    /// The rewritten request URI is invalid.
    #[error("invalid request uri: {0}")]
    Uri(#[from] http::uri::InvalidUriParts),

    /// DNS resolution failure.
    #[error("dns resolution failed: {0}")]
    Dns(#[from] hickory_resolver::error::ResolveError),

    /// Registry query failure.
    #[error("registry query failed: {0}")]
    Registry(String),

    /// IO error while reading a resolver-config file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidNode("300.bad".to_string());
        assert_eq!(
            err.to_string(),
            "node info [300.bad] with wrong format, expected \"IP[:Port][ weight=N]\""
        );

        let err = Error::EmptyNodeList;
        assert_eq!(
            err.to_string(),
            "type=static requires a non-empty ip_list or node_list"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
