use std::time::Duration;

use crate::core::multiplexed::ConnectOptions;
use crate::{Error, Result};

use super::client::ClusterClient;
use super::redirect::DEFAULT_MAX_REDIRECTS;

/// Settings of a [`ClusterClient`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClusterOptions {
    /// Reject `host:port` connections to addresses outside the topology,
    /// including redirect targets. Defaults to `true`.
    pub validate_cluster_node_membership: bool,
    /// Redirects followed per command before giving up. Defaults to 5.
    pub max_redirects: usize,
    /// Upper bound on dialing a node. Defaults to 10 seconds.
    pub connect_timeout: Duration,
    /// Name set with `CLIENT SETNAME` on every new node connection.
    pub client_name: Option<String>,
    /// Initial flush mode of node connections. Defaults to `true`.
    pub auto_flush: bool,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            validate_cluster_node_membership: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            connect_timeout: Duration::from_secs(10),
            client_name: None,
            auto_flush: true,
        }
    }
}

impl ClusterOptions {
    pub(crate) fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: self.connect_timeout,
            client_name: self.client_name.clone(),
            auto_flush: self.auto_flush,
        }
    }
}

/// Builder for configuring and creating a [`ClusterClient`].
///
/// # Example
///
/// ```no_run
/// use slotmux::ClusterClientBuilder;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ClusterClientBuilder::new()
///     .seeds("127.0.0.1:7000,127.0.0.1:7001")
///     .validate_cluster_node_membership(false)
///     .max_redirects(3)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ClusterClientBuilder {
    seeds: Vec<String>,
    options: ClusterOptions,
}

impl ClusterClientBuilder {
    /// Creates a new [`ClusterClientBuilder`] instance.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds seed nodes.
    ///
    /// # Arguments
    ///
    /// * `seeds` - Comma-separated `host:port` or `redis://host:port` entries
    #[inline]
    pub fn seeds(mut self, seeds: impl AsRef<str>) -> Self {
        self.seeds.extend(
            seeds
                .as_ref()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
        self
    }

    /// Adds one seed node.
    #[inline]
    pub fn seed(mut self, host: impl AsRef<str>, port: u16) -> Self {
        self.seeds.push(format!("{}:{}", host.as_ref(), port));
        self
    }

    /// Enables or disables membership validation for `host:port` lookups.
    #[inline]
    pub fn validate_cluster_node_membership(mut self, enabled: bool) -> Self {
        self.options.validate_cluster_node_membership = enabled;
        self
    }

    /// Sets the redirect bound.
    #[inline]
    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.options.max_redirects = max_redirects;
        self
    }

    /// Sets the connection timeout.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum time to wait for connection establishment
    #[inline]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    /// Sets the client connection name.
    ///
    /// # Arguments
    ///
    /// * `name` - Client name displayed in `CLIENT LIST`
    #[inline]
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.options.client_name = Some(name.into());
        self
    }

    /// Sets the initial flush mode of node connections.
    #[inline]
    pub fn auto_flush(mut self, enabled: bool) -> Self {
        self.options.auto_flush = enabled;
        self
    }

    /// Replaces all options at once.
    #[inline]
    pub fn options(mut self, options: ClusterOptions) -> Self {
        self.options = options;
        self
    }

    /// Discovers the topology and returns the connected client.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if no seed was given or a seed is malformed,
    /// otherwise the error of the last seed that could not be queried.
    pub async fn build(self) -> Result<ClusterClient> {
        let seeds = self
            .seeds
            .iter()
            .map(|seed| parse_seed(seed))
            .collect::<Result<Vec<_>>>()?;
        if seeds.is_empty() {
            return Err(Error::InvalidArgument {
                message: "no seed nodes provided".to_string(),
            });
        }
        ClusterClient::with_options(seeds, self.options).await
    }
}

/// Parses `host:port` or `redis://host[:port]` into `host:port`.
fn parse_seed(seed: &str) -> Result<String> {
    let invalid = || Error::InvalidArgument {
        message: format!("invalid seed address: {}", seed),
    };
    let with_scheme = if seed.contains("://") {
        seed.to_string()
    } else {
        format!("redis://{}", seed)
    };
    let url = url::Url::parse(&with_scheme).map_err(|_| invalid())?;
    if url.scheme() != "redis" {
        return Err(Error::InvalidArgument {
            message: "invalid scheme, expected redis://".to_string(),
        });
    }
    let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok(format!("{}:{}", host, url.port().unwrap_or(6379)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_default() {
        let options = ClusterOptions::default();
        assert!(options.validate_cluster_node_membership);
        assert_eq!(options.max_redirects, 5);
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert!(options.client_name.is_none());
        assert!(options.auto_flush);
    }

    #[test]
    fn test_builder_collects_seeds() {
        let builder = ClusterClientBuilder::new()
            .seeds("127.0.0.1:7000, redis://127.0.0.1:7001,")
            .seed("localhost", 7002)
            .max_redirects(2)
            .client_name("app");
        assert_eq!(builder.seeds.len(), 3);
        assert_eq!(builder.options.max_redirects, 2);
        assert_eq!(builder.options.client_name.as_deref(), Some("app"));
    }

    #[test]
    fn test_parse_seed() {
        assert_eq!(parse_seed("127.0.0.1:7000").unwrap(), "127.0.0.1:7000");
        assert_eq!(parse_seed("redis://example.com").unwrap(), "example.com:6379");
        assert!(parse_seed("http://example.com:1").is_err());
        assert!(parse_seed("redis://:7000").is_err());
    }

    #[tokio::test]
    async fn test_build_without_seeds() {
        let result = ClusterClientBuilder::new().build().await;
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }
}
