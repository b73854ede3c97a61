//! Runtime configuration for a dashboard host.
//!
//! A [`HostConfig`] is built from code-level defaults layered under
//! `INTERVAL_`-prefixed environment variables, so deployments can repoint the
//! endpoint or loosen timeouts without a rebuild. Timeouts are stored as
//! integral milliseconds to keep the environment surface simple; accessors
//! expose them as [`Duration`]s.

use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Default websocket endpoint of the dashboard service.
pub const DEFAULT_ENDPOINT: &str = "wss://interval.com/websocket";

/// Environment variable prefix recognised during [`HostConfig::load`].
pub const ENV_PREFIX: &str = "INTERVAL_";

const DEFAULT_SEND_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_PING_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_PING_INTERVAL_MS: u64 = 30_000;
const DEFAULT_RETRY_INTERVAL_MS: u64 = 3_000;
const DEFAULT_CLOSE_UNRESPONSIVE_TIMEOUT_MS: u64 = 180_000;
const DEFAULT_REINITIALIZE_BATCH_TIMEOUT_MS: u64 = 200;

/// Errors produced while loading or deriving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configured endpoint is not a parseable URL.
    #[error("invalid endpoint URL: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    /// The configured endpoint does not use a websocket scheme.
    #[error("unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),
    /// The environment layer could not be merged.
    #[error(transparent)]
    Environment(#[from] Box<figment::Error>),
}

/// Connection settings shared by every part of the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// API key presented in the `x-api-key` upgrade header and HTTP calls.
    pub api_key: String,
    /// Websocket endpoint to dial.
    pub endpoint: String,
    /// How long a framed `send` waits for its acknowledgement.
    pub send_timeout_ms: u64,
    /// How long `connect` waits for the authentication message.
    pub connect_timeout_ms: u64,
    /// How long a `ping` waits for its acknowledgement.
    pub ping_timeout_ms: u64,
    /// Interval between liveness pings.
    pub ping_interval_ms: u64,
    /// Back-off between reconnect attempts and awaiting-connection retries.
    pub retry_interval_ms: u64,
    /// Silence threshold after which the connection is closed and re-dialled.
    pub close_unresponsive_connection_timeout_ms: u64,
    /// Debounce window coalescing route-registry changes into one re-init.
    pub reinitialize_batch_timeout_ms: u64,
    /// Number of producer workers draining the outbound frame queue.
    pub num_message_producers: usize,
}

impl HostConfig {
    /// Create a configuration with the library defaults.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            ping_timeout_ms: DEFAULT_PING_TIMEOUT_MS,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            close_unresponsive_connection_timeout_ms: DEFAULT_CLOSE_UNRESPONSIVE_TIMEOUT_MS,
            reinitialize_batch_timeout_ms: DEFAULT_REINITIALIZE_BATCH_TIMEOUT_MS,
            num_message_producers: 1,
        }
    }

    /// Create a configuration from defaults overlaid with `INTERVAL_`
    /// environment variables (e.g. `INTERVAL_ENDPOINT`,
    /// `INTERVAL_RETRY_INTERVAL_MS`).
    ///
    /// # Errors
    /// Returns an error when an environment value cannot be parsed into the
    /// field it targets.
    pub fn load(api_key: impl Into<String>) -> Result<Self, ConfigError> {
        Figment::from(Serialized::defaults(Self::new(api_key)))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|err| ConfigError::Environment(Box::new(err)))
    }

    /// Replace the websocket endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Replace the outbound producer count.
    #[must_use]
    pub const fn with_message_producers(mut self, count: usize) -> Self {
        self.num_message_producers = count;
        self
    }

    /// The HTTP API base derived from the websocket endpoint: same host,
    /// `http[s]` scheme, path `/api`.
    ///
    /// # Errors
    /// Returns an error when the endpoint is unparseable or not `ws`/`wss`.
    pub fn http_endpoint(&self) -> Result<Url, ConfigError> {
        let mut url = Url::parse(&self.endpoint)?;
        let scheme = match url.scheme() {
            "ws" => "http",
            "wss" => "https",
            other => return Err(ConfigError::UnsupportedScheme(other.to_owned())),
        };
        if url.set_scheme(scheme).is_err() {
            return Err(ConfigError::UnsupportedScheme(url.scheme().to_owned()));
        }
        url.set_path("/api");
        Ok(url)
    }

    /// A full HTTP API address for the given path.
    ///
    /// # Errors
    /// Returns an error when the endpoint cannot be converted to an HTTP
    /// base.
    pub fn api_url(&self, path: &str) -> Result<Url, ConfigError> {
        let base = self.http_endpoint()?;
        let trimmed = path.trim_start_matches('/');
        Ok(Url::parse(&format!("{base}/{trimmed}"))?)
    }

    /// True when the key targets a live (production) environment.
    #[must_use]
    pub fn is_live_key(&self) -> bool { self.api_key.starts_with("live_") }

    /// Acknowledgement timeout for framed sends.
    #[must_use]
    pub const fn send_timeout(&self) -> Duration { Duration::from_millis(self.send_timeout_ms) }

    /// Authentication timeout for new connections.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Acknowledgement timeout for liveness pings.
    #[must_use]
    pub const fn ping_timeout(&self) -> Duration { Duration::from_millis(self.ping_timeout_ms) }

    /// Interval between liveness pings.
    #[must_use]
    pub const fn ping_interval(&self) -> Duration { Duration::from_millis(self.ping_interval_ms) }

    /// Back-off between retries.
    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Silence threshold before an unresponsive connection is closed.
    #[must_use]
    pub const fn close_unresponsive_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.close_unresponsive_connection_timeout_ms)
    }

    /// Debounce window for coalesced re-initialisation.
    #[must_use]
    pub const fn reinitialize_batch_timeout(&self) -> Duration {
        Duration::from_millis(self.reinitialize_batch_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use figment::Jail;
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn defaults_match_documented_values() {
        let cfg = HostConfig::new("test_key");
        assert_eq!(cfg.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(cfg.send_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.ping_interval(), Duration::from_secs(30));
        assert_eq!(
            cfg.close_unresponsive_connection_timeout(),
            Duration::from_secs(180)
        );
        assert_eq!(cfg.reinitialize_batch_timeout(), Duration::from_millis(200));
        assert_eq!(cfg.num_message_producers, 1);
        assert!(!cfg.is_live_key());
    }

    #[rstest]
    fn environment_overrides_defaults() {
        Jail::expect_with(|j| {
            j.set_env("INTERVAL_ENDPOINT", "ws://localhost:3000/websocket");
            j.set_env("INTERVAL_RETRY_INTERVAL_MS", "50");
            let cfg = HostConfig::load("test_key").expect("load");
            assert_eq!(cfg.endpoint, "ws://localhost:3000/websocket");
            assert_eq!(cfg.retry_interval(), Duration::from_millis(50));
            assert_eq!(cfg.api_key, "test_key");
            Ok(())
        });
    }

    #[rstest]
    #[case("wss://interval.com/websocket", "https://interval.com/api")]
    #[case("ws://localhost:3000/websocket", "http://localhost:3000/api")]
    fn http_endpoint_swaps_scheme_and_path(#[case] endpoint: &str, #[case] expected: &str) {
        let cfg = HostConfig::new("k").with_endpoint(endpoint);
        assert_eq!(cfg.http_endpoint().expect("derive").as_str(), expected);
    }

    #[rstest]
    fn api_url_joins_below_the_base() {
        let cfg = HostConfig::new("k");
        let url = cfg.api_url("/actions/enqueue").expect("join");
        assert_eq!(url.as_str(), "https://interval.com/api/actions/enqueue");
    }

    #[rstest]
    fn non_websocket_scheme_is_rejected() {
        let cfg = HostConfig::new("k").with_endpoint("https://interval.com/websocket");
        assert!(matches!(
            cfg.http_endpoint(),
            Err(ConfigError::UnsupportedScheme(_))
        ));
    }

    #[rstest]
    fn live_keys_are_detected() {
        assert!(HostConfig::new("live_abc").is_live_key());
        assert!(!HostConfig::new("dev_abc").is_live_key());
    }
}
