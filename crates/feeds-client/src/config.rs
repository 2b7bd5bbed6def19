use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

pub(crate) const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub(crate) const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const HOSTED_API: &str = "https://api.private-beta-1.pusherplatform.com:443/apps";

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientConfig {
    /// Service root; feeds live under `{base_url}/feeds/{name}`.
    pub base_url: String,
    /// Token authorization. Requests go out anonymously when unset.
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuthConfig {
    /// Token endpoint for `client_credentials` and `refresh_token` grants.
    pub endpoint: String,
    /// Identity sent with the client_credentials grant.
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// TCP/TLS connect timeout, applied to every request.
    pub connect_timeout_ms: u64,
    /// Whole-request timeout for one-shot requests. Streams never time out.
    pub request_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl TimingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth: None,
            timing: TimingConfig::default(),
        }
    }

    /// Configuration for an app on the hosted service.
    pub fn for_app(app_id: &str) -> Self {
        Self::new(format!("{HOSTED_API}/{app_id}"))
    }

    pub fn with_auth(mut self, endpoint: impl Into<String>) -> Self {
        self.auth = Some(AuthConfig {
            endpoint: endpoint.into(),
            user_id: None,
        });
        self
    }

    /// Check the configuration and return the parsed base URL.
    pub fn validate(&self) -> Result<url::Url> {
        let base = parse_http_url(&self.base_url, "base_url")?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "base_url cannot carry a path: {}",
                self.base_url
            )));
        }

        if let Some(auth) = &self.auth {
            parse_http_url(&auth.endpoint, "auth.endpoint")?;
            if auth.user_id.as_deref().is_some_and(str::is_empty) {
                return Err(Error::Config("auth.user_id must not be empty".into()));
            }
        }

        if self.timing.connect_timeout_ms == 0 {
            return Err(Error::Config("timing.connect_timeout_ms must be > 0".into()));
        }
        if self.timing.request_timeout_ms == 0 {
            return Err(Error::Config("timing.request_timeout_ms must be > 0".into()));
        }
        Ok(base)
    }
}

fn parse_http_url(raw: &str, label: &str) -> Result<url::Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::Config(format!("{label} must not be empty")));
    }
    let url = url::Url::parse(raw).map_err(|e| Error::Config(format!("{label}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(Error::Config(format!(
            "{label}: unsupported scheme {other}"
        ))),
    }
}
