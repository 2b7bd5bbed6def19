//! Entry point: validated configuration in, feeds out.

use std::sync::Arc;

use tracing::info;

use crate::auth::{AnonymousAuthorizer, Authorizer, TokenAuthorizer};
use crate::config::ClientConfig;
use crate::credentials::{CredentialStore, MemoryCredentialStore};
use crate::error::{Error, Result};
use crate::feed::Feed;
use crate::http::{HttpClient, Transport, default_layers};
use crate::retry::RetryPolicy;

/// Connection to one feeds service. Clone is a cheap Arc refcount bump.
#[derive(Clone)]
pub struct FeedsClient {
    http: HttpClient,
}

impl FeedsClient {
    /// Client with credentials kept in memory.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(MemoryCredentialStore::new()))
    }

    /// Client whose token credentials persist through `store`. Without an
    /// auth endpoint configured, requests go out anonymously and the store
    /// is unused.
    pub fn with_store(config: ClientConfig, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let authorizer: Arc<dyn Authorizer> = match &config.auth {
            Some(auth) => {
                let endpoint = url::Url::parse(auth.endpoint.trim())
                    .map_err(|e| Error::Config(format!("auth.endpoint: {e}")))?;
                if let Some(user_id) = &auth.user_id {
                    store.set_user_id(user_id)?;
                }
                Arc::new(TokenAuthorizer::new(endpoint, store))
            }
            None => Arc::new(AnonymousAuthorizer),
        };
        Self::with_authorizer(config, authorizer)
    }

    /// Client with a caller-supplied authorizer; `config.auth` is ignored.
    pub fn with_authorizer(config: ClientConfig, authorizer: Arc<dyn Authorizer>) -> Result<Self> {
        let base_url = config.validate()?;
        let transport = Transport::new(&config.timing, default_layers())?;
        info!(base_url = %base_url, "Feeds client ready");
        Ok(Self {
            http: HttpClient::new(base_url, transport, authorizer),
        })
    }

    /// Handle to the feed `name` with the default reconnect policy.
    pub fn feed(&self, name: &str) -> Result<Feed> {
        self.feed_with_retry(name, RetryPolicy::default())
    }

    pub fn feed_with_retry(&self, name: &str, retry: RetryPolicy) -> Result<Feed> {
        if name.is_empty() {
            return Err(Error::Config("feed name must not be empty".into()));
        }
        Feed::new(name, self.http.clone(), retry)
    }

    /// Identity for subsequent client_credentials exchanges.
    pub fn set_user_id(&self, user_id: &str) -> Result<()> {
        if user_id.is_empty() {
            return Err(Error::Config("user id must not be empty".into()));
        }
        self.http.authorizer().set_user_id(user_id)
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }
}

impl std::fmt::Debug for FeedsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedsClient").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;

    #[test]
    fn invalid_config_fails_construction() {
        let err = FeedsClient::new(ClientConfig::new("ftp://example.com")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn configured_user_id_reaches_store() {
        let mut config = ClientConfig::new("http://localhost:8080").with_auth("http://localhost:8080/token");
        if let Some(AuthConfig { user_id, .. }) = config.auth.as_mut() {
            *user_id = Some("alice".into());
        }
        let store = Arc::new(MemoryCredentialStore::new());
        let client = FeedsClient::with_store(config, store.clone()).unwrap();
        assert_eq!(store.user_id().unwrap().as_deref(), Some("alice"));

        client.set_user_id("bob").unwrap();
        assert_eq!(store.user_id().unwrap().as_deref(), Some("bob"));
    }

    #[test]
    fn feed_urls_live_under_base() {
        let client = FeedsClient::new(ClientConfig::for_app("app-1")).unwrap();
        let feed = client.feed("posts").unwrap();
        assert_eq!(feed.name(), "posts");
        assert!(matches!(client.feed(""), Err(Error::Config(_))));
    }

    #[test]
    fn anonymous_client_accepts_user_id() {
        let client = FeedsClient::new(ClientConfig::new("http://localhost")).unwrap();
        assert!(client.set_user_id("alice").is_ok());
        assert!(matches!(client.set_user_id(""), Err(Error::Config(_))));
    }
}
