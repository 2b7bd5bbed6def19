//! Request authorization: anonymous pass-through, or bearer tokens obtained
//! and refreshed against a token endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::{Method, Response, StatusCode};
use tracing::{debug, info, warn};

use crate::credentials::{Credential, CredentialStore, unix_now};
use crate::error::{Error, Result};
use crate::http::Transport;
use crate::protocol::{TokenResponse, grant_type};

/// Sends of one request (first try plus refresh-and-replay) before the
/// last 401 is handed back to the caller.
const MAX_AUTHORIZATION_ATTEMPTS: u32 = 3;

/// Forwards requests with whatever credentials the server expects.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Send `request` and return the server's response.
    async fn authorize(&self, transport: &Transport, request: reqwest::Request)
    -> Result<Response>;

    /// Identity to use when credentials must be obtained from scratch.
    fn set_user_id(&self, _user_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Sends requests unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousAuthorizer;

#[async_trait]
impl Authorizer for AnonymousAuthorizer {
    async fn authorize(
        &self,
        transport: &Transport,
        request: reqwest::Request,
    ) -> Result<Response> {
        transport.execute(request).await
    }
}

#[derive(Clone, Copy)]
enum Grant<'a> {
    ClientCredentials,
    Refresh(&'a Credential),
}

/// Bearer-token authorizer.
///
/// - no stored credential: `client_credentials` exchange, then send
/// - stored and unexpired: send with `Authorization: Bearer ..`
/// - expired, or the server answered 401: `refresh_token` exchange, then
///   replay the request
///
/// Exchanges are serialized: a caller that waited on an in-flight refresh
/// reuses its result instead of refreshing again.
pub struct TokenAuthorizer {
    endpoint: url::Url,
    store: Arc<dyn CredentialStore>,
    refresh: tokio::sync::Mutex<()>,
}

impl TokenAuthorizer {
    pub fn new(endpoint: url::Url, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            endpoint,
            store,
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// A usable access token. `rejected` is a token the server just
    /// answered 401 to; it is never handed out again.
    async fn bearer_token(&self, transport: &Transport, rejected: Option<&str>) -> Result<String> {
        let _guard = self.refresh.lock().await;
        let now = unix_now();

        match self.store.load()? {
            Some(credential)
                if !credential.is_expired_at(now)
                    && rejected != Some(credential.access_token.as_str()) =>
            {
                Ok(credential.access_token)
            }
            Some(credential) => {
                info!(
                    expired = credential.is_expired_at(now),
                    "Refreshing access token"
                );
                self.exchange(transport, Grant::Refresh(&credential)).await
            }
            None => {
                info!("No stored credential, requesting client credentials");
                self.exchange(transport, Grant::ClientCredentials).await
            }
        }
    }

    /// Run one token exchange and persist the result.
    async fn exchange(&self, transport: &Transport, grant: Grant<'_>) -> Result<String> {
        let user_id = self.store.user_id()?;
        let form: Vec<(&str, &str)> = match grant {
            Grant::ClientCredentials => vec![
                ("grant_type", grant_type::CLIENT_CREDENTIALS),
                ("user_id", user_id.as_deref().unwrap_or_default()),
            ],
            Grant::Refresh(credential) => vec![
                ("grant_type", grant_type::REFRESH_TOKEN),
                ("refresh_token", credential.refresh_token.as_str()),
            ],
        };

        let response = transport
            .one_shot(Method::POST, self.endpoint.clone())
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::AuthExchange(format!("token request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Grant::Refresh(_) = grant
                && matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED)
            {
                warn!(%status, "Refresh token rejected, discarding stored credential");
                self.store.clear()?;
            }
            return Err(Error::AuthExchange(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::AuthExchange(format!("token response: {e}")))?;
        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| Error::AuthExchange(format!("malformed token response: {e}")))?;

        let previous_refresh = match grant {
            Grant::Refresh(credential) => Some(credential.refresh_token.as_str()),
            Grant::ClientCredentials => None,
        };
        let credential = Credential::from_response(token, previous_refresh, user_id, unix_now())?;
        self.store.save(&credential)?;
        debug!(expires_at = credential.expires_at, "Stored new credential");
        Ok(credential.access_token)
    }
}

#[async_trait]
impl Authorizer for TokenAuthorizer {
    async fn authorize(
        &self,
        transport: &Transport,
        request: reqwest::Request,
    ) -> Result<Response> {
        let mut rejected: Option<String> = None;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let token = self.bearer_token(transport, rejected.as_deref()).await?;

            let mut outgoing = request
                .try_clone()
                .ok_or_else(|| Error::Misuse("request body cannot be replayed".into()))?;
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| Error::AuthExchange("access token is not a valid header".into()))?;
            value.set_sensitive(true);
            outgoing.headers_mut().insert(AUTHORIZATION, value);

            let response = transport.execute(outgoing).await?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }
            if attempt >= MAX_AUTHORIZATION_ATTEMPTS {
                warn!(attempt, url = %request.url(), "Still unauthorized, giving up");
                return Ok(response);
            }
            warn!(attempt, url = %request.url(), "Request unauthorized, refreshing");
            rejected = Some(token);
        }
    }

    fn set_user_id(&self, user_id: &str) -> Result<()> {
        if self.store.user_id()?.as_deref() != Some(user_id) {
            // Stored tokens belong to the previous identity.
            self.store.clear()?;
        }
        self.store.set_user_id(user_id)
    }
}
