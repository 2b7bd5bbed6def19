use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::{Method, RequestBuilder, Response};
use tracing::debug;

use crate::auth::Authorizer;
use crate::config::TimingConfig;
use crate::error::{Error, Result};
use crate::protocol::{LAST_EVENT_ID_HEADER, SUBSCRIBE_METHOD};

/// Header identifying the client library on every request.
pub const CLIENT_HEADER: &str = "Feeds-Client";
const LIBRARY_NAME: &str = "feeds-client-rs";

/// A decoration applied to every outgoing request, in list order.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestLayer {
    /// `Feeds-Client: client=..&client-version=..&os=..&arch=..`
    ClientInfo(String),
    /// `Cache-Control: no-cache, no-store`
    NoCache,
    /// Any fixed header.
    Header(String, String),
}

impl RequestLayer {
    pub fn client_info() -> Self {
        let info = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("client", LIBRARY_NAME)
            .append_pair("client-version", env!("CARGO_PKG_VERSION"))
            .append_pair("os", std::env::consts::OS)
            .append_pair("arch", std::env::consts::ARCH)
            .finish();
        Self::ClientInfo(info)
    }

    fn apply(&self, builder: RequestBuilder) -> RequestBuilder {
        match self {
            Self::ClientInfo(info) => builder.header(CLIENT_HEADER, info.as_str()),
            Self::NoCache => builder.header(CACHE_CONTROL, "no-cache, no-store"),
            Self::Header(name, value) => builder.header(name.as_str(), value.as_str()),
        }
    }
}

/// Layers every client gets unless told otherwise.
pub fn default_layers() -> Vec<RequestLayer> {
    vec![RequestLayer::client_info(), RequestLayer::NoCache]
}

/// Connection pool plus the fixed request decoration list. Used both for
/// feed traffic and for token exchanges. Clone is a cheap Arc refcount bump.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    client: reqwest::Client,
    layers: Vec<RequestLayer>,
    request_timeout: Duration,
}

impl Transport {
    pub fn new(timing: &TimingConfig, layers: Vec<RequestLayer>) -> Result<Self> {
        // Only a connect timeout: a total timeout would cut long-lived streams.
        let client = reqwest::Client::builder()
            .connect_timeout(timing.connect_timeout())
            .build()?;

        Ok(Self {
            inner: Arc::new(TransportInner {
                client,
                layers,
                request_timeout: timing.request_timeout(),
            }),
        })
    }

    /// Start a request with every layer applied.
    pub fn request(&self, method: Method, url: url::Url) -> RequestBuilder {
        self.inner
            .layers
            .iter()
            .fold(self.inner.client.request(method, url), |builder, layer| {
                layer.apply(builder)
            })
    }

    /// Start a request that must complete within the request timeout.
    pub fn one_shot(&self, method: Method, url: url::Url) -> RequestBuilder {
        self.request(method, url).timeout(self.inner.request_timeout)
    }

    pub async fn execute(&self, request: reqwest::Request) -> Result<Response> {
        Ok(self.inner.client.execute(request).await?)
    }
}

/// Pass 2xx responses through; anything else becomes [`Error::Status`].
pub(crate) async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Status {
        status: status.as_u16(),
        body,
    })
}

/// Feed-service client: resolves feed URLs and sends every request through
/// the configured [`Authorizer`].
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Transport,
    base_url: url::Url,
    authorizer: Arc<dyn Authorizer>,
}

impl HttpClient {
    pub fn new(base_url: url::Url, transport: Transport, authorizer: Arc<dyn Authorizer>) -> Self {
        debug!(base_url = %base_url, "http client initialized");
        Self {
            inner: Arc::new(Inner {
                transport,
                base_url,
                authorizer,
            }),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    pub fn authorizer(&self) -> &Arc<dyn Authorizer> {
        &self.inner.authorizer
    }

    /// `{base_url}/feeds/{name}`, with `name` percent-encoded as one segment.
    pub fn feed_url(&self, name: &str) -> Result<url::Url> {
        let base = &self.inner.base_url;
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|()| Error::Config(format!("base URL cannot be a base: {base}")))?
            .pop_if_empty()
            .push("feeds")
            .push(name);
        Ok(url)
    }

    /// Build a one-shot request with layers and request timeout applied.
    pub fn one_shot(&self, method: Method, url: url::Url) -> RequestBuilder {
        self.inner.transport.one_shot(method, url)
    }

    /// Build and send a request through the authorizer.
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        self.execute(builder.build()?).await
    }

    pub async fn execute(&self, request: reqwest::Request) -> Result<Response> {
        self.inner
            .authorizer
            .authorize(&self.inner.transport, request)
            .await
    }

    /// Build the streaming `SUBSCRIBE` request for a resource.
    pub fn subscribe_request(
        &self,
        url: &url::Url,
        last_event_id: Option<&str>,
    ) -> Result<reqwest::Request> {
        let method = Method::from_bytes(SUBSCRIBE_METHOD.as_bytes())
            .map_err(|e| Error::Config(format!("subscribe method: {e}")))?;
        let mut builder = self
            .inner
            .transport
            .request(method, url.clone())
            .header(ACCEPT, "application/json");
        if let Some(id) = last_event_id {
            builder = builder.header(LAST_EVENT_ID_HEADER, id);
        }
        Ok(builder.build()?)
    }
}
