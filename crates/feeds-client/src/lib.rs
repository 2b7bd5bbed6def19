//! Client for append-only feeds served over long-lived HTTP streams.
//!
//! # Features
//! - `SUBSCRIBE` streams of newline-delimited `[type, id, headers, body]` frames
//! - Automatic reconnection with quadratic backoff, resuming via `Last-Event-ID`
//! - Bearer-token authorization with single-flight refresh and pluggable
//!   credential storage
//! - History pagination merged with the live stream, without gaps
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), feeds_client::Error> {
//! use feeds_client::{ClientConfig, Event, FeedsClient, Listeners};
//!
//! let config = ClientConfig::for_app("my-app").with_auth("https://example.com/token");
//! let client = FeedsClient::new(config)?;
//! let feed = client.feed("notifications")?;
//!
//! let (listeners, mut events) = Listeners::channel();
//! feed.subscribe(listeners, None).await?;
//! while let Some(event) = events.recv().await {
//!     match event {
//!         Event::Message(item) => println!("{:?}: {}", item.id, item.data),
//!         Event::Open => println!("stream open"),
//!         Event::Error(e) => eprintln!("gave up: {e}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod auth;
mod client;
mod config;
mod credentials;
mod error;
mod feed;
mod http;
pub mod protocol;
mod retry;
mod subscription;
mod types;

pub use auth::{AnonymousAuthorizer, Authorizer, TokenAuthorizer};
pub use client::FeedsClient;
pub use config::{AuthConfig, ClientConfig, TimingConfig};
pub use credentials::{Credential, CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use error::{Error, Result};
pub use feed::{Feed, FeedCursor, FetchedItems};
pub use http::{CLIENT_HEADER, HttpClient, RequestLayer, Transport, default_layers};
pub use retry::{
    BackoffConfig, DefaultRetryStrategy, NoRetryStrategy, RetryDecision, RetryPolicy,
    RetryStrategy, ScheduledRetry,
};
pub use subscription::{ResumableSubscription, SessionState};
pub use types::{Event, Item, Listeners, MessageEvent};
