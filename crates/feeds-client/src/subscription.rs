//! Resumable streaming subscription.
//!
//! [`ResumableSubscription::subscribe`] spawns a background driver that owns
//! one logical subscription:
//!
//! ```text
//! Idle -> Connecting -> Open -> Closed            (end frame)
//!            ^           |
//!            |           v
//!            +----- Reconnecting -> Failed        (strategy terminates)
//!
//! any active state -> Canceled                    (close())
//! ```
//!
//! Every reconnect resumes from the id of the last message handed to the
//! listener, sent as `Last-Event-ID`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use reqwest::{Response, StatusCode};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::http::HttpClient;
use crate::protocol::{Frame, LineBuffer, parse_frame};
use crate::retry::{RetryDecision, RetryPolicy, RetryStrategy};
use crate::types::{Listeners, MessageEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    /// Waiting for the retry strategy's delay.
    Reconnecting,
    /// The server ended the stream gracefully.
    Closed,
    /// The retry strategy gave up.
    Failed,
    /// Closed by the caller.
    Canceled,
}

impl SessionState {
    /// Whether a logical subscription is in progress.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Open | Self::Reconnecting)
    }
}

/// A streaming subscription to one resource that reconnects through a
/// [`RetryPolicy`] and resumes where it left off.
///
/// Dropping the handle closes the subscription.
pub struct ResumableSubscription {
    client: HttpClient,
    url: url::Url,
    retry: RetryPolicy,
    shared: Arc<Shared>,
}

struct Shared {
    state: watch::Sender<SessionState>,
    session: Mutex<Session>,
}

#[derive(Default)]
struct Session {
    /// Bumped by every `subscribe()`; drivers of older generations can no
    /// longer touch the session.
    generation: u64,
    cancel: Option<CancellationToken>,
    last_event_id: Option<String>,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move an active session of `generation` to `next`.
    fn transition(&self, generation: u64, next: SessionState) -> bool {
        let session = self.session();
        session.generation == generation
            && self.state.send_if_modified(|state| {
                if state.is_active() {
                    *state = next;
                    true
                } else {
                    false
                }
            })
    }

    fn record_delivery(&self, generation: u64, id: String) {
        let mut session = self.session();
        if session.generation == generation {
            session.last_event_id = Some(id);
        }
    }
}

impl ResumableSubscription {
    pub fn new(client: HttpClient, url: url::Url, retry: RetryPolicy) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            client,
            url,
            retry,
            shared: Arc::new(Shared {
                state,
                session: Mutex::new(Session::default()),
            }),
        }
    }

    /// Start streaming into `listeners`.
    ///
    /// Resumes from `last_event_id` if given, otherwise from the last id
    /// this subscription delivered. Fails with [`Error::Misuse`] while a
    /// subscription is already active. Must be called within a Tokio
    /// runtime.
    pub fn subscribe(
        &self,
        listeners: Listeners<MessageEvent>,
        last_event_id: Option<String>,
    ) -> Result<()> {
        let (generation, cancel) = {
            let mut session = self.shared.session();
            let current = *self.shared.state.borrow();
            if current.is_active() {
                return Err(Error::Misuse(format!(
                    "already subscribed to {} ({current:?})",
                    self.url
                )));
            }
            session.generation += 1;
            if let Some(id) = last_event_id {
                session.last_event_id = Some(id);
            }
            let cancel = CancellationToken::new();
            session.cancel = Some(cancel.clone());
            self.shared.state.send_replace(SessionState::Connecting);
            (session.generation, cancel)
        };

        info!(url = %self.url, "Subscribing");
        let driver = Driver {
            client: self.client.clone(),
            url: self.url.clone(),
            strategy: self.retry.strategy(),
            listeners,
            shared: Arc::clone(&self.shared),
            generation,
            cancel,
        };
        tokio::spawn(driver.run());
        Ok(())
    }

    /// Cancel the in-flight call and any pending retry. Idempotent.
    pub fn close(&self) {
        let session = self.shared.session();
        if let Some(cancel) = &session.cancel {
            cancel.cancel();
        }
        let closed = self.shared.state.send_if_modified(|state| {
            if state.is_active() {
                *state = SessionState::Canceled;
                true
            } else {
                false
            }
        });
        if closed {
            info!(url = %self.url, "Subscription closed");
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.state().is_active()
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Id of the last message delivered to a listener.
    pub fn last_event_id(&self) -> Option<String> {
        self.shared.session().last_event_id.clone()
    }

    pub fn url(&self) -> &url::Url {
        &self.url
    }
}

impl Drop for ResumableSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ResumableSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableSubscription")
            .field("url", &self.url.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

enum Outcome {
    /// End frame received.
    Ended,
    Canceled,
    Failed(Error),
}

struct Driver {
    client: HttpClient,
    url: url::Url,
    strategy: Box<dyn RetryStrategy>,
    listeners: Listeners<MessageEvent>,
    shared: Arc<Shared>,
    generation: u64,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        loop {
            let outcome = tokio::select! {
                outcome = self.attempt() => outcome,
                () = cancel.cancelled() => Outcome::Canceled,
            };

            let failure = match outcome {
                Outcome::Ended => {
                    info!(url = %self.url, "Stream ended by server");
                    self.set_state(SessionState::Closed);
                    return;
                }
                Outcome::Canceled => {
                    debug!(url = %self.url, "Stream canceled");
                    self.strategy.cancel();
                    self.set_state(SessionState::Canceled);
                    return;
                }
                Outcome::Failed(failure) if !failure.is_retryable() => {
                    error!(url = %self.url, error = %failure, "Subscription failed");
                    if self.set_state(SessionState::Failed) {
                        self.listeners.error(failure);
                    }
                    return;
                }
                Outcome::Failed(failure) => failure,
            };

            self.set_state(SessionState::Reconnecting);
            match self.strategy.try_again() {
                RetryDecision::Scheduled(retry) => {
                    warn!(
                        url = %self.url,
                        delay_ms = retry.delay().as_millis() as u64,
                        error = %failure,
                        "Stream failed, reconnecting"
                    );
                    let fired = tokio::select! {
                        fired = retry.wait() => fired,
                        () = cancel.cancelled() => false,
                    };
                    if !fired {
                        self.strategy.cancel();
                        self.set_state(SessionState::Canceled);
                        return;
                    }
                    self.set_state(SessionState::Connecting);
                }
                RetryDecision::Terminate(reason) => {
                    error!(url = %self.url, %reason, error = %failure, "Subscription failed");
                    if self.set_state(SessionState::Failed) {
                        self.listeners.error(Error::RetryExhausted {
                            reason,
                            source: Box::new(failure),
                        });
                    }
                    return;
                }
            }
        }
    }

    fn set_state(&self, next: SessionState) -> bool {
        self.shared.transition(self.generation, next)
    }

    /// One connection: request, status check, then frames until the
    /// stream ends or fails.
    async fn attempt(&mut self) -> Outcome {
        let last_event_id = self.shared.session().last_event_id.clone();
        let request = match self
            .client
            .subscribe_request(&self.url, last_event_id.as_deref())
        {
            Ok(request) => request,
            // An unbuildable request fails identically on every attempt.
            Err(e) => return Outcome::Failed(e),
        };

        let response = match self.client.execute(request).await {
            Ok(response) => response,
            // Authorization failures are retried like a dropped connection.
            Err(e) => return Outcome::Failed(Error::ConnectionLost(e.to_string())),
        };

        let status = response.status();
        if status != StatusCode::OK {
            return Outcome::Failed(Error::NonSuccessResponse {
                status: status.as_u16(),
            });
        }

        info!(url = %self.url, last_event_id = ?last_event_id, "Stream open");
        if !self.set_state(SessionState::Open) {
            return Outcome::Canceled;
        }
        self.strategy.on_open();
        self.listeners.open();

        self.read_frames(response).await
    }

    async fn read_frames(&mut self, response: Response) -> Outcome {
        let mut body = response.bytes_stream();
        let mut buffer = LineBuffer::default();

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => return Outcome::Failed(Error::ConnectionLost(e.to_string())),
            };
            let lines = match buffer.push(&chunk) {
                Ok(lines) => lines,
                Err(e) => return Outcome::Failed(e),
            };

            for line in lines {
                if line.trim().is_empty() {
                    continue;
                }
                match parse_frame(&line) {
                    Ok(Frame::KeepAlive) => trace!("Keep-alive"),
                    Ok(Frame::Message(event)) => {
                        let id = event.id.clone();
                        trace!(id = %id, "Message");
                        self.listeners.event(event);
                        self.shared.record_delivery(self.generation, id);
                    }
                    Ok(Frame::End) => return Outcome::Ended,
                    Err(e) => {
                        warn!(url = %self.url, error = %e, "Dropping stream");
                        return Outcome::Failed(e);
                    }
                }
            }
        }

        Outcome::Failed(Error::ConnectionLost(format!(
            "stream ended without an end frame ({} bytes pending)",
            buffer.pending_len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AnonymousAuthorizer;
    use crate::config::TimingConfig;
    use crate::http::{Transport, default_layers};

    fn subscription(base: &str) -> ResumableSubscription {
        let transport = Transport::new(&TimingConfig::default(), default_layers()).unwrap();
        let client = HttpClient::new(
            url::Url::parse(base).unwrap(),
            transport,
            Arc::new(AnonymousAuthorizer),
        );
        let url = client.feed_url("posts").unwrap();
        ResumableSubscription::new(client, url, RetryPolicy::Disabled)
    }

    /// A listener that accepts connections but never answers, so the
    /// subscription stays in `Connecting`.
    async fn silent_server() -> (tokio::net::TcpListener, String) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        (listener, base)
    }

    #[test]
    fn active_states() {
        assert!(!SessionState::Idle.is_active());
        assert!(SessionState::Connecting.is_active());
        assert!(SessionState::Open.is_active());
        assert!(SessionState::Reconnecting.is_active());
        assert!(!SessionState::Closed.is_active());
        assert!(!SessionState::Failed.is_active());
        assert!(!SessionState::Canceled.is_active());
    }

    #[tokio::test]
    async fn close_while_idle_is_a_no_op() {
        let sub = subscription("http://127.0.0.1:1");
        sub.close();
        sub.close();
        assert_eq!(sub.state(), SessionState::Idle);
        assert!(!sub.is_subscribed());
    }

    #[tokio::test]
    async fn second_subscribe_while_active_is_misuse() {
        let (_listener, base) = silent_server().await;
        let sub = subscription(&base);

        let (listeners, _rx) = Listeners::channel();
        sub.subscribe(listeners, None).unwrap();
        assert!(sub.is_subscribed());

        let (listeners, _rx2) = Listeners::channel();
        let err = sub.subscribe(listeners, None).unwrap_err();
        assert!(matches!(err, Error::Misuse(_)));
        assert_eq!(sub.state(), SessionState::Connecting);
    }

    #[tokio::test]
    async fn close_cancels_without_error() {
        let (_listener, base) = silent_server().await;
        let sub = subscription(&base);

        let (listeners, mut rx) = Listeners::channel();
        sub.subscribe(listeners, Some("9".into())).unwrap();
        sub.close();
        sub.close();

        assert_eq!(sub.state(), SessionState::Canceled);
        assert!(!sub.is_subscribed());
        // Listeners are dropped without any event once the driver exits.
        assert!(rx.recv().await.is_none());
        assert_eq!(sub.last_event_id().as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn resubscribe_after_close_starts_new_session() {
        let (_listener, base) = silent_server().await;
        let sub = subscription(&base);
        let states = sub.watch_state();

        let (listeners, _rx) = Listeners::channel();
        sub.subscribe(listeners, None).unwrap();
        sub.close();

        let (listeners, _rx2) = Listeners::channel();
        sub.subscribe(listeners, None).unwrap();
        assert_eq!(sub.state(), SessionState::Connecting);
        assert!(states.has_changed().unwrap());

        // The first driver winding down must not touch the new session.
        tokio::task::yield_now().await;
        assert_eq!(sub.state(), SessionState::Connecting);
    }
}
