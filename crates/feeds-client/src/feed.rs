//! Named feed: paginated history, live items, and appends.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reqwest::Method;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::http::{HttpClient, ensure_success};
use crate::protocol::{AppendRequest, FetchResponse};
use crate::retry::RetryPolicy;
use crate::subscription::{ResumableSubscription, SessionState};
use crate::types::{Item, Listeners, MessageEvent};

/// Pagination progress through a feed's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedCursor {
    /// Continuation id for the next older page.
    pub oldest_item_id: Option<String>,
    /// Id of the newest item delivered to a subscriber.
    pub newest_item_id: Option<String>,
    /// `false` once the server reports no older page.
    pub has_more: bool,
}

impl Default for FeedCursor {
    fn default() -> Self {
        Self {
            oldest_item_id: None,
            newest_item_id: None,
            has_more: true,
        }
    }
}

/// One page of history, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedItems {
    pub items: Vec<Item>,
    pub next_id: Option<String>,
}

pub struct Feed {
    name: String,
    client: HttpClient,
    url: url::Url,
    cursor: Arc<Mutex<FeedCursor>>,
    /// Held by a `subscribe` call between its first check and the start of
    /// the live stream.
    pending: Mutex<Option<CancellationToken>>,
    subscription: ResumableSubscription,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the pending slot when a `subscribe` call returns or is dropped
/// before going live.
struct Reservation<'a> {
    slot: &'a Mutex<Option<CancellationToken>>,
    token: CancellationToken,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            *lock(self.slot) = None;
        }
    }
}

impl Feed {
    pub(crate) fn new(name: &str, client: HttpClient, retry: RetryPolicy) -> Result<Self> {
        let url = client.feed_url(name)?;
        let subscription = ResumableSubscription::new(client.clone(), url.clone(), retry);
        Ok(Self {
            name: name.to_string(),
            client,
            url,
            cursor: Arc::new(Mutex::new(FeedCursor::default())),
            pending: Mutex::new(None),
            subscription,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cursor(&self) -> FeedCursor {
        lock(&self.cursor).clone()
    }

    /// Fetch one page of history starting at `from_id` (newest page when
    /// unset).
    ///
    /// Returns an empty page without a request once the history is
    /// exhausted.
    pub async fn fetch_items(
        &self,
        from_id: Option<&str>,
        limit: Option<u32>,
    ) -> Result<FetchedItems> {
        if !lock(&self.cursor).has_more {
            debug!(feed = %self.name, "History exhausted, skipping fetch");
            return Ok(FetchedItems::default());
        }

        let mut url = self.url.clone();
        let mut params = Vec::new();
        if let Some(from_id) = from_id {
            params.push(("from_id", from_id.to_string()));
        }
        if let Some(limit) = limit {
            params.push(("limit", limit.to_string()));
        }
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }

        let response = self.client.send(self.client.one_shot(Method::GET, url)).await?;
        let page: FetchResponse = ensure_success(response).await?.json().await?;

        {
            let mut cursor = lock(&self.cursor);
            match &page.next_id {
                Some(next_id) => cursor.oldest_item_id = Some(next_id.clone()),
                None => {
                    cursor.has_more = false;
                    if let Some(oldest) = page.items.last().and_then(|item| item.id.clone()) {
                        cursor.oldest_item_id = Some(oldest);
                    }
                }
            }
        }
        debug!(
            feed = %self.name,
            count = page.items.len(),
            next_id = ?page.next_id,
            "Fetched history page"
        );

        Ok(FetchedItems {
            items: page.items,
            next_id: page.next_id,
        })
    }

    /// Fetch the page after the one the cursor points at.
    pub async fn fetch_older_items(&self, limit: Option<u32>) -> Result<FetchedItems> {
        let from_id = lock(&self.cursor).oldest_item_id.clone();
        self.fetch_items(from_id.as_deref(), limit).await
    }

    /// Deliver history then live items to `listeners`, oldest first.
    ///
    /// - `last_item_id` given: stream live items after that id.
    /// - nothing delivered yet: fetch one history page, deliver it, then
    ///   stream from its newest item.
    /// - otherwise: resume after the newest delivered item.
    ///
    /// A failed history fetch is returned here; live-stream failures go to
    /// the error listener. An [`unsubscribe`](Self::unsubscribe) while the
    /// history is in flight cancels the call: it returns `Ok(())` without
    /// delivering anything.
    pub async fn subscribe(
        &self,
        mut listeners: Listeners<Item>,
        last_item_id: Option<String>,
    ) -> Result<()> {
        let mut reservation = self.reserve()?;

        let newest_delivered = lock(&self.cursor).newest_item_id.clone();
        let resume_from = match (last_item_id, newest_delivered) {
            (Some(id), _) | (None, Some(id)) => Some(id),
            (None, None) => {
                let history = tokio::select! {
                    history = self.fetch_older_items(None) => history?,
                    () = reservation.token.cancelled() => {
                        info!(feed = %self.name, "Subscribe canceled during history fetch");
                        return Ok(());
                    }
                };
                info!(feed = %self.name, count = history.items.len(), "Delivering history");
                for item in history.items.into_iter().rev() {
                    let id = item.id.clone();
                    listeners.event(item);
                    if id.is_some() {
                        lock(&self.cursor).newest_item_id = id;
                    }
                }
                lock(&self.cursor).newest_item_id.clone()
            }
        };

        let cursor = Arc::clone(&self.cursor);
        let Listeners {
            on_open,
            mut on_event,
            on_error,
        } = listeners;
        let live: Listeners<MessageEvent> = Listeners {
            on_open,
            on_event: Box::new(move |event: MessageEvent| {
                let item = Item::from(event);
                let id = item.id.clone();
                on_event(item);
                lock(&cursor).newest_item_id = id;
            }),
            on_error,
        };

        let mut pending = lock(&self.pending);
        reservation.armed = false;
        *pending = None;
        if reservation.token.is_cancelled() {
            info!(feed = %self.name, "Subscribe canceled before going live");
            return Ok(());
        }
        self.subscription.subscribe(live, resume_from)
    }

    /// Claim the feed for one `subscribe` call, or fail with Misuse while
    /// another call or a live stream holds it.
    fn reserve(&self) -> Result<Reservation<'_>> {
        let mut pending = lock(&self.pending);
        if pending.is_some() || self.subscription.is_subscribed() {
            return Err(Error::Misuse(format!(
                "already subscribed to feed {}",
                self.name
            )));
        }
        let token = CancellationToken::new();
        *pending = Some(token.clone());
        Ok(Reservation {
            slot: &self.pending,
            token,
            armed: true,
        })
    }

    /// Stop the live stream, or cancel a `subscribe` still fetching history.
    pub fn unsubscribe(&self) -> Result<()> {
        let pending = lock(&self.pending);
        if let Some(token) = pending.as_ref()
            && !token.is_cancelled()
        {
            token.cancel();
            info!(feed = %self.name, "Pending subscribe canceled");
            return Ok(());
        }
        if !self.subscription.is_subscribed() {
            return Err(Error::Misuse(format!("not subscribed to feed {}", self.name)));
        }
        self.subscription.close();
        Ok(())
    }

    /// True from the start of a `subscribe` call until the stream stops.
    pub fn is_subscribed(&self) -> bool {
        let pending = lock(&self.pending);
        pending.as_ref().is_some_and(|token| !token.is_cancelled())
            || self.subscription.is_subscribed()
    }

    pub fn state(&self) -> SessionState {
        self.subscription.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.subscription.watch_state()
    }

    /// Append a batch. The response body is ignored.
    pub async fn append(&self, items: &[Item]) -> Result<()> {
        let builder = self
            .client
            .one_shot(Method::POST, self.url.clone())
            .json(&AppendRequest { items });
        ensure_success(self.client.send(builder).await?).await?;
        debug!(feed = %self.name, count = items.len(), "Appended items");
        Ok(())
    }

    pub async fn append_item(&self, item: Item) -> Result<()> {
        self.append(std::slice::from_ref(&item)).await
    }
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("name", &self.name)
            .field("cursor", &self.cursor())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
