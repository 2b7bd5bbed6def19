//! Public types for the feeds-client crate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Error;

/// A message delivered on a resumable subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    /// Event id; the resumption point for the next reconnect.
    pub id: String,
    /// Per-event headers sent by the server.
    pub headers: HashMap<String, String>,
    /// Event payload.
    pub body: serde_json::Value,
}

/// A feed item. The id is assigned server-side on append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Item {
    /// A new item to append; the server assigns its id.
    pub fn new(data: serde_json::Value) -> Self {
        Self { id: None, data }
    }
}

impl From<MessageEvent> for Item {
    fn from(event: MessageEvent) -> Self {
        Self {
            id: Some(event.id),
            data: event.body,
        }
    }
}

/// Events emitted through [`Listeners::channel`].
#[derive(Debug)]
pub enum Event<T> {
    /// The stream was opened (or re-opened after a reconnect).
    Open,
    /// A message or item was received.
    Message(T),
    /// A terminal error; nothing follows it.
    Error(Error),
}

type OpenFn = Box<dyn FnMut() + Send>;
type EventFn<T> = Box<dyn FnMut(T) + Send>;
type ErrorFn = Box<dyn FnMut(Error) + Send>;

/// Callbacks attached to a subscription.
///
/// Every callback runs on the subscription's background task, in wire order.
pub struct Listeners<T> {
    pub(crate) on_open: Option<OpenFn>,
    pub(crate) on_event: EventFn<T>,
    pub(crate) on_error: ErrorFn,
}

impl<T: 'static> Listeners<T> {
    pub fn new(
        on_event: impl FnMut(T) + Send + 'static,
        on_error: impl FnMut(Error) + Send + 'static,
    ) -> Self {
        Self {
            on_open: None,
            on_event: Box::new(on_event),
            on_error: Box::new(on_error),
        }
    }

    /// Called every time the stream opens, including after reconnects.
    pub fn on_open(mut self, on_open: impl FnMut() + Send + 'static) -> Self {
        self.on_open = Some(Box::new(on_open));
        self
    }

    pub(crate) fn open(&mut self) {
        if let Some(on_open) = self.on_open.as_mut() {
            on_open();
        }
    }

    pub(crate) fn event(&mut self, value: T) {
        (self.on_event)(value);
    }

    pub(crate) fn error(&mut self, error: Error) {
        (self.on_error)(error);
    }
}

impl<T: Send + 'static> Listeners<T> {
    /// Listeners that forward everything into an unbounded channel.
    ///
    /// The receiver yields `None` once the subscription task has finished
    /// and dropped its listeners.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event<T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let open_tx = tx.clone();
        let error_tx = tx.clone();
        let listeners = Self::new(
            move |value| {
                let _ = tx.send(Event::Message(value));
            },
            move |error| {
                let _ = error_tx.send(Event::Error(error));
            },
        )
        .on_open(move || {
            let _ = open_tx.send(Event::Open);
        });
        (listeners, rx)
    }
}

impl<T> std::fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("on_open", &self.on_open.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_without_id_skips_id_field() {
        let json = serde_json::to_string(&Item::new(serde_json::json!({"x": 1}))).unwrap();
        assert_eq!(json, r#"{"data":{"x":1}}"#);
    }

    #[test]
    fn item_deserializes_with_missing_data() {
        let item: Item = serde_json::from_str(r#"{"id":"7"}"#).unwrap();
        assert_eq!(item.id.as_deref(), Some("7"));
        assert_eq!(item.data, serde_json::Value::Null);
    }

    #[test]
    fn message_event_becomes_item() {
        let event = MessageEvent {
            id: "42".into(),
            headers: HashMap::new(),
            body: serde_json::json!({"x": 1}),
        };
        let item = Item::from(event);
        assert_eq!(item.id.as_deref(), Some("42"));
        assert_eq!(item.data, serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn channel_listeners_preserve_order() {
        let (mut listeners, mut rx) = Listeners::<u32>::channel();
        listeners.open();
        listeners.event(1);
        listeners.event(2);
        listeners.error(Error::Misuse("done".into()));
        drop(listeners);

        assert!(matches!(rx.recv().await, Some(Event::Open)));
        assert!(matches!(rx.recv().await, Some(Event::Message(1))));
        assert!(matches!(rx.recv().await, Some(Event::Message(2))));
        assert!(matches!(rx.recv().await, Some(Event::Error(Error::Misuse(_)))));
        assert!(rx.recv().await.is_none());
    }
}
