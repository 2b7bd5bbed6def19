//! Error taxonomy shared by every layer of the client.

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O failure while connecting or while reading an open stream.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The initial response to a subscribe request was not 200.
    #[error("subscribe returned non-200 status {status}")]
    NonSuccessResponse { status: u16 },

    /// Malformed line or unrecognised frame type on the stream.
    #[error("malformed protocol: {0}")]
    ProtocolViolation(String),

    /// API used out of order (double subscribe, unsubscribe while idle).
    #[error("misuse: {0}")]
    Misuse(String),

    /// Token or credential exchange failed.
    #[error("token exchange failed: {0}")]
    AuthExchange(String),

    /// The retry strategy gave up. Always terminal.
    #[error("subscription terminated ({reason}): {source}")]
    RetryExhausted {
        reason: String,
        #[source]
        source: Box<Error>,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("config error: {0}")]
    Config(String),

    #[error("credential store error: {0}")]
    Store(String),
}

impl Error {
    /// The failure that started it all, looking through terminal wrappers.
    pub fn cause(&self) -> &Error {
        match self {
            Error::RetryExhausted { source, .. } => source.cause(),
            other => other,
        }
    }

    /// Whether this error is offered to the retry strategy by a subscription.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost(_)
                | Error::NonSuccessResponse { .. }
                | Error::ProtocolViolation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_unwraps_nested_terminal_errors() {
        let err = Error::RetryExhausted {
            reason: "outer".into(),
            source: Box::new(Error::RetryExhausted {
                reason: "inner".into(),
                source: Box::new(Error::NonSuccessResponse { status: 503 }),
            }),
        };
        assert!(matches!(
            err.cause(),
            Error::NonSuccessResponse { status: 503 }
        ));
    }

    #[test]
    fn only_stream_failures_are_retryable() {
        assert!(Error::ConnectionLost("reset".into()).is_retryable());
        assert!(Error::NonSuccessResponse { status: 500 }.is_retryable());
        assert!(Error::ProtocolViolation("bad".into()).is_retryable());
        assert!(!Error::Misuse("twice".into()).is_retryable());
        assert!(!Error::AuthExchange("denied".into()).is_retryable());
    }

    #[test]
    fn terminal_error_mentions_reason_and_cause() {
        let err = Error::RetryExhausted {
            reason: "too many reconnects".into(),
            source: Box::new(Error::ConnectionLost("stream reset".into())),
        };
        let text = err.to_string();
        assert!(text.contains("too many reconnects"));
        assert!(text.contains("stream reset"));
    }
}
