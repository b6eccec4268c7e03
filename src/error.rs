//! Error types for the feed client and the volume refresher.
//!
//! Transport failures are recovered by the client itself and show up as
//! [`ConnectionState`](crate::model::ConnectionState) changes; the variants
//! below are what callers see from individual operations.
use std::time::Duration;

use thiserror::Error;

/// Errors returned by [`FeedClient`](crate::feed::FeedClient) operations and
/// feed transports.
#[derive(Error, Debug)]
pub enum FeedError {
    /// The transport could not be opened or failed mid-session.
    #[error("feed transport error: {0}")]
    Transport(String),

    /// The transport did not finish connecting in time.
    #[error("timed out connecting to feed after {0:?}")]
    ConnectTimeout(Duration),

    /// The operation needs a Connected client.
    #[error("feed client is not connected")]
    NotConnected,

    /// Blank or otherwise unusable security code.
    #[error("invalid security code: {0:?}")]
    InvalidCode(String),

    /// Upstream refused the subscription (unknown code, market closed, ...).
    #[error("subscription for {code} rejected: {reason}")]
    Rejected { code: String, reason: String },

    /// No acknowledgement arrived for a subscribe request.
    #[error("timed out waiting for subscription ack for {0}")]
    SubscribeTimeout(String),

    /// Another subscribe for the same code is still waiting for its ack.
    #[error("subscription for {0} is already pending")]
    SubscribePending(String),

    /// The session dropped while a request was in flight.
    #[error("feed connection lost")]
    Disconnected,

    /// The client was closed while the operation was running.
    #[error("feed client closed")]
    Closed,

    /// A frame could not be encoded or decoded.
    #[error("malformed feed frame: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        FeedError::Transport(err.to_string())
    }
}

/// Errors from a single volume/trading-value pull query.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Network or client-level HTTP failure.
    #[error("volume request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream answered with a non-success status.
    #[error("volume endpoint returned HTTP {status} for {code}")]
    Status { code: String, status: u16 },

    /// Response body did not match the expected shape.
    #[error("malformed volume response: {0}")]
    Malformed(String),

    /// The configured endpoint cannot carry a code path segment.
    #[error("invalid volume endpoint URL: {0}")]
    InvalidUrl(String),

    /// The fetch exceeded its per-request budget.
    #[error("volume fetch timed out after {0:?}")]
    Timeout(Duration),
}
