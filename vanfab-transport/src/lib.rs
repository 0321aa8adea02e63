//! Messaging transport.
//!
//! A [`Session`] is one point-to-point connection carrying addressed
//! envelopes: length-delimited JSON frames over TCP (or an in-process
//! duplex for tests). Each session exposes one anonymous producer, any
//! number of addressed receivers, and one dynamic reply receiver used to
//! correlate request/reply exchanges. Outbound requests embed a
//! monotonically increasing `correlation_id` and the session's reply
//! address; replies are matched from the session's in-flight table, and a
//! timeout fails the waiter and clears the slot.

mod listener;
mod session;

pub use listener::SessionListener;
pub use session::{Delivery, Sender, Session, DEFAULT_REQUEST_TIMEOUT};

use thiserror::Error;

/// Errors surfaced by transport operations.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The request's waiter timed out
    #[error("Request timed out")]
    Timeout,

    /// The session has been closed
    #[error("Session closed")]
    Closed,

    /// A frame failed to encode or decode
    #[error("Codec error: {0}")]
    Codec(String),
}

pub type TransportResult<T> = Result<T, TransportError>;
