//! Transfer layer between [`LookupClient`](crate::LookupClient) and the
//! network.
//!
//! A transport pushes [`TransferEvent`]s for every transfer it runs onto a
//! single channel owned by the client. Each event carries the
//! [`TransferToken`] of the transfer that produced it, so the client can
//! discard late events from a transfer it has already cancelled or
//! superseded by comparing tokens instead of round-tripping the request
//! URL. For one transfer the events arrive strictly in order: status,
//! zero or more chunks, completion.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;
use tracing::debug;
use url::Url;

/// Identity of a single transfer, unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferToken(u64);

impl TransferToken {
    pub(crate) fn next() -> TransferToken {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TransferToken(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Network-level transfer failure.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> TransportError {
        TransportError {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> TransportError {
        TransportError::new(err.to_string())
    }
}

/// One observation point in a transfer's lifecycle.
#[derive(Debug)]
pub struct TransferEvent {
    pub token: TransferToken,
    pub kind: EventKind,
}

#[derive(Debug)]
pub enum EventKind {
    /// Response metadata arrived; the numeric HTTP status.
    Status(u16),
    /// A slice of the payload arrived.
    Chunk(Bytes),
    /// The transfer finished, successfully or not.
    Done(Result<(), TransportError>),
}

impl TransferEvent {
    pub fn status(token: TransferToken, status: u16) -> TransferEvent {
        TransferEvent {
            token,
            kind: EventKind::Status(status),
        }
    }

    pub fn chunk(token: TransferToken, bytes: Bytes) -> TransferEvent {
        TransferEvent {
            token,
            kind: EventKind::Chunk(bytes),
        }
    }

    pub fn done(token: TransferToken, result: Result<(), TransportError>) -> TransferEvent {
        TransferEvent {
            token,
            kind: EventKind::Done(result),
        }
    }
}

/// Token plus abort hook for a started transfer.
pub struct TransferHandle {
    token: TransferToken,
    abort: Box<dyn FnOnce() + Send>,
}

impl TransferHandle {
    pub fn new(token: TransferToken, abort: impl FnOnce() + Send + 'static) -> TransferHandle {
        TransferHandle {
            token,
            abort: Box::new(abort),
        }
    }

    pub fn token(&self) -> TransferToken {
        self.token
    }

    /// Stops the underlying transfer. Events it already queued are still
    /// delivered and must be filtered by token.
    pub fn abort(self) {
        (self.abort)();
    }
}

/// Something that can run one HTTP transfer and report it as events.
pub trait Transport: Send + 'static {
    fn start(&mut self, url: Url, events: &UnboundedSender<TransferEvent>) -> TransferHandle;
}

/// The reqwest-backed transport used outside of tests.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> HttpTransport {
        HttpTransport {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> HttpTransport {
        HttpTransport::new()
    }
}

impl Transport for HttpTransport {
    fn start(&mut self, url: Url, events: &UnboundedSender<TransferEvent>) -> TransferHandle {
        let token = TransferToken::next();
        let client = self.client.clone();
        let events = events.clone();
        debug!(?token, %url, "starting transfer");
        let task = tokio::spawn(async move {
            // Send failures here mean the client went away; nothing is
            // listening for the events anyway.
            match client
                .get(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .send()
                .await
            {
                Ok(mut response) => {
                    let _ = events.send(TransferEvent::status(token, response.status().as_u16()));
                    loop {
                        match response.chunk().await {
                            Ok(Some(bytes)) => {
                                let _ = events.send(TransferEvent::chunk(token, bytes));
                            }
                            Ok(None) => {
                                let _ = events.send(TransferEvent::done(token, Ok(())));
                                break;
                            }
                            Err(err) => {
                                let _ =
                                    events.send(TransferEvent::done(token, Err(err.into())));
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    let _ = events.send(TransferEvent::done(token, Err(err.into())));
                }
            }
        });
        let abort: AbortHandle = task.abort_handle();
        TransferHandle::new(token, move || abort.abort())
    }
}
