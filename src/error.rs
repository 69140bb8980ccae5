//! Error types surfaced by the relay.

use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::config::ConfigError;

/// Failure reported by a broker connection or channel.
#[derive(Debug, Error)]
pub enum BrokerFault {
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Error raised by the AMQP client library.
    #[error("broker protocol error: {0}")]
    Protocol(String),
    /// The broker negatively acknowledged the publish.
    #[error("broker rejected the message")]
    Nacked,
    /// The message could not be routed to any queue.
    #[error("message was returned as unroutable")]
    Unroutable,
    #[error("no publisher confirm within {0:?}")]
    ConfirmTimeout(Duration),
    #[error("broker link is closed")]
    Closed,
}

impl BrokerFault {
    /// True when the connection or channel can no longer be trusted.
    ///
    /// A nack or an unroutable return leaves the link usable.
    pub fn is_link_fault(&self) -> bool {
        !matches!(self, BrokerFault::Nacked | BrokerFault::Unroutable)
    }
}

/// Errors returned by the transport, store, sink, and reconciler.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The transport is known to be unhealthy; no I/O was attempted.
    #[error("broker transport is not connected")]
    NotConnected,
    /// I/O was attempted and failed; the transport is now disconnected.
    #[error("publish to broker failed: {source}")]
    PublishFailed {
        #[source]
        source: BrokerFault,
    },
    /// A single connect attempt failed; the transport is disconnected.
    #[error("connect to broker failed: {source}")]
    ConnectFailed {
        #[source]
        source: BrokerFault,
    },
    /// The bounded reconnect budget is used up.
    #[error("reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    /// The durable fallback medium failed. No record of the event exists.
    #[error("fallback store {} is unavailable: {source}", path.display())]
    StoreUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The transport has been torn down.
    #[error("broker transport has been disposed")]
    Disposed,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RelayError {
    /// True when reconnecting and publishing again might deliver the event.
    ///
    /// A disposed transport never comes back, and store or configuration
    /// failures have nothing to do with the broker.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RelayError::Disposed | RelayError::StoreUnavailable { .. } | RelayError::Config(_)
        )
    }
}
