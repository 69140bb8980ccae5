//! Broker client seams.
//!
//! The transport talks to the broker through three small traits mirroring the
//! AMQP object model: a [`BrokerConnector`] opens a network
//! [`BrokerConnection`], which opens a logical [`BrokerChannel`] used for
//! publishing. [`amqp`] provides the RabbitMQ implementation; tests plug in an
//! in-memory broker instead.

pub mod amqp;

use std::time::Duration;

use crate::error::BrokerFault;

pub use amqp::AmqpConnector;

/// Factory for broker connections.
pub trait BrokerConnector: Send + Sync {
    /// Open a new network connection.
    fn open_connection(&self) -> Result<Box<dyn BrokerConnection>, BrokerFault>;

    /// Human-readable target used in diagnostics.
    fn describe(&self) -> String;
}

/// An open network connection to the broker.
pub trait BrokerConnection: Send {
    /// Open a logical channel on this connection.
    fn open_channel(&mut self) -> Result<Box<dyn BrokerChannel>, BrokerFault>;

    fn is_open(&self) -> bool;

    /// Release the connection. Must not fail.
    fn close(self: Box<Self>);
}

/// A logical channel capable of confirmed publishing.
pub trait BrokerChannel: Send {
    /// Publish `payload` and wait up to `timeout` for the broker to confirm
    /// it was routed and accepted.
    fn publish(
        &mut self,
        payload: &[u8],
        content_type: &str,
        timeout: Duration,
    ) -> Result<(), BrokerFault>;

    fn is_open(&self) -> bool;

    /// Release the channel. Must not fail.
    fn close(self: Box<Self>);
}
