//! RabbitMQ (AMQP 0-9-1) implementation of the broker seams.
//!
//! `lapin` is asynchronous; the relay is thread based, so every call is
//! driven to completion with `futures_lite::future::block_on` on the calling
//! thread while lapin's own executor handles socket I/O. Every blocking call
//! is bounded by an `async_io::Timer` so an unresponsive broker cannot stall
//! the caller indefinitely.

use std::{future::Future, io, time::Duration};

use async_io::Timer;
use futures_lite::future;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
    options::{
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
};
use log::debug;

use crate::{config::BrokerConfig, error::BrokerFault};

use super::{BrokerChannel, BrokerConnection, BrokerConnector};

const REPLY_SUCCESS: u16 = 200;
/// Upper bound on graceful close handshakes.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
/// AMQP delivery mode marking a message persistent.
const PERSISTENT: u8 = 2;

fn protocol(err: lapin::Error) -> BrokerFault {
    BrokerFault::Protocol(err.to_string())
}

/// Drive `fut` to completion on this thread, giving up after `timeout`.
fn block_on_timeout<T>(
    fut: impl Future<Output = Result<T, lapin::Error>>,
    timeout: Duration,
) -> Result<T, BrokerFault> {
    block_on_or(fut, timeout, || {
        BrokerFault::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("broker did not respond within {timeout:?}"),
        ))
    })
}

fn block_on_or<T>(
    fut: impl Future<Output = Result<T, lapin::Error>>,
    timeout: Duration,
    on_timeout: impl FnOnce() -> BrokerFault,
) -> Result<T, BrokerFault> {
    future::block_on(future::or(async { fut.await.map_err(protocol) }, async {
        Timer::after(timeout).await;
        Err(on_timeout())
    }))
}

/// Opens RabbitMQ connections described by a [`BrokerConfig`].
#[derive(Clone, Debug)]
pub struct AmqpConnector {
    config: BrokerConfig,
}

impl AmqpConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    fn uri(&self) -> AMQPUri {
        let cfg = &self.config;
        AMQPUri {
            scheme: if cfg.tls {
                AMQPScheme::AMQPS
            } else {
                AMQPScheme::AMQP
            },
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: cfg.username.clone(),
                    password: cfg.password.clone(),
                },
                host: cfg.host.clone(),
                port: cfg.port,
            },
            vhost: cfg.virtual_host.clone(),
            query: AMQPQueryString {
                heartbeat: Some(cfg.heartbeat),
                connection_timeout: Some(
                    u64::try_from(cfg.connect_timeout.as_millis()).unwrap_or(u64::MAX),
                ),
                ..AMQPQueryString::default()
            },
        }
    }
}

impl BrokerConnector for AmqpConnector {
    fn open_connection(&self) -> Result<Box<dyn BrokerConnection>, BrokerFault> {
        let properties =
            ConnectionProperties::default().with_connection_name("femtorelay".into());
        let connection = block_on_timeout(
            Connection::connect_uri(self.uri(), properties),
            self.config.connect_timeout,
        )?;
        debug!("FemtoBrokerTransport connected to {}", self.describe());
        Ok(Box::new(AmqpConnection {
            inner: connection,
            config: self.config.clone(),
        }))
    }

    fn describe(&self) -> String {
        let scheme = if self.config.tls { "amqps" } else { "amqp" };
        format!(
            "{scheme}://{}:{}/{}",
            self.config.host, self.config.port, self.config.virtual_host
        )
    }
}

struct AmqpConnection {
    inner: Connection,
    config: BrokerConfig,
}

impl AmqpConnection {
    /// Enable confirms and declare the configured topology.
    fn prepare(&self, channel: &Channel) -> Result<(), BrokerFault> {
        let cfg = &self.config;
        let timeout = cfg.connect_timeout;
        block_on_timeout(
            channel.confirm_select(ConfirmSelectOptions::default()),
            timeout,
        )?;
        if !cfg.declare_topology {
            return Ok(());
        }
        if !cfg.exchange.is_empty() {
            block_on_timeout(
                channel.exchange_declare(
                    &cfg.exchange,
                    ExchangeKind::Direct,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                ),
                timeout,
            )?;
        }
        if !cfg.queue.is_empty() {
            block_on_timeout(
                channel.queue_declare(
                    &cfg.queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                ),
                timeout,
            )?;
            if !cfg.exchange.is_empty() {
                block_on_timeout(
                    channel.queue_bind(
                        &cfg.queue,
                        &cfg.exchange,
                        cfg.effective_routing_key(),
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    ),
                    timeout,
                )?;
            }
        }
        Ok(())
    }
}

impl BrokerConnection for AmqpConnection {
    fn open_channel(&mut self) -> Result<Box<dyn BrokerChannel>, BrokerFault> {
        let channel = block_on_timeout(self.inner.create_channel(), self.config.connect_timeout)?;
        if let Err(err) = self.prepare(&channel) {
            let _ = block_on_timeout(channel.close(REPLY_SUCCESS, "setup failed"), CLOSE_TIMEOUT);
            return Err(err);
        }
        Ok(Box::new(AmqpChannel {
            inner: channel,
            exchange: self.config.exchange.clone(),
            routing_key: self.config.effective_routing_key().to_owned(),
        }))
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn close(self: Box<Self>) {
        if self.inner.status().connected()
            && let Err(err) =
                block_on_timeout(self.inner.close(REPLY_SUCCESS, "closing"), CLOSE_TIMEOUT)
        {
            debug!("FemtoBrokerTransport connection close failed: {err}");
        }
    }
}

struct AmqpChannel {
    inner: Channel,
    exchange: String,
    routing_key: String,
}

impl BrokerChannel for AmqpChannel {
    fn publish(
        &mut self,
        payload: &[u8],
        content_type: &str,
        timeout: Duration,
    ) -> Result<(), BrokerFault> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type(content_type.into());
        let options = BasicPublishOptions {
            mandatory: true,
            ..BasicPublishOptions::default()
        };
        let confirmation = block_on_or(
            async {
                self.inner
                    .basic_publish(
                        &self.exchange,
                        &self.routing_key,
                        options,
                        payload,
                        properties,
                    )
                    .await?
                    .await
            },
            timeout,
            || BrokerFault::ConfirmTimeout(timeout),
        )?;
        match confirmation {
            Confirmation::Ack(None) => Ok(()),
            // A returned message is acked but was not routed to any queue.
            Confirmation::Ack(Some(_)) => Err(BrokerFault::Unroutable),
            Confirmation::Nack(_) => Err(BrokerFault::Nacked),
            Confirmation::NotRequested => Err(BrokerFault::Protocol(
                "publisher confirms are not enabled on this channel".into(),
            )),
        }
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn close(self: Box<Self>) {
        if self.inner.status().connected()
            && let Err(err) =
                block_on_timeout(self.inner.close(REPLY_SUCCESS, "closing"), CLOSE_TIMEOUT)
        {
            debug!("FemtoBrokerTransport channel close failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::net::TcpListener;

    fn config() -> BrokerConfig {
        BrokerConfig {
            host: "rabbit.internal".into(),
            port: 5671,
            username: "svc".into(),
            password: "secret".into(),
            tls: true,
            heartbeat: 30,
            connect_timeout: Duration::from_millis(1500),
            queue: "logs".into(),
            ..BrokerConfig::default()
        }
    }

    #[rstest]
    fn uri_carries_credentials_and_timeouts() {
        let uri = AmqpConnector::new(config()).uri();
        assert_eq!(uri.scheme, AMQPScheme::AMQPS);
        assert_eq!(uri.authority.host, "rabbit.internal");
        assert_eq!(uri.authority.port, 5671);
        assert_eq!(uri.authority.userinfo.username, "svc");
        assert_eq!(uri.vhost, "/");
        assert_eq!(uri.query.heartbeat, Some(30));
        assert_eq!(uri.query.connection_timeout, Some(1500));
    }

    #[rstest]
    fn describe_omits_credentials() {
        let described = AmqpConnector::new(config()).describe();
        assert_eq!(described, "amqps://rabbit.internal:5671//");
        assert!(!described.contains("secret"));
    }

    #[rstest]
    fn connect_to_silent_peer_times_out() {
        // Accepts TCP but never speaks AMQP.
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind listener");
        let port = listener.local_addr().expect("local addr").port();
        let connector = AmqpConnector::new(BrokerConfig {
            host: "127.0.0.1".into(),
            port,
            connect_timeout: Duration::from_millis(200),
            queue: "logs".into(),
            ..BrokerConfig::default()
        });
        let started = std::time::Instant::now();
        assert!(connector.open_connection().is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(listener);
    }
}
