//! Broker transport with an explicit connection lifecycle.
//!
//! `FemtoBrokerTransport` owns at most one connection and one channel to the
//! broker. Both live together in a link: a transport is `Connected` only while
//! it holds a link whose connection and channel are open, and any failure
//! closes the whole link. A single mutex serialises every check-and-act on
//! that state, so a publish never races a reconnect in progress.

mod backoff;

use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
    thread,
    time::Duration,
};

use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::{
    broker::{AmqpConnector, BrokerChannel, BrokerConnection, BrokerConnector},
    codec::{WireFormat, encode_event},
    config::{BrokerConfig, DEFAULT_PUBLISH_TIMEOUT},
    error::{BrokerFault, RelayError},
    log_event::FemtoLogEvent,
};

pub use backoff::{DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_BASE_DELAY, ReconnectPolicy};

/// Connection lifecycle as observed by monitoring.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// An open connection together with its publishing channel.
struct Link {
    connection: Box<dyn BrokerConnection>,
    channel: Box<dyn BrokerChannel>,
}

impl Link {
    fn is_open(&self) -> bool {
        self.connection.is_open() && self.channel.is_open()
    }

    fn close(self) {
        self.channel.close();
        self.connection.close();
    }
}

struct TransportState {
    link: Option<Link>,
    attempts: u32,
    disposed: bool,
}

/// Publishes events to the broker and manages reconnection.
pub struct FemtoBrokerTransport {
    connector: Box<dyn BrokerConnector>,
    inner: Mutex<TransportState>,
    /// Mirror of the lifecycle state. Written only while `inner` is held.
    state: AtomicU8,
    wire_format: WireFormat,
    publish_timeout: Duration,
    policy: ReconnectPolicy,
}

impl FemtoBrokerTransport {
    /// Create a disconnected transport. No I/O happens until [`connect`]
    /// or [`reconnect`] is called.
    ///
    /// [`connect`]: Self::connect
    /// [`reconnect`]: Self::reconnect
    pub fn new(connector: impl BrokerConnector + 'static) -> Self {
        Self {
            connector: Box::new(connector),
            inner: Mutex::new(TransportState {
                link: None,
                attempts: 0,
                disposed: false,
            }),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            wire_format: WireFormat::default(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            policy: ReconnectPolicy::default(),
        }
    }

    /// Transport for a RabbitMQ broker.
    pub fn from_config(config: &BrokerConfig, policy: ReconnectPolicy) -> Self {
        Self::configured(AmqpConnector::new(config.clone()), config, policy)
    }

    /// Transport reaching the broker through `connector`, with the wire
    /// format and publish timeout taken from `config`.
    pub fn configured(
        connector: impl BrokerConnector + 'static,
        config: &BrokerConfig,
        policy: ReconnectPolicy,
    ) -> Self {
        Self::new(connector)
            .with_wire_format(config.wire_format)
            .with_publish_timeout(config.publish_timeout)
            .with_reconnect_policy(policy)
    }

    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }

    /// Bound on a single publish including its confirm.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Current lifecycle state. Never blocks.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, _guard: &MutexGuard<'_, TransportState>, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether both the connection and the channel are currently open.
    ///
    /// Pure observation: never attempts to reconnect.
    pub fn is_healthy(&self) -> bool {
        let guard = self.inner.lock();
        !guard.disposed && guard.link.as_ref().is_some_and(Link::is_open)
    }

    /// Consecutive failed connect attempts since the last success or rearm.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    /// Establish the connection and channel.
    ///
    /// Idempotent while connected. A failure counts against the reconnect
    /// budget and leaves no partially opened resource behind.
    pub fn connect(&self) -> Result<(), RelayError> {
        let mut guard = self.inner.lock();
        self.connect_locked(&mut guard)
    }

    fn connect_locked(&self, guard: &mut MutexGuard<'_, TransportState>) -> Result<(), RelayError> {
        if guard.disposed {
            return Err(RelayError::Disposed);
        }
        if guard.link.as_ref().is_some_and(Link::is_open) {
            return Ok(());
        }
        self.teardown(guard);
        self.set_state(guard, ConnectionState::Connecting);
        match self.open_link() {
            Ok(link) => {
                guard.link = Some(link);
                guard.attempts = 0;
                self.set_state(guard, ConnectionState::Connected);
                Ok(())
            }
            Err(source) => {
                guard.attempts = guard.attempts.saturating_add(1);
                self.set_state(guard, ConnectionState::Disconnected);
                Err(RelayError::ConnectFailed { source })
            }
        }
    }

    fn open_link(&self) -> Result<Link, BrokerFault> {
        let mut connection = self.connector.open_connection()?;
        let channel = match connection.open_channel() {
            Ok(channel) => channel,
            Err(err) => {
                connection.close();
                return Err(err);
            }
        };
        let link = Link {
            connection,
            channel,
        };
        if !link.is_open() {
            // The connection dropped while the channel was being opened.
            link.close();
            return Err(BrokerFault::Closed);
        }
        Ok(link)
    }

    /// Close and forget the current link, if any.
    fn teardown(&self, guard: &mut MutexGuard<'_, TransportState>) {
        if let Some(link) = guard.link.take() {
            link.close();
        }
        self.set_state(guard, ConnectionState::Disconnected);
    }

    /// Publish one event and wait for the broker to confirm it.
    ///
    /// Fails with [`RelayError::NotConnected`] without any I/O when the
    /// transport is unhealthy. A link-level failure during the send closes
    /// the link and yields [`RelayError::PublishFailed`].
    pub fn publish(&self, event: &FemtoLogEvent) -> Result<(), RelayError> {
        let payload = encode_event(event, self.wire_format).map_err(|e| {
            RelayError::PublishFailed {
                source: BrokerFault::Io(e),
            }
        })?;
        let mut guard = self.inner.lock();
        if guard.disposed {
            return Err(RelayError::Disposed);
        }
        if !guard.link.as_ref().is_some_and(Link::is_open) {
            self.teardown(&mut guard);
            return Err(RelayError::NotConnected);
        }
        let Some(link) = guard.link.as_mut() else {
            return Err(RelayError::NotConnected);
        };
        let result = link.channel.publish(
            &payload,
            self.wire_format.content_type(),
            self.publish_timeout,
        );
        match result {
            Ok(()) => Ok(()),
            Err(source) => {
                if source.is_link_fault() {
                    debug!("FemtoBrokerTransport publish failed, closing link: {source}");
                    self.teardown(&mut guard);
                }
                Err(RelayError::PublishFailed { source })
            }
        }
    }

    /// Reconnect with bounded linear backoff, blocking until success or
    /// exhaustion.
    ///
    /// After the `n`th consecutive failure the call sleeps
    /// `base_delay × n` with the state lock released. Once the failure count
    /// reaches `max_attempts` every call fails immediately with
    /// [`RelayError::ReconnectExhausted`] until [`rearm`](Self::rearm).
    pub fn reconnect(&self) -> Result<(), RelayError> {
        loop {
            let failures = {
                let mut guard = self.inner.lock();
                if guard.disposed {
                    return Err(RelayError::Disposed);
                }
                if guard.link.as_ref().is_some_and(Link::is_open) {
                    return Ok(());
                }
                if self.policy.is_exhausted(guard.attempts) {
                    return Err(RelayError::ReconnectExhausted {
                        attempts: guard.attempts,
                    });
                }
                match self.connect_locked(&mut guard) {
                    Ok(()) => {
                        info!(
                            "FemtoBrokerTransport connected to {}",
                            self.connector.describe()
                        );
                        return Ok(());
                    }
                    Err(RelayError::ConnectFailed { source }) => {
                        debug!(
                            "FemtoBrokerTransport connect attempt {} to {} failed: {source}",
                            guard.attempts,
                            self.connector.describe()
                        );
                    }
                    Err(other) => return Err(other),
                }
                if self.policy.is_exhausted(guard.attempts) {
                    warn!(
                        "FemtoBrokerTransport giving up on {} after {} attempts",
                        self.connector.describe(),
                        guard.attempts
                    );
                    return Err(RelayError::ReconnectExhausted {
                        attempts: guard.attempts,
                    });
                }
                guard.attempts
            };
            thread::sleep(self.policy.delay_after(failures));
        }
    }

    /// Reset the reconnect budget so the next [`reconnect`](Self::reconnect)
    /// tries again.
    pub fn rearm(&self) {
        self.inner.lock().attempts = 0;
    }

    /// Release the link. Every later operation fails with
    /// [`RelayError::Disposed`]. Calling this again is a no-op.
    pub fn dispose(&self) {
        let mut guard = self.inner.lock();
        if guard.disposed {
            return;
        }
        guard.disposed = true;
        self.teardown(&mut guard);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }
}

impl Drop for FemtoBrokerTransport {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for FemtoBrokerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FemtoBrokerTransport")
            .field("target", &self.connector.describe())
            .field("state", &self.state())
            .field("wire_format", &self.wire_format)
            .field("publish_timeout", &self.publish_timeout)
            .field("policy", &self.policy)
            .finish()
    }
}
