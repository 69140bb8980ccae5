//! Resilient delivery of application log events to a message broker.
//!
//! Events are published to RabbitMQ through a [`FemtoBrokerTransport`]. When
//! the broker is unreachable the [`FemtoResilientSink`] records them in a
//! durable [`FemtoFallbackStore`], and a background [`FemtoReconciler`]
//! replays the store once the broker returns. [`FemtoRelay`] wires the
//! pieces together from a [`RelayConfig`].

pub mod broker;
pub mod codec;
pub mod config;
pub mod error;
pub mod fallback_store;
pub mod level;
pub mod log_event;
pub mod rate_limited_warner;
pub mod reconciler;
pub mod relay;
pub mod sink;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod test_utils;

pub use broker::{AmqpConnector, BrokerChannel, BrokerConnection, BrokerConnector};
pub use codec::WireFormat;
pub use config::{BrokerConfig, ConfigError, RelayConfig, RelayConfigBuilder};
pub use error::{BrokerFault, RelayError};
pub use fallback_store::FemtoFallbackStore;
pub use level::{FemtoLevel, ParseLevelError};
pub use log_event::{ErrorDetail, FemtoLogEvent};
pub use rate_limited_warner::RateLimitedWarner;
pub use reconciler::{FemtoReconciler, ReconcilerHandle, ReconcilerPhase, TickOutcome};
pub use relay::FemtoRelay;
pub use sink::{Delivery, FemtoResilientSink};
pub use transport::{ConnectionState, FemtoBrokerTransport, ReconnectPolicy};
