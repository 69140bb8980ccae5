//! End-to-end wiring of transport, fallback store, sink, and reconciler.

use std::sync::Arc;

use log::{info, warn};

use crate::{
    broker::BrokerConnector,
    config::RelayConfig,
    error::RelayError,
    fallback_store::FemtoFallbackStore,
    level::FemtoLevel,
    log_event::{ErrorDetail, FemtoLogEvent},
    rate_limited_warner::RateLimitedWarner,
    reconciler::{FemtoReconciler, ReconcilerHandle, ReconcilerPhase},
    sink::{Delivery, FemtoResilientSink},
    transport::{ConnectionState, FemtoBrokerTransport},
};

/// A running relay: accepts events and keeps the fallback store draining.
pub struct FemtoRelay {
    sink: FemtoResilientSink,
    reconciler: ReconcilerHandle,
}

impl FemtoRelay {
    /// Start a relay against the configured RabbitMQ broker.
    ///
    /// Returns `Ok(None)` when the configuration is disabled. An unreachable
    /// broker is not an error: events go to the fallback store until the
    /// reconciler restores the connection.
    pub fn start(config: RelayConfig) -> Result<Option<Self>, RelayError> {
        Self::launch(config, |config| {
            FemtoBrokerTransport::from_config(&config.broker, config.reconnect)
        })
    }

    /// Start a relay using `connector` to reach the broker.
    pub fn start_with_connector(
        config: RelayConfig,
        connector: impl BrokerConnector + 'static,
    ) -> Result<Option<Self>, RelayError> {
        Self::launch(config, |config| {
            FemtoBrokerTransport::configured(connector, &config.broker, config.reconnect)
        })
    }

    fn launch(
        config: RelayConfig,
        transport: impl FnOnce(&RelayConfig) -> FemtoBrokerTransport,
    ) -> Result<Option<Self>, RelayError> {
        if !config.enabled {
            info!("FemtoRelay disabled by configuration");
            return Ok(None);
        }
        let store = Arc::new(
            FemtoFallbackStore::open(&config.fallback_path)?
                .with_sync_on_append(config.sync_on_append),
        );
        let transport = Arc::new(transport(&config));
        if let Err(err) = transport.connect() {
            warn!(
                "FemtoRelay broker unavailable at startup ({err}); using {} until it returns",
                config.fallback_path.display()
            );
        }
        let sink = FemtoResilientSink::new(Arc::clone(&transport), Arc::clone(&store))
            .with_warner(RateLimitedWarner::new(config.warn_interval));
        let reconciler =
            FemtoReconciler::new(transport, store).spawn(config.reconcile_interval);
        Ok(Some(Self { sink, reconciler }))
    }

    /// Record one log call. See [`FemtoResilientSink::emit`].
    pub fn emit(
        &self,
        message: impl Into<String>,
        level: FemtoLevel,
        error: Option<ErrorDetail>,
    ) -> Result<Delivery, RelayError> {
        self.sink.emit(message, level, error)
    }

    pub fn publish(&self, event: &FemtoLogEvent) -> Result<Delivery, RelayError> {
        self.sink.publish(event)
    }

    /// Whether the broker link is currently up.
    pub fn is_healthy(&self) -> bool {
        self.sink.is_healthy()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.sink.transport().state()
    }

    pub fn reconciler_phase(&self) -> ReconcilerPhase {
        self.reconciler.phase()
    }

    /// Number of events waiting in the fallback store.
    pub fn pending(&self) -> Result<usize, RelayError> {
        self.sink.store().len()
    }

    /// Stop the reconciler and release the broker link.
    ///
    /// Events emitted afterwards go straight to the fallback store.
    pub fn shutdown(&mut self) {
        self.reconciler.shutdown();
        self.sink.transport().dispose();
    }
}

impl Drop for FemtoRelay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for FemtoRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FemtoRelay")
            .field("sink", &self.sink)
            .field("reconciler", &self.reconciler.phase())
            .finish()
    }
}
