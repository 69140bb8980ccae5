//! Publish-or-fallback delivery path.
//!
//! [`FemtoResilientSink::publish`] returns only once the event is recorded by
//! the broker or by the fallback store. Broker failures are absorbed here;
//! only a failing fallback store reaches the caller.

use std::sync::Arc;

use log::{error, warn};

use crate::{
    error::RelayError,
    fallback_store::FemtoFallbackStore,
    level::FemtoLevel,
    log_event::{ErrorDetail, FemtoLogEvent},
    rate_limited_warner::RateLimitedWarner,
    transport::FemtoBrokerTransport,
};

/// Where an accepted event ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Broker,
    Fallback,
}

pub struct FemtoResilientSink {
    transport: Arc<FemtoBrokerTransport>,
    store: Arc<FemtoFallbackStore>,
    warner: RateLimitedWarner,
}

impl FemtoResilientSink {
    pub fn new(transport: Arc<FemtoBrokerTransport>, store: Arc<FemtoFallbackStore>) -> Self {
        Self {
            transport,
            store,
            warner: RateLimitedWarner::default(),
        }
    }

    /// Replace the warner controlling how often fallback writes are reported.
    pub fn with_warner(mut self, warner: RateLimitedWarner) -> Self {
        self.warner = warner;
        self
    }

    /// Build an event from a log call and publish it.
    pub fn emit(
        &self,
        message: impl Into<String>,
        level: FemtoLevel,
        error: Option<ErrorDetail>,
    ) -> Result<Delivery, RelayError> {
        let mut event = FemtoLogEvent::new(level, message);
        event.error = error;
        self.publish(&event)
    }

    /// Deliver `event` to the broker, reconnecting once if needed, or record
    /// it in the fallback store.
    ///
    /// Returns an error only when the fallback store is unavailable.
    pub fn publish(&self, event: &FemtoLogEvent) -> Result<Delivery, RelayError> {
        let first = match self.transport.publish(event) {
            Ok(()) => return Ok(Delivery::Broker),
            Err(err) => err,
        };
        let cause = if first.is_retryable() {
            match self.transport.reconnect() {
                Ok(()) => match self.transport.publish(event) {
                    Ok(()) => return Ok(Delivery::Broker),
                    Err(err) => err,
                },
                Err(err) => err,
            }
        } else {
            first
        };
        self.fall_back(event, &cause)
    }

    fn fall_back(
        &self,
        event: &FemtoLogEvent,
        cause: &RelayError,
    ) -> Result<Delivery, RelayError> {
        if let Err(err) = self.store.append(event) {
            error!(
                "FemtoResilientSink lost a {} event: broker failed ({cause}) and {err}",
                event.level
            );
            return Err(err);
        }
        self.warner.record();
        self.warner.warn_if_due(|count| {
            warn!(
                "FemtoResilientSink broker unavailable ({cause}); {count} events written to {}",
                self.store.path().display()
            );
        });
        Ok(Delivery::Fallback)
    }

    pub fn is_healthy(&self) -> bool {
        self.transport.is_healthy()
    }

    pub fn transport(&self) -> &Arc<FemtoBrokerTransport> {
        &self.transport
    }

    pub fn store(&self) -> &Arc<FemtoFallbackStore> {
        &self.store
    }
}

impl Drop for FemtoResilientSink {
    fn drop(&mut self) {
        self.warner.flush(|count| {
            warn!(
                "FemtoResilientSink {count} events written to {} since the last report",
                self.store.path().display()
            );
        });
    }
}

impl std::fmt::Debug for FemtoResilientSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FemtoResilientSink")
            .field("transport", &self.transport)
            .field("store", &self.store)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{MemoryBroker, log_capture::capture_logs},
        transport::ReconnectPolicy,
    };
    use rstest::{fixture, rstest};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        broker: MemoryBroker,
        sink: FemtoResilientSink,
        _dir: TempDir,
    }

    #[fixture]
    fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("temp dir");
        let broker = MemoryBroker::new();
        let transport = FemtoBrokerTransport::new(broker.clone())
            .with_reconnect_policy(ReconnectPolicy::new(2, Duration::from_millis(1)));
        let store =
            FemtoFallbackStore::open(dir.path().join("fallback.log")).expect("open store");
        let sink = FemtoResilientSink::new(Arc::new(transport), Arc::new(store));
        Harness {
            broker,
            sink,
            _dir: dir,
        }
    }

    #[rstest]
    fn reconnects_lazily_and_delivers(harness: Harness) {
        let delivery = harness
            .sink
            .emit("started", FemtoLevel::Information, None)
            .expect("emit");
        assert_eq!(delivery, Delivery::Broker);
        assert_eq!(harness.broker.received_messages(), ["started"]);
        assert!(harness.sink.store().is_empty().expect("store"));
    }

    #[rstest]
    fn falls_back_when_broker_is_down(harness: Harness) {
        harness.broker.set_reachable(false);
        let delivery = harness
            .sink
            .emit(
                "db timeout",
                FemtoLevel::Error,
                Some(ErrorDetail::new("timed out after 30s")),
            )
            .expect("emit");
        assert_eq!(delivery, Delivery::Fallback);
        assert!(harness.broker.received().is_empty());
        let stored = harness.sink.store().drain_all().expect("drain");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].message, "db timeout");
        assert_eq!(stored[0].level, FemtoLevel::Error);
    }

    #[rstest]
    fn recovers_from_a_dropped_link_without_fallback(harness: Harness) {
        harness.sink.transport().connect().expect("connect");
        harness.broker.sever();
        let delivery = harness
            .sink
            .emit("after blip", FemtoLevel::Warning, None)
            .expect("emit");
        assert_eq!(delivery, Delivery::Broker);
        assert_eq!(harness.broker.received_messages(), ["after blip"]);
        assert!(harness.sink.store().is_empty().expect("store"));
    }

    #[rstest]
    fn rejected_event_is_stored_once(harness: Harness) {
        harness.sink.transport().connect().expect("connect");
        harness.broker.reject_publishes(true);
        let delivery = harness
            .sink
            .emit("nacked", FemtoLevel::Information, None)
            .expect("emit");
        assert_eq!(delivery, Delivery::Fallback);
        assert_eq!(harness.sink.store().len().expect("len"), 1);
    }

    #[rstest]
    fn disposed_transport_goes_straight_to_the_store(harness: Harness) {
        harness.sink.transport().dispose();
        let delivery = harness
            .sink
            .emit("late", FemtoLevel::Information, None)
            .expect("emit");
        assert_eq!(delivery, Delivery::Fallback);
        assert_eq!(harness.broker.connect_attempts(), 0);
    }

    #[rstest]
    fn unavailable_store_is_reported(harness: Harness) {
        let mut logger = capture_logs();
        harness.broker.set_reachable(false);
        let path = harness.sink.store().path().to_path_buf();
        std::fs::remove_file(&path).expect("remove store file");
        std::fs::create_dir(&path).expect("replace store with a directory");

        let err = harness
            .sink
            .emit("nowhere to go", FemtoLevel::Critical, None)
            .expect_err("store unavailable");
        assert!(matches!(err, RelayError::StoreUnavailable { .. }));
        let logged = std::iter::from_fn(|| logger.pop())
            .any(|r| r.level() == log::Level::Error && r.args().contains("lost a CRITICAL"));
        assert!(logged, "lost event should be logged at error");
    }

    #[rstest]
    fn fallback_warnings_are_rate_limited() {
        let dir = tempfile::tempdir().expect("temp dir");
        let transport = FemtoBrokerTransport::new(MemoryBroker::unreachable())
            .with_reconnect_policy(ReconnectPolicy::new(1, Duration::from_millis(1)));
        let store =
            FemtoFallbackStore::open(dir.path().join("fallback.log")).expect("open store");
        let sink = FemtoResilientSink::new(Arc::new(transport), Arc::new(store))
            .with_warner(RateLimitedWarner::new(Duration::from_secs(60)));

        let path = sink.store().path().display().to_string();
        let mut logger = capture_logs();
        for i in 0..10 {
            sink.emit(format!("event {i}"), FemtoLevel::Warning, None)
                .expect("emit");
        }
        let warnings = std::iter::from_fn(|| logger.pop())
            .filter(|r| r.args().contains("broker unavailable") && r.args().contains(&path))
            .count();
        assert_eq!(warnings, 1);
        assert_eq!(sink.store().len().expect("len"), 10);
    }
}
