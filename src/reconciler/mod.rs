//! Background replay of the fallback store.
//!
//! Each tick checks broker health (reconnecting if needed), drains the
//! fallback store, and republishes the drained events in order. Events that
//! cannot be replayed go back to the head of the store, so a tick never loses one.
//! [`FemtoReconciler::spawn`] runs ticks on a dedicated thread until the
//! returned [`ReconcilerHandle`] is shut down.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use log::{debug, error, info, warn};

use crate::{
    error::RelayError,
    fallback_store::FemtoFallbackStore,
    level::FemtoLevel,
    log_event::{ErrorDetail, FemtoLogEvent},
    transport::FemtoBrokerTransport,
};

/// How long [`ReconcilerHandle::shutdown`] waits for the worker to stop.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the reconciler is within a tick.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcilerPhase {
    Idle = 0,
    CheckingHealth = 1,
    Draining = 2,
    Replaying = 3,
    Stopped = 4,
}

impl ReconcilerPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::CheckingHealth,
            2 => Self::Draining,
            3 => Self::Replaying,
            4 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Result of one reconciliation pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// The broker could not be reached; a diagnostic event was stored.
    Unhealthy,
    /// The broker is healthy and the store was empty.
    Idle,
    /// Every drained event was republished.
    Replayed { count: usize },
    /// A publish failed; the unreplayed events were stored again.
    Interrupted { replayed: usize, requeued: usize },
    /// Cancellation was observed; the unreplayed events were stored again.
    Cancelled { replayed: usize, requeued: usize },
}

/// Shared phase cell that falls back to `Idle` when a tick ends.
struct PhaseGuard<'a>(&'a AtomicU8);

impl<'a> PhaseGuard<'a> {
    fn enter(cell: &'a AtomicU8, phase: ReconcilerPhase) -> Self {
        cell.store(phase as u8, Ordering::Release);
        Self(cell)
    }

    fn set(&self, phase: ReconcilerPhase) {
        self.0.store(phase as u8, Ordering::Release);
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.0.store(ReconcilerPhase::Idle as u8, Ordering::Release);
    }
}

/// Drains the fallback store back into the broker.
pub struct FemtoReconciler {
    transport: Arc<FemtoBrokerTransport>,
    store: Arc<FemtoFallbackStore>,
    phase: Arc<AtomicU8>,
}

impl FemtoReconciler {
    pub fn new(transport: Arc<FemtoBrokerTransport>, store: Arc<FemtoFallbackStore>) -> Self {
        Self {
            transport,
            store,
            phase: Arc::new(AtomicU8::new(ReconcilerPhase::Idle as u8)),
        }
    }

    pub fn phase(&self) -> ReconcilerPhase {
        ReconcilerPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Run a single pass.
    ///
    /// Errors only when the fallback store fails; broker failures are
    /// reported through the outcome.
    pub fn tick(&self) -> Result<TickOutcome, RelayError> {
        self.tick_until(&|| false)
    }

    fn tick_until(&self, cancelled: &dyn Fn() -> bool) -> Result<TickOutcome, RelayError> {
        let phase = PhaseGuard::enter(&self.phase, ReconcilerPhase::CheckingHealth);
        if !self.transport.is_healthy() {
            // Each health check grants the transport a fresh reconnect budget.
            self.transport.rearm();
            if let Err(err) = self.transport.reconnect() {
                warn!("FemtoReconciler broker still unreachable: {err}");
                self.store.append(&diagnostic(
                    "FemtoReconciler failed to reconnect to the broker; events stay in the fallback store",
                    &err,
                ))?;
                return Ok(TickOutcome::Unhealthy);
            }
            info!("FemtoReconciler broker connection restored");
        }
        if cancelled() {
            return Ok(TickOutcome::Cancelled {
                replayed: 0,
                requeued: 0,
            });
        }

        phase.set(ReconcilerPhase::Draining);
        let events = self.store.drain_all()?;
        if events.is_empty() {
            return Ok(TickOutcome::Idle);
        }

        phase.set(ReconcilerPhase::Replaying);
        for (replayed, event) in events.iter().enumerate() {
            if cancelled() {
                let requeued = self.requeue(&events[replayed..])?;
                return Ok(TickOutcome::Cancelled { replayed, requeued });
            }
            if let Err(err) = self.transport.publish(event) {
                let requeued = self.requeue(&events[replayed..])?;
                warn!(
                    "FemtoReconciler replay interrupted after {replayed} events ({err}); {requeued} returned to the fallback store"
                );
                return Ok(TickOutcome::Interrupted { replayed, requeued });
            }
        }
        debug!("FemtoReconciler replayed {} events", events.len());
        Ok(TickOutcome::Replayed {
            count: events.len(),
        })
    }

    fn requeue(&self, events: &[FemtoLogEvent]) -> Result<usize, RelayError> {
        if let Err(err) = self.store.requeue_front(events) {
            error!(
                "FemtoReconciler lost {} drained events: {err}",
                events.len()
            );
            return Err(err);
        }
        Ok(events.len())
    }

    /// Run ticks every `interval` on a dedicated thread, starting now.
    pub fn spawn(self, interval: Duration) -> ReconcilerHandle {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let (done_tx, done_rx) = bounded(1);
        let phase = Arc::clone(&self.phase);
        let handle = thread::spawn(move || {
            self.run(&shutdown_rx, interval);
            self.phase
                .store(ReconcilerPhase::Stopped as u8, Ordering::Release);
            let _ = done_tx.send(());
        });
        ReconcilerHandle {
            shutdown_tx: Some(shutdown_tx),
            done_rx,
            handle: Some(handle),
            phase,
        }
    }

    fn run(&self, shutdown_rx: &Receiver<()>, interval: Duration) {
        let cancelled = || matches!(shutdown_rx.try_recv(), Err(TryRecvError::Disconnected));
        loop {
            if cancelled() {
                break;
            }
            match self.tick_until(&cancelled) {
                Ok(TickOutcome::Cancelled { .. }) => break,
                Ok(outcome) => debug!("FemtoReconciler tick finished: {outcome:?}"),
                Err(err) => self.record_tick_error(&err),
            }
            match shutdown_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("FemtoReconciler stopped");
    }

    fn record_tick_error(&self, err: &RelayError) {
        error!("FemtoReconciler tick failed: {err}");
        let event = diagnostic("FemtoReconciler tick failed", err);
        if self.store.append(&event).is_err() {
            error!("FemtoReconciler could not record the failure in the fallback store");
        }
    }
}

fn diagnostic(message: &str, err: &RelayError) -> FemtoLogEvent {
    FemtoLogEvent::new(FemtoLevel::Error, message).with_error(ErrorDetail::from_error(err))
}

impl std::fmt::Debug for FemtoReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FemtoReconciler")
            .field("phase", &self.phase())
            .finish()
    }
}

/// Owner of a running reconciler thread.
///
/// Dropping the handle shuts the thread down.
pub struct ReconcilerHandle {
    shutdown_tx: Option<Sender<()>>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
    phase: Arc<AtomicU8>,
}

impl ReconcilerHandle {
    pub fn phase(&self) -> ReconcilerPhase {
        ReconcilerPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Signal cancellation and wait for the thread to stop.
    ///
    /// A tick in progress finishes its current publish, re-queues anything
    /// it has not replayed, and exits. Returns false if the thread did not
    /// stop within the timeout.
    pub fn shutdown(&mut self) -> bool {
        self.shutdown_tx.take();
        let Some(handle) = self.handle.take() else {
            return true;
        };
        if let Err(RecvTimeoutError::Timeout) = self.done_rx.recv_timeout(SHUTDOWN_TIMEOUT) {
            warn!("FemtoReconciler: worker thread did not shut down within {SHUTDOWN_TIMEOUT:?}");
            return false;
        }
        if handle.join().is_err() {
            warn!("FemtoReconciler: worker thread panicked");
        }
        true
    }
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
