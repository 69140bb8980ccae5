//! An in-process broker that records published messages and can be told to
//! fail in specific ways.
//!
//! Clones share state, so a test keeps one handle for assertions and hands
//! another to the transport.

use std::{io, sync::Arc, time::Duration};

use parking_lot::Mutex;

use crate::{
    broker::{BrokerChannel, BrokerConnection, BrokerConnector},
    codec::{WireFormat, decode_event},
    error::BrokerFault,
    log_event::FemtoLogEvent,
};

/// A message as the broker received it.
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub payload: Vec<u8>,
    pub content_type: String,
}

impl ReceivedMessage {
    /// Decode the payload according to its content type.
    pub fn decode(&self) -> io::Result<FemtoLogEvent> {
        let format = if self.content_type == WireFormat::MessagePack.content_type() {
            WireFormat::MessagePack
        } else {
            WireFormat::Json
        };
        decode_event(&self.payload, format)
    }
}

struct BrokerState {
    reachable: bool,
    fail_channel_open: bool,
    reject_publishes: bool,
    /// Publishes accepted before every open link is severed.
    publish_budget: Option<usize>,
    /// Bumped whenever existing links should observe a dropped connection.
    generation: u64,
    connect_attempts: usize,
    open_connections: usize,
    open_channels: usize,
    received: Vec<ReceivedMessage>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            reachable: true,
            fail_channel_open: false,
            reject_publishes: false,
            publish_budget: None,
            generation: 0,
            connect_attempts: 0,
            open_connections: 0,
            open_channels: 0,
            received: Vec::new(),
        }
    }
}

/// In-memory [`BrokerConnector`] with failure injection.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// A reachable broker with no messages.
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that refuses every connection.
    pub fn unreachable() -> Self {
        let broker = Self::new();
        broker.set_reachable(false);
        broker
    }

    /// Make the broker reachable or not. Going down drops every open link.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.state.lock();
        state.reachable = reachable;
        if !reachable {
            state.generation += 1;
        }
    }

    /// Let connections open but fail every channel open.
    pub fn fail_channel_open(&self, fail: bool) {
        self.state.lock().fail_channel_open = fail;
    }

    /// Nack every publish while set.
    pub fn reject_publishes(&self, reject: bool) {
        self.state.lock().reject_publishes = reject;
    }

    /// Accept `count` more publishes, then drop the connection on the next
    /// one and stay unreachable.
    pub fn drop_after(&self, count: usize) {
        self.state.lock().publish_budget = Some(count);
    }

    /// Drop every open link without changing reachability.
    pub fn sever(&self) {
        self.state.lock().generation += 1;
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().open_connections
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().open_channels
    }

    pub fn received(&self) -> Vec<ReceivedMessage> {
        self.state.lock().received.clone()
    }

    /// Decoded events in arrival order.
    pub fn received_events(&self) -> Vec<FemtoLogEvent> {
        self.received()
            .iter()
            .filter_map(|m| m.decode().ok())
            .collect()
    }

    /// Messages of the received events in arrival order.
    pub fn received_messages(&self) -> Vec<String> {
        self.received_events()
            .into_iter()
            .map(|e| e.message)
            .collect()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryBroker")
            .field("reachable", &state.reachable)
            .field("received", &state.received.len())
            .finish()
    }
}

impl BrokerConnector for MemoryBroker {
    fn open_connection(&self) -> Result<Box<dyn BrokerConnection>, BrokerFault> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if !state.reachable {
            return Err(BrokerFault::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "memory broker is unreachable",
            )));
        }
        state.open_connections += 1;
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            generation: state.generation,
        }))
    }

    fn describe(&self) -> String {
        "memory://broker".into()
    }
}

struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
    generation: u64,
}

impl BrokerConnection for MemoryConnection {
    fn open_channel(&mut self) -> Result<Box<dyn BrokerChannel>, BrokerFault> {
        let mut state = self.state.lock();
        if state.fail_channel_open {
            return Err(BrokerFault::Protocol("channel open refused".into()));
        }
        if state.generation != self.generation {
            return Err(BrokerFault::Closed);
        }
        state.open_channels += 1;
        Ok(Box::new(MemoryChannel {
            state: Arc::clone(&self.state),
            generation: self.generation,
        }))
    }

    fn is_open(&self) -> bool {
        self.state.lock().generation == self.generation
    }

    fn close(self: Box<Self>) {
        self.state.lock().open_connections -= 1;
    }
}

struct MemoryChannel {
    state: Arc<Mutex<BrokerState>>,
    generation: u64,
}

impl BrokerChannel for MemoryChannel {
    fn publish(
        &mut self,
        payload: &[u8],
        content_type: &str,
        _timeout: Duration,
    ) -> Result<(), BrokerFault> {
        let mut state = self.state.lock();
        if state.generation != self.generation {
            return Err(BrokerFault::Closed);
        }
        let budget = state.publish_budget;
        match budget {
            Some(0) => {
                state.publish_budget = None;
                state.reachable = false;
                state.generation += 1;
                return Err(BrokerFault::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "memory broker dropped the connection",
                )));
            }
            Some(remaining) => state.publish_budget = Some(remaining - 1),
            None => {}
        }
        if state.reject_publishes {
            return Err(BrokerFault::Nacked);
        }
        state.received.push(ReceivedMessage {
            payload: payload.to_vec(),
            content_type: content_type.to_owned(),
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().generation == self.generation
    }

    fn close(self: Box<Self>) {
        self.state.lock().open_channels -= 1;
    }
}
