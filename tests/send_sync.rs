//! Send/Sync guarantees for types shared between logging threads.

use femtorelay::{
    AmqpConnector, FemtoBrokerTransport, FemtoFallbackStore, FemtoReconciler, FemtoRelay,
    FemtoResilientSink, RateLimitedWarner, RelayConfig, RelayConfigBuilder, RelayError,
    test_utils::MemoryBroker,
};
use rstest::rstest;
use static_assertions::assert_impl_all;

#[rstest]
fn config_types_are_send_sync() {
    assert_impl_all!(RelayConfig: Send, Sync);
    assert_impl_all!(RelayConfigBuilder: Send, Sync);
    assert_impl_all!(RelayError: Send, Sync);
}

#[rstest]
fn components_are_send_sync() {
    assert_impl_all!(FemtoBrokerTransport: Send, Sync);
    assert_impl_all!(FemtoFallbackStore: Send, Sync);
    assert_impl_all!(FemtoResilientSink: Send, Sync);
    assert_impl_all!(FemtoReconciler: Send, Sync);
    assert_impl_all!(FemtoRelay: Send, Sync);
    assert_impl_all!(RateLimitedWarner: Send, Sync);
    assert_impl_all!(AmqpConnector: Send, Sync);
    assert_impl_all!(MemoryBroker: Send, Sync);
}
