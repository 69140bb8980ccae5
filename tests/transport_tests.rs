//! Reconnect bound, backoff schedule, and disposal of the broker transport.

use std::time::{Duration, Instant};

use femtorelay::{
    ConnectionState, FemtoBrokerTransport, FemtoLevel, FemtoLogEvent, RelayError,
    ReconnectPolicy, test_utils::MemoryBroker,
};
use rstest::rstest;

#[rstest]
fn sixth_reconnect_after_five_failures_makes_no_attempt() {
    let broker = MemoryBroker::unreachable();
    let transport = FemtoBrokerTransport::new(broker.clone())
        .with_reconnect_policy(ReconnectPolicy::new(5, Duration::from_millis(1)));
    for _ in 0..5 {
        assert!(matches!(
            transport.connect(),
            Err(RelayError::ConnectFailed { .. })
        ));
    }
    assert_eq!(transport.reconnect_attempts(), 5);

    let started = Instant::now();
    let err = transport.reconnect().expect_err("budget is spent");
    assert!(matches!(err, RelayError::ReconnectExhausted { attempts: 5 }));
    assert_eq!(broker.connect_attempts(), 5);
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(transport.state(), ConnectionState::Disconnected);
}

#[rstest]
#[case(Duration::from_millis(1))]
#[case(Duration::from_millis(250))]
#[case(Duration::from_secs(2))]
fn backoff_waits_grow_with_each_attempt(#[case] base: Duration) {
    let policy = ReconnectPolicy::new(8, base);
    let waits: Vec<_> = (1..policy.max_attempts)
        .map(|n| policy.delay_after(n))
        .collect();
    assert_eq!(waits[0], base);
    for pair in waits.windows(2) {
        assert!(pair[1] > pair[0], "{:?} should exceed {:?}", pair[1], pair[0]);
    }
}

#[rstest]
fn reconnect_succeeds_once_the_broker_is_back() {
    let broker = MemoryBroker::unreachable();
    let transport = FemtoBrokerTransport::new(broker.clone())
        .with_reconnect_policy(ReconnectPolicy::new(5, Duration::from_millis(1)));
    assert!(transport.connect().is_err());
    broker.set_reachable(true);

    transport.reconnect().expect("reconnect");
    assert_eq!(transport.state(), ConnectionState::Connected);
    assert_eq!(transport.reconnect_attempts(), 0);
    transport
        .publish(&FemtoLogEvent::new(FemtoLevel::Information, "back"))
        .expect("publish");
    assert_eq!(broker.received_messages(), ["back"]);
}

#[rstest]
fn dispose_twice_releases_resources_once() {
    let broker = MemoryBroker::new();
    let transport = FemtoBrokerTransport::new(broker.clone());
    transport.connect().expect("connect");
    assert_eq!(broker.open_connections(), 1);
    assert_eq!(broker.open_channels(), 1);

    transport.dispose();
    transport.dispose();
    drop(transport);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.open_channels(), 0);
}

#[rstest]
fn partial_connect_leaves_nothing_open() {
    let broker = MemoryBroker::new();
    broker.fail_channel_open(true);
    let transport = FemtoBrokerTransport::new(broker.clone());
    assert!(transport.connect().is_err());
    assert_eq!(transport.state(), ConnectionState::Disconnected);
    assert_eq!(broker.open_connections(), 0);

    broker.fail_channel_open(false);
    transport.connect().expect("connect");
    assert!(transport.is_healthy());
    assert_eq!(broker.open_connections(), 1);
}
