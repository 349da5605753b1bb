//! Router tests

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use test_case::test_case;

use super::*;
use crate::config::Config;
use crate::manager::ConnectionManager;
use crate::transport::MemoryTransport;

fn config() -> Config {
    let mut config = Config::default();
    config.broker.address = "tcp://localhost:1883".to_string();
    config.broker.client_id = "router-test".to_string();
    config.broker.ack_timeout = Duration::from_millis(100);
    config
}

/// A router wired to a connected in-memory session
async fn connected(
    result_topic: ResultTopic,
    counter: SequenceCounter,
) -> (Arc<Router>, Arc<MemoryTransport>, ConnectionManager) {
    let transport = Arc::new(MemoryTransport::new());
    let manager = ConnectionManager::new(&config(), transport.clone());
    let router = Arc::new(Router::new(result_topic, manager.publisher()).with_counter(counter));
    manager.start(router.clone()).await.unwrap();
    (router, transport, manager)
}

#[test_case("sensors/temp/result", true ; "suffix level")]
#[test_case("a/b/c/result", true ; "deep suffix level")]
#[test_case("sensors/temp", false ; "plain topic")]
#[test_case("sensors/myresult", false ; "suffix is only part of a level")]
#[test_case("result", false ; "single level")]
#[test_case("sensors/result/raw", false ; "suffix not last")]
fn test_per_source_is_result(topic: &str, expected: bool) {
    assert_eq!(ResultTopic::per_source("result").is_result(topic), expected);
}

#[test]
fn test_fixed_topic_is_result() {
    let rt = ResultTopic::fixed("nn/answers", "result");
    assert!(rt.is_result("nn/answers"));
    assert!(rt.is_result("other/result"));
    assert!(!rt.is_result("nn"));
    assert_eq!(rt.derive("any/topic"), "nn/answers");
}

#[test]
fn test_compose_payload() {
    let per_source = ResultTopic::per_source("result");
    assert_eq!(
        per_source.compose_payload(5, b"72F"),
        Bytes::from_static(b"Result message #5 72F")
    );
    assert_eq!(
        per_source.compose_payload(0, b""),
        Bytes::from_static(b"Result message #0 ")
    );

    let fixed = ResultTopic::fixed("nn/result", "result");
    assert_eq!(
        fixed.compose_payload(12, b"ignored"),
        Bytes::from_static(b"Result message #12")
    );
}

#[tokio::test]
async fn test_per_source_response() {
    let (router, transport, _manager) =
        connected(ResultTopic::per_source("result"), SequenceCounter::starting_at(5)).await;

    let outcome = router.route(&Message::new("sensors/temp", "72F")).await;

    assert_eq!(
        outcome,
        RouteOutcome::Published {
            topic: "sensors/temp/result".to_string(),
            sequence: 5,
            ack: Ack {
                packet_id: 0,
                qos: QoS::AtMostOnce
            },
        }
    );
    assert_eq!(router.counter().current(), 6);

    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "sensors/temp/result");
    assert_eq!(published[0].payload, Bytes::from_static(b"Result message #5 72F"));
    assert_eq!(published[0].qos, QoS::AtMostOnce);
    assert!(!published[0].retain);
}

#[tokio::test]
async fn test_result_topic_is_ignored() {
    let (router, transport, _manager) =
        connected(ResultTopic::per_source("result"), SequenceCounter::starting_at(5)).await;

    let outcome = router
        .route(&Message::new("sensors/temp/result", "Result message #5 72F"))
        .await;

    assert_eq!(outcome, RouteOutcome::Ignored);
    assert_eq!(router.counter().current(), 5);
    assert!(transport.published().is_empty());
    assert_eq!(router.stats().snapshot().ignored, 1);
}

#[tokio::test]
async fn test_fixed_topic_response() {
    let (router, transport, _manager) = connected(
        ResultTopic::fixed("nn/result", "result"),
        SequenceCounter::new(),
    )
    .await;

    let outcome = router.route(&Message::new("any/topic", "x")).await;

    assert!(matches!(
        outcome,
        RouteOutcome::Published { ref topic, sequence: 0, .. } if topic == "nn/result"
    ));
    assert_eq!(
        transport.published()[0].payload,
        Bytes::from_static(b"Result message #0")
    );

    // Its own output is never answered
    assert_eq!(
        router.route(&Message::new("nn/result", "Result message #0")).await,
        RouteOutcome::Ignored
    );
}

#[tokio::test]
async fn test_disconnected_skips_without_waiting() {
    let transport = Arc::new(MemoryTransport::new());
    let manager = ConnectionManager::new(&config(), transport.clone());
    let router = Router::new(ResultTopic::per_source("result"), manager.publisher());

    let started = tokio::time::Instant::now();
    let outcome = router.route(&Message::new("sensors/temp", "72F")).await;

    assert_eq!(
        outcome,
        RouteOutcome::Skipped {
            topic: "sensors/temp/result".to_string(),
            sequence: 0,
        }
    );
    assert!(started.elapsed() < Duration::from_millis(50));
    assert!(transport.published().is_empty());
    // The sequence is consumed even though nothing went out
    assert_eq!(router.counter().current(), 1);
    assert_eq!(router.stats().snapshot().skipped, 1);
}

#[tokio::test]
async fn test_transport_failure_is_contained() {
    let (router, transport, _manager) =
        connected(ResultTopic::per_source("result"), SequenceCounter::new()).await;

    // Link gone underneath a session that still believes it is live
    transport.drop_link("reset");
    let outcome = router.route(&Message::new("a", "b")).await;

    match outcome {
        RouteOutcome::Failed { topic, sequence, .. } => {
            assert_eq!(topic, "a/result");
            assert_eq!(sequence, 0);
        }
        // The manager may already have seen the link loss
        RouteOutcome::Skipped { sequence, .. } => assert_eq!(sequence, 0),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_response_above_packet_limit_fails_locally() {
    let mut config = config();
    config.broker.max_packet_size = 1024;
    let transport = Arc::new(MemoryTransport::new());
    let manager = ConnectionManager::new(&config, transport.clone());
    let router = Arc::new(Router::new(ResultTopic::per_source("result"), manager.publisher()));
    manager.start(router.clone()).await.unwrap();

    let outcome = router
        .route(&Message::new("sensors/blob", vec![b'x'; 1000]))
        .await;
    match outcome {
        RouteOutcome::Failed { topic, reason, .. } => {
            assert_eq!(topic, "sensors/blob/result");
            assert!(reason.contains("packet limit"), "{}", reason);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(transport.published().is_empty());

    // Later responses still go out
    let outcome = router.route(&Message::new("sensors/temp", "72F")).await;
    assert!(matches!(outcome, RouteOutcome::Published { sequence: 1, .. }));
    assert_eq!(router.stats().snapshot().failed, 1);
}

#[tokio::test]
async fn test_concurrent_messages_get_unique_sequences() {
    let (router, transport, _manager) =
        connected(ResultTopic::per_source("result"), SequenceCounter::new()).await;

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .route(&Message::new(format!("sensors/{}", i), "v"))
                    .await
            })
        })
        .collect();

    let mut sequences = HashSet::new();
    for handle in handles {
        match handle.await.unwrap() {
            RouteOutcome::Published { sequence, .. } => assert!(sequences.insert(sequence)),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    assert_eq!(sequences, (0..50).collect::<HashSet<u64>>());
    assert_eq!(transport.published().len(), 50);
    assert_eq!(router.counter().current(), 50);

    let stats = router.stats().snapshot();
    assert_eq!(stats.received, 50);
    assert_eq!(stats.published, 50);
}

#[tokio::test]
async fn test_outbound_qos_and_retain() {
    let transport = Arc::new(MemoryTransport::new());
    let manager = ConnectionManager::new(&config(), transport.clone());
    let router = Arc::new(
        Router::new(ResultTopic::per_source("result"), manager.publisher())
            .with_qos(QoS::AtLeastOnce, true),
    );
    manager.start(router.clone()).await.unwrap();

    let outcome = router.route(&Message::new("a", "b")).await;

    assert!(matches!(
        outcome,
        RouteOutcome::Published { ack: Ack { packet_id: 1, qos: QoS::AtLeastOnce }, .. }
    ));
    let published = transport.published();
    assert_eq!(published[0].qos, QoS::AtLeastOnce);
    assert!(published[0].retain);
}

fn topic_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,4}"
}

proptest! {
    #[test]
    fn prop_derived_topic_is_never_answered(source in topic_strategy()) {
        let rt = ResultTopic::per_source("result");
        prop_assert!(rt.is_result(&rt.derive(&source)));

        let fixed = ResultTopic::fixed("nn/result", "result");
        prop_assert!(fixed.is_result(&fixed.derive(&source)));
    }

    #[test]
    fn prop_derive_is_deterministic(source in topic_strategy()) {
        let rt = ResultTopic::per_source("reply");
        prop_assert_eq!(rt.derive(&source), rt.derive(&source));
        prop_assert_eq!(rt.derive(&source), format!("{}/reply", source));
    }

    #[test]
    fn prop_is_result_matches_last_level(source in topic_strategy()) {
        let rt = ResultTopic::per_source("result");
        let last = source.rsplit('/').next().unwrap_or_default();
        let expected = source.contains('/') && last == "result";
        prop_assert_eq!(rt.is_result(&source), expected);
    }
}
