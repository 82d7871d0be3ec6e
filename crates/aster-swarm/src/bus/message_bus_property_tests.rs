//! Property-based tests for the Message Bus
//!
//! These tests exercise delivery guarantees over the in-memory network with
//! randomized duplicate factors, timeouts and message ids.

use super::*;
use crate::transport::InMemoryNetwork;
use chrono::Utc;
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Strategy for generating message ids
fn message_id_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,6}".prop_map(|s| s.to_string())
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap()
}

async fn connected_pair(network: &InMemoryNetwork) -> (MessageBus, MessageBus) {
    let a = MessageBus::connect(Arc::new(network.endpoint("a")), MessageBusConfig::default())
        .await
        .unwrap();
    let b = MessageBus::connect(Arc::new(network.endpoint("b")), MessageBusConfig::default())
        .await
        .unwrap();
    (a, b)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// **Property 1: Request Outcome Exclusivity**
    ///
    /// *For any* responder delay and request timeout, each request SHALL end
    /// with exactly one of a matching response or a timeout error, and no
    /// waiter SHALL remain registered afterwards.
    #[test]
    fn property_request_resolves_exactly_once(
        delay_ms in 0u64..60,
        timeout_ms in 10u64..60,
        requests in 1usize..4,
    ) {
        let rt = runtime();
        rt.block_on(async {
            let network = InMemoryNetwork::new();
            let (a, b) = connected_pair(&network).await;
            b.register_handler(
                MessageType::Request,
                handler_fn(move |bus: MessageBus, msg: AgentMessage| async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    bus.send_response(&msg, msg.payload.clone()).await?;
                    Ok(())
                }),
            );

            let mut handles = Vec::new();
            for i in 0..requests {
                let a = a.clone();
                handles.push(tokio::spawn(async move {
                    a.send_request("b", json!({"i": i}), Duration::from_millis(timeout_ms))
                        .await
                }));
            }

            let mut outcomes = 0;
            for (i, handle) in handles.into_iter().enumerate() {
                match handle.await.unwrap() {
                    Ok(response) => {
                        prop_assert_eq!(response.payload, json!({"i": i}));
                        outcomes += 1;
                    }
                    Err(MessageBusError::RequestTimeout(_)) => outcomes += 1,
                    Err(other) => prop_assert!(false, "unexpected error: {}", other),
                }
            }

            prop_assert_eq!(outcomes, requests);
            prop_assert_eq!(a.pending_request_count(), 0);
            a.shutdown();
            b.shutdown();
            Ok(())
        })?;
    }

    /// **Property 2: Exactly-Once Handler Invocation**
    ///
    /// *For any* number of duplicate deliveries of EXACTLY_ONCE envelopes,
    /// each envelope id SHALL reach the handler at most once.
    #[test]
    fn property_exactly_once_invokes_handler_once(
        duplicates in 0usize..5,
        messages in 1usize..5,
    ) {
        let rt = runtime();
        rt.block_on(async {
            let network = InMemoryNetwork::new();
            network.set_duplicate_deliveries(duplicates);
            let (a, b) = connected_pair(&network).await;

            let counter = Arc::new(AtomicUsize::new(0));
            let seen = counter.clone();
            b.register_handler(
                MessageType::Broadcast,
                handler_fn(move |_bus: MessageBus, _msg: AgentMessage| {
                    let seen = seen.clone();
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            );

            for i in 0..messages {
                let message = a
                    .new_message("", MessageType::Broadcast, json!(i))
                    .with_delivery(DeliveryMode::ExactlyOnce);
                a.send(&message).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(50)).await;

            prop_assert_eq!(counter.load(Ordering::SeqCst), messages);
            prop_assert_eq!(b.stats().dropped(DropReason::Duplicate), (messages * duplicates) as u64);
            a.shutdown();
            b.shutdown();
            Ok(())
        })?;
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// **Property 3: Dedup Cache Admits Each Id Once**
    ///
    /// *For any* sequence of ids inside one window, `check_and_record` SHALL
    /// return true exactly once per distinct id.
    #[test]
    fn property_dedup_admits_each_id_once(
        ids in prop::collection::vec(message_id_strategy(), 0..50)
    ) {
        let mut cache = DedupCache::new(Duration::from_secs(600), 10_000);
        let now = Instant::now();
        let admitted: Vec<String> = ids
            .iter()
            .filter(|id| cache.check_and_record_at(id, now))
            .cloned()
            .collect();

        let distinct: HashSet<&String> = ids.iter().collect();
        let admitted_set: HashSet<&String> = admitted.iter().collect();
        prop_assert_eq!(admitted.len(), distinct.len());
        prop_assert_eq!(admitted_set, distinct);
    }

    /// **Property 4: TTL Expiry**
    ///
    /// *For any* TTL and age, an envelope SHALL be expired exactly when the
    /// TTL is non-zero and the age exceeds it.
    #[test]
    fn property_ttl_expiry(ttl in 0u64..100, age in 0i64..200) {
        let now = Utc::now();
        let msg = AgentMessage::new("a", "b", MessageType::Request, json!({}))
            .with_ttl(ttl)
            .with_timestamp(now - chrono::Duration::seconds(age));

        let expected = ttl > 0 && age > ttl as i64;
        prop_assert_eq!(msg.is_expired_at(now), expected);
    }
}
