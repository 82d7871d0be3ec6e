//! Property-based tests for the Coordination Service
//!
//! These tests verify mutual exclusion, optimistic concurrency and barrier
//! release under randomized contention.

use super::*;
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn service() -> CoordinationService {
    CoordinationService::new(
        "authority",
        CoordinationConfig::default()
            .with_lock_wait_timeout(Duration::from_secs(5))
            .with_state_update_retries(1_000),
    )
}

/// Strategy for generating a lock request
fn lock_type_strategy() -> impl Strategy<Value = LockType> {
    prop_oneof![Just(LockType::Exclusive), Just(LockType::Shared)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    /// **Property 1: No Lost Updates**
    ///
    /// *For any* number of concurrent writers each incrementing a counter
    /// through `update`, the final counter SHALL equal the total number of
    /// increments and the version SHALL have advanced once per increment.
    #[test]
    fn property_concurrent_updates_converge(
        writers in 1usize..6,
        increments in 1usize..8,
    ) {
        let rt = runtime();
        rt.block_on(async {
            let svc = service();
            let mut handles = Vec::new();
            for w in 0..writers {
                let svc = svc.clone();
                handles.push(tokio::spawn(async move {
                    let writer = format!("writer-{}", w);
                    for _ in 0..increments {
                        svc.modify_state_as(&writer, "counter", |value| {
                            let n = value.get("n").and_then(Value::as_u64).unwrap_or(0);
                            value.insert("n".into(), json!(n + 1));
                        })
                        .await?;
                        tokio::task::yield_now().await;
                    }
                    Ok::<(), CoordinationError>(())
                }));
            }
            for handle in handles {
                prop_assert!(handle.await.unwrap().is_ok());
            }

            let state = svc.get_state("counter").await.unwrap().unwrap();
            let total = (writers * increments) as u64;
            prop_assert_eq!(state.value.get("n"), Some(&json!(total)));
            prop_assert_eq!(state.version, total);
            Ok(())
        })?;
    }

    /// **Property 2: Exclusive Holders Never Overlap**
    ///
    /// *For any* mix of EXCLUSIVE and SHARED contenders on one resource, no
    /// EXCLUSIVE holder SHALL ever coexist with another holder.
    #[test]
    fn property_exclusive_mutual_exclusion(
        contenders in prop::collection::vec(lock_type_strategy(), 2..8),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let svc = service();
            let exclusive_inside = Arc::new(AtomicUsize::new(0));
            let shared_inside = Arc::new(AtomicUsize::new(0));
            let violations = Arc::new(AtomicUsize::new(0));

            let mut handles = Vec::new();
            for (i, lock_type) in contenders.into_iter().enumerate() {
                let svc = svc.clone();
                let exclusive_inside = exclusive_inside.clone();
                let shared_inside = shared_inside.clone();
                let violations = violations.clone();
                handles.push(tokio::spawn(async move {
                    let holder = format!("agent-{}", i);
                    let lock = svc
                        .acquire_lock_as(
                            &holder,
                            "resource",
                            lock_type,
                            Duration::from_secs(10),
                            Duration::from_secs(5),
                        )
                        .await?;

                    let (mine, other) = match lock_type {
                        LockType::Exclusive => (&exclusive_inside, &shared_inside),
                        LockType::Shared => (&shared_inside, &exclusive_inside),
                    };
                    let already = mine.fetch_add(1, Ordering::SeqCst);
                    if other.load(Ordering::SeqCst) > 0
                        || (lock_type == LockType::Exclusive && already > 0)
                    {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    mine.fetch_sub(1, Ordering::SeqCst);

                    svc.release(&lock.token).await;
                    Ok::<(), CoordinationError>(())
                }));
            }
            for handle in handles {
                prop_assert!(handle.await.unwrap().is_ok());
            }
            prop_assert_eq!(violations.load(Ordering::SeqCst), 0);
            prop_assert_eq!(svc.lock_count(), 0);
            Ok(())
        })?;
    }

    /// **Property 3: Stale Writes Rejected**
    ///
    /// *For any* number of successful writes, a `set_state` carrying any
    /// version other than the current one SHALL fail with a version
    /// conflict and leave the stored value untouched.
    #[test]
    fn property_stale_set_never_overwrites(
        writes in 1u64..10,
        stale in 0u64..20,
    ) {
        prop_assume!(stale != writes);
        let store = StateStore::new();
        for version in 0..writes {
            let mut value = Map::new();
            value.insert("v".into(), json!(version));
            store.set("k", value, version, "writer").unwrap();
        }

        let result = store.set("k", Map::new(), stale, "late");
        let is_version_conflict = matches!(result, Err(CoordinationError::VersionConflict { .. }));
        prop_assert!(is_version_conflict);
        let current = store.get("k").unwrap();
        prop_assert_eq!(current.version, writes);
        prop_assert_eq!(current.value.get("v"), Some(&json!(writes - 1)));
    }

    /// **Property 4: Barrier Quorum**
    ///
    /// *For any* required count and number of distinct arrivals, every
    /// waiter SHALL be released successfully when arrivals reach the
    /// required count, and SHALL receive a timeout otherwise.
    #[test]
    fn property_barrier_releases_on_quorum(
        required in 1usize..5,
        arrivals in 1usize..5,
    ) {
        let rt = runtime();
        rt.block_on(async {
            let svc = service();
            let mut handles = Vec::new();
            for i in 0..arrivals {
                let svc = svc.clone();
                handles.push(tokio::spawn(async move {
                    svc.wait_at_barrier_as(
                        &format!("agent-{}", i),
                        "rendezvous",
                        required,
                        Duration::from_millis(150),
                    )
                    .await
                }));
            }

            let mut outcomes = HashSet::new();
            for handle in handles {
                outcomes.insert(handle.await.unwrap().is_ok());
            }

            if arrivals >= required {
                // Arrivals beyond the quorum start the next round and time out
                prop_assert!(outcomes.contains(&true));
                if arrivals == required {
                    prop_assert_eq!(outcomes.len(), 1);
                }
            } else {
                prop_assert_eq!(outcomes, HashSet::from([false]));
            }
            prop_assert!(svc.barrier_status("rendezvous").is_none());
            Ok(())
        })?;
    }
}
