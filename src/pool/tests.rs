//! Pool Manager Tests
//!
//! Capacity, LRU eviction, idempotent starts and failure handling, driven by
//! the scripted runtime under paused time.

use super::*;
use crate::Error;
use crate::runtime::MockRuntime;
use std::sync::{Arc, Mutex};
use tokio::time::advance;

const A: ModelId = ModelId(1);
const B: ModelId = ModelId(2);
const C: ModelId = ModelId(3);

fn unit(model: ModelId) -> UnitRef {
    UnitRef::new(format!("unit-{}", model))
}

fn create_test_pool(max_running: usize) -> (Arc<MockRuntime>, PoolManager) {
    let runtime = Arc::new(MockRuntime::new());
    for model in [A, B, C] {
        runtime.add_unit(&unit(model));
    }
    let config = PoolConfig {
        max_running,
        start_timeout: Duration::from_secs(5),
    };
    let pool = PoolManager::new(runtime.clone(), config);
    (runtime, pool)
}

fn record_events(pool: &PoolManager) -> Arc<Mutex<Vec<PoolEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    pool.on_event(Box::new(move |event| {
        sink.lock().unwrap().push(event.clone());
    }));
    events
}

fn running_models(pool: &PoolManager) -> Vec<ModelId> {
    let mut ids: Vec<ModelId> = pool.snapshot().entries.iter().map(|e| e.model_id).collect();
    ids.sort();
    ids
}

#[tokio::test(start_paused = true)]
async fn test_ensure_running_is_idempotent() {
    let (runtime, pool) = create_test_pool(3);

    let first = pool.ensure_running(A, &unit(A)).await.unwrap();
    assert!(first.cold_start);

    let second = pool.ensure_running(A, &unit(A)).await.unwrap();
    assert!(!second.cold_start);
    assert_eq!(first.external_port, second.external_port);

    assert_eq!(runtime.start_calls(&unit(A)), 1);
    assert_eq!(pool.snapshot().running_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_capacity_is_never_exceeded() {
    let (runtime, pool) = create_test_pool(2);

    for model in [A, B, C, A, B, C] {
        pool.ensure_running(model, &unit(model)).await.unwrap();
        advance(Duration::from_secs(1)).await;
        let snapshot = pool.snapshot();
        assert!(snapshot.running_count <= 2);
        assert_eq!(snapshot.max_running, 2);
    }

    assert_eq!(runtime.running_units().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_lru_entry_is_evicted() {
    let (runtime, pool) = create_test_pool(2);
    let events = record_events(&pool);

    pool.ensure_running(A, &unit(A)).await.unwrap();
    advance(Duration::from_secs(10)).await;
    pool.ensure_running(B, &unit(B)).await.unwrap();
    advance(Duration::from_secs(10)).await;
    pool.touch(A);

    let lease = pool.ensure_running(C, &unit(C)).await.unwrap();
    assert!(lease.cold_start);

    assert_eq!(running_models(&pool), vec![A, C]);
    assert_eq!(runtime.stop_calls(&unit(B)), 1);
    assert_eq!(runtime.stop_calls(&unit(A)), 0);

    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        PoolEvent::Stopped { model_id, reason: StopReason::Evicted, .. } if *model_id == B
    )));
}

#[tokio::test(start_paused = true)]
async fn test_lru_ties_break_by_start_order() {
    let (runtime, pool) = create_test_pool(2);

    // No time passes, so A and B share a last-used instant.
    pool.ensure_running(A, &unit(A)).await.unwrap();
    pool.ensure_running(B, &unit(B)).await.unwrap();
    let snapshot = pool.snapshot();
    assert_eq!(snapshot.entries[0].last_used, snapshot.entries[1].last_used);

    pool.ensure_running(C, &unit(C)).await.unwrap();
    assert_eq!(running_models(&pool), vec![B, C]);
    assert_eq!(runtime.stop_calls(&unit(A)), 1);
    assert_eq!(runtime.stop_calls(&unit(B)), 0);
    assert_eq!(runtime.start_calls(&unit(C)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_touch_and_release_of_absent_model_are_noops() {
    let (runtime, pool) = create_test_pool(2);

    pool.touch(A);
    assert!(!pool.release(A).await.unwrap());
    assert_eq!(pool.snapshot().running_count, 0);
    assert_eq!(runtime.stop_calls(&unit(A)), 0);
}

#[tokio::test(start_paused = true)]
async fn test_touch_moves_last_used_forward() {
    let (_runtime, pool) = create_test_pool(2);
    pool.ensure_running(A, &unit(A)).await.unwrap();
    let before = pool.snapshot().get(A).unwrap().last_used;

    advance(Duration::from_secs(30)).await;
    pool.touch(A);
    let after = pool.snapshot().get(A).unwrap().last_used;
    assert_eq!(after - before, Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_release_stops_container() {
    let (runtime, pool) = create_test_pool(2);
    let events = record_events(&pool);

    pool.ensure_running(A, &unit(A)).await.unwrap();
    assert!(pool.release(A).await.unwrap());
    assert_eq!(pool.snapshot().running_count, 0);
    assert!(runtime.running_units().is_empty());

    let events = events.lock().unwrap();
    assert!(matches!(events[0], PoolEvent::Started { .. }));
    assert!(matches!(
        events[1],
        PoolEvent::Stopped {
            reason: StopReason::Requested,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_port_is_requeried_after_restart() {
    let (_runtime, pool) = create_test_pool(2);

    let first = pool.ensure_running(A, &unit(A)).await.unwrap();
    pool.release(A).await.unwrap();
    let second = pool.ensure_running(A, &unit(A)).await.unwrap();

    assert!(second.cold_start);
    assert_ne!(first.external_port, second.external_port);
    assert_eq!(
        pool.snapshot().get(A).unwrap().external_port,
        second.external_port
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_eviction_keeps_victim() {
    let (runtime, pool) = create_test_pool(1);

    pool.ensure_running(A, &unit(A)).await.unwrap();
    runtime.fail_stop(&unit(A), true);

    let err = pool.ensure_running(B, &unit(B)).await.unwrap_err();
    assert!(matches!(err, Error::CapacityEvictionFailed { model_id, .. } if model_id == A));
    assert_eq!(running_models(&pool), vec![A]);
    assert_eq!(runtime.start_calls(&unit(B)), 0);

    runtime.fail_stop(&unit(A), false);
    pool.ensure_running(B, &unit(B)).await.unwrap();
    assert_eq!(running_models(&pool), vec![B]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_release_restores_entry() {
    let (runtime, pool) = create_test_pool(2);

    pool.ensure_running(A, &unit(A)).await.unwrap();
    runtime.fail_stop(&unit(A), true);

    assert!(pool.release(A).await.is_err());
    assert_eq!(running_models(&pool), vec![A]);
}

#[tokio::test(start_paused = true)]
async fn test_start_failure_leaves_no_entry() {
    let (runtime, pool) = create_test_pool(2);
    let events = record_events(&pool);
    runtime.fail_start(&unit(A), true);

    let err = pool.ensure_running(A, &unit(A)).await.unwrap_err();
    assert!(matches!(err, Error::StartFailed { .. }));
    assert_eq!(pool.snapshot().running_count, 0);

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], PoolEvent::StartFailed { model_id, .. } if model_id == A));
}

#[tokio::test(start_paused = true)]
async fn test_missing_port_is_reported_and_cleaned_up() {
    let (runtime, pool) = create_test_pool(2);
    runtime.without_port(&unit(A), true);

    let err = pool.ensure_running(A, &unit(A)).await.unwrap_err();
    assert!(matches!(err, Error::NoPortAssigned { .. }));
    assert_eq!(pool.snapshot().running_count, 0);
    assert_eq!(runtime.stop_calls(&unit(A)), 1);
    assert!(runtime.running_units().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_engine() {
    let (runtime, pool) = create_test_pool(2);
    runtime.set_unreachable(true);

    let err = pool.ensure_running(A, &unit(A)).await.unwrap_err();
    assert!(matches!(err, Error::EngineUnreachable { .. }));
    assert_eq!(pool.snapshot().running_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_timeout() {
    let (runtime, pool) = create_test_pool(2);
    runtime.set_start_delay(Some(Duration::from_secs(60)));

    let err = pool.ensure_running(A, &unit(A)).await.unwrap_err();
    assert!(matches!(err, Error::StartFailed { .. }));
    assert!(err.to_string().contains("did not start within"));
    assert_eq!(pool.snapshot().running_count, 0);
    assert_eq!(runtime.stop_calls(&unit(A)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_cold_starts_share_one_start() {
    let (runtime, pool) = create_test_pool(2);
    runtime.set_start_delay(Some(Duration::from_secs(2)));
    let pool = Arc::new(pool);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.ensure_running(A, &unit(A)).await })
        })
        .collect();

    let mut cold = 0;
    let mut ports = Vec::new();
    for handle in handles {
        let lease = handle.await.unwrap().unwrap();
        if lease.cold_start {
            cold += 1;
        }
        ports.push(lease.external_port);
    }

    assert_eq!(cold, 1);
    assert_eq!(runtime.start_calls(&unit(A)), 1);
    assert!(ports.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_starts_of_distinct_models_respect_capacity() {
    let (runtime, pool) = create_test_pool(2);
    let models: Vec<ModelId> = (10..18).map(ModelId).collect();
    for model in &models {
        runtime.add_unit(&unit(*model));
    }
    runtime.set_start_delay(Some(Duration::from_millis(500)));
    let pool = Arc::new(pool);

    let handles: Vec<_> = models
        .iter()
        .map(|&model| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.ensure_running(model, &unit(model)).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(pool.snapshot().running_count, 2);
    assert_eq!(runtime.running_units().len(), 2);
    assert_eq!(runtime.total_start_calls(), models.len());
}

#[tokio::test(start_paused = true)]
async fn test_retire_stops_and_removes_container() {
    let (runtime, pool) = create_test_pool(2);
    let events = record_events(&pool);
    pool.ensure_running(A, &unit(A)).await.unwrap();

    pool.retire(A, &unit(A)).await.unwrap();

    assert_eq!(pool.snapshot().running_count, 0);
    assert!(!runtime.has_unit(&unit(A)));
    assert!(events.lock().unwrap().iter().any(|e| matches!(
        e,
        PoolEvent::Stopped { model_id, reason: StopReason::Requested, .. } if *model_id == A
    )));

    // A container the pool never started is still removed.
    pool.retire(B, &unit(B)).await.unwrap();
    assert!(!runtime.has_unit(&unit(B)));
}

#[tokio::test(start_paused = true)]
async fn test_retire_keeps_everything_when_stop_fails() {
    let (runtime, pool) = create_test_pool(2);
    pool.ensure_running(A, &unit(A)).await.unwrap();
    runtime.fail_stop(&unit(A), true);

    assert!(pool.retire(A, &unit(A)).await.is_err());
    assert_eq!(running_models(&pool), vec![A]);
    assert!(runtime.has_unit(&unit(A)));
    assert_eq!(runtime.running_units(), vec![unit(A)]);
}

#[tokio::test(start_paused = true)]
async fn test_release_if_idle_respects_cutoff() {
    let (runtime, pool) = create_test_pool(3);
    pool.ensure_running(A, &unit(A)).await.unwrap();
    pool.ensure_running(B, &unit(B)).await.unwrap();

    advance(Duration::from_secs(200)).await;
    pool.touch(B);
    advance(Duration::from_secs(200)).await;

    let cutoff = Instant::now() - Duration::from_secs(300);
    assert!(pool.release_if_idle(A, cutoff).await.unwrap());
    assert!(!pool.release_if_idle(B, cutoff).await.unwrap());
    assert!(!pool.release_if_idle(C, cutoff).await.unwrap());

    assert_eq!(running_models(&pool), vec![B]);
    assert_eq!(runtime.stop_calls(&unit(B)), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_drops_vanished_containers() {
    let (runtime, pool) = create_test_pool(3);
    let events = record_events(&pool);
    pool.ensure_running(A, &unit(A)).await.unwrap();
    pool.ensure_running(B, &unit(B)).await.unwrap();

    runtime.crash(&unit(A));
    let vanished = pool.reconcile().await.unwrap();

    assert_eq!(vanished, vec![A]);
    assert_eq!(running_models(&pool), vec![B]);
    assert!(events.lock().unwrap().iter().any(|e| matches!(
        e,
        PoolEvent::Stopped { reason: StopReason::Vanished, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_release_all_continues_past_failures() {
    let (runtime, pool) = create_test_pool(3);
    for model in [A, B, C] {
        pool.ensure_running(model, &unit(model)).await.unwrap();
    }
    runtime.fail_stop(&unit(B), true);

    assert_eq!(pool.release_all().await, vec![A, C]);
    assert_eq!(running_models(&pool), vec![B]);
    assert_eq!(runtime.running_units(), vec![unit(B)]);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_orders_by_start() {
    let (_runtime, pool) = create_test_pool(3);
    for model in [C, A, B] {
        pool.ensure_running(model, &unit(model)).await.unwrap();
        advance(Duration::from_secs(1)).await;
    }

    let snapshot = pool.snapshot();
    let order: Vec<ModelId> = snapshot.entries.iter().map(|e| e.model_id).collect();
    assert_eq!(order, vec![C, A, B]);
    assert_eq!(snapshot.running_count, 3);
}
