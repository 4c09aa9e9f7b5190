// crates/dflowruntime/tests/mock_test.rs

use dflowcore::{ConstructionError, FlowError, StepError, MOCK};
use dflowruntime::{Engine, EngineConfig, Flow};
use dflowstores::{InMemoryContextStore, InMemoryCounterStore};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

fn engine(test_mode: bool) -> Engine {
    Engine::builder(
        Arc::new(InMemoryContextStore::new()),
        Arc::new(InMemoryCounterStore::new()),
    )
    .config(EngineConfig {
        test_mode,
        ..EngineConfig::default()
    })
    .build()
}

/// A flow whose middle node needs a real service.
fn service_flow(calls: &Arc<AtomicUsize>) -> Flow {
    let calls = calls.clone();
    Flow::just(1)
        .map(move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StepError::user("service unreachable"))
        })
        .id("lookup")
        .mock_value(41)
        .map(|_, v| Ok(json!(v.as_i64().unwrap_or(0) + 1)))
}

#[tokio::test]
async fn test_mocked_instance_uses_mock_answers() {
    init_tracing();
    let engine = engine(true);
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = engine.install(&service_flow(&calls), "svc").await.unwrap();

    assert!(engine.start_mocked(&pipeline, "m1").await.unwrap());
    let cp = engine.checkpoint("m1").await.unwrap().unwrap();
    assert!(cp.is_mock());
    assert!(cp.is_finished());
    assert_eq!(cp.result(), Some(&json!(42)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Unmocked instances on the same engine run the real node.
    let err = engine.start(&pipeline, "m2").await.unwrap_err();
    assert!(matches!(err, FlowError::Step { ref step, .. } if step == "lookup"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_mocks_are_ignored_outside_test_mode() {
    init_tracing();
    let engine = engine(false);
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = engine.install(&service_flow(&calls), "svc").await.unwrap();

    let err = engine.start_mocked(&pipeline, "m3").await.unwrap_err();
    assert!(matches!(err, FlowError::Step { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(engine.checkpoint("m3").await.unwrap().unwrap().is_failed());
}

#[tokio::test]
async fn test_mock_can_answer_a_callback_or_defer() {
    init_tracing();
    let engine = engine(true);
    let flow = Flow::just(1)
        .await_call("approval")
        .mock(|_| Ok(Some(json!("stubbed"))))
        .map(|_, v| Ok(json!({ "approved": v })));
    let pipeline = engine.install(&flow, "approve").await.unwrap();

    // The mock answers without waiting for the callback.
    engine.start_mocked(&pipeline, "m4").await.unwrap();
    let cp = engine.checkpoint("m4").await.unwrap().unwrap();
    assert_eq!(cp.result(), Some(&json!({ "approved": "stubbed" })));

    // A mock returning nothing lets the node do its own work.
    let deferring = Flow::just(3)
        .map(|_, v| Ok(json!(v.as_i64().unwrap_or(0) * 2)))
        .mock(|_| Ok(None));
    let pipeline = engine.install(&deferring, "defer").await.unwrap();
    assert!(engine.start_mocked(&pipeline, "m7").await.unwrap());
    let cp = engine.checkpoint("m7").await.unwrap().unwrap();
    assert_eq!(cp.result(), Some(&json!(6)));

    let failing = Flow::just(1)
        .mock(|_| Err(StepError::user("mock refused")))
        .id("refuse");
    let pipeline = engine.install(&failing, "refuse").await.unwrap();
    let err = engine.start_mocked(&pipeline, "m5").await.unwrap_err();
    assert!(matches!(err, FlowError::Step { ref message, .. } if message == "mock refused"));
}

#[tokio::test]
async fn test_mock_marker_is_not_reserved() {
    init_tracing();
    let mut cp = dflowcore::Checkpoint::new("m6");
    assert!(!cp.is_mock());
    cp.set_mock();
    assert!(cp.is_mock());
    assert!(cp.get_value(MOCK).is_some());
    cp.unset_mock();
    assert!(!cp.is_mock());
}

#[tokio::test]
async fn test_omit_patterns_are_managed_at_runtime() {
    init_tracing();
    let engine = engine(false);
    assert!(engine.omit_patterns().await.is_empty());

    let active = engine.add_omit_pattern("^load-test-").await.unwrap();
    assert_eq!(active, vec!["^load-test-".to_string()]);
    let active = engine.add_omit_pattern("^load-test-").await.unwrap();
    assert_eq!(active.len(), 1);
    engine.add_omit_pattern("-skip$").await.unwrap();
    assert_eq!(engine.omit_patterns().await, vec!["^load-test-".to_string(), "-skip$".to_string()]);

    let err = engine.add_omit_pattern("(unclosed").await.unwrap_err();
    assert!(matches!(
        err,
        FlowError::Construction(ConstructionError::InvalidPattern { ref pattern, .. }) if pattern == "(unclosed"
    ));

    engine.clear_omit_pattern("-skip$").await;
    assert_eq!(engine.omit_patterns().await, vec!["^load-test-".to_string()]);
}

#[tokio::test]
async fn test_omitted_trace_fails_on_entry() {
    init_tracing();
    let engine = engine(false);
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();
    let flow = Flow::just(1).map(move |_, v| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(v)
    });
    let pipeline = engine.install(&flow, "omit").await.unwrap();
    engine.add_omit_pattern("^load-test-").await.unwrap();

    let err = engine.start(&pipeline, "load-test-1").await.unwrap_err();
    match err {
        FlowError::Step { trace_id, message, .. } => {
            assert_eq!(trace_id, "load-test-1");
            assert!(message.contains("omitted by pattern: ^load-test-"), "{}", message);
        }
        other => panic!("unexpected error {:?}", other),
    }
    let cp = engine.checkpoint("load-test-1").await.unwrap().unwrap();
    assert!(cp.is_finished());
    assert!(cp.is_failed());
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    assert!(engine.start(&pipeline, "regular-1").await.unwrap());
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    engine.clear_omit_pattern("^load-test-").await;
    assert!(engine.start(&pipeline, "load-test-2").await.unwrap());
}
