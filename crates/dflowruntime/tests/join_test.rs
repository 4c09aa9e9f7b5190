// crates/dflowruntime/tests/join_test.rs

use dflowcore::{Checkpoint, ConstructionError, FlowError, RoutingError, StepError, Value};
use dflowruntime::{trigger, Engine, EngineConfig, Flow, TriggerFn};
use dflowstores::{InMemoryContextStore, InMemoryCounterStore};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

fn engine() -> Engine {
    Engine::new(
        Arc::new(InMemoryContextStore::new()),
        Arc::new(InMemoryCounterStore::new()),
    )
}

fn counting_map(
    counter: &Arc<AtomicUsize>,
) -> impl Fn(&mut Checkpoint, Value) -> Result<Value, StepError> + Send + Sync + 'static {
    let counter = counter.clone();
    move |_, v| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(v)
    }
}

/// Triggers that record the spawned branch trace ids in declared order.
fn recording_triggers(n: usize) -> (Vec<TriggerFn>, Arc<Mutex<Vec<(usize, String)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let triggers = (0..n)
        .map(|i| {
            let seen = seen.clone();
            trigger(move |child| {
                seen.lock().unwrap().push((i, child.id.clone()));
                Ok(())
            })
        })
        .collect();
    (triggers, seen)
}

fn branch_ids(seen: &Arc<Mutex<Vec<(usize, String)>>>) -> Vec<String> {
    let mut ids = seen.lock().unwrap().clone();
    ids.sort();
    ids.into_iter().map(|(_, id)| id).collect()
}

const PERMUTATIONS: [[usize; 3]; 6] = [
    [0, 1, 2],
    [0, 2, 1],
    [1, 0, 2],
    [1, 2, 0],
    [2, 0, 1],
    [2, 1, 0],
];

#[tokio::test]
async fn test_and_join_fires_once_for_every_permutation() {
    init_tracing();
    let engine = engine();
    let fired = Arc::new(AtomicUsize::new(0));
    let flow = Flow::from_calls(["c0", "c1", "c2"])
        .id("gather")
        .map(counting_map(&fired));
    engine.install(&flow, "and").await.unwrap();

    for (n, order) in PERMUTATIONS.iter().enumerate() {
        let trace = format!("and-{}", n);
        let before = fired.load(Ordering::SeqCst);

        for (position, &slot) in order.iter().enumerate() {
            let call = format!("c{}", slot);
            let payload = format!("v{}", slot);
            engine.resume(&call, &payload, &trace).await.unwrap();
            // Redeliver the first arrival while the join is still open.
            if position == 1 {
                let first = order[0];
                let resent = engine
                    .resume(&format!("c{}", first), "dup", &trace)
                    .await
                    .unwrap();
                assert!(!resent);
            }
        }
        // Redelivery after the join fired.
        assert!(!engine.resume("c1", "late", &trace).await.unwrap());

        assert_eq!(fired.load(Ordering::SeqCst), before + 1, "order {:?}", order);
        let cp = engine.checkpoint(&trace).await.unwrap().unwrap();
        assert!(cp.is_finished());
        assert_eq!(cp.result(), Some(&json!(["v0", "v1", "v2"])));
    }
}

#[tokio::test]
async fn test_or_join_first_arrival_wins() {
    init_tracing();
    let engine = engine();
    let fired = Arc::new(AtomicUsize::new(0));
    let flow = Flow::from_any_call(["r0", "r1", "r2"])
        .id("race")
        .map(counting_map(&fired));
    engine.install(&flow, "or").await.unwrap();

    assert!(engine.resume("r2", "v2", "or-1").await.unwrap());
    assert!(!engine.resume("r0", "v0", "or-1").await.unwrap());
    assert!(!engine.resume("r2", "v2", "or-1").await.unwrap());
    assert!(!engine.resume("r1", "v1", "or-1").await.unwrap());

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    let cp = engine.checkpoint("or-1").await.unwrap().unwrap();
    assert_eq!(cp.result(), Some(&json!([null, null, "v2"])));
}

#[tokio::test]
async fn test_zip_combines_in_declared_order_and_merges_globals() {
    init_tracing();
    let engine = engine();
    let left = Flow::just(3).map(|cp, v| {
        cp.put("seen", "left")?;
        cp.put("left_only", true)?;
        Ok(v)
    });
    let right = Flow::just(4)
        .map(|cp, v| {
            cp.put("seen", "right")?;
            Ok(json!(v.as_i64().unwrap_or(0) * 2))
        })
        .name("double");
    let flow = Flow::zip(vec![left, right], |_, values| Ok(json!(values)))
        .id("pair")
        .map(|_, v| Ok(v));
    let pipeline = engine.install(&flow, "zip").await.unwrap();

    engine.start(&pipeline, "z1").await.unwrap();

    let cp = engine.checkpoint("z1").await.unwrap().unwrap();
    assert!(cp.is_finished());
    assert!(!cp.is_failed());
    assert_eq!(cp.result(), Some(&json!([3, 8])));
    assert_eq!(cp.get_str("seen"), Some("left"));
    assert_eq!(cp.get_str("seen0"), Some("right"));
    assert_eq!(cp.get::<bool>("left_only").unwrap(), Some(true));

    let join = cp.frame_named("pair#join").unwrap();
    assert!(join.parallel);
    assert_eq!(join.total_size, Some(2));
    assert_eq!(join.child_task.as_ref().map(Vec::len), Some(2));

    let (trace, frame) = engine.find_frame("z1", "double").await.unwrap().unwrap();
    assert_eq!(trace, Checkpoint::child_id("z1", 2, 1));
    assert_eq!(frame.ret, Some(json!(8)));
}

#[tokio::test]
async fn test_zip_failure_skips_combiner_in_any_arrival_order() {
    init_tracing();

    for failing_first in [true, false] {
        let engine = engine();
        let combined = Arc::new(AtomicUsize::new(0));
        let counter = combined.clone();
        let a = Flow::just(3).await_call("a.done");
        let b = Flow::just(0)
            .await_call("b.done")
            .map(|_, _| Err(StepError::user("branch b broke")));
        let (triggers, seen) = recording_triggers(2);
        let flow = Flow::zip_with_triggers(vec![a, b], triggers, move |_, values| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(values))
        })
        .id("both");
        let pipeline = engine.install(&flow, "zipfail").await.unwrap();

        engine.start(&pipeline, "zf").await.unwrap();
        let ids = branch_ids(&seen);
        assert_eq!(ids.len(), 2);

        let deliveries = if failing_first {
            [("b.done", &ids[1]), ("a.done", &ids[0])]
        } else {
            [("a.done", &ids[0]), ("b.done", &ids[1])]
        };
        let mut last = Ok(false);
        for (call, trace) in deliveries {
            last = engine.resume(call, "go", trace).await;
        }
        assert!(matches!(last, Err(FlowError::Terminated { .. })), "got {:?}", last);

        assert_eq!(combined.load(Ordering::SeqCst), 0);
        let cp = engine.checkpoint("zf").await.unwrap().unwrap();
        assert!(cp.is_failed());
        assert!(cp.error_message().unwrap_or("").contains("zip failed, branch 1 failed"));
    }
}

#[tokio::test]
async fn test_terminated_branch_fails_the_zip() {
    init_tracing();
    let engine = engine();
    let combined = Arc::new(AtomicUsize::new(0));
    let counter = combined.clone();
    let flow = Flow::zip(
        vec![
            Flow::just(1).map(|_, _| Err(StepError::terminal("branch gave up"))),
            Flow::just(2),
        ],
        move |_, values| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(values))
        },
    );
    let pipeline = engine.install(&flow, "zipterm").await.unwrap();

    assert!(engine.start(&pipeline, "zt").await.is_err());
    assert_eq!(combined.load(Ordering::SeqCst), 0);
    let cp = engine.checkpoint("zt").await.unwrap().unwrap();
    assert!(cp.is_failed());
    assert!(cp.is_finished());
}

#[tokio::test]
async fn test_or_picks_first_successful_branch() {
    init_tracing();
    let engine = engine();
    let flow = Flow::any(
        vec![
            Flow::just(0).map(|_, _| Err(StepError::user("first branch down"))),
            Flow::just(5),
            Flow::just(7),
        ],
        |_, winner| Ok(json!({ "index": winner.index, "data": winner.data })),
    );
    let pipeline = engine.install(&flow, "race").await.unwrap();

    assert!(!engine.start(&pipeline, "o1").await.unwrap());

    let cp = engine.checkpoint("o1").await.unwrap().unwrap();
    assert!(cp.is_finished());
    assert_eq!(cp.result(), Some(&json!({ "index": 1, "data": 5 })));
}

#[tokio::test]
async fn test_or_winner_is_first_to_arrive() {
    init_tracing();
    let engine = engine();
    let judged = Arc::new(AtomicUsize::new(0));
    let counter = judged.clone();
    let (triggers, seen) = recording_triggers(2);
    let flow = Flow::any_with_triggers(
        vec![Flow::just("slow").await_call("slow.done"), Flow::just("fast")],
        triggers,
        move |_, winner| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(winner.index))
        },
    );
    let pipeline = engine.install(&flow, "arrival").await.unwrap();
    engine.start(&pipeline, "o2").await.unwrap();

    let cp = engine.checkpoint("o2").await.unwrap().unwrap();
    assert_eq!(cp.result(), Some(&json!(1)));

    // The slow branch completes afterwards and changes nothing.
    let ids = branch_ids(&seen);
    engine.resume("slow.done", "", &ids[0]).await.unwrap();
    assert_eq!(judged.load(Ordering::SeqCst), 1);
    let cp = engine.checkpoint("o2").await.unwrap().unwrap();
    assert_eq!(cp.result(), Some(&json!(1)));
}

#[tokio::test]
async fn test_or_fails_only_when_every_branch_failed() {
    init_tracing();
    let engine = engine();
    let judged = Arc::new(AtomicUsize::new(0));
    let counter = judged.clone();
    let flow = Flow::any(
        vec![
            Flow::just(1).map(|_, _| Err(StepError::user("no"))),
            Flow::just(2).map(|_, _| Err(StepError::user("nope"))),
        ],
        move |_, winner| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(winner.data)
        },
    );
    let pipeline = engine.install(&flow, "allfail").await.unwrap();

    let err = engine.start(&pipeline, "o3").await.unwrap_err();
    assert!(matches!(err, FlowError::Terminated { ref reason, .. } if reason.contains("all branches")));
    assert_eq!(judged.load(Ordering::SeqCst), 0);
    assert!(engine.checkpoint("o3").await.unwrap().unwrap().is_failed());
}

#[tokio::test]
async fn test_branch_triggers_see_spawned_children() {
    init_tracing();
    let engine = engine();
    let (triggers, seen) = recording_triggers(3);
    let branches = (0..3).map(|i| Flow::just(i).await_call(format!("job{}", i))).collect();
    let flow = Flow::zip_with_triggers(branches, triggers, |_, values| Ok(json!(values)));
    let pipeline = engine.install(&flow, "jobs").await.unwrap();
    engine.start(&pipeline, "j1").await.unwrap();

    let ids = branch_ids(&seen);
    assert_eq!(
        ids,
        (0..3).map(|i| Checkpoint::child_id("j1", 2, i)).collect::<Vec<_>>()
    );
    for (i, id) in ids.iter().enumerate() {
        let child = engine.checkpoint(id).await.unwrap().unwrap();
        assert_eq!(child.parent(), Some("j1"));
        assert_eq!(child.param(), json!(i));
    }

    for (i, id) in ids.iter().enumerate().rev() {
        engine.resume(&format!("job{}", i), "done", id).await.unwrap();
    }
    let cp = engine.checkpoint("j1").await.unwrap().unwrap();
    assert_eq!(cp.result(), Some(&json!([0, 1, 2])));
}

#[tokio::test]
async fn test_trigger_count_must_match_branches() {
    init_tracing();
    let engine = engine();
    let (triggers, _) = recording_triggers(1);
    let flow = Flow::zip_with_triggers(vec![Flow::just(1), Flow::just(2)], triggers, |_, v| Ok(json!(v)));
    let err = engine.install(&flow, "mismatch").await.unwrap_err();
    assert!(matches!(
        err,
        FlowError::Construction(ConstructionError::TriggerCountMismatch {
            branches: 2,
            triggers: 1,
            ..
        })
    ));
}

#[tokio::test]
async fn test_null_branch_value_fills_its_slot() {
    init_tracing();
    let engine = engine();
    let combined = Arc::new(AtomicUsize::new(0));
    let counter = combined.clone();
    let flow = Flow::zip(vec![Flow::just(Value::Null), Flow::just(2)], move |_, values| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(json!(values))
    });
    let pipeline = engine.install(&flow, "nullzip").await.unwrap();
    engine.start(&pipeline, "n1").await.unwrap();

    assert_eq!(combined.load(Ordering::SeqCst), 1);
    let cp = engine.checkpoint("n1").await.unwrap().unwrap();
    assert!(cp.is_finished());
    assert!(!cp.is_failed());
    assert_eq!(cp.result(), Some(&json!([null, 2])));

    let flow = Flow::any(vec![Flow::just(Value::Null), Flow::just(5)], |_, winner| {
        Ok(json!({ "index": winner.index, "data": winner.data }))
    });
    let pipeline = engine.install(&flow, "nullrace").await.unwrap();
    engine.start(&pipeline, "n2").await.unwrap();
    let cp = engine.checkpoint("n2").await.unwrap().unwrap();
    assert_eq!(cp.result(), Some(&json!({ "index": 0, "data": null })));
}

#[tokio::test]
async fn test_null_payload_is_a_real_arrival() {
    init_tracing();
    let engine = engine();
    let fired = Arc::new(AtomicUsize::new(0));
    let flow = Flow::from_calls(["c0", "c1", "c2"])
        .id("gather")
        .map(counting_map(&fired));
    engine.install(&flow, "nullcall").await.unwrap();

    assert!(!engine.resume("c0", "null", "n3").await.unwrap());
    assert!(!engine.resume("c0", "other", "n3").await.unwrap());
    engine.resume("c1", "v1", "n3").await.unwrap();
    engine.resume("c2", "v2", "n3").await.unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    let cp = engine.checkpoint("n3").await.unwrap().unwrap();
    assert_eq!(cp.result(), Some(&json!(["null", "v1", "v2"])));
}

#[tokio::test]
async fn test_late_branch_after_removal_leaves_race_alone() {
    init_tracing();
    let engine = Engine::builder(
        Arc::new(InMemoryContextStore::new()),
        Arc::new(InMemoryCounterStore::new()),
    )
    .config(EngineConfig {
        remove_finished: true,
        ..EngineConfig::default()
    })
    .build();
    let judged = Arc::new(AtomicUsize::new(0));
    let counter = judged.clone();
    let (triggers, seen) = recording_triggers(2);
    let flow = Flow::any_with_triggers(
        vec![Flow::just("slow").await_call("slow.done"), Flow::just("fast")],
        triggers,
        move |_, winner| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(winner.index))
        },
    );
    let pipeline = engine.install(&flow, "removed").await.unwrap();
    engine.start(&pipeline, "o4").await.unwrap();

    assert_eq!(judged.load(Ordering::SeqCst), 1);
    assert!(engine.checkpoint("o4").await.unwrap().is_none());

    let ids = branch_ids(&seen);
    engine.resume("slow.done", "", &ids[0]).await.unwrap();
    assert_eq!(judged.load(Ordering::SeqCst), 1);
    assert!(engine.checkpoint("o4").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_and_arrivals_fire_once() {
    init_tracing();
    let engine = engine();
    let fired = Arc::new(AtomicUsize::new(0));
    let flow = Flow::from_calls(["c0", "c1", "c2"])
        .id("gather")
        .map(counting_map(&fired));
    engine.install(&flow, "and").await.unwrap();

    let traces: Vec<String> = (0..8).map(|n| format!("cand-{}", n)).collect();
    let mut handles = Vec::new();
    for trace in &traces {
        // Every slot is delivered three times at once.
        for _ in 0..3 {
            for slot in 0..3 {
                let engine = engine.clone();
                let trace = trace.clone();
                handles.push(tokio::spawn(async move {
                    let call = format!("c{}", slot);
                    let payload = format!("v{}", slot);
                    engine.resume(&call, &payload, &trace).await
                }));
            }
        }
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(fired.load(Ordering::SeqCst), traces.len());
    for trace in &traces {
        let cp = engine.checkpoint(trace).await.unwrap().unwrap();
        assert!(cp.is_finished(), "{}", trace);
        assert_eq!(cp.result(), Some(&json!(["v0", "v1", "v2"])));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_or_arrivals_fire_once() {
    init_tracing();
    let engine = engine();
    let fired = Arc::new(AtomicUsize::new(0));
    let flow = Flow::from_any_call(["r0", "r1", "r2"])
        .id("race")
        .map(counting_map(&fired));
    engine.install(&flow, "or").await.unwrap();

    let traces: Vec<String> = (0..8).map(|n| format!("cor-{}", n)).collect();
    let mut handles = Vec::new();
    for trace in &traces {
        for _ in 0..3 {
            for slot in 0..3 {
                let engine = engine.clone();
                let trace = trace.clone();
                handles.push(tokio::spawn(async move {
                    engine
                        .resume(&format!("r{}", slot), &format!("v{}", slot), &trace)
                        .await
                }));
            }
        }
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(fired.load(Ordering::SeqCst), traces.len());
    for trace in &traces {
        let cp = engine.checkpoint(trace).await.unwrap().unwrap();
        assert!(cp.is_finished(), "{}", trace);
        let slots = cp.result().and_then(Value::as_array).cloned().unwrap_or_default();
        assert_eq!(slots.len(), 3);
        assert!(slots.iter().any(|v| !v.is_null()), "{}: {:?}", trace, slots);
    }
}

#[tokio::test]
async fn test_slot_call_types_are_not_accepted_from_outside() {
    init_tracing();
    let engine = engine();
    let fired = Arc::new(AtomicUsize::new(0));
    let flow = Flow::zip(
        vec![Flow::just(1).await_call("w.done"), Flow::just(2)],
        |_, values| Ok(json!(values)),
    )
    .id("pair")
    .map(counting_map(&fired));
    let pipeline = engine.install(&flow, "internal").await.unwrap();
    engine.start(&pipeline, "i1").await.unwrap();

    let slot_calls: Vec<String> = engine
        .router()
        .routes()
        .await
        .into_iter()
        .map(|r| r.call_type)
        .filter(|c| c.contains('#'))
        .collect();
    assert!(!slot_calls.is_empty());
    for call in &slot_calls {
        let err = engine.resume(call, "1", "i1").await.unwrap_err();
        assert!(matches!(err, FlowError::Routing(RoutingError::UnknownCallType(ref c)) if c == call));
    }

    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(!engine.checkpoint("i1").await.unwrap().unwrap().is_finished());
}
