// crates/dflowcore/tests/checkpoint_test.rs

use dflowcore::{
    merge_branch_globals, sample_children, Checkpoint, EventBus, FlowEvent, FrameStatus, Pin,
    ERROR_MSG, FINISHED, SAMPLE_GAP,
};
use serde_json::{json, Map, Value};

fn globals(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[test]
fn test_dump_and_rebuild_keep_everything() {
    let mut cp = Checkpoint::new("t1");
    cp.put("customer", json!({ "id": 7, "tier": "gold" })).unwrap();
    cp.push_frame("a", Some("first"), "10.0.0.1");
    assert!(cp.set_result(json!(5), FrameStatus::End));
    cp.push_frame("b", None, "10.0.0.1");
    let mut closure = Map::new();
    closure.insert("limit".to_string(), json!(3));
    cp.set_closure_data("config", closure);
    cp.set_pin(Pin {
        machine: "10.0.0.1".to_string(),
        scope: "fm".to_string(),
        entry: "fm@t1/just0".to_string(),
    });

    let rebuilt = Checkpoint::rebuild(&cp.dump().unwrap()).unwrap();
    assert_eq!(rebuilt, cp);
    assert_eq!(rebuilt.param(), json!(5));
    assert_eq!(rebuilt.closure_data("config").unwrap()["limit"], json!(3));
    assert_eq!(rebuilt.pin().unwrap().entry, "fm@t1/just0");
}

#[test]
fn test_null_result_survives_round_trip() {
    let mut cp = Checkpoint::new("t-null");
    cp.push_frame("a", None, "local");
    assert!(cp.set_result(Value::Null, FrameStatus::End));

    let rebuilt = Checkpoint::rebuild(&cp.dump().unwrap()).unwrap();
    assert_eq!(rebuilt.result(), Some(&Value::Null));
    // Still exactly once after rebuilding.
    let mut rebuilt = rebuilt;
    assert!(!rebuilt.set_result(json!(1), FrameStatus::End));
}

#[test]
fn test_push_frame_chains_results() {
    let mut cp = Checkpoint::new("t2");
    cp.push_frame("a", None, "m1");
    assert_eq!(cp.param(), Value::Null);
    cp.set_result(json!(10), FrameStatus::End);

    let frame = cp.push_frame("b", None, "m2");
    assert_eq!(frame.param, json!(10));
    assert_eq!(frame.status, FrameStatus::Begin);
    assert_eq!(frame.ip, "m2");
    assert_eq!(cp.depth(), 2);
    assert_eq!(cp.name(), Some("b"));
}

#[test]
fn test_set_result_only_once() {
    let mut cp = Checkpoint::new("t3");
    assert!(!cp.set_result(json!(1), FrameStatus::End));

    cp.push_frame("a", None, "m1");
    assert!(cp.set_result(json!(1), FrameStatus::End));
    assert!(!cp.set_result(json!(2), FrameStatus::End));
    assert_eq!(cp.result(), Some(&json!(1)));
    assert!(cp.top().unwrap().cost_time.is_some());
}

#[test]
fn test_retry_replaces_stale_frame() {
    let mut cp = Checkpoint::new("t4");
    cp.push_frame("a", None, "m1");
    cp.set_result(json!("input"), FrameStatus::End);
    cp.push_frame("b", None, "m1");
    cp.mark_retry("db down");

    let frame = cp.push_frame("b", None, "m1");
    assert_eq!(frame.param, json!("input"));
    assert_eq!(
        frame.status,
        FrameStatus::Retrying {
            attempt: 1,
            cause: "db down".to_string()
        }
    );
    assert!(frame.status.is_in_progress());
    assert_eq!(cp.depth(), 2);

    cp.mark_retry("still down");
    let frame = cp.push_frame("b", None, "m1");
    assert!(matches!(frame.status, FrameStatus::Retrying { attempt: 2, .. }));
}

#[test]
fn test_status_flags_and_errors() {
    let mut cp = Checkpoint::new("t5");
    assert!(!cp.is_finished());
    assert!(!cp.is_failed());

    cp.append_error("a", "first");
    cp.append_error("b", "second");
    assert_eq!(cp.error_message(), Some("[a] first\n[b] second"));

    cp.set_finished();
    cp.set_failed();
    cp.set_next_step("TERMINATED");
    assert!(cp.is_finished());
    assert!(cp.is_failed());
    assert_eq!(cp.next_step(), Some("TERMINATED"));
    assert_eq!(cp.get_value(FINISHED), Some(&Value::Bool(true)));
}

#[test]
fn test_children_sampling() {
    let ids: Vec<String> = (0..5).map(|i| Checkpoint::child_id("p", 3, i)).collect();
    assert_eq!(ids[0], "p_3-0");

    let sampled = sample_children(&ids, 3);
    assert_eq!(sampled, vec!["p_3-0".to_string(), SAMPLE_GAP.to_string(), "p_3-4".to_string()]);
    assert_eq!(sample_children(&ids[..2], 3), ids[..2].to_vec());

    let mut cp = Checkpoint::new("p");
    cp.push_frame("zip", None, "m1");
    cp.set_result(Value::Null, FrameStatus::PrepareSubcall);
    cp.push_frame("zip#join", None, "m1");
    cp.record_children(&ids, 3);
    cp.set_result(json!([]), FrameStatus::End);
    cp.push_frame("zip#collect", None, "m1");

    // The full list is recoverable even though only a sample was stored.
    assert_eq!(cp.spawned_children().len(), 5);
    assert_eq!(cp.spawned_children()[4], Checkpoint::child_id("p", 2, 4));
}

#[test]
fn test_merge_renames_conflicts_in_branch_order() {
    let mut target = globals(&[("shared", json!("parent")), ("_FINISHED", json!(false))]);
    let branches = vec![
        globals(&[("shared", json!("parent")), ("x", json!(1)), ("_FINISHED", json!(true))]),
        globals(&[("x", json!(2)), ("y", json!("b"))]),
        globals(&[("x", json!(3)), ("shared", json!("changed"))]),
    ];

    merge_branch_globals(&mut target, &branches);

    assert_eq!(target["shared"], json!("parent"));
    assert_eq!(target["shared0"], json!("changed"));
    assert_eq!(target["x"], json!(1));
    assert_eq!(target["x0"], json!(2));
    assert_eq!(target["x1"], json!(3));
    assert_eq!(target["y"], json!("b"));
    // Reserved keys are never copied.
    assert_eq!(target["_FINISHED"], json!(false));
}

#[test]
fn test_merge_keeps_identical_values_once() {
    let mut target = Map::new();
    let branches = vec![
        globals(&[(ERROR_MSG, json!("[a] boom"))]),
        globals(&[(ERROR_MSG, json!("[a] boom"))]),
    ];
    merge_branch_globals(&mut target, &branches);
    assert_eq!(target.len(), 1);
}

#[tokio::test]
async fn test_event_bus_delivers_to_subscribers() {
    let bus = EventBus::new(16);
    bus.step_started("t1", "nobody-listens");

    let mut rx = bus.subscribe();
    bus.suspended("t1", "approve");
    bus.flow_finished("t1", false);

    match rx.recv().await.unwrap() {
        FlowEvent::Suspended { trace_id, step, .. } => {
            assert_eq!(trace_id, "t1");
            assert_eq!(step, "approve");
        }
        other => panic!("unexpected event {:?}", other),
    }
    let finished = rx.recv().await.unwrap();
    assert_eq!(finished.trace_id(), "t1");
    assert!(matches!(finished, FlowEvent::FlowFinished { failed: false, .. }));

    let json = serde_json::to_value(&finished).unwrap();
    assert_eq!(json["type"], "FlowFinished");
}
