// DAG and jump topology validation, including engine-level init errors.

mod common;

use common::{build_request, connection_dict, harness, jump_dict, ItemScript};
use graphloom::core::EngineInitFailed;
use graphloom::dag::{items_by_jump, validate_jumps, Dag};
use graphloom::jump::{Jump, JumpCondition};
use serde_json::json;
use std::collections::HashMap;

fn dag_of(nodes: &[&str], edges: &[(&str, &str)]) -> Dag {
    let mut successors: HashMap<String, Vec<String>> = HashMap::new();
    for (from, to) in edges {
        successors
            .entry(from.to_string())
            .or_default()
            .push(to.to_string());
    }
    Dag::from_successors(nodes.iter().map(|n| n.to_string()), &successors)
}

fn jump(source: &str, destination: &str) -> Jump {
    Jump::new(
        source,
        "bottom",
        destination,
        "bottom",
        JumpCondition::default(),
        Vec::new(),
    )
}

#[test]
fn diamond_is_a_valid_dag() {
    let dag = dag_of(
        &["a", "b", "c", "d"],
        &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
    );
    dag.validate().unwrap();
    assert!(dag.has_path("a", "d"));
    assert!(!dag.has_path("b", "c"));
}

#[test]
fn cycles_are_rejected() {
    let dag = dag_of(&["a", "b"], &[("a", "b"), ("b", "a")]);
    assert!(matches!(dag.validate(), Err(EngineInitFailed::InvalidDag)));
}

#[test]
fn disconnected_components_are_rejected() {
    let dag = dag_of(&["a", "b", "c", "d"], &[("a", "b"), ("c", "d")]);
    assert!(matches!(
        dag.validate(),
        Err(EngineInitFailed::UnconnectedDag)
    ));
}

#[test]
fn isolated_single_node_is_valid() {
    let dag = dag_of(&["a"], &[]);
    dag.validate().unwrap();
    assert_eq!(dag.node_count(), 1);
}

#[test]
fn simple_path_items_cover_all_branches() {
    let dag = dag_of(
        &["a", "b", "c", "d"],
        &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
    );
    let items = dag.items_on_simple_paths("a", "d");
    let expected: Vec<&str> = vec!["a", "b", "c", "d"];
    assert_eq!(items.iter().map(String::as_str).collect::<Vec<_>>(), expected);
}

#[test]
fn forward_jumps_are_rejected() {
    let dag = dag_of(&["a", "b"], &[("a", "b")]);
    let jumps = vec![jump("a", "b")];
    let bodies = items_by_jump(&jumps, &dag);
    assert!(matches!(
        validate_jumps(&jumps, &bodies, &dag),
        Err(EngineInitFailed::ForwardJump)
    ));
}

#[test]
fn jumps_across_branches_are_rejected() {
    let dag = dag_of(&["a", "b", "c"], &[("a", "b"), ("a", "c")]);
    let jumps = vec![jump("c", "b")];
    let bodies = items_by_jump(&jumps, &dag);
    assert!(matches!(
        validate_jumps(&jumps, &bodies, &dag),
        Err(EngineInitFailed::JumpAcrossBranches)
    ));
}

#[test]
fn shared_jump_sources_are_rejected() {
    let dag = dag_of(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
    let jumps = vec![jump("c", "a"), jump("c", "b")];
    let bodies = items_by_jump(&jumps, &dag);
    assert!(matches!(
        validate_jumps(&jumps, &bodies, &dag),
        Err(EngineInitFailed::SharedJumpSource(_, _))
    ));
}

#[test]
fn partially_overlapping_jumps_are_rejected() {
    let dag = dag_of(
        &["a", "b", "c", "d"],
        &[("a", "b"), ("b", "c"), ("c", "d")],
    );
    // Bodies {a, b, c} and {b, c, d} overlap without nesting.
    let jumps = vec![jump("c", "a"), jump("d", "b")];
    let bodies = items_by_jump(&jumps, &dag);
    assert!(matches!(
        validate_jumps(&jumps, &bodies, &dag),
        Err(EngineInitFailed::OverlappingJumps(_, _))
    ));
}

#[test]
fn nested_jumps_validate() {
    let dag = dag_of(
        &["a", "b", "c", "d"],
        &[("a", "b"), ("b", "c"), ("c", "d")],
    );
    let jumps = vec![jump("d", "a"), jump("c", "b")];
    let bodies = items_by_jump(&jumps, &dag);
    validate_jumps(&jumps, &bodies, &dag).unwrap();
}

#[test]
fn missing_jump_endpoints_are_rejected() {
    let dag = dag_of(&["a", "b"], &[("a", "b")]);
    let jumps = vec![jump("b", "ghost")];
    let bodies = items_by_jump(&jumps, &dag);
    assert!(matches!(
        validate_jumps(&jumps, &bodies, &dag),
        Err(EngineInitFailed::JumpDestinationMissing(_))
    ));
}

#[test]
fn engine_rejects_disconnected_projects() {
    let request = build_request(
        &["a", "b", "c", "d"],
        vec![connection_dict("a", "b"), connection_dict("c", "d")],
        vec![],
    );
    let result = harness(request, |factory, _db| {
        for item in ["a", "b", "c", "d"] {
            factory.script(item, ItemScript::default());
        }
    });
    assert!(matches!(result, Err(EngineInitFailed::UnconnectedDag)));
}

#[test]
fn engine_rejects_write_index_conflicts() {
    // a writes to d after its own descendant b.
    let mut request = build_request(
        &["a", "b", "d"],
        vec![
            json!({ "from": ["a", "right"], "to": ["b", "left"] }),
            json!({ "from": ["a", "right"], "to": ["d", "left"], "options": { "write_index": 2 } }),
            json!({ "from": ["b", "right"], "to": ["d", "left"], "options": { "write_index": 1 } }),
        ],
        vec![],
    );
    request.node_successors = HashMap::new();
    let result = harness(request, |factory, _db| {
        for item in ["a", "b", "d"] {
            factory.script(item, ItemScript::default());
        }
    });
    assert!(matches!(
        result,
        Err(EngineInitFailed::WriteIndexConflict(_))
    ));
}

#[test]
fn engine_rejects_forward_loops() {
    let request = build_request(
        &["a", "b"],
        vec![connection_dict("a", "b")],
        vec![jump_dict("a", "b", 2)],
    );
    let result = harness(request, |factory, _db| {
        factory.script("a", ItemScript::default());
        factory.script("b", ItemScript::default());
    });
    assert!(matches!(result, Err(EngineInitFailed::ForwardJump)));
}
