// End-to-end engine runs over scripted items: chains, forks, merges, filter
// fan-out, loops and user stops.

mod common;

use common::*;
use graphloom::core::EngineState;
use graphloom::event::EventKind;
use graphloom::resource::{database_resource, file_resource, url_resource};
use std::time::Duration;

#[test]
fn linear_chain_executes_every_item_once() {
    let request = build_request(
        &["a", "b", "c"],
        vec![connection_dict("a", "b"), connection_dict("b", "c")],
        vec![],
    );
    let harness = harness(request, |factory, _db| {
        factory.script(
            "a",
            ItemScript {
                forward_outputs: vec![file_resource("a", "/data/a.out", None)],
                ..Default::default()
            },
        );
        factory.script(
            "b",
            ItemScript {
                forward_outputs: vec![file_resource("b", "/data/b.out", None)],
                backward_outputs: vec![url_resource("b", "https://example.com/b", "b_url", None)],
                ..Default::default()
            },
        );
        factory.script(
            "c",
            ItemScript {
                backward_outputs: vec![url_resource("c", "https://example.com/c", "c_url", None)],
                ..Default::default()
            },
        );
    })
    .unwrap();

    let events = collect_events(&harness.engine);

    let (kind, payload) = events.last().unwrap();
    assert_eq!(*kind, EventKind::DagExecFinished);
    assert_eq!(payload, "COMPLETED");
    assert_eq!(harness.engine.state(), EngineState::Completed);
    for item in ["a", "b", "c"] {
        for direction in ["FORWARD", "BACKWARD"] {
            assert_eq!(
                count_events(&events, EventKind::ExecStarted, item, direction),
                1,
                "exec_started for {item} {direction}"
            );
            assert_eq!(
                count_events(&events, EventKind::ExecFinished, item, direction),
                1,
                "exec_finished for {item} {direction}"
            );
        }
    }
    let a_runs = harness.recorder.executions_of("a");
    assert_eq!(a_runs.len(), 1);
    assert!(a_runs[0].forward.is_empty());
    assert_eq!(a_runs[0].backward.len(), 1);
    assert_eq!(a_runs[0].backward[0].provider_name, "b");
    let b_runs = harness.recorder.executions_of("b");
    assert_eq!(b_runs.len(), 1);
    assert_eq!(b_runs[0].forward.len(), 1);
    assert_eq!(b_runs[0].forward[0].provider_name, "a");
    assert_eq!(b_runs[0].backward.len(), 1);
    assert_eq!(b_runs[0].backward[0].provider_name, "c");
}

#[test]
fn fork_advertises_one_backward_resource_per_successor() {
    let request = build_request(
        &["a", "b", "c"],
        vec![connection_dict("a", "b"), connection_dict("a", "c")],
        vec![],
    );
    let harness = harness(request, |factory, _db| {
        factory.script(
            "a",
            ItemScript {
                forward_outputs: vec![file_resource("a", "/data/a.out", None)],
                ..Default::default()
            },
        );
        factory.script(
            "b",
            ItemScript {
                backward_outputs: vec![url_resource("b", "https://example.com/b", "b_url", None)],
                ..Default::default()
            },
        );
        factory.script(
            "c",
            ItemScript {
                backward_outputs: vec![url_resource("c", "https://example.com/c", "c_url", None)],
                ..Default::default()
            },
        );
    })
    .unwrap();

    let events = collect_events(&harness.engine);

    assert_eq!(events.last().unwrap().1, "COMPLETED");
    let a_runs = harness.recorder.executions_of("a");
    assert_eq!(a_runs.len(), 1);
    assert_eq!(a_runs[0].backward.len(), 2);
    for item in ["b", "c"] {
        let runs = harness.recorder.executions_of(item);
        assert_eq!(runs.len(), 1, "{item} should run once");
        assert_eq!(runs[0].forward.len(), 1);
        assert_eq!(runs[0].forward[0].provider_name, "a");
    }
}

#[test]
fn merge_delivers_both_forward_resources_in_one_call() {
    let request = build_request(
        &["a", "b", "c"],
        vec![connection_dict("a", "c"), connection_dict("b", "c")],
        vec![],
    );
    let harness = harness(request, |factory, _db| {
        factory.script(
            "a",
            ItemScript {
                forward_outputs: vec![file_resource("a", "/data/a.out", None)],
                ..Default::default()
            },
        );
        factory.script(
            "b",
            ItemScript {
                forward_outputs: vec![file_resource("b", "/data/b.out", None)],
                ..Default::default()
            },
        );
        factory.script("c", ItemScript::default());
    })
    .unwrap();

    let events = collect_events(&harness.engine);

    assert_eq!(events.last().unwrap().1, "COMPLETED");
    let c_runs = harness.recorder.executions_of("c");
    assert_eq!(c_runs.len(), 1);
    let mut providers: Vec<&str> = c_runs[0]
        .forward
        .iter()
        .map(|r| r.provider_name.as_str())
        .collect();
    providers.sort_unstable();
    assert_eq!(providers, ["a", "b"]);
}

#[test]
fn scenario_filters_fan_out_downstream_executions() {
    let request = build_request(
        &["a", "b", "c"],
        vec![connection_dict("a", "b"), connection_dict("b", "c")],
        vec![],
    );
    let harness = harness(request, |factory, db| {
        db.add_scenarios("mysql://host/db", &["S1", "S2"]);
        factory.script(
            "a",
            ItemScript {
                forward_outputs: vec![database_resource(
                    "a",
                    "mysql://host/db",
                    Some("a_db"),
                    true,
                    None,
                )],
                ..Default::default()
            },
        );
        factory.script(
            "b",
            ItemScript {
                forward_outputs: vec![file_resource("b", "/data/b.out", None)],
                ..Default::default()
            },
        );
        factory.script("c", ItemScript::default());
    })
    .unwrap();

    let events = collect_events(&harness.engine);

    assert_eq!(events.last().unwrap().1, "COMPLETED");
    let b_runs = harness.recorder.executions_of("b");
    assert_eq!(b_runs.len(), 2, "one b execution per scenario");
    let mut b_filter_ids: Vec<&str> = b_runs.iter().map(|e| e.filter_id.as_str()).collect();
    b_filter_ids.sort_unstable();
    assert_eq!(b_filter_ids, ["S1 - a", "S2 - a"]);
    for run in &b_runs {
        assert_eq!(run.forward.len(), 1);
        let resource = &run.forward[0];
        assert_eq!(resource.metadata.filter_stack.len(), 1);
        assert!(
            resource.url().unwrap().contains("filter="),
            "filter config should be appended to the URL"
        );
    }
    let c_runs = harness.recorder.executions_of("c");
    assert_eq!(c_runs.len(), 2, "fan-out passes through b");
    let mut c_filter_ids: Vec<&str> = c_runs.iter().map(|e| e.filter_id.as_str()).collect();
    c_filter_ids.sort_unstable();
    assert_eq!(c_filter_ids, ["S1 - a", "S2 - a"]);
}

#[test]
fn self_loop_runs_body_once_per_condition_pass() {
    let request = build_request(&["a"], vec![], vec![jump_dict("a", "a", 2)]);
    let harness = harness(request, |factory, _db| {
        factory.script("a", ItemScript::default());
    })
    .unwrap();

    let events = collect_events(&harness.engine);

    assert_eq!(events.last().unwrap().1, "COMPLETED");
    assert_eq!(harness.recorder.execution_count("a"), 2);
    assert_eq!(
        harness
            .recorder
            .updates
            .lock()
            .unwrap()
            .iter()
            .filter(|name| *name == "a")
            .count(),
        1,
        "update hook runs once per positive condition"
    );
    let flashes = events
        .iter()
        .filter(|(kind, payload)| {
            *kind == EventKind::Flash && payload["item_name"] == "from a to a"
        })
        .count();
    assert_eq!(flashes, 1);
}

#[test]
fn nested_loops_multiply_inner_iterations() {
    let request = build_request(
        &["a", "b", "c"],
        vec![connection_dict("a", "b"), connection_dict("b", "c")],
        vec![jump_dict("c", "a", 2), jump_dict("b", "b", 2)],
    );
    let harness = harness(request, |factory, _db| {
        factory.script(
            "a",
            ItemScript {
                forward_outputs: vec![file_resource("a", "/data/a.out", None)],
                ..Default::default()
            },
        );
        factory.script(
            "b",
            ItemScript {
                forward_outputs: vec![file_resource("b", "/data/b.out", None)],
                ..Default::default()
            },
        );
        factory.script("c", ItemScript::default());
    })
    .unwrap();

    let events = collect_events(&harness.engine);

    assert_eq!(events.last().unwrap().1, "COMPLETED");
    assert_eq!(harness.recorder.execution_count("a"), 2, "outer body");
    assert_eq!(harness.recorder.execution_count("c"), 2, "outer body");
    assert_eq!(
        harness.recorder.execution_count("b"),
        4,
        "two inner iterations per outer pass"
    );
}

#[test]
fn stop_ends_the_run_with_user_stopped() {
    let request = build_request(&["a", "b"], vec![connection_dict("a", "b")], vec![]);
    let harness = harness(request, |factory, _db| {
        factory.script(
            "a",
            ItemScript {
                execute_delay: Some(Duration::from_millis(500)),
                ..Default::default()
            },
        );
        factory.script("b", ItemScript::default());
    })
    .unwrap();

    let mut events = Vec::new();
    while let Some(event) = harness.engine.get_event() {
        let is_a_start = event.0 == EventKind::ExecStarted
            && event.1["item_name"] == "a"
            && event.1["direction"] == "FORWARD";
        events.push(event);
        if is_a_start {
            // Give the filtered execution a moment to register as running.
            std::thread::sleep(Duration::from_millis(150));
            harness.engine.stop();
        }
    }

    let (kind, payload) = events.last().unwrap();
    assert_eq!(*kind, EventKind::DagExecFinished);
    assert_eq!(payload, "USER_STOPPED");
    assert_eq!(harness.engine.state(), EngineState::UserStopped);
    assert_eq!(
        count_events(&events, EventKind::ExecStarted, "b", "FORWARD"),
        0,
        "no events from items that never started"
    );
    assert!(harness
        .recorder
        .stopped
        .lock()
        .unwrap()
        .contains(&"a".to_string()));
}

#[test]
fn failing_item_fails_the_run_but_completes_the_stream() {
    let request = build_request(&["a", "b"], vec![connection_dict("a", "b")], vec![]);
    let harness = harness(request, |factory, _db| {
        factory.script(
            "a",
            ItemScript {
                execute_result: Some(graphloom::core::FinishState::Failure),
                ..Default::default()
            },
        );
        factory.script("b", ItemScript::default());
    })
    .unwrap();

    let events = collect_events(&harness.engine);

    let (kind, payload) = events.last().unwrap();
    assert_eq!(*kind, EventKind::DagExecFinished);
    assert_eq!(payload, "FAILED");
    assert_eq!(harness.engine.state(), EngineState::Failed);
    // The failed forward solid reports FAILURE; b's forward solid never runs.
    assert_eq!(harness.recorder.execution_count("b"), 0);
}
