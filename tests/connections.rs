// Connection behaviour: dict round-trips, filter settings, write-index
// ordering tags and resource conversions.

mod common;

use common::MemoryDbServer;
use graphloom::connection::{Connection, ConnectionOptions, FilterSettings};
use graphloom::event::{event_channel, ItemLogger};
use graphloom::filter_config::{FilterConfig, SCENARIO_FILTER_TYPE};
use graphloom::jump::{Jump, JumpCondition};
use graphloom::resource::{database_resource, file_resource, CmdLineArg};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

fn test_logger(name: &str) -> ItemLogger {
    let (tx, _rx) = event_channel();
    ItemLogger::new(tx, name, None, Arc::new(Mutex::new(HashMap::new())), false)
}

#[test]
fn connection_round_trips_through_dict() {
    let dict = json!({
        "from": ["source", "bottom"],
        "to": ["destination", "top"],
        "options": { "use_memory_db": true, "write_index": 3 },
        "filter_settings": {
            "known_filters": { "db": { "scenario_filter": { "S1": false } } },
            "auto_online": false,
        },
    });
    let connection = Connection::from_dict(&dict).unwrap();
    assert_eq!(connection.source, "source");
    assert_eq!(connection.source_position, "bottom");
    assert_eq!(connection.destination, "destination");
    assert_eq!(connection.destination_position, "top");
    assert!(connection.options.use_memory_db);
    assert_eq!(connection.options.write_index, 3);
    assert!(!connection.filter_settings.auto_online);
    let restored = Connection::from_dict(&connection.to_dict()).unwrap();
    assert_eq!(restored, connection);
}

#[test]
fn unsupported_filter_types_are_dropped() {
    let dict = json!({
        "from": ["source", "right"],
        "to": ["destination", "left"],
        "filter_settings": {
            "known_filters": {
                "db": {
                    "scenario_filter": { "S1": true },
                    "tool_filter": { "T1": true },
                },
            },
        },
    });
    let connection = Connection::from_dict(&dict).unwrap();
    let filters = &connection.filter_settings.known_filters["db"];
    assert!(filters.contains_key(SCENARIO_FILTER_TYPE));
    assert!(!filters.contains_key("tool_filter"));
}

#[test]
fn jump_round_trips_through_dict() {
    let dict = json!({
        "from": ["loop_end", "bottom"],
        "to": ["loop_start", "bottom"],
        "condition": { "type": "python-script", "script": "exit(0)" },
        "cmd_line_args": ["--mode", {"type": "resource", "arg": "db_label"}],
    });
    let jump = Jump::from_dict(&dict).unwrap();
    assert_eq!(jump.source, "loop_end");
    assert_eq!(jump.destination, "loop_start");
    assert_eq!(
        jump.cmd_line_args,
        vec![
            CmdLineArg::Literal("--mode".to_string()),
            CmdLineArg::Resource("db_label".to_string()),
        ]
    );
    match &jump.condition {
        JumpCondition::PythonScript { script, .. } => assert_eq!(script, "exit(0)"),
        other => panic!("unexpected condition {other:?}"),
    }
    let restored = Jump::from_dict(&jump.to_dict()).unwrap();
    assert_eq!(restored, jump);
}

#[test]
fn required_filters_gate_readiness() {
    let mut filter_settings = FilterSettings::default();
    filter_settings.known_filters.insert(
        "db".to_string(),
        HashMap::from([(
            SCENARIO_FILTER_TYPE.to_string(),
            HashMap::from([("S1".to_string(), false)]),
        )]),
    );
    let options = ConnectionOptions {
        require_scenario_filter: true,
        ..Default::default()
    };
    let offline = Connection::new("a", "right", "b", "left", options.clone(), filter_settings);
    assert!(!offline.ready_to_execute());
    assert!(!offline.notifications().is_empty());

    let mut online_settings = FilterSettings::default();
    online_settings.known_filters.insert(
        "db".to_string(),
        HashMap::from([(
            SCENARIO_FILTER_TYPE.to_string(),
            HashMap::from([("S1".to_string(), true)]),
        )]),
    );
    let online = Connection::new("a", "right", "b", "left", options, online_settings);
    assert!(online.ready_to_execute());
}

#[test]
fn write_index_tags_precursors_on_database_resources() {
    let options = ConnectionOptions {
        write_index: 2,
        ..Default::default()
    };
    let connection = Connection::new(
        "a",
        "right",
        "c",
        "left",
        options,
        FilterSettings::default(),
    );
    let resources = vec![database_resource("c", "mysql://host/db", None, false, None)];
    let siblings = vec![("from b to c".to_string(), 1)];
    let converted = connection.convert_backward_resources(&resources, &siblings);
    assert_eq!(converted.len(), 1);
    let metadata = &converted[0].metadata;
    assert_eq!(metadata.current.as_deref(), Some("from a to c"));
    assert!(metadata.precursors.contains("from b to c"));
    assert!(metadata.part_count.is_some());

    // Swapping the indices swaps the ordering: the earlier writer has no
    // precursors.
    let early = Connection::new(
        "a",
        "right",
        "c",
        "left",
        ConnectionOptions::default(),
        FilterSettings::default(),
    );
    let siblings = vec![("from b to c".to_string(), 2)];
    let converted = early.convert_backward_resources(&resources, &siblings);
    assert!(converted[0].metadata.precursors.is_empty());
}

#[test]
fn memory_db_flag_marks_forward_databases() {
    let options = ConnectionOptions {
        use_memory_db: true,
        ..Default::default()
    };
    let connection = Connection::new(
        "a",
        "right",
        "b",
        "left",
        options,
        FilterSettings::default(),
    );
    let resources = vec![
        database_resource("a", "mysql://host/db", None, false, None),
        file_resource("a", "/data/a.out", None),
    ];
    let converted = connection.convert_forward_resources(&resources).unwrap();
    assert!(converted[0].metadata.memory);
    assert!(!converted[1].metadata.memory);
}

#[test]
fn enabled_filters_intersect_database_and_settings() {
    let mut filter_settings = FilterSettings::default();
    filter_settings.known_filters.insert(
        "a_db".to_string(),
        HashMap::from([(
            SCENARIO_FILTER_TYPE.to_string(),
            HashMap::from([("S1".to_string(), false)]),
        )]),
    );
    let mut connection = Connection::new(
        "a",
        "right",
        "b",
        "left",
        ConnectionOptions::default(),
        filter_settings,
    );
    let db = Arc::new(MemoryDbServer::new());
    db.add_scenarios("mysql://host/db", &["S2", "S1", "S3"]);
    connection.prepare(test_logger("from a to b"), db);
    connection.receive_resources_from_source(&[database_resource(
        "a",
        "mysql://host/db",
        Some("a_db"),
        true,
        None,
    )]);
    let config_lists = connection.enabled_filter_configs("a_db").unwrap();
    assert_eq!(config_lists.len(), 1);
    assert_eq!(
        config_lists[0],
        vec![FilterConfig::scenario("S2"), FilterConfig::scenario("S3")]
    );
    assert!(connection.enabled_filter_configs("unknown").is_none());
}

#[test]
fn purge_before_writing_purges_database_destinations() {
    let options = ConnectionOptions {
        purge_before_writing: true,
        purge_settings: Some(HashMap::from([("scenario".to_string(), true)])),
        ..Default::default()
    };
    let mut connection = Connection::new(
        "a",
        "right",
        "b",
        "left",
        options,
        FilterSettings::default(),
    );
    let db = Arc::new(MemoryDbServer::new());
    connection.prepare(test_logger("from a to b"), db.clone());
    let resources = vec![
        database_resource("b", "mysql://host/db", None, false, None),
        file_resource("b", "/data/b.out", None),
    ];
    connection.clean_up_backward_resources(&resources).unwrap();
    assert_eq!(*db.purged.lock().unwrap(), vec!["mysql://host/db"]);
}
