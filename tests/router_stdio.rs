use std::sync::Arc;

use rackctl::app::App;
use rackctl::config::ControlConfig;
use rackctl::engine::InMemoryEngine;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

async fn demo_router(dir: &tempfile::TempDir) -> rackctl::router::ToolRouter {
    let mut app = App::new(ControlConfig::defaults(dir.path()));
    app.bootstrap(Arc::new(InMemoryEngine::with_demo_rack()))
        .await
        .unwrap()
}

#[tokio::test]
async fn serves_one_envelope_per_request_line() {
    let dir = tempfile::tempdir().unwrap();
    let router = demo_router(&dir).await;

    let input = [
        r#"{"id": 1, "tool": "list_plugins"}"#,
        "",
        r#"{"id": 2, "tool": "get_parameter", "arguments": {"plugin_id": 1, "parameter_id": 0}}"#,
        r#"{"id": 3, "tool": "get_parameter", "arguments": {"plugin_id": 99, "parameter_id": 0}}"#,
        r#"{"id": 4, "tool": "no_such_tool"}"#,
        "not json",
    ]
    .join("\n");
    let mut output = Vec::new();
    let handled = router
        .serve(input.as_bytes(), &mut output, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(handled, 5);

    let responses: Vec<Value> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(responses.len(), 5);

    let by_id = |id: i64| {
        responses
            .iter()
            .find(|r| r["id"] == json!(id))
            .unwrap_or_else(|| panic!("no response for request {id}"))
    };
    assert_eq!(by_id(1)["success"], json!(true));
    assert_eq!(by_id(1)["plugins"].as_array().unwrap().len(), 3);
    assert_eq!(by_id(2)["name"], json!("Cutoff"));
    assert_eq!(by_id(3)["error_kind"], json!("not_found"));
    assert_eq!(by_id(4)["error_kind"], json!("invalid_argument"));

    let malformed = responses.iter().find(|r| r.get("id").is_none()).unwrap();
    assert_eq!(malformed["success"], json!(false));
    assert_eq!(malformed["error_kind"], json!("invalid_argument"));
}

#[tokio::test]
async fn invalid_arguments_are_rejected_before_engine_calls() {
    let dir = tempfile::tempdir().unwrap();
    let router = demo_router(&dir).await;

    let cases = [
        ("set_parameter", json!({"plugin_id": 0, "parameter_id": 0, "value": 99.0})),
        ("automate_parameter", json!({"plugin_id": 0, "parameter_id": 0, "automation_type": "square", "duration_ms": 100})),
        ("automate_parameter", json!({"plugin_id": 0, "parameter_id": 0, "automation_type": "linear", "duration_ms": 5})),
        ("randomize_parameters", json!({"plugin_id": 0, "amount": 1.5})),
        ("connect_plugins", json!({"source_id": 0, "destination_id": 1, "gain": -1.0})),
        ("detect_feedback", json!({"sensitivity": -0.1})),
        ("create_snapshot", json!({"name": "no session yet"})),
    ];
    for (tool, arguments) in cases {
        let response = router.handle(tool, arguments).await;
        assert_eq!(response["success"], json!(false), "{tool}: {response}");
        assert_eq!(response["error_kind"], json!("invalid_argument"), "{tool}: {response}");
    }
}

#[tokio::test]
async fn recording_and_morph_round_trip_through_router() {
    let dir = tempfile::tempdir().unwrap();
    let router = demo_router(&dir).await;

    let recording = router
        .handle(
            "start_recording",
            json!({"plugin_id": 2, "parameter_ids": [1, 2], "duration_ms": 40}),
        )
        .await;
    assert_eq!(recording["success"], json!(true), "{recording}");

    let morph = router
        .handle(
            "morph_parameters",
            json!({"plugin_id": 2, "targets": {"1": 0.9, "2": 0.1}, "duration_ms": 30}),
        )
        .await;
    assert_eq!(morph["success"], json!(true), "{morph}");

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    let done = router
        .handle("get_recording", json!({"recording_id": recording["id"]}))
        .await;
    assert_eq!(done["recording"]["status"], json!("complete"));
    assert!(done["event_count"].as_u64().unwrap() > 0);

    let morphed = router.handle("get_parameter", json!({"plugin_id": 2, "parameter_id": 1})).await;
    assert_eq!(morphed["current"], json!(0.9));
}
