use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rackctl::app::App;
use rackctl::bridge::{BatchBridge, BlockingBridge, BlockingOperation};
use rackctl::config::ControlConfig;
use rackctl::engine::{AudioEngine, InMemoryEngine, PluginId, SimParameter};
use rackctl::error::ControlError;
use rackctl::router::ToolRouter;
use serde_json::{Value, json};
use tempfile::TempDir;

struct Rack {
    engine: Arc<InMemoryEngine>,
    app: App,
    router: ToolRouter,
    dir: TempDir,
    plugins: Vec<PluginId>,
}

async fn rack() -> Rack {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(InMemoryEngine::new());
    let plugins = ["A", "B", "C"]
        .iter()
        .map(|name| {
            engine.add_plugin(
                name,
                vec![
                    SimParameter::new("Level", 0.0, 1.0, 0.0),
                    SimParameter::new("Tone", 0.0, 1.0, 0.0),
                ],
            )
        })
        .collect();

    let mut config = ControlConfig::defaults(dir.path());
    config.call_timeout = Duration::from_secs(2);
    config.batch_timeout = Duration::from_secs(2);
    config.batch_size = 2;
    let mut app = App::new(config);
    let router = app.bootstrap(engine.clone()).await.unwrap();
    Rack {
        engine,
        app,
        router,
        dir,
        plugins,
    }
}

fn ok(response: Value) -> Value {
    assert_eq!(response["success"], json!(true), "{response}");
    response
}

#[tokio::test]
async fn batch_output_matches_input_under_failures_and_timeouts() {
    let batch = BatchBridge::new(3, Duration::from_millis(100), 4);
    let ops: Vec<BlockingOperation<usize>> = (0..8)
        .map(|i| {
            BlockingOperation::new(format!("op {i}"), move || match i {
                2 => anyhow::bail!("op {i} refused"),
                // stalls the second batch past its timeout
                4 => {
                    std::thread::sleep(Duration::from_millis(400));
                    Ok(i)
                }
                _ => Ok(i),
            })
        })
        .collect();

    let outcome = batch.run_batch("mixed", ops).await;
    assert_eq!(outcome.results.len(), 8);
    assert_eq!(outcome.results[0], Some(0));
    assert_eq!(outcome.results[1], Some(1));
    assert_eq!(outcome.results[2], None);
    assert_eq!(outcome.results[3], Some(3));
    assert_eq!(outcome.results[4], None);
    assert_eq!(outcome.results[5], None);
    assert_eq!(outcome.results[6], Some(6));
    assert_eq!(outcome.results[7], Some(7));
    assert!(!outcome.is_complete());
}

#[tokio::test]
async fn timed_out_call_does_not_block_other_calls() {
    let bridge = BlockingBridge::new(Duration::from_secs(2), 4);
    let finished = Arc::new(AtomicUsize::new(0));
    let slow_done = finished.clone();

    let slow = bridge.run(
        BlockingOperation::new("stuck engine call", move || {
            std::thread::sleep(Duration::from_millis(300));
            slow_done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .with_timeout(Duration::from_millis(50)),
    );
    let fast = bridge.run(BlockingOperation::new("quick call", || Ok(42)));
    let (slow, fast) = tokio::join!(slow, fast);

    assert!(matches!(slow, Err(ControlError::Timeout { .. })));
    assert_eq!(fast.unwrap(), 42);

    let later = bridge
        .run(BlockingOperation::new("after timeout", || Ok("ready")))
        .await;
    assert_eq!(later.unwrap(), "ready");

    // the abandoned call still runs to completion on its worker
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn linear_automation_writes_each_step_in_order() {
    let rack = rack().await;
    let plugin = rack.plugins[0];
    let started = ok(rack
        .router
        .handle(
            "automate_parameter",
            json!({
                "plugin_id": plugin,
                "parameter_id": 0,
                "automation_type": "linear",
                "duration_ms": 100,
                "values": [0.0, 1.0],
            }),
        )
        .await);
    assert_eq!(started["steps"], json!(10));

    let id = started["automation_id"].clone();
    let automation = rackctl_wait(&rack, &id).await;
    assert_eq!(automation["state"], json!("completed"));

    let expected: Vec<f64> = (0..10).map(|i| i as f64 / 10.0).collect();
    assert_eq!(rack.engine.set_history(plugin, 0), expected);
}

async fn rackctl_wait(rack: &Rack, id: &Value) -> Value {
    for _ in 0..200 {
        let current = ok(rack
            .router
            .handle("get_automation", json!({ "automation_id": id }))
            .await);
        if current["state"] != json!("running") && current["state"] != json!("created") {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("automation {id} never finished");
}

#[tokio::test]
async fn stop_halts_further_parameter_writes() {
    let rack = rack().await;
    let plugin = rack.plugins[1];
    let started = ok(rack
        .router
        .handle(
            "automate_parameter",
            json!({
                "plugin_id": plugin,
                "parameter_id": 1,
                "automation_type": "sine",
                "duration_ms": 5000,
            }),
        )
        .await);

    while rack.engine.set_history(plugin, 1).len() < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let stopped = ok(rack
        .router
        .handle("stop_automation", json!({ "automation_id": started["automation_id"] }))
        .await);
    assert_eq!(stopped["state"], json!("cancelled"));

    let writes = rack.engine.set_history(plugin, 1).len();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(rack.engine.set_history(plugin, 1).len(), writes);
    assert_eq!(stopped["steps_applied"], json!(writes));
}

#[tokio::test]
async fn routing_cycles_are_reported_only_for_rings() {
    let rack = rack().await;
    let [a, b, c] = [rack.plugins[0], rack.plugins[1], rack.plugins[2]];
    for (src, dst) in [(a, b), (b, c)] {
        ok(rack
            .router
            .handle("connect_plugins", json!({ "source_id": src, "destination_id": dst }))
            .await);
    }
    let chain = ok(rack.router.handle("get_routing_matrix", Value::Null).await);
    assert_eq!(chain["has_cycles"], json!(false));
    assert_eq!(chain["cycle_members"], json!([]));

    let closing = ok(rack
        .router
        .handle("connect_plugins", json!({ "source_id": c, "destination_id": a }))
        .await);
    assert_eq!(closing["cycle_members"], json!([a, b, c]));

    let matrix = ok(rack.router.handle("get_routing_matrix", Value::Null).await);
    assert_eq!(matrix["cycle_members"], json!([a, b, c]));
    assert_eq!(matrix["back_edges"], json!([format!("{c} -> {a}")]));

    let duplicate = rack
        .router
        .handle("connect_plugins", json!({ "source_id": c, "destination_id": a }))
        .await;
    assert_eq!(duplicate["error_kind"], json!("invalid_argument"));
}

#[tokio::test]
async fn snapshot_restores_captured_parameters() {
    let rack = rack().await;
    let plugin = rack.plugins[0];
    let project = rack.dir.path().join("set.project");
    ok(rack
        .router
        .handle("save_session", json!({ "path": project }))
        .await);

    for (param, value) in [(0, 0.3), (1, 0.7)] {
        ok(rack
            .router
            .handle(
                "set_parameter",
                json!({ "plugin_id": plugin, "parameter_id": param, "value": value }),
            )
            .await);
    }
    let captured = ok(rack
        .router
        .handle("create_snapshot", json!({ "name": "verse" }))
        .await);
    let snapshot_id = captured["snapshot"]["id"].clone();

    for param in [0, 1] {
        rack.engine.set_parameter(plugin, param, 0.0).unwrap();
    }
    let report = ok(rack
        .router
        .handle("restore_snapshot", json!({ "snapshot_id": snapshot_id }))
        .await);
    assert_eq!(report["warnings"], json!([]));
    assert_eq!(rack.engine.get_parameter(plugin, 0).unwrap(), 0.3);
    assert_eq!(rack.engine.get_parameter(plugin, 1).unwrap(), 0.7);
}

#[tokio::test]
async fn deleted_snapshot_is_gone_from_disk_and_table() {
    let rack = rack().await;
    ok(rack
        .router
        .handle(
            "save_session",
            json!({ "path": rack.dir.path().join("set.project") }),
        )
        .await);
    let captured = ok(rack
        .router
        .handle("create_snapshot", json!({ "name": "chorus" }))
        .await);
    let snapshot_id = captured["snapshot"]["id"].clone();
    let snapshot_dir = rack
        .app
        .config()
        .snapshot_dir
        .join(snapshot_id.as_str().unwrap());
    assert!(snapshot_dir.join("metadata.json").exists());

    ok(rack
        .router
        .handle("delete_snapshot", json!({ "snapshot_id": snapshot_id }))
        .await);
    assert!(!snapshot_dir.exists());

    let restore = rack
        .router
        .handle("restore_snapshot", json!({ "snapshot_id": snapshot_id }))
        .await;
    assert_eq!(restore["success"], json!(false));
    assert_eq!(restore["error_kind"], json!("not_found"));
}

#[tokio::test]
async fn shutdown_stops_running_processes() {
    let rack = rack().await;
    let started = ok(rack
        .router
        .handle(
            "automate_parameter",
            json!({
                "plugin_id": rack.plugins[2],
                "parameter_id": 0,
                "automation_type": "random_walk",
                "duration_ms": 10_000,
            }),
        )
        .await);
    rack.app.shutdown().await;

    let state = ok(rack
        .router
        .handle("get_automation", json!({ "automation_id": started["automation_id"] }))
        .await);
    assert_eq!(state["state"], json!("cancelled"));
}

#[tokio::test]
async fn plugin_control_reaches_engine_and_info() {
    let rack = rack().await;
    let plugin = rack.plugins[1];

    let changed = ok(rack
        .router
        .handle(
            "control_plugin",
            json!({ "plugin_id": plugin, "active": false, "volume": 0.5 }),
        )
        .await);
    assert_eq!(changed["runtime"]["active"], json!(false));
    assert_eq!(changed["runtime"]["volume"], json!(0.5));
    assert!(!rack.engine.get_runtime_state(plugin).unwrap().active);

    let info = ok(rack
        .router
        .handle("get_plugin_info", json!({ "plugin_id": plugin }))
        .await);
    assert_eq!(info["info"]["name"], json!("B"));
    assert_eq!(info["parameter_count"], json!(2));
    assert_eq!(info["runtime"]["drywet"], json!(1.0));

    let rejected = rack
        .router
        .handle("control_plugin", json!({ "plugin_id": plugin, "drywet": 1.5 }))
        .await;
    assert_eq!(rejected["error_kind"], json!("invalid_argument"));
    let missing = rack
        .router
        .handle("get_plugin_info", json!({ "plugin_id": 99 }))
        .await;
    assert_eq!(missing["error_kind"], json!("not_found"));
    assert_eq!(rack.engine.get_runtime_state(plugin).unwrap().volume, 0.5);
}
