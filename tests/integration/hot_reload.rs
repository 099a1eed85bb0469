use std::time::Duration;

use crate::common::TestConfig;
use logviewer::handlers::QueryArgs;

const CONFIG_A: &str = r#"
clients:
  c1: {type: local}
contexts:
  ctx:
    client: c1
    search:
      options: {cmd: "sleep 1; echo done"}
"#;

const CONFIG_B: &str = r#"
clients:
  c1: {type: local}
contexts:
  replacement:
    client: c1
    search:
      options: {cmd: "echo other"}
"#;

/// An in-flight request keeps the snapshot it started with; the swap only
/// affects requests that start after it.
#[tokio::test]
async fn in_flight_request_survives_reload() {
    let fixture = TestConfig::new(CONFIG_A);
    let engine = fixture.engine();
    engine.clone().start_watcher().await.unwrap();

    // a slow query against config A
    let in_flight = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .query_logs("ctx", &QueryArgs { size: Some(1), ..Default::default() })
                .await
        })
    };
    // let it take its snapshot and start the backend call
    tokio::time::sleep(Duration::from_millis(200)).await;

    // rewrite the config, removing ctx, and wait past the debounce window
    fixture.rewrite(CONFIG_B);
    tokio::time::sleep(Duration::from_millis(800)).await;

    // the in-flight request completes against the old snapshot
    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(response.entries[0].message, "done");

    // a new request sees the swapped config
    let err = engine
        .query_logs("ctx", &QueryArgs::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, "CONTEXT_NOT_FOUND");
    assert!(engine
        .list_contexts()
        .await
        .contains(&"replacement".to_string()));
}

#[tokio::test]
async fn reload_config_handler_swaps_on_demand() {
    let fixture = TestConfig::new(CONFIG_A);
    let engine = fixture.engine();

    fixture.rewrite(CONFIG_B);
    engine.reload_config().await.unwrap();
    assert_eq!(engine.list_contexts().await, vec!["replacement"]);
}
