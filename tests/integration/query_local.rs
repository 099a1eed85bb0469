use crate::common::{TestConfig, ECHO_CONFIG};
use logviewer::handlers::QueryArgs;

#[tokio::test]
async fn list_and_query_one_echo_context() {
    let fixture = TestConfig::new(ECHO_CONFIG);
    let engine = fixture.engine();

    assert_eq!(engine.list_contexts().await, vec!["ctx1"]);

    let args = QueryArgs {
        size: Some(1),
        ..Default::default()
    };
    let response = engine.query_logs("ctx1", &args).await.unwrap();
    assert_eq!(response.meta.result_count, 1);
    assert_eq!(response.entries[0].message, "hi");
    assert_eq!(response.meta.context_id, "ctx1");
}

#[tokio::test]
async fn size_bounds_the_batch() {
    let fixture = TestConfig::new(
        r#"
clients:
  c1: {type: local}
contexts:
  many:
    client: c1
    search:
      options: {cmd: "seq 1 50"}
"#,
    );
    let engine = fixture.engine();

    let args = QueryArgs {
        size: Some(7),
        ..Default::default()
    };
    let response = engine.query_logs("many", &args).await.unwrap();
    assert_eq!(response.entries.len(), 7);
}

#[tokio::test]
async fn field_values_collects_distinct_levels() {
    let fixture = TestConfig::new(
        r#"
clients:
  c1: {type: local}
contexts:
  mixed:
    client: c1
    search:
      options: {cmd: "printf 'ERROR a\nINFO b\nERROR c\n'"}
"#,
    );
    let engine = fixture.engine();

    let values = engine
        .get_field_values("mixed", &["level".to_string()], &QueryArgs::default())
        .await
        .unwrap();
    assert_eq!(values["level"], vec!["ERROR", "INFO"]);
}

#[tokio::test]
async fn cmd_template_sees_search_shape() {
    let fixture = TestConfig::new(
        r#"
clients:
  c1: {type: local}
contexts:
  templated:
    client: c1
    search:
      options: {cmd: "echo size={{ size }} last={{ range.last }}"}
"#,
    );
    let engine = fixture.engine();

    let args = QueryArgs {
        size: Some(3),
        last: Some("30m".to_string()),
        ..Default::default()
    };
    let response = engine.query_logs("templated", &args).await.unwrap();
    assert_eq!(response.entries[0].message, "size=3 last=30m");
}
