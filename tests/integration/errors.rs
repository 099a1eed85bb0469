use crate::common::{TestConfig, ECHO_CONFIG};
use logviewer::handlers::QueryArgs;

#[tokio::test]
async fn missing_required_variable_has_stable_code() {
    let fixture = TestConfig::new(
        r#"
clients:
  c1: {type: local}
contexts:
  guarded:
    client: c1
    search:
      options: {cmd: "echo hi"}
      variables:
        sessionId:
          description: the session to inspect
          required: true
"#,
    );
    let engine = fixture.engine();

    let err = engine
        .query_logs("guarded", &QueryArgs::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, "MISSING_REQUIRED_VARIABLE");
    assert!(err.error.contains("sessionId"));
}

#[tokio::test]
async fn context_not_found_ranks_suggestions() {
    let fixture = TestConfig::new(
        r#"
clients:
  c1: {type: local}
contexts:
  main-latest: {client: c1, search: {options: {cmd: "echo hi"}}}
  staging-main-latest: {client: c1, search: {options: {cmd: "echo hi"}}}
  main-late: {client: c1, search: {options: {cmd: "echo hi"}}}
  dev: {client: c1, search: {options: {cmd: "echo hi"}}}
"#,
    );
    let engine = fixture.engine();

    let err = engine
        .query_logs("main-latet", &QueryArgs::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, "CONTEXT_NOT_FOUND");
    assert_eq!(err.invalid_context.as_deref(), Some("main-latet"));
    assert_eq!(
        err.suggestions.unwrap(),
        vec!["main-late", "main-latest", "staging-main-latest"]
    );
    assert_eq!(err.available_contexts.unwrap().len(), 4);
}

#[tokio::test]
async fn envelope_serializes_with_camel_case_keys() {
    let fixture = TestConfig::new(ECHO_CONFIG);
    let engine = fixture.engine();

    let err = engine
        .query_logs("nope", &QueryArgs::default())
        .await
        .unwrap_err();
    let json = serde_json::to_value(&err).unwrap();
    assert_eq!(json["code"], "CONTEXT_NOT_FOUND");
    assert!(json["invalidContext"].is_string());
    assert!(json["availableContexts"].is_array());
    assert!(json["suggestions"].is_array());
}

#[tokio::test]
async fn inverted_range_rejected_by_local_backend() {
    let fixture = TestConfig::new(ECHO_CONFIG);
    let engine = fixture.engine();

    let args = QueryArgs {
        start_time: Some("2024-05-02T00:00:00Z".to_string()),
        end_time: Some("2024-05-01T00:00:00Z".to_string()),
        ..Default::default()
    };
    let err = engine.query_logs("ctx1", &args).await.unwrap_err();
    assert_eq!(err.code, "INVALID_SEARCH");
}
