use std::collections::BTreeMap;

use crate::common::TestConfig;

const CONFIG: &str = r#"
clients:
  c1: {type: local}
searches:
  base:
    fields:
      region: "${region}"
    options:
      cluster: "cluster-${region}"
    variables:
      region:
        description: target region
        default: us-west-1
contexts:
  child:
    client: c1
    searchInherit: [base]
    search:
      options: {cmd: "echo hi"}
      fields:
        service: login
"#;

#[tokio::test]
async fn inheritance_with_default_variable() {
    let fixture = TestConfig::new(CONFIG);
    let engine = fixture.engine();

    let details = engine
        .get_context_details("child", &BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(details.search.fields["region"], "us-west-1");
    assert_eq!(details.search.fields["service"], "login");
    assert_eq!(
        details.search.options.get_str("cluster").as_deref(),
        Some("cluster-us-west-1")
    );
}

#[tokio::test]
async fn runtime_variable_overrides_default() {
    let fixture = TestConfig::new(CONFIG);
    let engine = fixture.engine();

    let variables = BTreeMap::from([("region".to_string(), "eu-central-1".to_string())]);
    let details = engine.get_context_details("child", &variables).await.unwrap();
    assert_eq!(details.search.fields["region"], "eu-central-1");
    assert_eq!(
        details.search.options.get_str("cluster").as_deref(),
        Some("cluster-eu-central-1")
    );
}

#[tokio::test]
async fn no_partial_substitution_remains() {
    let fixture = TestConfig::new(CONFIG);
    let engine = fixture.engine();

    let details = engine
        .get_context_details("child", &BTreeMap::new())
        .await
        .unwrap();
    for value in details.search.fields.values() {
        assert!(!value.contains("${"), "unresolved marker in {value}");
    }
    for key in details.search.options.0.keys() {
        if let Some(value) = details.search.options.get_str(key) {
            assert!(!value.contains("${"), "unresolved marker in {value}");
        }
    }
}
