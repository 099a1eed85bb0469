use std::collections::BTreeMap;

use crate::error::ConfigError;
use crate::model::LogSearch;

use super::model::{ContextConfig, SearchContext};
use super::vars::{EnvLookup, VarResolver};

/// Resolve a context into a fully materialized search.
///
/// Inheritance list is the context's declared `search_inherit` followed by
/// `extra_inherits`, each merged in order; the context's own search merges
/// on top, then `override_search`. Variables resolve with precedence
/// runtime > env > definition default, and required misses fail here,
/// before any backend is touched.
///
/// Resolution is deterministic and pure given its inputs: the environment
/// is passed as a lookup function, inheritance order is declared order, and
/// map merges are key-wise.
pub fn resolve_context(
    config: &ContextConfig,
    context_id: &str,
    extra_inherits: &[String],
    override_search: Option<&LogSearch>,
    runtime_vars: &BTreeMap<String, String>,
    env: EnvLookup<'_>,
) -> Result<SearchContext, ConfigError> {
    resolve_context_inner(
        config,
        context_id,
        extra_inherits,
        override_search,
        runtime_vars,
        env,
        true,
    )
}

/// Same resolution, but missing required variables are tolerated: used to
/// inspect a context (and its variable schema) without supplying values.
pub fn resolve_context_lenient(
    config: &ContextConfig,
    context_id: &str,
    runtime_vars: &BTreeMap<String, String>,
    env: EnvLookup<'_>,
) -> Result<SearchContext, ConfigError> {
    resolve_context_inner(config, context_id, &[], None, runtime_vars, env, false)
}

#[allow(clippy::too_many_arguments)]
fn resolve_context_inner(
    config: &ContextConfig,
    context_id: &str,
    extra_inherits: &[String],
    override_search: Option<&LogSearch>,
    runtime_vars: &BTreeMap<String, String>,
    env: EnvLookup<'_>,
    enforce_required: bool,
) -> Result<SearchContext, ConfigError> {
    let context = config
        .contexts
        .get(context_id)
        .ok_or_else(|| ConfigError::ContextNotFound {
            id: context_id.to_string(),
        })?;

    if !config.clients.contains_key(&context.client) {
        return Err(ConfigError::UnknownClient {
            name: context.client.clone(),
        });
    }

    let mut search = LogSearch::default();
    for name in context.search_inherit.iter().chain(extra_inherits) {
        let template = config
            .searches
            .get(name)
            .ok_or_else(|| ConfigError::UnknownSearch { name: name.clone() })?;
        search.merge(template);
    }
    search.merge(&context.search);
    if let Some(over) = override_search {
        search.merge(over);
    }

    let resolver = VarResolver::new(runtime_vars, &search.variables, env);
    if enforce_required {
        resolver.check_required(&search.variables)?;
    }
    resolver.resolve_search(&mut search);

    Ok(SearchContext {
        client: context.client.clone(),
        search_inherit: context.search_inherit.clone(),
        description: context.description.clone(),
        search,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::vars::process_env;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn fixture() -> ContextConfig {
        serde_yaml::from_str(
            r#"
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
  sized:
    size: 25
contexts:
  child:
    client: c1
    searchInherit: [base]
    search:
      fields:
        service: login
"#,
        )
        .unwrap()
    }

    #[test]
    fn inheritance_and_default_substitution() {
        let config = fixture();
        let vars = BTreeMap::new();
        let ctx = resolve_context(&config, "child", &[], None, &vars, &no_env).unwrap();

        assert_eq!(ctx.search.fields["region"], "us-west-1");
        assert_eq!(ctx.search.fields["service"], "login");
        assert_eq!(
            ctx.search.options.get_str("cluster").as_deref(),
            Some("cluster-us-west-1")
        );
    }

    #[test]
    fn runtime_vars_override_default() {
        let config = fixture();
        let vars = BTreeMap::from([("region".to_string(), "eu-central-1".to_string())]);
        let ctx = resolve_context(&config, "child", &[], None, &vars, &no_env).unwrap();

        assert_eq!(ctx.search.fields["region"], "eu-central-1");
        assert_eq!(
            ctx.search.options.get_str("cluster").as_deref(),
            Some("cluster-eu-central-1")
        );
    }

    #[test]
    fn extra_inherits_apply_after_declared() {
        let config = fixture();
        let vars = BTreeMap::new();
        let ctx =
            resolve_context(&config, "child", &["sized".to_string()], None, &vars, &no_env)
                .unwrap();
        assert_eq!(ctx.search.size, Some(25));
    }

    #[test]
    fn override_search_wins_last() {
        let config = fixture();
        let vars = BTreeMap::new();
        let over = LogSearch {
            size: Some(1),
            ..Default::default()
        };
        let ctx = resolve_context(&config, "child", &[], Some(&over), &vars, &no_env).unwrap();
        assert_eq!(ctx.search.size, Some(1));
    }

    #[test]
    fn unknown_context_is_sentinel() {
        let config = fixture();
        let vars = BTreeMap::new();
        match resolve_context(&config, "nope", &[], None, &vars, &no_env) {
            Err(ConfigError::ContextNotFound { id }) => assert_eq!(id, "nope"),
            other => panic!("expected ContextNotFound, got {other:?}"),
        }
    }

    #[test]
    fn unknown_inherit_is_sentinel() {
        let config = fixture();
        let vars = BTreeMap::new();
        match resolve_context(&config, "child", &["ghost".to_string()], None, &vars, &no_env) {
            Err(ConfigError::UnknownSearch { name }) => assert_eq!(name, "ghost"),
            other => panic!("expected UnknownSearch, got {other:?}"),
        }
    }

    #[test]
    fn required_variable_missing_fails_before_dispatch() {
        let mut config = fixture();
        let ctx = config.contexts.get_mut("child").unwrap();
        ctx.search.variables.insert(
            "sessionId".to_string(),
            crate::model::VariableDefinition {
                required: true,
                ..Default::default()
            },
        );

        let vars = BTreeMap::new();
        match resolve_context(&config, "child", &[], None, &vars, &no_env) {
            Err(ConfigError::MissingRequiredVariable { name, .. }) => {
                assert_eq!(name, "sessionId")
            }
            other => panic!("expected MissingRequiredVariable, got {other:?}"),
        }
    }

    #[test]
    fn resolution_is_idempotent() {
        let config = fixture();
        let vars = BTreeMap::new();
        let once = resolve_context(&config, "child", &[], None, &vars, &no_env).unwrap();

        // re-resolve with the already-resolved search as the context body
        let mut as_config = config.clone();
        as_config.contexts.insert(
            "child".to_string(),
            SearchContext {
                search_inherit: Vec::new(),
                ..once.clone()
            },
        );
        let twice = resolve_context(&as_config, "child", &[], None, &vars, &no_env).unwrap();
        assert_eq!(twice.search, once.search);
    }

    #[test]
    fn process_env_fallback_reads_host() {
        // PATH exists everywhere this runs
        assert!(process_env("PATH").is_some());
    }
}
