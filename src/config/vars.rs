use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::ConfigError;
use crate::model::{LogSearch, VariableDefinition};

/// Compiled pattern matching `${VAR}`, `${VAR:-default}`, and bare `$VAR`.
static VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid regex")
});

/// Environment lookup, injectable so resolution stays pure in tests.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// The production environment lookup.
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Expands variable references in strings and option values.
///
/// Lookup precedence is strictly: runtime overrides, then environment, then
/// the per-definition default. A reference that misses all three stays
/// literally in the string (callers may detect it later). Replacement is a
/// single pass; values are never re-scanned.
pub struct VarResolver<'a> {
    runtime: &'a BTreeMap<String, String>,
    defaults: BTreeMap<String, String>,
    env: EnvLookup<'a>,
}

impl<'a> VarResolver<'a> {
    pub fn new(
        runtime: &'a BTreeMap<String, String>,
        definitions: &BTreeMap<String, VariableDefinition>,
        env: EnvLookup<'a>,
    ) -> Self {
        let defaults = definitions
            .iter()
            .filter_map(|(name, def)| def.default.clone().map(|d| (name.clone(), d)))
            .collect();
        VarResolver {
            runtime,
            defaults,
            env,
        }
    }

    /// Resolve a variable by name through the precedence chain.
    pub fn lookup(&self, name: &str) -> Option<String> {
        self.runtime
            .get(name)
            .cloned()
            .or_else(|| (self.env)(name))
            .or_else(|| self.defaults.get(name).cloned())
    }

    /// Substitute every reference in `input`, leaving misses untouched.
    pub fn resolve_str(&self, input: &str) -> String {
        if !input.contains('$') {
            return input.to_string();
        }

        let mut result = String::with_capacity(input.len());
        let mut last_end = 0;

        for caps in VAR_RE.captures_iter(input) {
            let m = caps.get(0).unwrap();
            result.push_str(&input[last_end..m.start()]);

            let name = caps
                .get(1)
                .or_else(|| caps.get(3))
                .map(|g| g.as_str())
                .unwrap_or_default();
            let inline_default = caps.get(2).map(|g| g.as_str());

            match self
                .lookup(name)
                .or_else(|| inline_default.map(str::to_string))
            {
                Some(value) => result.push_str(&value),
                None => result.push_str(m.as_str()),
            }

            last_end = m.end();
        }

        result.push_str(&input[last_end..]);
        result
    }

    /// Walk an option value: strings are substituted, maps and arrays are
    /// recursed into, other kinds pass through.
    pub fn resolve_value(&self, value: &mut Value) {
        match value {
            Value::String(s) => *s = self.resolve_str(s),
            Value::Object(map) => {
                for v in map.values_mut() {
                    self.resolve_value(v);
                }
            }
            Value::Array(items) => {
                for v in items.iter_mut() {
                    self.resolve_value(v);
                }
            }
            _ => {}
        }
    }

    /// Apply substitution across a merged search: field predicates, options,
    /// filter values, the native query, and the printer template.
    pub fn resolve_search(&self, search: &mut LogSearch) {
        for v in search.fields.values_mut() {
            *v = self.resolve_str(v);
        }
        for v in search.fields_condition.values_mut() {
            *v = self.resolve_str(v);
        }
        for v in search.options.0.values_mut() {
            self.resolve_value(v);
        }
        if let Some(filter) = &mut search.filter {
            filter.visit_values(&mut |v| *v = self.resolve_str(v));
        }
        if let Some(nq) = &mut search.native_query {
            *nq = self.resolve_str(nq);
        }
        if let Some(tpl) = &mut search.printer_options.template {
            *tpl = self.resolve_str(tpl);
        }
    }

    /// Fail on any declared required variable that resolves to nothing.
    /// Runs before dispatch so no backend is touched.
    pub fn check_required(
        &self,
        definitions: &BTreeMap<String, VariableDefinition>,
    ) -> Result<(), ConfigError> {
        for (name, def) in definitions {
            if def.required && self.lookup(name).is_none() {
                return Err(ConfigError::MissingRequiredVariable {
                    name: name.clone(),
                    description: def.description.clone(),
                });
            }
        }
        Ok(())
    }
}
