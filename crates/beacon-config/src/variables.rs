//! `((var))` interpolation for resource sources.
//!
//! A string that is exactly `((name))` is replaced by the variable's value,
//! whatever its JSON shape. A placeholder embedded in a longer string is
//! spliced in as text. `((name.field))` indexes into an object value.
//!
//! Every referenced variable is looked up once before substitution, and all
//! missing names are reported together.

use beacon_core::check::{Source, VersionedResourceType};
use beacon_core::creds::Variables;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use crate::{ConfigError, ConfigResult};

static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(\(([-/.\w\s]+)\)\)").expect("variable pattern is valid")
});

/// Resolve every placeholder in `source`.
pub async fn evaluate_source(vars: &dyn Variables, source: &Source) -> ConfigResult<Source> {
    let value = Value::Object(source.clone());

    let mut names = BTreeSet::new();
    collect_names(&value, &mut names);
    if names.is_empty() {
        return Ok(source.clone());
    }

    let mut resolved = HashMap::new();
    let mut missing = Vec::new();
    for name in names {
        match lookup(vars, &name).await? {
            Some(v) => {
                resolved.insert(name, v);
            }
            None => missing.push(name),
        }
    }

    if !missing.is_empty() {
        return Err(ConfigError::UndefinedVariables(missing));
    }

    match substitute(value, &resolved) {
        Value::Object(map) => Ok(map),
        _ => Err(ConfigError::InvalidValue {
            field: "source".to_string(),
            message: "interpolated source is not an object".to_string(),
        }),
    }
}

/// Resolve the sources of a custom type chain.
pub async fn evaluate_resource_types(
    vars: &dyn Variables,
    types: &[VersionedResourceType],
) -> ConfigResult<Vec<VersionedResourceType>> {
    let mut evaluated = Vec::with_capacity(types.len());
    for t in types {
        let mut t = t.clone();
        t.source = evaluate_source(vars, &t.source).await?;
        evaluated.push(t);
    }
    Ok(evaluated)
}

fn collect_names(value: &Value, names: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            for caps in VAR_REGEX.captures_iter(s) {
                names.insert(caps[1].trim().to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_names(v, names)),
        Value::Object(map) => map.values().for_each(|v| collect_names(v, names)),
        _ => {}
    }
}

async fn lookup(vars: &dyn Variables, name: &str) -> ConfigResult<Option<Value>> {
    let mut segments = name.split('.');
    let head = segments.next().unwrap_or_default();

    let Some(mut value) = vars
        .get(head)
        .await
        .map_err(|e| ConfigError::Credentials(e.to_string()))?
    else {
        return Ok(None);
    };

    for field in segments {
        match value.get(field) {
            Some(v) => value = v.clone(),
            None => return Ok(None),
        }
    }

    Ok(Some(value))
}

fn substitute(value: Value, resolved: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            if let Some(caps) = VAR_REGEX.captures(&s) {
                if caps[0].len() == s.len() {
                    if let Some(v) = resolved.get(caps[1].trim()) {
                        return v.clone();
                    }
                }
            }

            let replaced = VAR_REGEX.replace_all(&s, |caps: &regex::Captures| {
                match resolved.get(caps[1].trim()) {
                    Some(Value::String(v)) => v.clone(),
                    Some(other) => other.to_string(),
                    None => caps[0].to_string(),
                }
            });
            Value::String(replaced.into_owned())
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| substitute(v, resolved))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, substitute(v, resolved)))
                .collect(),
        ),
        other => other,
    }
}
