//! Credential resolution collaborator.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::Result;

/// Source of values for `((name))` placeholders.
#[async_trait]
pub trait Variables: Send + Sync {
    /// Look up a variable by name. `Ok(None)` means it does not exist.
    async fn get(&self, name: &str) -> Result<Option<Value>>;
}

/// Variables held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticVariables {
    values: HashMap<String, Value>,
}

impl StaticVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    /// Load every environment variable starting with `prefix`, lowercased and
    /// with `_` turned into `-` (`BEACON_VAR_GIT_KEY` -> `git-key`).
    pub fn from_env(prefix: &str) -> Self {
        Self::from_pairs(prefix, std::env::vars())
    }

    fn from_pairs(prefix: &str, pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let values = pairs
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(prefix)
                    .filter(|name| !name.is_empty())
                    .map(|name| (name.to_lowercase().replace('_', "-"), Value::String(value)))
            })
            .collect();
        Self { values }
    }

    /// Merge `other` over these values.
    pub fn merged(mut self, other: StaticVariables) -> Self {
        self.values.extend(other.values);
        self
    }
}

#[async_trait]
impl Variables for StaticVariables {
    async fn get(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.values.get(name).cloned())
    }
}
