//! Cache keys derived from a procedure name and its arguments.
//!
//! Two keys are equal iff their canonical serialization matches. The canonical
//! form is `procedure:` followed by the arguments as JSON with every object's
//! fields sorted, so `{"b":1,"a":2}` and `{"a":2,"b":1}` address the same entry.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;
use serde_json::Value;

use crate::error::KeyError;

/// Structured identifier of a cached query result.
///
/// Immutable once constructed. Equality, hashing and ordering only look at
/// the canonical string.
#[derive(Debug, Clone)]
pub struct CacheKey {
    procedure: String,
    args: Value,
    canonical: String,
}

impl CacheKey {
    /// Build a key from a procedure name and any serializable argument value.
    pub fn new<A>(procedure: impl Into<String>, args: &A) -> Result<Self, KeyError>
    where
        A: Serialize + ?Sized,
    {
        let procedure = procedure.into();
        if procedure.trim().is_empty() {
            return Err(KeyError::EmptyProcedure);
        }
        let args = serde_json::to_value(args).map_err(|e| KeyError::Serialization {
            procedure: procedure.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_parts(procedure, args))
    }

    /// Key for a procedure that takes no arguments.
    pub fn procedure_only(procedure: impl Into<String>) -> Result<Self, KeyError> {
        Self::new(procedure, &Value::Null)
    }

    fn from_parts(procedure: String, args: Value) -> Self {
        let canonical = format!("{}:{}", procedure, canonical_json(&args));
        Self {
            procedure,
            args,
            canonical,
        }
    }

    /// Procedure name, e.g. `todo.list`.
    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    /// Arguments as they were serialized.
    pub fn args(&self) -> &Value {
        &self.args
    }

    /// Canonical serialization used for identity.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// True if the procedure lives under `namespace` (`todo` covers `todo.list`
    /// and `todo.byId`, but not `todos.list`).
    pub fn in_namespace(&self, namespace: &str) -> bool {
        self.procedure == namespace
            || self
                .procedure
                .strip_prefix(namespace)
                .is_some_and(|rest| rest.starts_with('.'))
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacheKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Serialize JSON with object fields in sorted order, independent of how the
/// map was built.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            let items: Vec<String> = fields
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect();
            format!("{{{}}}", items.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

/// Selects a set of keys for bulk staleness marking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFilter {
    /// Exactly this key.
    Exact(CacheKey),
    /// Every key of one procedure, whatever its arguments.
    Procedure(String),
    /// Every key whose procedure sits under a dotted namespace.
    Namespace(String),
    /// Every key in the store.
    All,
}

impl KeyFilter {
    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            Self::Exact(exact) => exact == key,
            Self::Procedure(procedure) => key.procedure() == procedure,
            Self::Namespace(namespace) => key.in_namespace(namespace),
            Self::All => true,
        }
    }
}
