//! Shared value types: the `KV` map exchanged between steps and a small
//! duration parser used for task timeouts and trigger schedules.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::FlowError;

/// String-keyed JSON map carried as step input/output and node parameters.
///
/// Merging is last-write-wins per key: the right-hand side overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KV(pub Map<String, Value>);

impl KV {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `other` into `self`, `other` winning on key collisions.
    pub fn merge(mut self, other: KV) -> KV {
        for (k, v) in other.0 {
            self.0.insert(k, v);
        }
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Map<String, Value>> for KV {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for KV {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Parse a duration string like `"500ms"`, `"30s"`, `"5m"`, `"1.5h"`.
///
/// A bare number is seconds.
pub fn parse_duration(value: &str) -> Result<Duration, FlowError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(FlowError::InvalidDuration {
            value: value.to_string(),
        });
    }
    let (number, unit) = match value.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => value.split_at(idx),
        None => (value, "s"),
    };
    let number: f64 = number.parse().map_err(|_| FlowError::InvalidDuration {
        value: value.to_string(),
    })?;
    if number < 0.0 || !number.is_finite() {
        return Err(FlowError::InvalidDuration {
            value: value.to_string(),
        });
    }
    let secs = match unit {
        "ms" => number / 1000.0,
        "s" => number,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => {
            return Err(FlowError::InvalidDuration {
                value: value.to_string(),
            })
        }
    };
    Ok(Duration::from_secs_f64(secs))
}
