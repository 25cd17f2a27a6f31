//! Field-level merge strategies used by the MERGE conflict policy.

use chrono::Utc;
use serde_json::{Map, Value};

/// Field stamped with the merge time on every merged payload.
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Combines a local payload with the server's current entity state.
///
/// Implementations must always return a JSON object.
pub trait MergeStrategy: Send + Sync {
    fn merge(&self, local: &Value, remote: &Value) -> Value;
}

/// Remote fields overlaid with local fields; local wins per field.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShallowMerge;

impl MergeStrategy for ShallowMerge {
    fn merge(&self, local: &Value, remote: &Value) -> Value {
        let mut merged = shallow_merge(local, remote);
        stamp(&mut merged);
        Value::Object(merged)
    }
}

fn as_object(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    }
}

fn shallow_merge(local: &Value, remote: &Value) -> Map<String, Value> {
    let mut merged = as_object(remote);
    for (key, value) in as_object(local) {
        merged.insert(key, value);
    }
    merged
}

fn stamp(merged: &mut Map<String, Value>) {
    merged.insert(
        UPDATED_AT_FIELD.to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
}

/// Domain rule applied to one field when both sides carry it.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldRule {
    /// Keep the larger number (monotonic progress counters).
    Max,
    /// Join differing text as `remote{separator}local`.
    AppendText { separator: String },
    /// Union two lists of line items keyed by `key`, summing `quantity` for
    /// lines present on both sides.
    AdditiveQuantity { key: String, quantity: String },
}

impl FieldRule {
    fn apply(&self, local: &Value, remote: &Value) -> Value {
        match self {
            FieldRule::Max => match (local.as_f64(), remote.as_f64()) {
                (Some(l), Some(r)) if r > l => remote.clone(),
                _ => local.clone(),
            },
            FieldRule::AppendText { separator } => match (local, remote) {
                (Value::String(l), Value::String(r)) => {
                    if l == r || r.is_empty() || l.contains(r.as_str()) {
                        local.clone()
                    } else if l.is_empty() {
                        remote.clone()
                    } else {
                        Value::String(format!("{}{}{}", r, separator, l))
                    }
                }
                _ => local.clone(),
            },
            FieldRule::AdditiveQuantity { key, quantity } => match (local, remote) {
                (Value::Array(l), Value::Array(r)) => {
                    Value::Array(merge_line_items(l, r, key, quantity))
                }
                _ => local.clone(),
            },
        }
    }
}

fn merge_line_items(local: &[Value], remote: &[Value], key: &str, quantity: &str) -> Vec<Value> {
    let mut merged: Vec<Value> = remote.to_vec();
    for line in local {
        let position = line
            .get(key)
            .and_then(|k| merged.iter().position(|candidate| candidate.get(key) == Some(k)));

        if let Some(Value::Object(target)) = position.map(|i| &mut merged[i]) {
            let sum = target.get(quantity).and_then(Value::as_f64).unwrap_or(0.0)
                + line.get(quantity).and_then(Value::as_f64).unwrap_or(0.0);
            for (field, value) in as_object(line) {
                target.insert(field, value);
            }
            target.insert(quantity.to_string(), number(sum));
            continue;
        }
        merged.push(line.clone());
    }
    merged
}

/// Integral sums stay integers in the JSON output.
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Shallow merge followed by per-field domain rules.
#[derive(Debug, Clone, Default)]
pub struct FieldRulesMerge {
    rules: Vec<(String, FieldRule)>,
}

impl FieldRulesMerge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule for `field`.
    pub fn rule(mut self, field: impl Into<String>, rule: FieldRule) -> Self {
        self.rules.push((field.into(), rule));
        self
    }

    pub fn max(self, field: impl Into<String>) -> Self {
        self.rule(field, FieldRule::Max)
    }

    pub fn append_text(self, field: impl Into<String>, separator: impl Into<String>) -> Self {
        self.rule(
            field,
            FieldRule::AppendText {
                separator: separator.into(),
            },
        )
    }

    pub fn additive_quantity(
        self,
        field: impl Into<String>,
        key: impl Into<String>,
        quantity: impl Into<String>,
    ) -> Self {
        self.rule(
            field,
            FieldRule::AdditiveQuantity {
                key: key.into(),
                quantity: quantity.into(),
            },
        )
    }
}

impl MergeStrategy for FieldRulesMerge {
    fn merge(&self, local: &Value, remote: &Value) -> Value {
        let mut merged = shallow_merge(local, remote);
        for (field, rule) in &self.rules {
            if let (Some(l), Some(r)) = (local.get(field), remote.get(field)) {
                merged.insert(field.clone(), rule.apply(l, r));
            }
        }
        stamp(&mut merged);
        Value::Object(merged)
    }
}
