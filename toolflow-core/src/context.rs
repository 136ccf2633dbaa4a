use std::borrow::Cow;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::{Value, json};
use toolflow_commons::ErrorCategory;
use toolflow_llm::Message;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}")
        .unwrap_or_else(|err| unreachable!("placeholder pattern is valid: {err}"))
});

/// A step failure that the flow continued past.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepFailure {
    pub index: usize,
    pub key: String,
    pub kind: String,
    pub category: ErrorCategory,
    pub message: String,
    pub attempts: u32,
}

/// Values shared between the steps of one flow run.
///
/// Values keep insertion order. Chat steps also append to a message history
/// so later chat steps see earlier turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlowContext {
    values: IndexMap<String, Value>,
    messages: Vec<Message>,
    failures: Vec<StepFailure>,
}

impl FlowContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values<I, K>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self {
            values: values.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            ..Self::default()
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Look up `key`, descending into objects and arrays on `.` segments
    /// when no value is stored under the full key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        if let Some(value) = self.values.get(key) {
            return Some(value);
        }
        let mut segments = key.split('.');
        let mut current = self.values.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn values(&self) -> &IndexMap<String, Value> {
        &self.values
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn failures(&self) -> &[StepFailure] {
        &self.failures
    }

    /// Store the failure under the step key and in the failure list.
    pub fn record_failure(&mut self, failure: StepFailure) {
        self.values.insert(
            failure.key.clone(),
            json!({
                "error": {
                    "category": failure.category,
                    "message": failure.message,
                    "attempts": failure.attempts,
                }
            }),
        );
        self.failures.push(failure);
    }

    /// Replace `{{key}}` placeholders. Strings are inserted raw, other
    /// values as JSON; unknown keys are left untouched.
    pub fn interpolate<'a>(&self, template: &'a str) -> Cow<'a, str> {
        PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| match self.get(&caps[1]) {
            Some(Value::String(text)) => text.clone(),
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
    }

    /// Interpolate every string inside `value`, keys excluded.
    pub fn interpolate_value(&self, value: &Value) -> Value {
        match value {
            Value::String(text) => Value::String(self.interpolate(text).into_owned()),
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.interpolate_value(item)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, item)| (key.clone(), self.interpolate_value(item)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}
