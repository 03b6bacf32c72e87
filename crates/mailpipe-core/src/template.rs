//! Template Renderer - `{{key}}` personalization of subjects and bodies

use mailpipe_storage::models::{Subscriber, TriggerEvent};
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;
use thiserror::Error;

/// Template rendering errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("missing template variables: {}", .0.join(", "))]
    MissingVariables(Vec<String>),
}

impl From<TemplateError> for mailpipe_common::Error {
    fn from(e: TemplateError) -> Self {
        mailpipe_common::Error::Template(e.to_string())
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("placeholder pattern is valid")
    })
}

/// Flat variable map used for substitution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateVariables {
    values: BTreeMap<String, String>,
}

impl TemplateVariables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Variables from a trigger event: `email`, `name`, `first_name`,
    /// `last_name` and every event field (nested objects become `a.b`)
    pub fn from_event(event: &TriggerEvent) -> Self {
        let mut vars = Self::new();
        for (key, value) in &event.fields {
            vars.insert_value(key, value);
        }
        vars.set_identity(&event.email, event.name.as_deref());
        vars
    }

    /// Variables from a subscriber: identity plus `attributes.*`
    pub fn from_subscriber(subscriber: &Subscriber) -> Self {
        let mut vars = Self::new();
        for (key, value) in subscriber.attributes.iter() {
            vars.insert_value(&format!("attributes.{}", key), value);
        }
        vars.set_identity(&subscriber.email, subscriber.name.as_deref());
        vars
    }

    /// Identity only, for list recipients without a subscriber row
    pub fn for_address(email: &str) -> Self {
        let mut vars = Self::new();
        vars.set_identity(email, None);
        vars
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn set_identity(&mut self, email: &str, name: Option<&str>) {
        let name = name.unwrap_or("").trim();
        let mut parts = name.split_whitespace();
        let first_name = parts.next().unwrap_or("").to_string();
        let last_name = parts.collect::<Vec<_>>().join(" ");

        self.insert("email", email);
        self.insert("name", name);
        self.insert("first_name", first_name);
        self.insert("last_name", last_name);
    }

    fn insert_value(&mut self, key: &str, value: &Value) {
        match value {
            Value::Object(map) => {
                for (child, v) in map {
                    self.insert_value(&format!("{}.{}", key, child), v);
                }
            }
            Value::Null => self.insert(key, ""),
            Value::String(s) => self.insert(key, s.clone()),
            Value::Number(n) => self.insert(key, n.to_string()),
            Value::Bool(b) => self.insert(key, b.to_string()),
            Value::Array(_) => self.insert(key, value.to_string()),
        }
    }
}

/// Substitute `{{key}}` placeholders; unknown placeholders stay literal
pub fn render(template: &str, vars: &TemplateVariables) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &Captures| match vars.get(&caps[1]) {
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Like [`render`] but fails when any placeholder has no value
pub fn render_strict(template: &str, vars: &TemplateVariables) -> Result<String, TemplateError> {
    let missing: BTreeSet<String> = placeholder_regex()
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .filter(|key| vars.get(key).is_none())
        .collect();

    if !missing.is_empty() {
        return Err(TemplateError::MissingVariables(missing.into_iter().collect()));
    }
    Ok(render(template, vars))
}
