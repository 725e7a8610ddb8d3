//! Metric configuration policy.
//!
//! Collectors declare a policy tree during discovery. Each node is
//! keyed by a namespace prefix and carries typed rules; applying the
//! policy to a user-supplied config table yields the effective table
//! handed to the plugin on every collect, or a bag of faults.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A typed configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ConfigValue {
    /// Numeric view for range checks; integers widen to floats.
    fn as_number(&self) -> Option<f64> {
        match self {
            ConfigValue::Int(v) => Some(*v as f64),
            ConfigValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ConfigValue::Bool(_) => "bool",
            ConfigValue::Int(_) => "int",
            ConfigValue::Float(_) => "float",
            ConfigValue::Str(_) => "string",
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(v) => write!(f, "{v}"),
            ConfigValue::Int(v) => write!(f, "{v}"),
            ConfigValue::Float(v) => write!(f, "{v}"),
            ConfigValue::Str(v) => write!(f, "{v}"),
        }
    }
}

/// User-supplied configuration key/value table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigDataNode {
    pub table: BTreeMap<String, ConfigValue>,
}

impl ConfigDataNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ConfigValue) {
        self.table.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.table.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Overlay `other` on top of this table; `other` wins on conflict.
    pub fn merged(&self, other: &ConfigDataNode) -> ConfigDataNode {
        let mut table = self.table.clone();
        table.extend(other.table.clone());
        ConfigDataNode { table }
    }
}

/// A single policy fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PolicyFault {
    MissingRequired { key: String },
    WrongType { key: String, expected: String, got: String },
    OutOfRange { key: String, value: f64 },
    NotAllowed { key: String, value: String },
}

impl fmt::Display for PolicyFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyFault::MissingRequired { key } => {
                write!(f, "required config field missing: {key}")
            }
            PolicyFault::WrongType { key, expected, got } => {
                write!(f, "config field {key}: expected {expected}, got {got}")
            }
            PolicyFault::OutOfRange { key, value } => {
                write!(f, "config field {key}: value {value} out of range")
            }
            PolicyFault::NotAllowed { key, value } => {
                write!(f, "config field {key}: value {value} not in allowed set")
            }
        }
    }
}

/// A typed rule for one configuration key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ConfigValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<ConfigValue>,
}

impl Rule {
    fn check(&self, key: &str, value: &ConfigValue, faults: &mut Vec<PolicyFault>) {
        if let Some(default) = &self.default {
            if std::mem::discriminant(default) != std::mem::discriminant(value)
                && !(matches!(default, ConfigValue::Float(_)) && matches!(value, ConfigValue::Int(_)))
            {
                faults.push(PolicyFault::WrongType {
                    key: key.to_string(),
                    expected: default.kind().to_string(),
                    got: value.kind().to_string(),
                });
                return;
            }
        }
        if let Some(n) = value.as_number() {
            if self.minimum.is_some_and(|min| n < min)
                || self.maximum.is_some_and(|max| n > max)
            {
                faults.push(PolicyFault::OutOfRange {
                    key: key.to_string(),
                    value: n,
                });
                return;
            }
        }
        if !self.allowed.is_empty() && !self.allowed.contains(value) {
            faults.push(PolicyFault::NotAllowed {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
    }
}

/// Rules for one namespace prefix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyNode {
    #[serde(default)]
    pub rules: BTreeMap<String, Rule>,
}

/// Policy tree keyed by namespace prefix.
///
/// A node applies to every metric whose namespace it prefixes on a
/// component boundary; deeper nodes override shallower ones per key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigPolicy {
    pub nodes: BTreeMap<String, PolicyNode>,
}

impl ConfigPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, prefix: impl Into<String>, node: PolicyNode) {
        self.nodes.insert(prefix.into(), node);
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Rules applicable to `namespace`, shallow-to-deep so deeper nodes
    /// override earlier ones.
    fn rules_for(&self, namespace: &str) -> BTreeMap<&str, &Rule> {
        let mut merged: BTreeMap<&str, &Rule> = BTreeMap::new();
        // BTreeMap iteration is ordered by prefix, so shorter prefixes
        // of the same chain come first and deeper nodes win.
        for (prefix, node) in &self.nodes {
            if prefix_matches(prefix, namespace) {
                for (key, rule) in &node.rules {
                    merged.insert(key, rule);
                }
            }
        }
        merged
    }

    /// Apply the policy for `namespace` to a user-supplied table.
    ///
    /// Defaults are filled in, required fields without defaults must be
    /// present, and present values are checked against type, range, and
    /// allowed-set rules.
    pub fn process(
        &self,
        namespace: &str,
        given: &ConfigDataNode,
    ) -> Result<ConfigDataNode, Vec<PolicyFault>> {
        let mut effective = given.clone();
        let mut faults = Vec::new();

        for (key, rule) in self.rules_for(namespace) {
            match effective.get(key) {
                Some(value) => rule.check(key, value, &mut faults),
                None => match &rule.default {
                    Some(default) => effective.insert(key, default.clone()),
                    None if rule.required => faults.push(PolicyFault::MissingRequired {
                        key: key.to_string(),
                    }),
                    None => {}
                },
            }
        }

        if faults.is_empty() {
            Ok(effective)
        } else {
            Err(faults)
        }
    }
}

/// Component-boundary prefix test: `/a/b` matches `/a/b` and `/a/b/c`,
/// never `/a/bc`. An empty or `/` prefix matches everything.
pub(crate) fn prefix_matches(prefix: &str, namespace: &str) -> bool {
    if prefix.is_empty() || prefix == "/" {
        return true;
    }
    match namespace.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
