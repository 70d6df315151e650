//! Host attributes and placement constraints

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A named tag on a host, e.g. `rack = {a}` or `zone = {us-east, us-west}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub values: BTreeSet<String>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, values: impl IntoIterator<Item = String>) -> Self {
        Self {
            name: name.into(),
            values: values.into_iter().collect(),
        }
    }
}

/// Requires (or forbids, when negated) one of a set of attribute values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueConstraint {
    #[serde(default)]
    pub negated: bool,
    pub values: BTreeSet<String>,
}

/// Caps how many tasks of one job may land on hosts sharing an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConstraint {
    pub limit: u32,
}

/// One placement constraint on a task, keyed by attribute name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConstraint {
    /// Attribute name the constraint applies to.
    pub name: String,
    #[serde(flatten)]
    pub constraint: ConstraintKind,
}

/// The two constraint forms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Value(ValueConstraint),
    Limit(LimitConstraint),
}
