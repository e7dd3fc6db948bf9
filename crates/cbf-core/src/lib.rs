//! Core domain model for CBF: identifiers, work queues and the category taxonomy.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cbf-core";

pub const PATH_DELIMITER: char = '/';

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseTarget {
    #[default]
    Main,
    App,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConfig {
    pub name: String,
    #[serde(default)]
    pub database: DatabaseTarget,
    #[serde(default)]
    pub source_query: Option<String>,
    #[serde(default)]
    pub sink_query: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl DomainConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database: DatabaseTarget::Main,
            source_query: None,
            sink_query: None,
            enabled: true,
        }
    }
}

pub type IdentifierSet = Vec<Identifier>;

/// Left-anti-join of `source` against `sink`.
///
/// Keeps every source identifier with no exact (case-sensitive) match in the
/// sink, in source order. Source duplicates are not collapsed: each copy of an
/// unmatched identifier is kept.
pub fn reconcile(source: &[Identifier], sink: &[Identifier]) -> IdentifierSet {
    if sink.is_empty() {
        return source.to_vec();
    }
    let loaded: HashSet<&str> = sink.iter().map(Identifier::as_str).collect();
    source
        .iter()
        .filter(|id| !loaded.contains(id.as_str()))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkQueue {
    pub domain: String,
    pub generated_at: DateTime<Utc>,
    pub ids: IdentifierSet,
}

impl WorkQueue {
    pub fn build(
        domain: impl Into<String>,
        generated_at: DateTime<Utc>,
        source: &[Identifier],
        sink: &[Identifier],
    ) -> Self {
        Self {
            domain: domain.into(),
            generated_at,
            ids: reconcile(source, sink),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Split a taxonomy path into its segments.
///
/// Every leading and trailing delimiter is dropped, then the remainder is
/// split on every delimiter. Inner empty segments are kept.
pub fn parse_category_path(raw: &str) -> Vec<String> {
    raw.trim_matches(PATH_DELIMITER)
        .split(PATH_DELIMITER)
        .map(ToString::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryNode {
    pub category_id: String,
    pub name: String,
    pub path: Vec<String>,
    pub has_children: bool,
}

impl CategoryNode {
    pub fn from_raw_path(
        category_id: impl Into<String>,
        name: impl Into<String>,
        raw_path: &str,
        has_children: bool,
    ) -> Self {
        Self {
            category_id: category_id.into(),
            name: name.into(),
            path: parse_category_path(raw_path),
            has_children,
        }
    }

    pub fn leaf_segment(&self) -> Option<&str> {
        self.path.last().map(String::as_str)
    }
}

/// Flat, deduplicated result of one traversal. Insertion order is discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<CategoryNode>", into = "Vec<CategoryNode>")]
pub struct CategoryTable {
    nodes: Vec<CategoryNode>,
    seen: HashSet<String>,
}

impl CategoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: CategoryNode) -> bool {
        if self.seen.contains(&node.category_id) {
            return false;
        }
        self.seen.insert(node.category_id.clone());
        self.nodes.push(node);
        true
    }

    pub fn contains(&self, category_id: &str) -> bool {
        self.seen.contains(category_id)
    }

    pub fn get(&self, category_id: &str) -> Option<&CategoryNode> {
        if !self.contains(category_id) {
            return None;
        }
        self.nodes.iter().find(|n| n.category_id == category_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CategoryNode> {
        self.nodes.iter()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.category_id.as_str()).collect()
    }

    pub fn to_rows(&self, market: &str) -> Vec<CategoryRow> {
        self.nodes
            .iter()
            .map(|node| CategoryRow::from_node(node, market))
            .collect()
    }
}

impl From<Vec<CategoryNode>> for CategoryTable {
    fn from(nodes: Vec<CategoryNode>) -> Self {
        let mut table = CategoryTable::new();
        for node in nodes {
            table.insert(node);
        }
        table
    }
}

impl From<CategoryTable> for Vec<CategoryNode> {
    fn from(table: CategoryTable) -> Self {
        table.nodes
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRow {
    pub category_id: String,
    pub market: String,
    pub category: String,
    pub category_path: Vec<String>,
    pub url: String,
}

impl CategoryRow {
    pub fn from_node(node: &CategoryNode, market: &str) -> Self {
        Self {
            category_id: node.category_id.clone(),
            market: market.to_string(),
            category: node.name.clone(),
            category_path: node.path.clone(),
            url: String::new(),
        }
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.category_id, &self.market)
    }

    pub fn category_path_json(&self) -> serde_json::Value {
        serde_json::Value::from(self.category_path.clone())
    }
}
