//! Filter descriptors and filter stacks.
//!
//! A database resource can fan out into several parallel sub-executions, one
//! per [`FilterStack`]. Stacks are ordered and compare element-wise; their
//! [`FilterStack::filter_id`] is a stable digest used to correlate events
//! across the fan-out.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind of a database filter.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
  Scenario,
  Tool,
}

impl FilterType {
  /// All filter types, in the order they stack onto a URL.
  pub const ALL: [FilterType; 2] = [FilterType::Scenario, FilterType::Tool];
}

/// A single filter descriptor: one named filter of one type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Filter {
  #[serde(rename = "type")]
  pub filter_type: FilterType,
  pub name: String,
}

impl Filter {
  pub fn new(filter_type: FilterType, name: impl Into<String>) -> Self {
    Self {
      filter_type,
      name: name.into(),
    }
  }
}

/// Ordered sequence of filters applied to a database URL.
///
/// Two stacks are equal iff their descriptor sequences are equal. A resource
/// with an empty stack is unfiltered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterStack(Vec<Filter>);

impl FilterStack {
  pub fn new(filters: Vec<Filter>) -> Self {
    Self(filters)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn filters(&self) -> &[Filter] {
    &self.0
  }

  pub fn push(&mut self, filter: Filter) {
    self.0.push(filter);
  }

  /// Deterministic id of this stack: lowercase hex SHA-256 of the canonical
  /// JSON form of the descriptor sequence. Same stack, same id, across runs
  /// and processes. The empty stack yields an empty id.
  pub fn filter_id(&self) -> String {
    if self.0.is_empty() {
      return String::new();
    }
    let canonical = serde_json::to_string(&self.0).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    let mut id = String::with_capacity(digest.len() * 2);
    for byte in digest {
      let _ = write!(id, "{:02x}", byte);
    }
    id
  }
}

impl FromIterator<Filter> for FilterStack {
  fn from_iter<I: IntoIterator<Item = Filter>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}

/// Joins the per-resource filter ids of one combination into a composite id.
///
/// Ids are de-duplicated and sorted so the composite does not depend on
/// resource iteration order; empty ids (unfiltered resources) are dropped.
pub fn composite_filter_id<'a, I>(ids: I) -> String
where
  I: IntoIterator<Item = &'a str>,
{
  let mut distinct: Vec<&str> = ids.into_iter().filter(|id| !id.is_empty()).collect();
  distinct.sort_unstable();
  distinct.dedup();
  distinct.join(" & ")
}

/// Appends the stack's filters to a database URL as query parameters.
pub fn filtered_url(url: &str, stack: &FilterStack) -> String {
  let mut filtered = url.to_string();
  for filter in stack.filters() {
    let separator = if filtered.contains('?') { '&' } else { '?' };
    let type_tag = match filter.filter_type {
      FilterType::Scenario => "scenario",
      FilterType::Tool => "tool",
    };
    let _ = write!(filtered, "{}filter={}:{}", separator, type_tag, filter.name);
  }
  filtered
}
