//! Project item resources.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::filter::{filtered_url, FilterStack};

/// The type of data a [`Resource`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
  /// The url points to an existing file.
  File,
  /// A labelled collection of files; the members are carried as metadata.
  FilePack,
  /// The url is a database URL.
  Database,
  /// A file that may not exist yet or may change location; the url points to
  /// the latest version, or is absent.
  TransientFile,
}

/// Metadata attached to a resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetadata {
  /// Filters applied to this resource's URL, in application order.
  #[serde(default, skip_serializing_if = "FilterStack::is_empty")]
  pub filter_stack: FilterStack,
  /// Correlation id derived from the filter stack; set during fan-out.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub filter_id: Option<String>,
  /// Free-form extras (e.g. file-pack members, execution timestamps).
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub extras: BTreeMap<String, serde_json::Value>,
}

/// An immutable descriptor of data made available by one project item and
/// consumed by another.
///
/// Equality and hashing cover (provider, kind, label, url, filter stack); a
/// [`ResourceKind::FilePack`] never compares equal to a non-pack with the same
/// label because the kind participates in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
  /// Name of the item that provides this resource.
  pub provider: String,
  pub kind: ResourceKind,
  /// Stable identifier within the provider.
  pub label: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub url: Option<String>,
  #[serde(default)]
  pub metadata: ResourceMetadata,
}

impl Resource {
  /// A file resource; the label is the path itself.
  pub fn file(provider: impl Into<String>, path: impl Into<String>) -> Self {
    let path = path.into();
    Self {
      provider: provider.into(),
      kind: ResourceKind::File,
      label: path.clone(),
      url: Some(path),
      metadata: ResourceMetadata::default(),
    }
  }

  /// A file resource with an explicit label distinct from its path.
  pub fn labelled_file(
    provider: impl Into<String>,
    label: impl Into<String>,
    path: impl Into<String>,
  ) -> Self {
    Self {
      provider: provider.into(),
      kind: ResourceKind::File,
      label: label.into(),
      url: Some(path.into()),
      metadata: ResourceMetadata::default(),
    }
  }

  pub fn database(
    provider: impl Into<String>,
    label: impl Into<String>,
    url: impl Into<String>,
  ) -> Self {
    Self {
      provider: provider.into(),
      kind: ResourceKind::Database,
      label: label.into(),
      url: Some(url.into()),
      metadata: ResourceMetadata::default(),
    }
  }

  pub fn file_pack(provider: impl Into<String>, label: impl Into<String>) -> Self {
    Self {
      provider: provider.into(),
      kind: ResourceKind::FilePack,
      label: label.into(),
      url: None,
      metadata: ResourceMetadata::default(),
    }
  }

  pub fn transient_file(
    provider: impl Into<String>,
    label: impl Into<String>,
    url: Option<String>,
  ) -> Self {
    Self {
      provider: provider.into(),
      kind: ResourceKind::TransientFile,
      label: label.into(),
      url,
      metadata: ResourceMetadata::default(),
    }
  }

  /// Clones this resource with the given filter stack applied: the stack and
  /// its derived filter id are attached and the URL (if any) is rewritten.
  pub fn with_filter_stack(&self, stack: FilterStack) -> Self {
    let mut clone = self.clone();
    clone.url = self.url.as_deref().map(|url| filtered_url(url, &stack));
    clone.metadata.filter_id = Some(stack.filter_id());
    clone.metadata.filter_stack = stack;
    clone
  }

  /// The correlation id attached during fan-out, or the empty string.
  pub fn filter_id(&self) -> &str {
    self.metadata.filter_id.as_deref().unwrap_or("")
  }

  /// The local path of this resource, when it has one.
  pub fn path(&self) -> Option<PathBuf> {
    if !self.has_file_path() {
      return None;
    }
    let url = self.url.as_deref()?;
    let path = url.strip_prefix("file://").unwrap_or(url);
    let path = match self.kind {
      ResourceKind::Database => path.strip_prefix("sqlite://").unwrap_or(path),
      _ => path,
    };
    Some(PathBuf::from(path))
  }

  /// Whether the resource points at something on the local filesystem.
  pub fn has_file_path(&self) -> bool {
    match self.kind {
      ResourceKind::File => self.url.is_some(),
      ResourceKind::Database => self
        .url
        .as_deref()
        .is_some_and(|url| url.starts_with("sqlite")),
      ResourceKind::TransientFile => self.url.is_some(),
      ResourceKind::FilePack => false,
    }
  }

  /// The value to pass on a command line: the URL for databases, the path
  /// otherwise.
  pub fn command_line_arg(&self) -> Option<String> {
    match self.kind {
      ResourceKind::Database => self.url.clone(),
      _ => self.path().map(|p| p.to_string_lossy().into_owned()),
    }
  }
}

impl PartialEq for Resource {
  fn eq(&self, other: &Self) -> bool {
    self.provider == other.provider
      && self.kind == other.kind
      && self.label == other.label
      && self.url == other.url
      && self.metadata.filter_stack == other.metadata.filter_stack
  }
}

impl Eq for Resource {}

impl Hash for Resource {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.provider.hash(state);
    self.kind.hash(state);
    self.label.hash(state);
    self.url.hash(state);
    self.metadata.filter_stack.hash(state);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::filter::{Filter, FilterType};

  #[test]
  fn pack_never_equals_non_pack_with_same_label() {
    let pack = Resource::file_pack("Importer", "output");
    let mut file = Resource::labelled_file("Importer", "output", "/tmp/output.csv");
    file.url = None;
    assert_ne!(pack, file);
  }

  #[test]
  fn equality_ignores_extras_but_not_filter_stack() {
    let a = Resource::database("Store", "db@Store", "sqlite:///d.db");
    let mut b = a.clone();
    b.metadata
      .extras
      .insert("note".into(), serde_json::Value::Bool(true));
    assert_eq!(a, b);

    let stack = FilterStack::new(vec![Filter::new(FilterType::Scenario, "base")]);
    let filtered = a.with_filter_stack(stack);
    assert_ne!(a, filtered);
  }

  #[test]
  fn with_filter_stack_rewrites_url_and_derives_id() {
    let resource = Resource::database("Store", "db@Store", "sqlite:///d.db");
    let stack = FilterStack::new(vec![Filter::new(FilterType::Scenario, "base")]);
    let filtered = resource.with_filter_stack(stack.clone());
    assert_eq!(
      filtered.url.as_deref(),
      Some("sqlite:///d.db?filter=scenario:base")
    );
    assert_eq!(filtered.filter_id(), stack.filter_id());
  }

  #[test]
  fn serialization_round_trip_preserves_filter_id() {
    let stack = FilterStack::new(vec![Filter::new(FilterType::Tool, "opt")]);
    let resource =
      Resource::database("Store", "db@Store", "sqlite:///d.db").with_filter_stack(stack);
    let json = serde_json::to_string(&resource).unwrap();
    let restored: Resource = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, resource);
    assert_eq!(restored.filter_id(), resource.filter_id());
  }

  #[test]
  fn database_path_only_for_sqlite() {
    let sqlite = Resource::database("Store", "db", "sqlite:///data/d.db");
    assert!(sqlite.has_file_path());
    let remote = Resource::database("Store", "db", "postgresql://host/d");
    assert!(!remote.has_file_path());
    assert_eq!(remote.command_line_arg().as_deref(), Some("postgresql://host/d"));
  }
}
