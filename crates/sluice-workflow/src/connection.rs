//! Connections between project items.
//!
//! A connection is a directed edge. It records which database resources flow
//! through it, which filters are switched on per resource label, and how
//! resources are converted on their way forward (currently: packing CSVs into
//! a datapackage).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::WorkflowError;
use crate::filter::{Filter, FilterStack, FilterType};
use crate::resource::{Resource, ResourceKind};

/// Connection options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
  /// Pack the CSV files flowing through this edge into a single datapackage.
  #[serde(default)]
  pub use_datapackage: bool,
}

impl ConnectionOptions {
  fn is_default(&self) -> bool {
    *self == Self::default()
  }
}

/// Online flags per filter value id.
type FilterOnline = BTreeMap<String, bool>;
/// Filter activations per filter type.
type FiltersByType = BTreeMap<FilterType, FilterOnline>;

/// One filter value offered by a database: type, stable id and display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterCandidate {
  pub filter_type: FilterType,
  pub id: String,
  pub name: String,
}

/// Reads the filter candidates a database offers.
///
/// The engine never links a database driver; the workbench supplies an
/// implementation of this seam.
#[async_trait]
pub trait DatabaseReader: Send + Sync {
  async fn filter_candidates(&self, url: &str) -> Result<Vec<FilterCandidate>, WorkflowError>;
}

/// A directed edge between two project items.
#[derive(Debug, Clone)]
pub struct Connection {
  source: String,
  source_anchor: String,
  destination: String,
  destination_anchor: String,
  resource_filters: BTreeMap<String, FiltersByType>,
  options: ConnectionOptions,
  /// Database resources received from the source, re-indexed on every
  /// advertisement.
  resources: Vec<Resource>,
  id_to_name: BTreeMap<FilterType, BTreeMap<String, String>>,
}

impl Connection {
  pub fn new(
    source: impl Into<String>,
    source_anchor: impl Into<String>,
    destination: impl Into<String>,
    destination_anchor: impl Into<String>,
  ) -> Self {
    Self {
      source: source.into(),
      source_anchor: source_anchor.into(),
      destination: destination.into(),
      destination_anchor: destination_anchor.into(),
      resource_filters: BTreeMap::new(),
      options: ConnectionOptions::default(),
      resources: Vec::new(),
      id_to_name: BTreeMap::new(),
    }
  }

  pub fn with_options(mut self, options: ConnectionOptions) -> Self {
    self.options = options;
    self
  }

  /// Switches the given filter ids on for a resource label.
  pub fn with_enabled_filters<I>(
    mut self,
    label: impl Into<String>,
    filter_type: FilterType,
    ids: I,
  ) -> Self
  where
    I: IntoIterator,
    I::Item: Into<String>,
  {
    let online = self
      .resource_filters
      .entry(label.into())
      .or_default()
      .entry(filter_type)
      .or_default();
    for id in ids {
      online.insert(id.into(), true);
    }
    self
  }

  pub fn name(&self) -> String {
    format!("from {} to {}", self.source, self.destination)
  }

  pub fn source(&self) -> &str {
    &self.source
  }

  pub fn destination(&self) -> &str {
    &self.destination
  }

  pub fn source_anchor(&self) -> &str {
    &self.source_anchor
  }

  pub fn destination_anchor(&self) -> &str {
    &self.destination_anchor
  }

  pub fn options(&self) -> &ConnectionOptions {
    &self.options
  }

  /// Whether any filter is switched on.
  pub fn has_filters(&self) -> bool {
    self
      .resource_filters
      .values()
      .flat_map(|by_type| by_type.values())
      .any(|online| online.values().any(|on| *on))
  }

  /// Records (and re-indexes) the database resources arriving from the
  /// source item.
  pub fn receive_resources_from_source<'a, I>(&mut self, resources: I)
  where
    I: IntoIterator<Item = &'a Resource>,
  {
    self.resources = resources
      .into_iter()
      .filter(|r| r.kind == ResourceKind::Database)
      .cloned()
      .collect();
  }

  /// Atomically substitutes one recorded resource. Labels must match.
  pub fn replace_resource_from_source(
    &mut self,
    old: &Resource,
    new: &Resource,
  ) -> Result<(), WorkflowError> {
    if old.label != new.label {
      return Err(WorkflowError::LabelMismatch {
        old_label: old.label.clone(),
        new_label: new.label.clone(),
      });
    }
    self.resources.retain(|r| r != old);
    if new.kind == ResourceKind::Database {
      self.resources.push(new.clone());
    }
    Ok(())
  }

  /// Queries each recorded database for its filter candidates and rebuilds
  /// the activation maps, preserving flags for ids that still exist.
  pub async fn fetch_database_items(&mut self, reader: &dyn DatabaseReader) {
    let mut resource_filters: BTreeMap<String, FiltersByType> = BTreeMap::new();
    let mut id_to_name: BTreeMap<FilterType, BTreeMap<String, String>> = BTreeMap::new();
    for resource in &self.resources {
      let Some(url) = resource.url.as_deref() else {
        continue;
      };
      let candidates = match reader.filter_candidates(url).await {
        Ok(candidates) => candidates,
        Err(err) => {
          warn!(connection = %self.name(), url, error = %err, "skipping unreadable database");
          continue;
        }
      };
      for candidate in candidates {
        let currently_on = self
          .resource_filters
          .get(&resource.label)
          .and_then(|by_type| by_type.get(&candidate.filter_type))
          .and_then(|online| online.get(&candidate.id))
          .copied()
          .unwrap_or(false);
        resource_filters
          .entry(resource.label.clone())
          .or_default()
          .entry(candidate.filter_type)
          .or_default()
          .insert(candidate.id.clone(), currently_on);
        id_to_name
          .entry(candidate.filter_type)
          .or_default()
          .insert(candidate.id, candidate.name);
      }
    }
    self.resource_filters = resource_filters;
    self.id_to_name = id_to_name;
  }

  /// Flips activation flags for the given resource label and filter type.
  pub fn set_online(&mut self, label: &str, filter_type: FilterType, online: &BTreeMap<String, bool>) {
    let current = self
      .resource_filters
      .entry(label.to_string())
      .or_default()
      .entry(filter_type)
      .or_default();
    for (id, flag) in online {
      current.insert(id.clone(), *flag);
    }
  }

  /// The display name behind a filter value id, when known.
  pub fn id_to_name(&self, filter_type: FilterType, id: &str) -> Option<&str> {
    self
      .id_to_name
      .get(&filter_type)
      .and_then(|names| names.get(id))
      .map(String::as_str)
  }

  fn online_filters(&self, label: &str, filter_type: FilterType) -> Vec<Filter> {
    let Some(online) = self
      .resource_filters
      .get(label)
      .and_then(|by_type| by_type.get(&filter_type))
    else {
      return Vec::new();
    };
    online
      .iter()
      .filter(|(_, on)| **on)
      .map(|(id, _)| {
        let name = self
          .id_to_name(filter_type, id)
          .unwrap_or(id.as_str())
          .to_string();
        Filter::new(filter_type, name)
      })
      .collect()
  }

  /// The filter stacks a resource label fans out into on this edge.
  ///
  /// The stacks are the Cartesian product over filter types, each axis being
  /// the active filters of that type; a type with no active filter
  /// contributes nothing to the product. No active filters at all yields an
  /// empty list (no expansion).
  pub fn filter_stacks(&self, label: &str) -> Vec<FilterStack> {
    let axes: Vec<Vec<Filter>> = FilterType::ALL
      .iter()
      .map(|filter_type| self.online_filters(label, *filter_type))
      .filter(|axis| !axis.is_empty())
      .collect();
    if axes.is_empty() {
      return Vec::new();
    }
    let mut stacks: Vec<Vec<Filter>> = vec![Vec::new()];
    for axis in &axes {
      let mut next = Vec::with_capacity(stacks.len() * axis.len());
      for stack in &stacks {
        for filter in axis {
          let mut extended = stack.clone();
          extended.push(filter.clone());
          next.push(extended);
        }
      }
      stacks = next;
    }
    stacks.into_iter().map(FilterStack::new).collect()
  }

  /// Forward-only resource conversion.
  ///
  /// With `use_datapackage` on, the CSV file resources are replaced by a
  /// single `datapackage.json` file resource written next to them; everything
  /// else passes through unchanged.
  pub fn convert_resources(&self, resources: Vec<Resource>) -> Result<Vec<Resource>, WorkflowError> {
    if !self.options.use_datapackage {
      return Ok(resources);
    }
    let mut converted = Vec::with_capacity(resources.len());
    let mut csv_paths: Vec<PathBuf> = Vec::new();
    for resource in resources {
      let is_csv = resource
        .path()
        .is_some_and(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("csv")));
      if is_csv {
        if let Some(path) = resource.path() {
          csv_paths.push(path);
          continue;
        }
      }
      converted.push(resource);
    }
    if csv_paths.is_empty() {
      return Ok(converted);
    }
    let base = common_parent(&csv_paths);
    let descriptor_path = base.join("datapackage.json");
    let descriptor = serde_json::json!({
      "resources": csv_paths
        .iter()
        .map(|p| {
          let relative = p.strip_prefix(&base).unwrap_or(p);
          serde_json::json!({"path": relative.to_string_lossy()})
        })
        .collect::<Vec<_>>(),
    });
    std::fs::write(
      &descriptor_path,
      serde_json::to_vec_pretty(&descriptor).unwrap_or_default(),
    )
    .map_err(|source| WorkflowError::Datapackage {
      path: descriptor_path.to_string_lossy().into_owned(),
      source,
    })?;
    converted.push(Resource::labelled_file(
      self.source.clone(),
      format!("datapackage@{}", self.source),
      descriptor_path.to_string_lossy().into_owned(),
    ));
    Ok(converted)
  }

  /// The serialized form of this connection. Only online filter ids are kept.
  pub fn to_def(&self) -> ConnectionDef {
    let mut resource_filters: BTreeMap<String, BTreeMap<FilterType, Vec<String>>> = BTreeMap::new();
    for (label, by_type) in &self.resource_filters {
      for (filter_type, online) in by_type {
        let ids: Vec<String> = online
          .iter()
          .filter(|(_, on)| **on)
          .map(|(id, _)| id.clone())
          .collect();
        if !ids.is_empty() {
          resource_filters
            .entry(label.clone())
            .or_default()
            .insert(*filter_type, ids);
        }
      }
    }
    ConnectionDef {
      from: (self.source.clone(), self.source_anchor.clone()),
      to: (self.destination.clone(), self.destination_anchor.clone()),
      resource_filters,
      options: self.options,
    }
  }

  /// Restores a connection from its serialized form.
  pub fn from_def(def: ConnectionDef) -> Self {
    let mut connection = Connection::new(def.from.0, def.from.1, def.to.0, def.to.1)
      .with_options(def.options);
    for (label, by_type) in def.resource_filters {
      for (filter_type, ids) in by_type {
        connection = connection.with_enabled_filters(label.clone(), filter_type, ids);
      }
    }
    connection
  }
}

impl PartialEq for Connection {
  fn eq(&self, other: &Self) -> bool {
    // Fetched database items are transient state; equality covers the
    // serialized identity.
    self.source == other.source
      && self.source_anchor == other.source_anchor
      && self.destination == other.destination
      && self.destination_anchor == other.destination_anchor
      && self.resource_filters == other.resource_filters
      && self.options == other.options
  }
}

/// Serialized form of a [`Connection`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDef {
  pub from: (String, String),
  pub to: (String, String),
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub resource_filters: BTreeMap<String, BTreeMap<FilterType, Vec<String>>>,
  #[serde(default, skip_serializing_if = "ConnectionOptions::is_default")]
  pub options: ConnectionOptions,
}

/// The deepest directory containing every given path.
fn common_parent(paths: &[PathBuf]) -> PathBuf {
  let mut iter = paths.iter();
  let Some(first) = iter.next() else {
    return PathBuf::new();
  };
  let mut base: PathBuf = first.parent().map(Path::to_path_buf).unwrap_or_default();
  for path in iter {
    while !path.starts_with(&base) {
      if !base.pop() {
        return PathBuf::new();
      }
    }
  }
  base
}
