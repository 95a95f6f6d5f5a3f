//! Explicit item registry.
//!
//! Concrete project item types are registered at startup as a mapping from
//! item type to an item constructor and an optional specification factory.
//! The engine validates every DAG node against this registry before running
//! anything.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::WorkflowError;
use crate::item::ExecutableItem;
use crate::logger::QueueLogger;
use crate::settings::AppSettings;

/// A named, typed bundle of configuration shared by items of one type.
#[derive(Debug, Clone)]
pub struct Specification {
  pub name: String,
  pub item_type: String,
  pub data: serde_json::Value,
}

/// Everything an item constructor gets to work with.
pub struct ItemContext<'a> {
  pub name: &'a str,
  pub definition: &'a serde_json::Value,
  pub project_dir: &'a Path,
  pub settings: &'a AppSettings,
  pub specification: Option<&'a Specification>,
  pub logger: QueueLogger,
}

type ItemConstructor =
  dyn Fn(ItemContext<'_>) -> Result<Arc<dyn ExecutableItem>, WorkflowError> + Send + Sync;

type SpecificationFactory =
  dyn Fn(&serde_json::Value, &AppSettings) -> Result<Specification, WorkflowError> + Send + Sync;

/// Registry entry for one item type.
pub struct ItemEntry {
  constructor: Box<ItemConstructor>,
  specification_factory: Option<Box<SpecificationFactory>>,
}

/// Maps item types to their constructors and specification factories.
#[derive(Default)]
pub struct ItemRegistry {
  entries: HashMap<String, ItemEntry>,
}

impl ItemRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers an item type without specification support.
  pub fn register<F>(&mut self, item_type: impl Into<String>, constructor: F)
  where
    F: Fn(ItemContext<'_>) -> Result<Arc<dyn ExecutableItem>, WorkflowError>
      + Send
      + Sync
      + 'static,
  {
    self.entries.insert(
      item_type.into(),
      ItemEntry {
        constructor: Box::new(constructor),
        specification_factory: None,
      },
    );
  }

  /// Registers an item type together with its specification factory.
  pub fn register_with_specifications<F, S>(
    &mut self,
    item_type: impl Into<String>,
    constructor: F,
    specification_factory: S,
  ) where
    F: Fn(ItemContext<'_>) -> Result<Arc<dyn ExecutableItem>, WorkflowError>
      + Send
      + Sync
      + 'static,
    S: Fn(&serde_json::Value, &AppSettings) -> Result<Specification, WorkflowError>
      + Send
      + Sync
      + 'static,
  {
    self.entries.insert(
      item_type.into(),
      ItemEntry {
        constructor: Box::new(constructor),
        specification_factory: Some(Box::new(specification_factory)),
      },
    );
  }

  pub fn contains(&self, item_type: &str) -> bool {
    self.entries.contains_key(item_type)
  }

  /// Instantiates an item of the given type.
  pub fn make_item(
    &self,
    item_type: &str,
    context: ItemContext<'_>,
  ) -> Result<Arc<dyn ExecutableItem>, WorkflowError> {
    let entry = self
      .entries
      .get(item_type)
      .ok_or_else(|| WorkflowError::UnknownItemType {
        item_type: item_type.to_string(),
      })?;
    (entry.constructor)(context)
  }

  /// Builds a specification for the given item type, when the type supports
  /// specifications.
  pub fn make_specification(
    &self,
    item_type: &str,
    definition: &serde_json::Value,
    settings: &AppSettings,
  ) -> Result<Option<Specification>, WorkflowError> {
    let entry = self
      .entries
      .get(item_type)
      .ok_or_else(|| WorkflowError::UnknownItemType {
        item_type: item_type.to_string(),
      })?;
    match &entry.specification_factory {
      Some(factory) => factory(definition, settings).map(Some),
      None => Ok(None),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::item::{ExecutionDirection, FinishState};
  use crate::resource::Resource;
  use async_trait::async_trait;
  use tokio::sync::mpsc;

  struct NullItem {
    name: String,
  }

  #[async_trait]
  impl ExecutableItem for NullItem {
    fn name(&self) -> &str {
      &self.name
    }

    async fn execute(&self, _forward: &[Resource], _backward: &[Resource]) -> FinishState {
      FinishState::Success
    }

    fn output_resources(&self, _direction: ExecutionDirection) -> Vec<Resource> {
      Vec::new()
    }
  }

  fn context<'a>(
    name: &'a str,
    definition: &'a serde_json::Value,
    settings: &'a AppSettings,
    logger: QueueLogger,
  ) -> ItemContext<'a> {
    ItemContext {
      name,
      definition,
      project_dir: Path::new("."),
      settings,
      specification: None,
      logger,
    }
  }

  #[test]
  fn unknown_type_is_an_error() {
    let registry = ItemRegistry::new();
    let (tx, _rx) = mpsc::channel(1);
    let logger = QueueLogger::new(tx, "X", crate::PromptBroker::new());
    let definition = serde_json::json!({});
    let settings = AppSettings::default();
    let err = registry
      .make_item("importer", context("X", &definition, &settings, logger))
      .unwrap_err();
    assert!(matches!(err, WorkflowError::UnknownItemType { .. }));
  }

  #[test]
  fn registered_constructor_is_used() {
    let mut registry = ItemRegistry::new();
    registry.register("null", |ctx| {
      Ok(Arc::new(NullItem {
        name: ctx.name.to_string(),
      }) as Arc<dyn ExecutableItem>)
    });
    let (tx, _rx) = mpsc::channel(1);
    let logger = QueueLogger::new(tx, "X", crate::PromptBroker::new());
    let definition = serde_json::json!({"type": "null"});
    let settings = AppSettings::default();
    let item = registry
      .make_item("null", context("X", &definition, &settings, logger))
      .unwrap();
    assert_eq!(item.name(), "X");
    assert!(registry.contains("null"));
  }
}
