//! Workflow-level error types.

/// Errors raised by the data model and item registry.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
  /// The item type is not registered.
  #[error("unknown item type '{item_type}'")]
  UnknownItemType { item_type: String },

  /// The item references a specification that was never defined.
  #[error("item '{item_name}' references missing specification '{specification}'")]
  MissingSpecification {
    item_name: String,
    specification: String,
  },

  /// The item definition is malformed.
  #[error("invalid definition for item '{item_name}': {message}")]
  InvalidDefinition { item_name: String, message: String },

  /// A specification definition is malformed.
  #[error("invalid specification for item type '{item_type}': {message}")]
  InvalidSpecification { item_type: String, message: String },

  /// Resource substitution with mismatched labels.
  #[error("cannot replace resource '{old_label}' with '{new_label}': labels differ")]
  LabelMismatch {
    old_label: String,
    new_label: String,
  },

  /// Reading filter candidates from a database failed.
  #[error("failed to read filter candidates from '{url}': {message}")]
  DatabaseRead { url: String, message: String },

  /// Writing the datapackage descriptor failed.
  #[error("failed to write datapackage at '{path}'")]
  Datapackage {
    path: String,
    #[source]
    source: std::io::Error,
  },
}
