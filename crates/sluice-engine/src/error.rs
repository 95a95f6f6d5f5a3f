//! Engine error types.

/// Errors surfaced before or during a run.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  /// The adjacency is not a DAG.
  #[error("invalid workflow graph: {message}")]
  InvalidDag { message: String },

  /// Item definitions, types or specifications do not line up.
  #[error("workflow setup error: {message}")]
  Setup { message: String },
}
