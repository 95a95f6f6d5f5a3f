//! The executable item contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::resource::Resource;

/// Direction of a sweep over the DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionDirection {
  Forward,
  Backward,
}

impl std::fmt::Display for ExecutionDirection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ExecutionDirection::Forward => write!(f, "FORWARD"),
      ExecutionDirection::Backward => write!(f, "BACKWARD"),
    }
  }
}

/// How one item's execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishState {
  Success,
  Failure,
  /// Short-circuited because an upstream item failed or was stopped.
  Skipped,
  /// Not in the execution permit set; resources were passed through.
  Excluded,
  Stopped,
  NeverFinished,
}

impl std::fmt::Display for FinishState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      FinishState::Success => "SUCCESS",
      FinishState::Failure => "FAILURE",
      FinishState::Skipped => "SKIPPED",
      FinishState::Excluded => "EXCLUDED",
      FinishState::Stopped => "STOPPED",
      FinishState::NeverFinished => "NEVER_FINISHED",
    };
    write!(f, "{}", name)
  }
}

/// The contract between the engine and a project item implementation.
///
/// Items are instantiated through the [`crate::ItemRegistry`]: once per sweep
/// direction, plus once per forward sub-execution, and dropped at run end.
/// Implementations must be cancellation-safe: [`ExecutableItem::execute`] may
/// be abandoned when the run is stopped.
#[async_trait]
pub trait ExecutableItem: Send + Sync {
  fn name(&self) -> &str;

  /// Items sharing a group id also share persistent/kernel managers.
  fn group_id(&self) -> Option<&str> {
    None
  }

  /// Whether the item has everything it needs for a forward execution.
  fn ready_to_execute(&self) -> bool {
    true
  }

  /// Executes the item with the given filtered forward and backward
  /// resources.
  async fn execute(&self, forward: &[Resource], backward: &[Resource]) -> FinishState;

  /// Called instead of [`ExecutableItem::execute`] when the item is not
  /// permitted, so it may forward resources unchanged.
  async fn exclude_execution(&self, _forward: &[Resource], _backward: &[Resource]) {}

  /// The resources this item makes available in the given direction.
  fn output_resources(&self, direction: ExecutionDirection) -> Vec<Resource>;

  /// Requests cooperative termination of an in-flight execution.
  fn stop_execution(&self) {}
}

impl std::fmt::Debug for dyn ExecutableItem {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ExecutableItem").field("name", &self.name()).finish()
  }
}
