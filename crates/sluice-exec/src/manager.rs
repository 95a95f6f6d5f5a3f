//! The execution manager contract.

use async_trait::async_trait;

use crate::error::ExecError;

/// Runs one item's external computation and reports its exit status.
///
/// Implementations own their subprocess or kernel client and relay its output
/// through the item's logger. A non-zero return value means the computation
/// failed; by convention managers return `-1` for infrastructure failures.
#[async_trait]
pub trait ExecutionManager: Send {
  async fn run_until_complete(&mut self) -> Result<i32, ExecError>;

  /// Requests cooperative termination; must not block.
  fn stop_execution(&self);
}
