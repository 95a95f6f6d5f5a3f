//! Execution manager error types.

use std::time::Duration;

/// Errors raised by the process, persistent and kernel managers.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
  /// Spawning a subprocess failed.
  #[error("failed to start '{program}'")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  /// The interpreter never printed its helper-port marker.
  #[error("interpreter did not report its helper port within {timeout:?}")]
  HelperStartupTimeout { timeout: Duration },

  /// The persistent interpreter is gone.
  #[error("persistent interpreter is not running")]
  NotRunning,

  /// A request to the in-child helper failed.
  #[error("helper request '{request}' failed")]
  HelperRequest {
    request: String,
    #[source]
    source: std::io::Error,
  },

  /// No kernel spec with that name is installed.
  #[error("kernel spec '{kernel_name}' not found")]
  KernelSpecNotFound { kernel_name: String },

  /// The kernel spec names an executable that does not exist.
  #[error("kernel spec '{kernel_name}' points at missing executable '{path}'")]
  KernelExecutableNotFound { kernel_name: String, path: String },

  /// The kernel never reported ready.
  #[error("kernel '{kernel_name}' did not become ready within {timeout:?}")]
  KernelStartupTimeout {
    kernel_name: String,
    timeout: Duration,
  },

  /// Writing the kernel connection file failed.
  #[error("failed to write kernel connection file '{path}'")]
  ConnectionFile {
    path: String,
    #[source]
    source: std::io::Error,
  },

  /// `conda env list` failed or returned garbage.
  #[error("conda environment discovery failed: {message}")]
  CondaDiscovery { message: String },

  /// The pool has been closed; no new managers are created.
  #[error("the manager pool is closed")]
  PoolClosed,
}
