//! Sluice Exec
//!
//! Execution managers for sluice project items:
//!
//! - [`ProcessExecutionManager`]: one-shot subprocess, pipes drained into
//!   the item's logger.
//! - [`PersistentManager`] / [`PersistentManagerPool`]: long-running
//!   interactive interpreters (python, julia) with sentinel-synchronised
//!   commands, shared across items by `(argv, group id)`.
//! - [`KernelManager`] / [`KernelManagerPool`]: Jupyter-style kernels
//!   shared by `(kernel name, group id)`, addressable by connection file,
//!   with conda environments synthesized into kernel specs on demand.
//!
//! Pools are explicit services: callers create them, hand them to items, and
//! shut them down at the end of a run.

mod conda;
mod error;
mod kernel;
mod manager;
mod persistent;
mod process;
mod signal;

pub use conda::{CondaKernelSpecManager, CONDA_SPEC_CACHE_TTL};
pub use error::ExecError;
pub use kernel::{
  find_kernel_specs, ConnectionInfo, InstalledKernelSpecs, KernelChannels, KernelChannelsFactory,
  KernelExecutionManager, KernelIoMessage, KernelKey, KernelLaunchOptions, KernelManager,
  KernelManagerPool, KernelReplyStatus, KernelSpec, KernelSpecProvider, DEFAULT_STARTUP_TIMEOUT,
};
pub use manager::ExecutionManager;
pub use persistent::{
  JuliaLanguage, PersistentExecutionManager, PersistentKey, PersistentLanguage,
  PersistentManager, PersistentManagerPool, PythonLanguage, ReplMessage, ReplMessageKind,
  REPL_PORT_MARKER,
};
pub use process::ProcessExecutionManager;
