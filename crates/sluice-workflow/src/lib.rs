//! Sluice Workflow
//!
//! This crate provides the data model and contracts shared by the sluice
//! engine and its execution managers:
//!
//! - [`Resource`]: a typed descriptor of a file, database URL or file pack
//!   flowing between project items.
//! - [`FilterStack`]: an ordered sequence of filters applied to a database
//!   resource, with a deterministic [`FilterStack::filter_id`].
//! - [`Connection`]: a directed edge that relabels and converts resources
//!   and stores per-resource filter activations.
//! - [`ExecutableItem`]: the contract the engine drives; concrete items are
//!   registered in an [`ItemRegistry`] at startup.
//! - [`Event`] and [`QueueLogger`]: the observable event stream and the
//!   item-scoped handle that feeds it.

mod connection;
mod error;
mod event;
mod filter;
mod item;
mod logger;
mod registry;
mod resource;
mod settings;

pub use connection::{Connection, ConnectionDef, ConnectionOptions, DatabaseReader, FilterCandidate};
pub use error::WorkflowError;
pub use event::{EngineState, Event, MessageKind};
pub use filter::{composite_filter_id, filtered_url, Filter, FilterStack, FilterType};
pub use item::{ExecutableItem, ExecutionDirection, FinishState};
pub use logger::{PromptBroker, QueueLogger};
pub use registry::{ItemContext, ItemEntry, ItemRegistry, Specification};
pub use resource::{Resource, ResourceKind, ResourceMetadata};
pub use settings::{
  find_in_path, resolve_conda_executable, resolve_gams_executable, resolve_julia_command,
  resolve_python_interpreter, AppSettings, EMBEDDED_PYTHON,
};
