//! Sluice Engine
//!
//! The coordination layer between a workbench and the computations its
//! project items perform. The engine owns the DAG, runs a backward resource
//! gathering sweep followed by the forward execution sweep, expands item
//! executions over filter combinations, and publishes a cancellable event
//! stream.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Engine                           │
//! │  run() ── backward sweep ──▶ forward sweep ──▶ outcome   │
//! │    │            │                  │                     │
//! │    │            ▼                  ▼                     │
//! │    │      task executor      fan-out per node            │
//! │    │    (ready-set admission, │  (filter combinations,   │
//! │    │     priority, skipping)  │   one task per combo)    │
//! │    ▼                          ▼                          │
//! │  EventStream ◀── bounded channel ◀── QueueLogger/engine  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let (engine, mut stream) = Engine::new(setup, registry);
//! engine.run();
//! while let Some(event) = stream.next().await {
//!   // feed the workbench
//! }
//! ```

mod engine;
mod error;
mod fanout;
mod scheduler;

pub use engine::{Engine, EngineSetup, EventStream};
pub use error::EngineError;
