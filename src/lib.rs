//! Roadmap engine: keeps a roadmap of dependent steps acyclic and consistent
//! while steps are completed, phases roll over and branches grow.
//!
//! The data model, cycle detection and persistence live in [`roadmap_core`];
//! this crate holds the transactional operations on top of it.

pub mod collaborators;
pub mod completion;
pub mod config;
pub mod engine;
pub mod error;
pub mod expansion;
pub mod phase;
pub mod render;
pub mod transaction;

pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use roadmap_core;
