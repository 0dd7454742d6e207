//! Core library for the roadmap engine: the roadmap graph model, cycle
//! detection, and persistence.

pub mod db;
pub mod error;
pub mod graph;
pub mod models;
pub mod repository;

pub use error::{GraphError, RepositoryError};
pub use graph::{Cycle, CycleDetector, InputError, RoadmapManifest};
pub use repository::{
    ManifestCommit, MemoryRepository, RoadmapRepository, SaveOutcome, StepRecord,
};
