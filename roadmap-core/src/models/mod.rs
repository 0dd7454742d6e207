//! Domain models for the roadmap engine.
//!
//! # Core Concepts
//!
//! - [`RoadmapStep`]: A node of the roadmap. Steps depend on other steps
//!   (forming a DAG), nest under a parent step, and belong to one phase.
//! - [`Phase`]: A milestone grouping of steps with a declared order and
//!   prerequisite phases.
//! - [`RoadmapManifest`](crate::graph::RoadmapManifest): The authoritative
//!   document holding every step and phase of one tree, plus its version.
//!
//! ## Records
//!
//! - [`AuditRecord`]: Append-only log of every operation on a tree.
//! - [`ExpansionRecord`]: Fingerprints of applied expansions, used to collapse
//!   retried requests.

mod audit;
mod expansion;
mod phase;
mod step;

pub use audit::*;
pub use expansion::*;
pub use phase::*;
pub use step::*;
