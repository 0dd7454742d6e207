//! The roadmap graph: the validated manifest and the cycle detector guarding it.

mod cycle;
mod manifest;

pub use cycle::{Cycle, CycleDetector};
pub use manifest::{InputError, RoadmapManifest};
