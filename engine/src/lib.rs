//! tmaps engine library
//!
//! Builds zoomable image pyramids from multi-well microscopy acquisitions
//! and indexes segmented objects for tile-scoped lookups.

pub mod config;
pub mod experiment;
pub mod grid;
pub mod partition;
pub mod pyramid;
pub mod segmentation;
pub mod teardown;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types
pub use config::Config;
pub use experiment::{ExperimentDescription, ExperimentRegistry};
pub use grid::GridLayout;
pub use partition::{PartitionKey, PartitionPolicy};
pub use pyramid::{PyramidBuilder, PyramidLayout, TileStore};
pub use segmentation::{SegmentationStore, SpatialQueryEngine};
pub use teardown::{TeardownError, TeardownReport, delete_experiment, delete_plate};
