//! Experiment layout module
//!
//! Plates, wells, sites and channels as registered during experiment setup.

pub mod description;
pub mod names;
pub mod registry;
pub mod types;

pub use description::ExperimentDescription;
pub use names::{format_well_name, parse_well_name};
pub use registry::{ExperimentRegistry, RemovedPlate};
pub use types::{
    Channel, ChannelId, Direction, ExperimentError, ExperimentSettings, GridDims, Offset,
    PixelRect, PixelSize, Plate, PlateFormat, PlateId, Site, SiteId, Well, WellId,
};
