//! Serializable experiment description used to populate a registry

use serde::{Deserialize, Serialize};

use super::registry::ExperimentRegistry;
use super::types::{ExperimentError, ExperimentSettings};

/// Declarative description of an experiment's plates, wells and sites
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentDescription {
    pub name: String,
    #[serde(flatten)]
    pub settings: ExperimentSettings,
    pub channels: Vec<ChannelDescription>,
    pub plates: Vec<PlateDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDescription {
    pub name: String,
    #[serde(default = "default_bit_depth")]
    pub bit_depth: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlateDescription {
    pub name: String,
    pub wells: Vec<WellDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WellDescription {
    pub name: String,
    pub sites: Vec<SiteDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteDescription {
    pub row: u32,
    pub col: u32,
    #[serde(default)]
    pub omitted: bool,
}

fn default_bit_depth() -> u8 {
    16
}

impl ExperimentDescription {
    /// Parse a JSON description
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Build a registry, failing on the first configuration error
    pub fn into_registry(self) -> Result<ExperimentRegistry, ExperimentError> {
        if self.plates.is_empty() {
            return Err(ExperimentError::NoPlates);
        }

        let mut registry = ExperimentRegistry::new(self.name, self.settings)?;
        for channel in self.channels {
            registry.add_channel(channel.name, channel.bit_depth)?;
        }
        for plate in self.plates {
            let plate_id = registry.add_plate(plate.name)?;
            for well in plate.wells {
                let well_id = registry.add_well(plate_id, &well.name)?;
                for site in well.sites {
                    registry.add_site(
                        well_id,
                        site.row,
                        site.col,
                        self.settings.site_size,
                        site.omitted,
                    )?;
                }
            }
        }
        Ok(registry)
    }
}
