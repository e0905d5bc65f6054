use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// The eight fixed SensorThings entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum EntityType {
    Thing,
    Location,
    HistoricalLocation,
    Sensor,
    ObservedProperty,
    Datastream,
    Observation,
    FeatureOfInterest,
}

impl EntityType {
    pub const ALL: [EntityType; 8] = [
        EntityType::Thing,
        EntityType::Location,
        EntityType::HistoricalLocation,
        EntityType::Sensor,
        EntityType::ObservedProperty,
        EntityType::Datastream,
        EntityType::Observation,
        EntityType::FeatureOfInterest,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EntityType::Thing => "Thing",
            EntityType::Location => "Location",
            EntityType::HistoricalLocation => "HistoricalLocation",
            EntityType::Sensor => "Sensor",
            EntityType::ObservedProperty => "ObservedProperty",
            EntityType::Datastream => "Datastream",
            EntityType::Observation => "Observation",
            EntityType::FeatureOfInterest => "FeatureOfInterest",
        }
    }

    /// Entity set name used in resource paths and self links.
    pub fn set_name(&self) -> &'static str {
        match self {
            EntityType::Thing => "Things",
            EntityType::Location => "Locations",
            EntityType::HistoricalLocation => "HistoricalLocations",
            EntityType::Sensor => "Sensors",
            EntityType::ObservedProperty => "ObservedProperties",
            EntityType::Datastream => "Datastreams",
            EntityType::Observation => "Observations",
            EntityType::FeatureOfInterest => "FeaturesOfInterest",
        }
    }

    /// Case-insensitive lookup by entity set name.
    pub fn from_set_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.set_name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown entity type: {}", s))
    }
}
