//! Integer code tables for enumerated string fields.

/// A fixed mapping between stored integer codes and their public values.
#[derive(Debug, PartialEq, Eq)]
pub struct CodeTable {
    pub name: &'static str,
    entries: &'static [(i64, &'static str)],
}

impl CodeTable {
    pub fn value_of(&self, code: i64) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| *v)
    }

    pub fn code_of(&self, value: &str) -> Option<i64> {
        self.entries
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(c, _)| *c)
    }
}

pub static ENCODING_TYPES: CodeTable = CodeTable {
    name: "encodingType",
    entries: &[
        (0, "unknown"),
        (1, "application/vnd.geo+json"),
        (2, "application/pdf"),
        (3, "http://www.opengis.net/doc/IS/SensorML/2.0"),
    ],
};

pub static OBSERVATION_TYPES: CodeTable = CodeTable {
    name: "observationType",
    entries: &[
        (
            0,
            "http://www.opengis.net/def/observationType/OGC-OM/2.0/OM_CategoryObservation",
        ),
        (
            1,
            "http://www.opengis.net/def/observationType/OGC-OM/2.0/OM_CountObservation",
        ),
        (
            2,
            "http://www.opengis.net/def/observationType/OGC-OM/2.0/OM_Measurement",
        ),
        (
            3,
            "http://www.opengis.net/def/observationType/OGC-OM/2.0/OM_Observation",
        ),
        (
            4,
            "http://www.opengis.net/def/observationType/OGC-OM/2.0/OM_TruthObservation",
        ),
    ],
};
