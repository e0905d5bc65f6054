//! Static entity/relationship metadata.
//!
//! The registry is built once at startup and is read-only afterwards. It
//! answers four questions for the compiler and the materializer:
//!
//! - which table stores an entity type ([`Registry::table_of`])
//! - which column or expression backs a field ([`Registry::column_of`])
//! - how rows of one type are constrained by a row of another
//!   ([`Registry::relation_fragment`])
//! - which navigation field a child is attached to ([`Registry::attachment_field`])
//!
//! Every relation is declared explicitly in both directions; nothing is
//! inferred. [`Registry::new`] checks that the declarations are exhaustive
//! and consistent, so a missing pair fails at startup rather than at
//! request time.

use crate::codes::{CodeTable, ENCODING_TYPES, OBSERVATION_TYPES};
use crate::entity_type::EntityType;
use crate::error::{QueryError, RegistryError, Result};
use crate::value::ColumnKind;
use std::collections::HashMap;

/// Column aliases ending in this suffix mark the start of a branch in a result row.
pub const IDENTITY_SUFFIX: &str = "_id";

/// Static type of a field, used to pick the decoded column representation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind {
    Identity,
    Integer,
    Text,
    Json,
    Geometry,
    Timestamp,
    /// Integer code mapped to a public string value
    Code(&'static CodeTable),
}

impl FieldKind {
    pub fn column_kind(&self) -> ColumnKind {
        match self {
            FieldKind::Identity | FieldKind::Integer | FieldKind::Code(_) => ColumnKind::Integer,
            FieldKind::Text | FieldKind::Timestamp => ColumnKind::Text,
            FieldKind::Json => ColumnKind::Json,
            FieldKind::Geometry => ColumnKind::Geometry,
        }
    }
}

/// How a field's value is read from its table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColumnExpr {
    /// The bare column
    Column,
    /// Geometry column rendered as GeoJSON text
    Geometry,
    /// Key inside the JSONB `data` column
    DataKey(&'static str),
    /// `timestamptz` column rendered as ISO-8601 UTC text
    Timestamp,
    /// Free-form select template; `{t}` is the table alias, `{s}` the schema prefix
    Template(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldDef {
    /// Public field name
    pub name: &'static str,
    /// Storage column, also the stem of the result alias
    pub column: &'static str,
    pub expr: ColumnExpr,
    pub kind: FieldKind,
}

impl FieldDef {
    pub const IDENTITY: FieldDef = FieldDef {
        name: "id",
        column: "id",
        expr: ColumnExpr::Column,
        kind: FieldKind::Identity,
    };

    const fn column(name: &'static str, column: &'static str, kind: FieldKind) -> Self {
        FieldDef {
            name,
            column,
            expr: ColumnExpr::Column,
            kind,
        }
    }

    const fn geometry(name: &'static str, column: &'static str) -> Self {
        FieldDef {
            name,
            column,
            expr: ColumnExpr::Geometry,
            kind: FieldKind::Geometry,
        }
    }

    const fn data_key(name: &'static str, column: &'static str) -> Self {
        FieldDef {
            name,
            column,
            expr: ColumnExpr::DataKey(name),
            kind: FieldKind::Json,
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self.kind, FieldKind::Identity)
    }

    /// Expression placed in a select list.
    pub fn select_expr(&self, alias: &str, schema_prefix: &str) -> String {
        match self.expr {
            ColumnExpr::Column => format!("{}.{}", alias, self.column),
            ColumnExpr::Geometry => format!("public.ST_AsGeoJSON({}.{})", alias, self.column),
            ColumnExpr::DataKey(key) => format!("{}.data -> '{}'", alias, key),
            ColumnExpr::Timestamp => format!(
                "to_char({}.{} AT TIME ZONE 'UTC', 'YYYY-MM-DD\"T\"HH24:MI:SS.MS\"Z\"')",
                alias, self.column
            ),
            ColumnExpr::Template(template) => template
                .replace("{s}", schema_prefix)
                .replace("{t}", alias),
        }
    }

    /// Expression used in comparisons and ordering, before any text conversion.
    pub fn compare_expr(&self, alias: &str, schema_prefix: &str) -> String {
        match self.expr {
            ColumnExpr::Column | ColumnExpr::Geometry | ColumnExpr::Timestamp => {
                format!("{}.{}", alias, self.column)
            }
            ColumnExpr::DataKey(_) | ColumnExpr::Template(_) => {
                self.select_expr(alias, schema_prefix)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

/// A named relation field on an entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Navigation {
    pub name: &'static str,
    pub target: EntityType,
    pub cardinality: Cardinality,
}

impl Navigation {
    const fn one(name: &'static str, target: EntityType) -> Self {
        Navigation {
            name,
            target,
            cardinality: Cardinality::One,
        }
    }

    const fn many(name: &'static str, target: EntityType) -> Self {
        Navigation {
            name,
            target,
            cardinality: Cardinality::Many,
        }
    }
}

/// How `target` rows are constrained by one `source` row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Relation {
    /// `target.target_column = source.source_column`
    Column {
        target_column: &'static str,
        source_column: &'static str,
    },
    /// Many-to-many through a link table keyed by both identities
    Link {
        table: &'static str,
        target_key: &'static str,
        source_key: &'static str,
    },
}

/// How a relation refers to the row it is correlated with.
#[derive(Debug, Clone, Copy)]
pub enum SourceRef<'a> {
    /// A table (or derived table) exposing raw column names
    Table(&'a str),
    /// A lateral branch exposing `<table>_<column>` aliases
    Branch { alias: &'a str, table: &'a str },
}

impl SourceRef<'_> {
    pub fn column(&self, column: &str) -> String {
        match self {
            SourceRef::Table(alias) => format!("{}.{}", alias, column),
            SourceRef::Branch { alias, table } => format!("{}.{}_{}", alias, table, column),
        }
    }
}

/// Rendered relation: an optional join clause plus the correlating condition.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationFragment {
    pub join: Option<String>,
    pub condition: String,
}

#[derive(Debug, Clone)]
pub struct EntityDef {
    pub entity_type: EntityType,
    pub table: &'static str,
    /// Non-identity fields in output order
    pub fields: Vec<FieldDef>,
    /// Columns other relations correlate against
    pub foreign_keys: Vec<&'static str>,
    pub navigations: Vec<Navigation>,
}

#[derive(Debug)]
pub struct Registry {
    schema: Option<String>,
    entities: Vec<EntityDef>,
    relations: HashMap<(EntityType, EntityType), Relation>,
}

impl Registry {
    /// Builds and validates a registry from explicit declarations.
    ///
    /// `relations` are `(target, source, relation)` triples: "target by source".
    pub fn new(
        schema: Option<&str>,
        entities: Vec<EntityDef>,
        relations: Vec<(EntityType, EntityType, Relation)>,
    ) -> std::result::Result<Self, RegistryError> {
        if let Some(schema) = schema {
            if !is_identifier(schema) {
                return Err(RegistryError::InvalidSchema(schema.to_string()));
            }
        }

        let mut ordered = Vec::with_capacity(EntityType::ALL.len());
        for entity_type in EntityType::ALL {
            let mut matching = entities.iter().filter(|e| e.entity_type == entity_type);
            let def = matching
                .next()
                .ok_or(RegistryError::MissingEntity(entity_type))?;
            if matching.next().is_some() {
                return Err(RegistryError::DuplicateEntity(entity_type));
            }
            ordered.push(def.clone());
        }

        let registry = Registry {
            schema: schema.map(str::to_string),
            entities: ordered,
            relations: relations
                .into_iter()
                .map(|(target, source, relation)| ((target, source), relation))
                .collect(),
        };
        registry.validate()?;
        Ok(registry)
    }

    /// The SensorThings data model.
    pub fn sensorthings(schema: Option<&str>) -> std::result::Result<Self, RegistryError> {
        Self::new(schema, sensorthings_entities(), sensorthings_relations())
    }

    fn validate(&self) -> std::result::Result<(), RegistryError> {
        for def in &self.entities {
            for field in &def.fields {
                if field.column.ends_with(IDENTITY_SUFFIX) {
                    return Err(RegistryError::ReservedSuffix {
                        entity: def.entity_type,
                        column: field.column,
                    });
                }
            }

            for (i, nav) in def.navigations.iter().enumerate() {
                if def.navigations[i + 1..]
                    .iter()
                    .any(|other| other.target == nav.target)
                {
                    return Err(RegistryError::AmbiguousAttachment {
                        entity: def.entity_type,
                        target: nav.target,
                    });
                }

                if self.attachment_field(nav.target, def.entity_type).is_none() {
                    return Err(RegistryError::MissingReverseNavigation {
                        entity: def.entity_type,
                        navigation: nav.name,
                    });
                }

                if !self.relations.contains_key(&(nav.target, def.entity_type)) {
                    return Err(RegistryError::MissingRelation {
                        target: nav.target,
                        by: def.entity_type,
                    });
                }
            }
        }

        for (&(target, source), relation) in &self.relations {
            if let Relation::Column {
                target_column,
                source_column,
            } = relation
            {
                for (entity_type, column) in [(target, *target_column), (source, *source_column)] {
                    let known = column == "id"
                        || self.entity(entity_type).foreign_keys.contains(&column);
                    if !known {
                        return Err(RegistryError::UnknownColumn {
                            target,
                            by: source,
                            column,
                        });
                    }
                }
            }
        }

        Ok(())
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// `"<schema>."`, or empty when no schema is configured.
    pub fn schema_prefix(&self) -> String {
        self.schema
            .as_ref()
            .map(|s| format!("{}.", s))
            .unwrap_or_default()
    }

    pub fn entity(&self, entity_type: EntityType) -> &EntityDef {
        // `new` stores exactly one definition per type, in `EntityType::ALL` order
        &self.entities[entity_type as usize]
    }

    /// Bare table name, also used as the table alias in generated SQL.
    pub fn table_alias(&self, entity_type: EntityType) -> &'static str {
        self.entity(entity_type).table
    }

    /// Schema-qualified table identifier.
    pub fn table_of(&self, entity_type: EntityType) -> String {
        self.qualify(self.entity(entity_type).table)
    }

    pub fn qualify(&self, table: &str) -> String {
        format!("{}{}", self.schema_prefix(), table)
    }

    /// Field lookup by public name, case-insensitive. `id` and `@iot.id` name the identity.
    pub fn column_of(&self, entity_type: EntityType, field: &str) -> Option<FieldDef> {
        if field.eq_ignore_ascii_case("id") || field == "@iot.id" {
            return Some(FieldDef::IDENTITY);
        }
        self.entity(entity_type)
            .fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(field))
            .copied()
    }

    pub fn fields(&self, entity_type: EntityType) -> &[FieldDef] {
        &self.entity(entity_type).fields
    }

    pub fn foreign_keys(&self, entity_type: EntityType) -> &[&'static str] {
        &self.entity(entity_type).foreign_keys
    }

    pub fn navigations(&self, entity_type: EntityType) -> &[Navigation] {
        &self.entity(entity_type).navigations
    }

    /// Navigation lookup by name, case-insensitive.
    pub fn navigation(&self, entity_type: EntityType, name: &str) -> Option<&Navigation> {
        self.navigations(entity_type)
            .iter()
            .find(|n| n.name.eq_ignore_ascii_case(name))
    }

    /// The field of `parent` a materialized `child` is assigned or appended to.
    pub fn attachment_field(&self, parent: EntityType, child: EntityType) -> Option<&Navigation> {
        self.navigations(parent).iter().find(|n| n.target == child)
    }

    pub fn relation(&self, target: EntityType, by: EntityType) -> Result<&Relation> {
        self.relations
            .get(&(target, by))
            .ok_or(QueryError::UndeclaredRelation { target, by })
    }

    /// Renders the relation constraining `target` rows (aliased `target_alias`)
    /// against the correlated `source` row of type `by`.
    pub fn relation_fragment(
        &self,
        target: EntityType,
        by: EntityType,
        target_alias: &str,
        source: SourceRef<'_>,
    ) -> Result<RelationFragment> {
        let fragment = match *self.relation(target, by)? {
            Relation::Column {
                target_column,
                source_column,
            } => RelationFragment {
                join: None,
                condition: format!(
                    "{}.{} = {}",
                    target_alias,
                    target_column,
                    source.column(source_column)
                ),
            },
            Relation::Link {
                table,
                target_key,
                source_key,
            } => RelationFragment {
                join: Some(format!(
                    "INNER JOIN {} AS {} ON {}.{} = {}.id",
                    self.qualify(table),
                    table,
                    table,
                    target_key,
                    target_alias
                )),
                condition: format!("{}.{} = {}", table, source_key, source.column("id")),
            },
        };
        Ok(fragment)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

const OBSERVED_AREA: &str = "public.ST_AsGeoJSON(COALESCE({t}.observedarea, \
(SELECT public.ST_ConvexHull(public.ST_Collect(foi.feature)) FROM {s}featureofinterest AS foi \
WHERE foi.id IN (SELECT DISTINCT o.featureofinterest_id FROM {s}observation AS o WHERE o.stream_id = {t}.id))))";

fn sensorthings_entities() -> Vec<EntityDef> {
    use EntityType::*;

    let encoding = FieldKind::Code(&ENCODING_TYPES);
    vec![
        EntityDef {
            entity_type: Thing,
            table: "thing",
            fields: vec![
                FieldDef::column("name", "name", FieldKind::Text),
                FieldDef::column("description", "description", FieldKind::Text),
                FieldDef::column("properties", "properties", FieldKind::Json),
            ],
            foreign_keys: vec![],
            navigations: vec![
                Navigation::many("Locations", Location),
                Navigation::many("HistoricalLocations", HistoricalLocation),
                Navigation::many("Datastreams", Datastream),
            ],
        },
        EntityDef {
            entity_type: Location,
            table: "location",
            fields: vec![
                FieldDef::column("name", "name", FieldKind::Text),
                FieldDef::column("description", "description", FieldKind::Text),
                FieldDef::column("encodingType", "encodingtype", encoding),
                FieldDef::geometry("location", "location"),
            ],
            foreign_keys: vec![],
            navigations: vec![
                Navigation::many("Things", Thing),
                Navigation::many("HistoricalLocations", HistoricalLocation),
            ],
        },
        EntityDef {
            entity_type: HistoricalLocation,
            table: "historicallocation",
            fields: vec![FieldDef {
                name: "time",
                column: "time",
                expr: ColumnExpr::Timestamp,
                kind: FieldKind::Timestamp,
            }],
            foreign_keys: vec!["thing_id"],
            navigations: vec![
                Navigation::many("Locations", Location),
                Navigation::one("Thing", Thing),
            ],
        },
        EntityDef {
            entity_type: Sensor,
            table: "sensor",
            fields: vec![
                FieldDef::column("name", "name", FieldKind::Text),
                FieldDef::column("description", "description", FieldKind::Text),
                FieldDef::column("encodingType", "encodingtype", encoding),
                FieldDef::column("metadata", "metadata", FieldKind::Text),
            ],
            foreign_keys: vec![],
            navigations: vec![Navigation::many("Datastreams", Datastream)],
        },
        EntityDef {
            entity_type: ObservedProperty,
            table: "observedproperty",
            fields: vec![
                FieldDef::column("name", "name", FieldKind::Text),
                FieldDef::column("definition", "definition", FieldKind::Text),
                FieldDef::column("description", "description", FieldKind::Text),
            ],
            foreign_keys: vec![],
            navigations: vec![Navigation::many("Datastreams", Datastream)],
        },
        EntityDef {
            entity_type: Datastream,
            table: "datastream",
            fields: vec![
                FieldDef::column("name", "name", FieldKind::Text),
                FieldDef::column("description", "description", FieldKind::Text),
                FieldDef::column("unitOfMeasurement", "unitofmeasurement", FieldKind::Json),
                FieldDef::column(
                    "observationType",
                    "observationtype",
                    FieldKind::Code(&OBSERVATION_TYPES),
                ),
                FieldDef {
                    name: "observedArea",
                    column: "observedarea",
                    expr: ColumnExpr::Template(OBSERVED_AREA),
                    kind: FieldKind::Geometry,
                },
                FieldDef::column("phenomenonTime", "phenomenontime", FieldKind::Text),
                FieldDef::column("resultTime", "resulttime", FieldKind::Text),
            ],
            foreign_keys: vec!["thing_id", "sensor_id", "observedproperty_id"],
            navigations: vec![
                Navigation::one("Thing", Thing),
                Navigation::one("Sensor", Sensor),
                Navigation::one("ObservedProperty", ObservedProperty),
                Navigation::many("Observations", Observation),
            ],
        },
        EntityDef {
            entity_type: Observation,
            table: "observation",
            fields: vec![
                FieldDef::data_key("phenomenonTime", "phenomenontime"),
                FieldDef::data_key("resultTime", "resulttime"),
                FieldDef::data_key("result", "result"),
                FieldDef::data_key("validTime", "validtime"),
                FieldDef::data_key("resultQuality", "resultquality"),
                FieldDef::data_key("parameters", "parameters"),
            ],
            foreign_keys: vec!["stream_id", "featureofinterest_id"],
            navigations: vec![
                Navigation::one("Datastream", Datastream),
                Navigation::one("FeatureOfInterest", FeatureOfInterest),
            ],
        },
        EntityDef {
            entity_type: FeatureOfInterest,
            table: "featureofinterest",
            fields: vec![
                FieldDef::column("name", "name", FieldKind::Text),
                FieldDef::column("description", "description", FieldKind::Text),
                FieldDef::column("encodingType", "encodingtype", encoding),
                FieldDef::geometry("feature", "feature"),
            ],
            foreign_keys: vec![],
            navigations: vec![Navigation::many("Observations", Observation)],
        },
    ]
}

fn sensorthings_relations() -> Vec<(EntityType, EntityType, Relation)> {
    use EntityType::*;

    let column = |target_column, source_column| Relation::Column {
        target_column,
        source_column,
    };
    let thing_location = |target_key, source_key| Relation::Link {
        table: "thing_to_location",
        target_key,
        source_key,
    };
    let location_history = |target_key, source_key| Relation::Link {
        table: "location_to_historicallocation",
        target_key,
        source_key,
    };

    vec![
        // thing by ...
        (Thing, Datastream, column("id", "thing_id")),
        (Thing, HistoricalLocation, column("id", "thing_id")),
        (Thing, Location, thing_location("thing_id", "location_id")),
        // location by ...
        (Location, Thing, thing_location("location_id", "thing_id")),
        (
            Location,
            HistoricalLocation,
            location_history("location_id", "historicallocation_id"),
        ),
        // historical location by ...
        (HistoricalLocation, Thing, column("thing_id", "id")),
        (
            HistoricalLocation,
            Location,
            location_history("historicallocation_id", "location_id"),
        ),
        // sensor / observed property by ...
        (Sensor, Datastream, column("id", "sensor_id")),
        (ObservedProperty, Datastream, column("id", "observedproperty_id")),
        // datastream by ...
        (Datastream, Thing, column("thing_id", "id")),
        (Datastream, Sensor, column("sensor_id", "id")),
        (Datastream, ObservedProperty, column("observedproperty_id", "id")),
        (Datastream, Observation, column("id", "stream_id")),
        // observation by ...
        (Observation, Datastream, column("stream_id", "id")),
        (Observation, FeatureOfInterest, column("featureofinterest_id", "id")),
        // feature of interest by ...
        (FeatureOfInterest, Observation, column("id", "featureofinterest_id")),
    ]
}
