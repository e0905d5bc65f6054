//! Resource paths below `/v1.0`.
//!
//! Supported shapes:
//!
//! ```text
//! Things
//! Things(1)
//! Things(1)/Datastreams
//! Things(1)/Datastreams(4)
//! Datastreams(4)/Thing
//! Things(1)/name
//! Things(1)/name/$value
//! Things/$ref
//! Things(1)/Locations/$ref
//! ```

use sensorthings_query::{
    Cardinality, EntityType, FieldDef, QueryError, QueryTarget, Registry, Result,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePath {
    pub target: QueryTarget,
    /// Responds with one entity instead of a collection envelope
    pub singular: bool,
    pub property: Option<FieldDef>,
    /// `$value` after a property
    pub raw_value: bool,
    /// Trailing `$ref`
    pub ref_only: bool,
}

impl ResourcePath {
    pub fn parse(registry: &Registry, path: &str) -> Result<Self> {
        let mut segments = path.trim_matches('/').split('/').peekable();
        let invalid = |reason: &str| QueryError::InvalidPath(format!("{}: {}", path, reason));

        let first = segments.next().filter(|s| !s.is_empty()).ok_or_else(|| invalid("empty path"))?;
        let (set, id) = split_key(first).ok_or_else(|| invalid("malformed entity key"))?;
        let entity_type =
            EntityType::from_set_name(set).ok_or_else(|| invalid("unknown entity set"))?;

        let mut resource = ResourcePath {
            target: QueryTarget {
                entity_type,
                id,
                scope: None,
            },
            singular: id.is_some(),
            property: None,
            raw_value: false,
            ref_only: false,
        };

        while let Some(segment) = segments.next() {
            let last = segments.peek().is_none();

            if segment == "$ref" {
                if !last || resource.property.is_some() {
                    return Err(invalid("$ref must be the last segment"));
                }
                resource.ref_only = true;
                continue;
            }

            if segment == "$value" {
                if !last || resource.property.is_none() {
                    return Err(invalid("$value must follow a property"));
                }
                resource.raw_value = true;
                continue;
            }

            if resource.property.is_some() {
                return Err(invalid("properties have no sub-resources"));
            }

            let (name, id) = split_key(segment).ok_or_else(|| invalid("malformed entity key"))?;
            let current = resource.target.entity_type;

            if let Some(navigation) = registry.navigation(current, name) {
                let Some(parent_id) = resource.target.id else {
                    return Err(invalid("navigation requires an entity id"));
                };
                if resource.target.scope.is_some() {
                    return Err(invalid("only one navigation step is supported"));
                }
                resource.target = QueryTarget {
                    entity_type: navigation.target,
                    id,
                    scope: None,
                }
                .scoped_by(current, parent_id);
                resource.singular = id.is_some() || navigation.cardinality == Cardinality::One;
                continue;
            }

            if id.is_none() && resource.singular {
                if let Some(field) = registry.column_of(current, name) {
                    resource.property = Some(field);
                    continue;
                }
            }

            return Err(invalid(&format!("unknown segment '{}'", segment)));
        }

        Ok(resource)
    }
}

/// `Name` or `Name(id)`; `None` when the key is not an integer.
fn split_key(segment: &str) -> Option<(&str, Option<i64>)> {
    match segment.find('(') {
        None => Some((segment, None)),
        Some(open) => {
            let key = segment[open..].strip_prefix('(')?.strip_suffix(')')?;
            let id = key.trim().parse::<i64>().ok()?;
            Some((&segment[..open], Some(id)))
        }
    }
}
