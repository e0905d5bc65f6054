use crate::entity_type::EntityType;
use crate::registry::{Cardinality, Navigation};
use crate::value::ColumnValue;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

/// An expanded relation of a materialized entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    One(Option<Box<Entity>>),
    Many(Vec<Entity>),
}

impl Related {
    pub fn empty(cardinality: Cardinality) -> Self {
        match cardinality {
            Cardinality::One => Related::One(None),
            Cardinality::Many => Related::Many(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Related::One(one) => usize::from(one.is_some()),
            Related::Many(many) => many.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        let (one, many) = match self {
            Related::One(one) => (one.as_deref(), &[][..]),
            Related::Many(many) => (None, many.as_slice()),
        };
        one.into_iter().chain(many.iter())
    }
}

/// A materialized entity with its selected fields and expanded relations.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub entity_type: EntityType,
    pub id: i64,
    pub self_link: String,
    /// Selected fields in output order, keyed by public name
    pub fields: Vec<(&'static str, ColumnValue)>,
    /// Expanded navigations in expand order
    pub relations: Vec<(&'static str, Related)>,
    /// Navigations serialized as `<Nav>@iot.navigationLink`
    pub navigation_links: Vec<&'static str>,
    /// Serialize the self link only
    pub ref_only: bool,
}

impl Entity {
    pub fn new(entity_type: EntityType, id: i64, self_link: String) -> Self {
        Entity {
            entity_type,
            id,
            self_link,
            fields: Vec::new(),
            relations: Vec::new(),
            navigation_links: Vec::new(),
            ref_only: false,
        }
    }

    /// Field lookup by public name, case-insensitive.
    pub fn field(&self, name: &str) -> Option<&ColumnValue> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn related(&self, navigation: &str) -> Option<&Related> {
        self.relations
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(navigation))
            .map(|(_, r)| r)
    }

    pub fn navigation_link(&self, navigation: &str) -> String {
        format!("{}/{}", self.self_link, navigation)
    }

    /// Assigns or appends `child` to the relation named by `navigation`.
    pub fn attach(&mut self, navigation: &Navigation, child: Entity) {
        let index = match self.relations.iter().position(|(n, _)| *n == navigation.name) {
            Some(index) => index,
            None => {
                self.relations
                    .push((navigation.name, Related::empty(navigation.cardinality)));
                self.relations.len() - 1
            }
        };
        match &mut self.relations[index].1 {
            Related::One(slot) => *slot = Some(Box::new(child)),
            Related::Many(items) => items.push(child),
        }
    }
}

impl Serialize for Related {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Related::One(one) => one.serialize(serializer),
            Related::Many(many) => many.serialize(serializer),
        }
    }
}

impl Serialize for Entity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.ref_only {
            let mut map = serializer.serialize_map(Some(1))?;
            map.serialize_entry("@iot.selfLink", &self.self_link)?;
            return map.end();
        }

        let len = 2 + self.fields.len() + self.navigation_links.len() + self.relations.len();
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry("@iot.id", &self.id)?;
        map.serialize_entry("@iot.selfLink", &self.self_link)?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        for name in &self.navigation_links {
            map.serialize_entry(
                &format!("{}@iot.navigationLink", name),
                &self.navigation_link(name),
            )?;
        }
        for (name, related) in &self.relations {
            map.serialize_entry(name, related)?;
        }
        map.end()
    }
}
