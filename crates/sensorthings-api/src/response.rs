use sensorthings_query::{ColumnValue, Entity, EntityType, FieldDef, QueryOptions, Registry};
use serde::Serialize;
use serde_json::{Map, Value};

/// Body of every collection response.
#[derive(Debug, Serialize)]
pub struct Collection<T> {
    #[serde(rename = "@iot.count", skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(rename = "@iot.nextLink", skip_serializing_if = "Option::is_none")]
    pub next_link: Option<String>,
    pub value: Vec<T>,
}

/// Observations in `$resultFormat=dataArray` form.
#[derive(Debug, Serialize)]
pub struct DataArray {
    #[serde(
        rename = "Datastream@iot.navigationLink",
        skip_serializing_if = "Option::is_none"
    )]
    pub datastream_link: Option<String>,
    pub components: Vec<&'static str>,
    #[serde(rename = "dataArray@iot.count")]
    pub count: usize,
    #[serde(rename = "dataArray")]
    pub data_array: Vec<Vec<Value>>,
}

#[derive(Debug, Serialize)]
pub struct EntitySet {
    pub name: &'static str,
    pub url: String,
}

pub fn entity_sets(external_uri: &str) -> Collection<EntitySet> {
    Collection {
        count: None,
        next_link: None,
        value: EntityType::ALL
            .iter()
            .map(|t| EntitySet {
                name: t.set_name(),
                url: format!("{}/v1.0/{}", external_uri, t.set_name()),
            })
            .collect(),
    }
}

fn field_value(entity: &Entity, field: &FieldDef) -> ColumnValue {
    if field.is_identity() {
        return ColumnValue::Integer(entity.id);
    }
    entity.field(field.name).cloned().unwrap_or(ColumnValue::Null)
}

/// `{"<name>": value}` for a property path.
pub fn property(entity: &Entity, field: &FieldDef) -> Value {
    let mut body = Map::new();
    body.insert(field.name.to_string(), field_value(entity, field).to_json());
    Value::Object(body)
}

/// Plain text for a `$value` path.
pub fn raw_value(entity: &Entity, field: &FieldDef) -> String {
    field_value(entity, field).to_raw_string()
}

/// Column order of a data array: identity first, then the selected fields.
pub fn components(registry: &Registry, options: &QueryOptions) -> Vec<&'static str> {
    let mut components = vec!["id"];
    if options.select.is_empty() {
        components.extend(registry.fields(EntityType::Observation).iter().map(|f| f.name));
    } else {
        for name in &options.select {
            if let Some(field) = registry.column_of(EntityType::Observation, name) {
                if !field.is_identity() && !components.contains(&field.name) {
                    components.push(field.name);
                }
            }
        }
    }
    components
}

pub fn data_array(
    entities: &[Entity],
    components: Vec<&'static str>,
    datastream_link: Option<String>,
) -> DataArray {
    let data_array: Vec<Vec<Value>> = entities
        .iter()
        .map(|entity| {
            components
                .iter()
                .map(|name| match *name {
                    "id" => Value::from(entity.id),
                    name => entity.field(name).map(|v| v.to_json()).unwrap_or(Value::Null),
                })
                .collect()
        })
        .collect();

    DataArray {
        datastream_link,
        components,
        count: data_array.len(),
        data_array,
    }
}

/// Paging state needed to decide on a next link.
#[derive(Debug, Clone, Copy)]
pub struct PageInfo {
    pub limit: u64,
    pub offset: u64,
    pub returned: usize,
    pub total: Option<i64>,
}

impl PageInfo {
    fn has_more(&self) -> bool {
        if (self.returned as u64) < self.limit || self.limit == 0 {
            return false;
        }
        match self.total {
            Some(total) => self.offset + (self.returned as u64) < total.max(0) as u64,
            None => true,
        }
    }
}

/// Link to the following page, carrying the request's other options.
pub fn next_link(
    external_uri: &str,
    path: &str,
    query: &[(String, String)],
    page: PageInfo,
) -> Option<String> {
    if !page.has_more() {
        return None;
    }

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in query {
        if name.eq_ignore_ascii_case("$top") || name.eq_ignore_ascii_case("$skip") {
            continue;
        }
        serializer.append_pair(name, value);
    }
    serializer.append_pair("$top", &page.limit.to_string());
    serializer.append_pair("$skip", &(page.offset + page.limit).to_string());

    Some(format!(
        "{}/v1.0/{}?{}",
        external_uri,
        path.trim_matches('/'),
        serializer.finish()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn observation(id: i64, result: f64) -> Entity {
        let mut entity = Entity::new(
            EntityType::Observation,
            id,
            format!("http://localhost:8080/v1.0/Observations({})", id),
        );
        entity.fields = vec![
            ("phenomenonTime", ColumnValue::Text("2020-01-01T00:00:00.000Z".into())),
            ("result", ColumnValue::Json(json!(result))),
        ];
        entity
    }

    #[test]
    fn test_next_link_only_for_full_pages() {
        let query = vec![
            ("$filter".to_string(), "name eq 'a b'".to_string()),
            ("$top".to_string(), "2".to_string()),
        ];
        let full = PageInfo {
            limit: 2,
            offset: 4,
            returned: 2,
            total: None,
        };
        assert_eq!(
            next_link("http://st.local", "Things", &query, full).unwrap(),
            "http://st.local/v1.0/Things?%24filter=name+eq+%27a+b%27&%24top=2&%24skip=6"
        );

        let partial = PageInfo { returned: 1, ..full };
        assert!(next_link("http://st.local", "Things", &query, partial).is_none());

        let last = PageInfo {
            total: Some(6),
            ..full
        };
        assert!(next_link("http://st.local", "Things", &query, last).is_none());

        let more = PageInfo {
            total: Some(7),
            ..full
        };
        assert!(next_link("http://st.local", "Things", &query, more).is_some());
    }

    #[test]
    fn test_data_array() {
        let registry = Registry::sensorthings(None).unwrap();
        let options =
            QueryOptions::parse([("$select", "result,phenomenonTime,result")]).unwrap();
        let components = components(&registry, &options);
        assert_eq!(components, vec!["id", "result", "phenomenonTime"]);

        let body = data_array(
            &[observation(2, 25.0), observation(1, 12.5)],
            components,
            Some("http://localhost:8080/v1.0/Datastreams(1)".into()),
        );
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "Datastream@iot.navigationLink": "http://localhost:8080/v1.0/Datastreams(1)",
                "components": ["id", "result", "phenomenonTime"],
                "dataArray@iot.count": 2,
                "dataArray": [
                    [2, 25.0, "2020-01-01T00:00:00.000Z"],
                    [1, 12.5, "2020-01-01T00:00:00.000Z"]
                ]
            })
        );
    }

    #[test]
    fn test_default_components_cover_every_field() {
        let registry = Registry::sensorthings(None).unwrap();
        let components = components(&registry, &QueryOptions::default());
        assert_eq!(components[0], "id");
        assert!(components.contains(&"result"));
        assert_eq!(
            components.len(),
            registry.fields(EntityType::Observation).len() + 1
        );
    }

    #[test]
    fn test_property_and_raw_value() {
        let registry = Registry::sensorthings(None).unwrap();
        let entity = observation(3, 31.0);

        let result = registry.column_of(EntityType::Observation, "result").unwrap();
        assert_eq!(property(&entity, &result), json!({"result": 31.0}));
        assert_eq!(raw_value(&entity, &result), "31.0");

        let id = registry.column_of(EntityType::Observation, "id").unwrap();
        assert_eq!(property(&entity, &id), json!({"id": 3}));

        let missing = registry.column_of(EntityType::Observation, "validTime").unwrap();
        assert_eq!(property(&entity, &missing), json!({"validTime": null}));
        assert_eq!(raw_value(&entity, &missing), "");
    }

    #[test]
    fn test_entity_sets() {
        let body = serde_json::to_value(entity_sets("http://st.local")).unwrap();
        assert_eq!(body["value"].as_array().unwrap().len(), 8);
        assert_eq!(
            body["value"][0],
            json!({"name": "Things", "url": "http://st.local/v1.0/Things"})
        );
    }
}
