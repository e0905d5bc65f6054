use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header::CONTENT_TYPE, Request, StatusCode};
use axum::Router;
use sensorthings_api::{router, AppState, ServerConfig};
use sensorthings_query::{
    ColumnValue, Entity, EntityStore, EntityType, QueryError, QueryOptions, QueryResult,
    QueryTarget, Registry, Result,
};
use serde_json::{json, Value};
use tower::ServiceExt;

const BASE: &str = "http://st.local";

/// In-memory store: filters by type and id, pages with the request's options.
struct FakeStore {
    entities: Vec<Entity>,
    failure: Option<fn() -> QueryError>,
    last: Mutex<Option<(QueryTarget, QueryOptions)>>,
}

#[async_trait]
impl EntityStore for FakeStore {
    fn store_type(&self) -> &'static str {
        "fake"
    }

    async fn query(&self, target: &QueryTarget, options: &QueryOptions) -> Result<QueryResult> {
        *self.last.lock().unwrap() = Some((*target, options.clone()));
        if let Some(failure) = self.failure {
            return Err(failure());
        }

        let matching: Vec<Entity> = self
            .entities
            .iter()
            .filter(|e| e.entity_type == target.entity_type)
            .filter(|e| target.id.map_or(true, |id| e.id == id))
            .cloned()
            .collect();
        let total = matching.len() as i64;
        let entities: Vec<Entity> = matching
            .into_iter()
            .skip(options.offset() as usize)
            .take(options.limit(100) as usize)
            .map(|mut e| {
                e.ref_only = options.ref_only;
                e
            })
            .collect();
        target.ensure_found(&entities)?;
        Ok(QueryResult::new(entities, options.count.then_some(total)))
    }
}

fn thing(id: i64, name: &str) -> Entity {
    let mut entity = Entity::new(EntityType::Thing, id, format!("{}/v1.0/Things({})", BASE, id));
    entity.fields = vec![
        ("name", ColumnValue::Text(name.to_string())),
        ("description", ColumnValue::Text(format!("{} description", name))),
    ];
    entity.navigation_links = vec!["Datastreams"];
    entity
}

fn observation(id: i64, result: f64) -> Entity {
    let mut entity = Entity::new(
        EntityType::Observation,
        id,
        format!("{}/v1.0/Observations({})", BASE, id),
    );
    entity.fields = vec![
        ("phenomenonTime", ColumnValue::Json(json!("2020-01-01T00:00:00.000Z"))),
        ("result", ColumnValue::Json(json!(result))),
    ];
    entity
}

fn fixture() -> Vec<Entity> {
    vec![
        thing(3, "mast"),
        thing(2, "buoy"),
        thing(1, "station"),
        observation(2, 25.0),
        observation(1, 12.5),
    ]
}

fn app_with(store: Arc<FakeStore>) -> Router {
    let mut config = ServerConfig::new("postgres://unused");
    config.external_uri = format!("{}/", BASE);
    let registry = Arc::new(Registry::sensorthings(None).unwrap());
    router(Arc::new(AppState::new(store, registry, &config)))
}

fn failing(failure: fn() -> QueryError) -> Router {
    app_with(Arc::new(FakeStore {
        entities: vec![],
        failure: Some(failure),
        last: Mutex::new(None),
    }))
}

fn store() -> Arc<FakeStore> {
    Arc::new(FakeStore {
        entities: fixture(),
        failure: None,
        last: Mutex::new(None),
    })
}

async fn get(app: Router, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .map(|v| v.to_str().unwrap().to_string());
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec();
    (status, content_type, body)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let (status, _, body) = get(app, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health_and_service_root() {
    let (status, body) = get_json(app_with(store()), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));

    let (status, body) = get_json(app_with(store()), "/v1.0").await;
    assert_eq!(status, StatusCode::OK);
    let sets = body["value"].as_array().unwrap();
    assert_eq!(sets.len(), 8);
    assert_eq!(sets[7]["url"], "http://st.local/v1.0/FeaturesOfInterest");
}

#[tokio::test]
async fn test_collection_envelope() {
    let (status, body) = get_json(app_with(store()), "/v1.0/Things?$count=true").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["@iot.count"], 3);
    assert!(body.get("@iot.nextLink").is_none());
    let value = body["value"].as_array().unwrap();
    assert_eq!(value.len(), 3);
    assert_eq!(
        value[2],
        json!({
            "@iot.id": 1,
            "@iot.selfLink": "http://st.local/v1.0/Things(1)",
            "name": "station",
            "description": "station description",
            "Datastreams@iot.navigationLink": "http://st.local/v1.0/Things(1)/Datastreams"
        })
    );
}

#[tokio::test]
async fn test_next_link_advances_skip() {
    let (status, body) = get_json(app_with(store()), "/v1.0/Things?$top=2&$count=true").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"].as_array().unwrap().len(), 2);
    assert_eq!(
        body["@iot.nextLink"],
        "http://st.local/v1.0/Things?%24count=true&%24top=2&%24skip=2"
    );

    let (_, body) = get_json(app_with(store()), "/v1.0/Things?$top=2&$skip=2&$count=true").await;
    assert_eq!(body["value"].as_array().unwrap().len(), 1);
    assert!(body.get("@iot.nextLink").is_none());
}

#[tokio::test]
async fn test_single_entity_and_not_found() {
    let (status, body) = get_json(app_with(store()), "/v1.0/Things(2)").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["@iot.id"], 2);
    assert_eq!(body["name"], "buoy");

    let (status, content_type, body) = get(app_with(store()), "/v1.0/Things(99)").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(content_type.as_deref(), Some("application/problem+json"));
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["title"], "Not Found");
}

#[tokio::test]
async fn test_property_and_value() {
    let (status, body) = get_json(app_with(store()), "/v1.0/Things(1)/name").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"name": "station"}));

    let (status, content_type, body) = get(app_with(store()), "/v1.0/Things(1)/name/$value").await;
    assert_eq!(status, StatusCode::OK);
    assert!(content_type.unwrap().starts_with("text/plain"));
    assert_eq!(body, b"station");
}

#[tokio::test]
async fn test_property_path_narrows_select() {
    let store = store();
    let app = app_with(store.clone());
    let (status, _) = get_json(app, "/v1.0/Things(1)/description?$expand=Datastreams").await;
    assert_eq!(status, StatusCode::OK);

    let (target, options) = store.last.lock().unwrap().clone().unwrap();
    assert_eq!(target, QueryTarget::by_id(EntityType::Thing, 1));
    assert_eq!(options.select, vec!["description".to_string()]);
    assert!(options.expand.is_empty());
}

#[tokio::test]
async fn test_ref_path_returns_self_links() {
    let (status, body) = get_json(app_with(store()), "/v1.0/Things/$ref").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["value"],
        json!([
            {"@iot.selfLink": "http://st.local/v1.0/Things(3)"},
            {"@iot.selfLink": "http://st.local/v1.0/Things(2)"},
            {"@iot.selfLink": "http://st.local/v1.0/Things(1)"}
        ])
    );
}

#[tokio::test]
async fn test_navigation_path_scopes_the_query() {
    let store = store();
    let (status, _) = get_json(
        app_with(store.clone()),
        "/v1.0/Datastreams(1)/Observations?$orderby=id%20asc",
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (target, options) = store.last.lock().unwrap().clone().unwrap();
    assert_eq!(
        target,
        QueryTarget::collection(EntityType::Observation).scoped_by(EntityType::Datastream, 1)
    );
    assert_eq!(options.order_by[0].field, "id");
}

#[tokio::test]
async fn test_data_array_result_format() {
    let (status, body) = get_json(
        app_with(store()),
        "/v1.0/Datastreams(1)/Observations?$resultFormat=dataArray&$select=result",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["value"],
        json!([{
            "Datastream@iot.navigationLink": "http://st.local/v1.0/Datastreams(1)",
            "components": ["id", "result"],
            "dataArray@iot.count": 2,
            "dataArray": [[2, 25.0], [1, 12.5]]
        }])
    );

    let (status, body) = get_json(app_with(store()), "/v1.0/Things?$resultFormat=dataArray").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["option"], "$resultFormat");
}

#[tokio::test]
async fn test_option_errors_are_classified() {
    let (status, body) = get_json(app_with(store()), "/v1.0/Things?$bogus=1").await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(body["option"], "$bogus");

    let (status, body) = get_json(app_with(store()), "/v1.0/Things?$top=notanumber").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["option"], "$top");

    let (status, body) = get_json(app_with(store()), "/v1.0/Gadgets").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["title"], "Invalid Path");
}

#[tokio::test]
async fn test_storage_failures_are_opaque() {
    let (status, body) = get_json(
        failing(|| QueryError::Storage("syntax error at or near \"LATERAL\"".into())),
        "/v1.0/Things",
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body.to_string().contains("LATERAL"));

    let (status, _) = get_json(failing(|| QueryError::Timeout(30_000)), "/v1.0/Things").await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
}
