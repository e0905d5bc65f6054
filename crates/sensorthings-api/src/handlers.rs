use std::sync::Arc;

use axum::extract::{Path, RawQuery, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sensorthings_query::{EntityType, QueryError, QueryOptions, ResultFormat};
use serde_json::json;
use tracing::debug;

use crate::path::ResourcePath;
use crate::problem::Result;
use crate::response::{self, Collection, PageInfo};
use crate::AppState;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn service_root(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(response::entity_sets(&state.external_uri))
}

/// Decoded `name=value` pairs in request order.
fn query_pairs(query: Option<&str>) -> Vec<(String, String)> {
    query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

pub async fn get_resource(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Response> {
    let resource = ResourcePath::parse(&state.registry, &path)?;
    let pairs = query_pairs(query.as_deref());
    let mut options =
        QueryOptions::parse(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;

    if resource.ref_only {
        options.ref_only = true;
    }
    if let Some(field) = &resource.property {
        options.select = vec![field.name.to_string()];
        options.expand.clear();
        options.ref_only = false;
    }

    let data_array = options.result_format == Some(ResultFormat::DataArray);
    if data_array
        && (resource.target.entity_type != EntityType::Observation
            || resource.singular
            || resource.property.is_some())
    {
        return Err(QueryError::invalid_option(
            "$resultFormat",
            "dataArray",
            "only supported on Observation collections",
        )
        .into());
    }

    let result = state.store.query(&resource.target, &options).await?;
    debug!(
        resource = %resource.target,
        entities = result.entities.len(),
        rows = result.stats.row_count,
        execution_ms = result.stats.execution_ms,
        "query complete"
    );

    if resource.singular {
        let entity = result
            .entities
            .into_iter()
            .next()
            .ok_or_else(|| QueryError::not_found(resource.target.to_string()))?;

        return Ok(match &resource.property {
            Some(field) if resource.raw_value => (
                [(CONTENT_TYPE, "text/plain; charset=utf-8")],
                response::raw_value(&entity, field),
            )
                .into_response(),
            Some(field) => Json(response::property(&entity, field)).into_response(),
            None => Json(entity).into_response(),
        });
    }

    let page = PageInfo {
        limit: options.limit(state.max_top),
        offset: options.offset(),
        returned: result.entities.len(),
        total: result.count,
    };
    let next_link = response::next_link(&state.external_uri, &path, &pairs, page);

    if data_array {
        let datastream_link = resource
            .target
            .scope
            .filter(|scope| scope.entity_type == EntityType::Datastream)
            .map(|scope| format!("{}/v1.0/Datastreams({})", state.external_uri, scope.id));
        let group = response::data_array(
            &result.entities,
            response::components(&state.registry, &options),
            datastream_link,
        );
        return Ok(Json(Collection {
            count: result.count,
            next_link,
            value: vec![group],
        })
        .into_response());
    }

    Ok(Json(Collection {
        count: result.count,
        next_link,
        value: result.entities,
    })
    .into_response())
}
