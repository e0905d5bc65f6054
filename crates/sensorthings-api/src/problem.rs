use std::collections::BTreeMap;

use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use sensorthings_query::QueryError;
use serde_json::Value;
use tracing::{error, warn};

/// An RFC 7807 problem returned to the client.
#[derive(Debug, Clone)]
pub struct Problem {
    pub status_code: StatusCode,
    pub body: BTreeMap<String, Value>,
}

/// Create a new `Problem` response to send to the client.
pub fn new<S>(status_code: S) -> Problem
where
    S: Into<StatusCode>,
{
    Problem {
        status_code: status_code.into(),
        body: BTreeMap::new(),
    }
}

impl Problem {
    pub fn with_title<S>(self, value: S) -> Self
    where
        S: Into<String>,
    {
        self.with_value("title", value.into())
    }

    pub fn with_detail<S>(self, value: S) -> Self
    where
        S: Into<String>,
    {
        self.with_value("detail", value.into())
    }

    /// Specify an arbitrary value to include in the problem.
    pub fn with_value<V>(mut self, key: &str, value: V) -> Self
    where
        V: Into<Value>,
    {
        self.body.insert(key.to_owned(), value.into());
        self
    }
}

pub type Result<T> = std::result::Result<T, Problem>;

impl IntoResponse for Problem {
    fn into_response(self) -> axum::response::Response {
        if self.body.is_empty() {
            return self.status_code.into_response();
        }
        let mut response = (self.status_code, Json(self.body)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<QueryError> for Problem {
    fn from(err: QueryError) -> Self {
        match &err {
            QueryError::NotImplemented { option, .. } => {
                warn!(error = %err, "unsupported query option");
                new(StatusCode::NOT_IMPLEMENTED)
                    .with_title("Not Implemented")
                    .with_detail(err.to_string())
                    .with_value("option", option.as_str())
            }
            QueryError::InvalidOption { option, .. } => {
                warn!(error = %err, "rejected query option");
                new(StatusCode::BAD_REQUEST)
                    .with_title("Invalid Query Option")
                    .with_detail(err.to_string())
                    .with_value("option", option.as_str())
            }
            QueryError::InvalidPath(_) => new(StatusCode::BAD_REQUEST)
                .with_title("Invalid Path")
                .with_detail(err.to_string()),
            QueryError::NotFound(_) => new(StatusCode::NOT_FOUND)
                .with_title("Not Found")
                .with_detail(err.to_string()),
            QueryError::Timeout(ms) => {
                warn!(timeout_ms = *ms, "request deadline expired");
                new(StatusCode::GATEWAY_TIMEOUT)
                    .with_title("Gateway Timeout")
                    .with_detail("The request could not be completed in time")
            }
            QueryError::Storage(_)
            | QueryError::Consistency(_)
            | QueryError::UndeclaredRelation { .. } => {
                error!(error = %err, "request failed");
                new(StatusCode::INTERNAL_SERVER_ERROR)
                    .with_title("Internal Server Error")
                    .with_detail("The server encountered an unexpected condition")
            }
        }
    }
}
