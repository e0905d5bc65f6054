use crate::error::Result;
use crate::odata::QueryOptions;
use crate::types::{QueryResult, QueryTarget};
use async_trait::async_trait;

/// A backend that answers entity queries.
///
/// Implementations compile `target` + `options` into a single statement,
/// execute it on one connection and materialize the rows. When
/// `options.count` is set the total root count comes from a second query
/// sharing the same scope and filter.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Name of the backing store, for logs
    fn store_type(&self) -> &'static str;

    async fn query(&self, target: &QueryTarget, options: &QueryOptions) -> Result<QueryResult>;
}
