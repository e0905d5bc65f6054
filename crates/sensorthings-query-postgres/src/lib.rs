//! PostgreSQL/PostGIS backend for sensorthings-query
//!
//! Implements [`EntityStore`] on a sqlx connection pool. A request compiles
//! into one statement (plus a COUNT when `$count=true`), runs on a single
//! pooled connection under the configured deadline, and the rows are
//! decoded by the static column kinds the compiler reported.

pub mod test_utils;

use async_trait::async_trait;
use sea_orm::SqlxPostgresConnector;
use sensorthings_migrations::{Migrator, MigratorTrait};
use sensorthings_query::{
    ColumnKind, ColumnValue, CompiledCount, CompiledQuery, EntityStore, Materializer, Param,
    QueryCompiler, QueryError, QueryOptions, QueryResult, QueryTarget, Registry, RegistryError,
    Scope,
};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Startup failures of the store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Database connection failed: {0}")]
    Connection(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sea_orm::DbErr),
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub database_url: String,
    /// Namespace for every table; `None` uses the connection's default search path
    pub schema: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    /// Public root URL self links are built on
    pub external_uri: String,
    pub max_top: u64,
    /// Bounds connection checkout plus execution
    pub request_timeout: Duration,
    pub run_migrations: bool,
}

impl StoreOptions {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            schema: None,
            max_connections: 10,
            min_connections: 1,
            external_uri: "http://localhost:8080".to_string(),
            max_top: 100,
            request_timeout: Duration::from_secs(30),
            run_migrations: true,
        }
    }
}

pub struct PostgresStore {
    pool: PgPool,
    compiler: QueryCompiler,
    external_uri: String,
    request_timeout: Duration,
}

impl PostgresStore {
    /// Builds the registry, opens the pool and brings the schema up to date.
    pub async fn connect(options: &StoreOptions) -> Result<Self, StoreError> {
        let registry = Arc::new(Registry::sensorthings(options.schema.as_deref())?);

        info!(
            schema = options.schema.as_deref().unwrap_or("<default>"),
            max_connections = options.max_connections,
            "connecting to PostgreSQL"
        );

        let session = session_settings(options);
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .min_connections(options.min_connections)
            .acquire_timeout(options.request_timeout)
            .after_connect(move |conn, _meta| {
                let session = session.clone();
                Box::pin(async move {
                    sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(&session)).await?;
                    Ok(())
                })
            })
            .connect(&options.database_url)
            .await?;

        if let Some(schema) = &options.schema {
            let sql = format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", schema);
            sqlx::raw_sql(&sql).execute(&pool).await?;
        }

        if options.run_migrations {
            let db = SqlxPostgresConnector::from_sqlx_postgres_pool(pool.clone());
            Migrator::up(&db, None).await?;
            debug!("migrations applied");
        }

        Ok(Self::from_pool(pool, registry, options))
    }

    /// Wraps an existing pool; no schema or migration work is done.
    pub fn from_pool(pool: PgPool, registry: Arc<Registry>, options: &StoreOptions) -> Self {
        Self {
            pool,
            compiler: QueryCompiler::new(registry, options.max_top),
            external_uri: options.external_uri.trim_end_matches('/').to_string(),
            request_timeout: options.request_timeout,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn compiler(&self) -> &QueryCompiler {
        &self.compiler
    }

    /// Runs the statement and the optional count on one connection.
    async fn execute(
        &self,
        compiled: &CompiledQuery,
        count: Option<&CompiledCount>,
    ) -> sensorthings_query::Result<(Vec<PgRow>, Option<i64>)> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| storage_error(&compiled.sql, e))?;

        let rows = bind_params(sqlx::query(&compiled.sql), &compiled.params)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| storage_error(&compiled.sql, e))?;

        let total = match count {
            Some(count) => {
                let row = bind_params(sqlx::query(&count.sql), &count.params)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(|e| storage_error(&count.sql, e))?;
                Some(
                    row.try_get::<i64, _>(0)
                        .map_err(|e| storage_error(&count.sql, e))?,
                )
            }
            None => None,
        };

        Ok((rows, total))
    }

    /// An empty scoped collection is only a page when the scoping entity exists.
    async fn ensure_scope_exists(&self, scope: &Scope) -> sensorthings_query::Result<()> {
        let exists = self.compiler.compile_exists(scope);
        let timeout_ms = self.request_timeout.as_millis() as u64;
        let query = bind_params(sqlx::query(&exists.sql), &exists.params).fetch_one(&self.pool);
        let row = tokio::time::timeout(self.request_timeout, query)
            .await
            .map_err(|_| QueryError::Timeout(timeout_ms))?
            .map_err(|e| storage_error(&exists.sql, e))?;
        let found = row
            .try_get::<bool, _>(0)
            .map_err(|e| storage_error(&exists.sql, e))?;
        if !found {
            return Err(QueryError::not_found(format!(
                "{}({})",
                scope.entity_type.set_name(),
                scope.id
            )));
        }
        Ok(())
    }
}

/// Statements run on every new connection: the search path and a server-side
/// statement deadline matching the request timeout.
fn session_settings(options: &StoreOptions) -> String {
    let mut sql = format!(
        "SET statement_timeout = {}",
        options.request_timeout.as_millis()
    );
    if let Some(schema) = &options.schema {
        sql.push_str(&format!("; SET search_path TO \"{}\", public", schema));
    }
    sql
}

#[async_trait]
impl EntityStore for PostgresStore {
    fn store_type(&self) -> &'static str {
        "postgres"
    }

    async fn query(
        &self,
        target: &QueryTarget,
        options: &QueryOptions,
    ) -> sensorthings_query::Result<QueryResult> {
        let started = Instant::now();
        let compiled = self.compiler.compile(target, options)?;
        let count = if options.count {
            Some(self.compiler.compile_count(target, options)?)
        } else {
            None
        };

        debug!(
            resource = %target,
            sql = %compiled.sql,
            params = compiled.params.len(),
            branches = compiled.tree.len(),
            "executing query"
        );

        let timeout_ms = self.request_timeout.as_millis() as u64;
        let (rows, total) =
            match tokio::time::timeout(self.request_timeout, self.execute(&compiled, count.as_ref()))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    warn!(resource = %target, timeout_ms, "query deadline expired");
                    return Err(QueryError::Timeout(timeout_ms));
                }
            };

        let row_count = rows.len();
        let (columns, values) = decode_rows(&compiled, &rows)
            .map_err(|e| storage_error(&compiled.sql, e))?;
        let entities = Materializer::new(self.compiler.registry(), &self.external_uri)
            .materialize(&compiled.tree, &columns, values)
            .inspect_err(|e| {
                error!(sql = %compiled.sql, tree = ?compiled.tree, error = %e, "materialization failed")
            })?;
        target.ensure_found(&entities)?;
        if let Some(scope) = target.unconfirmed_scope(&entities) {
            self.ensure_scope_exists(&scope).await?;
        }

        Ok(QueryResult::new(entities, total)
            .with_stats(row_count, started.elapsed().as_millis() as u64))
    }
}

fn storage_error(sql: &str, err: sqlx::Error) -> QueryError {
    error!(sql = %sql, error = %err, "query execution failed");
    QueryError::Storage(err.to_string())
}

fn bind_params<'q>(
    query: Query<'q, Postgres, PgArguments>,
    params: &'q [Param],
) -> Query<'q, Postgres, PgArguments> {
    params.iter().fold(query, |query, param| match param {
        Param::Integer(v) => query.bind(*v),
        Param::Float(v) => query.bind(*v),
        Param::Text(v) => query.bind(v.as_str()),
        Param::Timestamp(v) => query.bind(*v),
    })
}

/// Column names as the database reports them, plus every row decoded by column kind.
fn decode_rows(
    compiled: &CompiledQuery,
    rows: &[PgRow],
) -> Result<(Vec<String>, Vec<Vec<ColumnValue>>), sqlx::Error> {
    let columns: Vec<String> = match rows.first() {
        Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
        None => compiled.columns.iter().map(|c| c.name.clone()).collect(),
    };

    let values = rows
        .iter()
        .map(|row| {
            compiled
                .columns
                .iter()
                .enumerate()
                .map(|(index, column)| decode_value(row, index, column.kind))
                .collect()
        })
        .collect::<Result<Vec<Vec<ColumnValue>>, sqlx::Error>>()?;

    Ok((columns, values))
}

fn decode_value(row: &PgRow, index: usize, kind: ColumnKind) -> Result<ColumnValue, sqlx::Error> {
    let value = match kind {
        ColumnKind::Integer => row
            .try_get::<Option<i64>, _>(index)?
            .map(ColumnValue::Integer),
        ColumnKind::Text => row
            .try_get::<Option<String>, _>(index)?
            .map(ColumnValue::Text),
        ColumnKind::Json => row
            .try_get::<Option<serde_json::Value>, _>(index)?
            .map(ColumnValue::Json),
        ColumnKind::Geometry => row
            .try_get::<Option<String>, _>(index)?
            .map(ColumnValue::Geometry),
    };
    Ok(value.unwrap_or(ColumnValue::Null))
}
