//! Test utilities for PostGIS integration tests
//!
//! One `postgis/postgis` container is shared by every test in the run.
//! Each [`TestDatabase`] gets its own schema inside it, so tests do not see
//! each other's rows.

use crate::{PostgresStore, StoreOptions};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync, GenericImage, ImageExt};
use tokio::sync::{Mutex, OnceCell};

static TEST_CONTAINER: OnceCell<Arc<Mutex<SharedContainer>>> = OnceCell::const_new();
static SCHEMA_COUNTER: AtomicUsize = AtomicUsize::new(0);

struct SharedContainer {
    #[allow(dead_code)]
    container: ContainerAsync<GenericImage>,
    database_url: String,
}

impl SharedContainer {
    async fn new() -> anyhow::Result<Self> {
        let db_name = "sensorthings_test";
        let username = "test_user";
        let password = "test_password";

        let container = GenericImage::new("postgis/postgis", "16-3.4")
            .with_env_var("POSTGRES_DB", db_name)
            .with_env_var("POSTGRES_USER", username)
            .with_env_var("POSTGRES_PASSWORD", password)
            .with_env_var("POSTGRES_HOST_AUTH_METHOD", "trust")
            .start()
            .await?;

        let port = container.get_host_port_ipv4(5432).await?;
        let database_url = format!(
            "postgresql://{}:{}@localhost:{}/{}",
            username, password, port, db_name
        );

        // PostGIS initdb restarts the server once before it accepts connections
        tokio::time::sleep(Duration::from_secs(5)).await;

        Ok(Self {
            container,
            database_url,
        })
    }
}

/// A migrated, isolated schema plus a store bound to it.
pub struct TestDatabase {
    pub store: PostgresStore,
    pub schema: String,
    pub database_url: String,
}

impl TestDatabase {
    async fn shared_url() -> anyhow::Result<String> {
        let container = TEST_CONTAINER
            .get_or_try_init(|| async {
                let container = SharedContainer::new().await?;
                Ok::<_, anyhow::Error>(Arc::new(Mutex::new(container)))
            })
            .await?;
        let url = container.lock().await.database_url.clone();
        Ok(url)
    }

    /// Creates a fresh schema, runs the migrations in it and connects a store.
    pub async fn new() -> anyhow::Result<Self> {
        let database_url = Self::shared_url().await?;
        Self::wait_until_ready(&database_url, 20).await?;

        let schema = format!(
            "st_test_{}_{}",
            std::process::id(),
            SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst)
        );

        let mut options = StoreOptions::new(database_url.clone());
        options.schema = Some(schema.clone());
        options.max_connections = 4;
        options.external_uri = "http://localhost:8080".to_string();

        let store = PostgresStore::connect(&options)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect store: {}", e))?;

        Ok(Self {
            store,
            schema,
            database_url,
        })
    }

    /// Pool whose search path points at this test's schema.
    pub fn pool(&self) -> &PgPool {
        self.store.pool()
    }

    /// Runs fixture SQL; statements may be separated by `;`.
    pub async fn execute(&self, sql: &str) -> anyhow::Result<()> {
        sqlx::raw_sql(sql).execute(self.pool()).await?;
        Ok(())
    }

    async fn wait_until_ready(database_url: &str, max_retries: u32) -> anyhow::Result<()> {
        let mut last_error = None;
        for attempt in 1..=max_retries {
            match PgPoolOptions::new()
                .max_connections(1)
                .acquire_timeout(Duration::from_secs(2))
                .connect(database_url)
                .await
            {
                Ok(pool) => {
                    pool.close().await;
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < max_retries {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        }
        Err(anyhow::anyhow!(
            "Database not ready after {} attempts: {:?}",
            max_retries,
            last_error
        ))
    }
}
