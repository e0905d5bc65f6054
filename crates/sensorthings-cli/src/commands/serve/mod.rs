mod shutdown;

use clap::Args;
use sensorthings_api::{router, AppState, DatabaseConfig, ServerConfig};
use sensorthings_query::EntityStore;
use sensorthings_query_postgres::{PostgresStore, StoreOptions};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Args)]
pub struct ServeCommand {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1:8080", env = "SENSORTHINGS_ADDRESS")]
    pub address: String,

    /// Database connection URL
    #[arg(long, env = "SENSORTHINGS_DATABASE_URL")]
    pub database_url: String,

    /// Public root URL used in self links and next links
    #[arg(
        long,
        default_value = "http://localhost:8080",
        env = "SENSORTHINGS_EXTERNAL_URI"
    )]
    pub external_uri: String,

    /// Largest page size a request may ask for
    #[arg(long, default_value_t = 100, env = "SENSORTHINGS_MAX_TOP")]
    pub max_top: u64,

    /// Database schema holding the SensorThings tables
    #[arg(long, env = "SENSORTHINGS_SCHEMA")]
    pub schema: Option<String>,

    /// Per-request deadline in milliseconds
    #[arg(long, default_value_t = 30_000, env = "SENSORTHINGS_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: u64,

    #[arg(long, default_value_t = 10, env = "SENSORTHINGS_MAX_CONNECTIONS")]
    pub max_connections: u32,

    #[arg(long, default_value_t = 1, env = "SENSORTHINGS_MIN_CONNECTIONS")]
    pub min_connections: u32,

    /// Do not apply pending migrations at startup
    #[arg(long, env = "SENSORTHINGS_SKIP_MIGRATIONS")]
    pub skip_migrations: bool,
}

impl ServeCommand {
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let config = ServerConfig {
            external_uri: self.external_uri.clone(),
            max_top: self.max_top,
            schema: self.schema.clone(),
            request_timeout_ms: self.request_timeout_ms,
            database: DatabaseConfig {
                url: self.database_url.clone(),
                max_connections: self.max_connections,
                min_connections: self.min_connections,
            },
        };
        Ok(config.validate()?)
    }

    fn store_options(&self, config: &ServerConfig) -> StoreOptions {
        let mut options = StoreOptions::new(config.database.url.clone());
        options.schema = config.schema.clone();
        options.max_connections = config.database.max_connections;
        options.min_connections = config.database.min_connections;
        options.external_uri = config.external_uri.clone();
        options.max_top = config.max_top;
        options.request_timeout = config.request_timeout();
        options.run_migrations = !self.skip_migrations;
        options
    }

    pub fn execute(self) -> anyhow::Result<()> {
        let config = self.server_config()?;
        let store_options = self.store_options(&config);

        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async move {
            debug!("Initializing database connection...");
            let store = Arc::new(PostgresStore::connect(&store_options).await?);
            let registry = store.compiler().registry().clone();

            let state = Arc::new(AppState::new(
                store.clone() as Arc<dyn EntityStore>,
                registry,
                &config,
            ));
            let app = router(state);

            let listener = tokio::net::TcpListener::bind(&self.address).await?;
            info!(
                "Starting SensorThings server on {} (external URI {})",
                self.address, config.external_uri
            );

            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown::ctrl_c())
                .await?;

            store.pool().close().await;
            info!("Server stopped");
            Ok::<(), anyhow::Error>(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::time::Duration;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        serve: ServeCommand,
    }

    fn parse(args: &[&str]) -> ServeCommand {
        let mut argv = vec!["sensorthings"];
        argv.extend_from_slice(args);
        TestCli::parse_from(argv).serve
    }

    #[test]
    fn test_store_options_follow_arguments() {
        let cmd = parse(&[
            "--database-url",
            "postgres://localhost/st",
            "--external-uri",
            "https://sensors.example.org/",
            "--schema",
            "v1",
            "--max-top",
            "50",
            "--request-timeout-ms",
            "2500",
            "--skip-migrations",
        ]);
        let config = cmd.server_config().unwrap();
        assert_eq!(config.external_uri, "https://sensors.example.org");

        let options = cmd.store_options(&config);
        assert_eq!(options.schema.as_deref(), Some("v1"));
        assert_eq!(options.max_top, 50);
        assert_eq!(options.request_timeout, Duration::from_millis(2500));
        assert!(!options.run_migrations);
    }

    #[test]
    fn test_invalid_pool_bounds_are_rejected() {
        let cmd = parse(&[
            "--database-url",
            "postgres://localhost/st",
            "--min-connections",
            "20",
        ]);
        assert!(cmd.server_config().is_err());
    }
}
