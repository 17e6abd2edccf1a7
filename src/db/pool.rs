//! Connection pooling and embedded migrations.
//!
//! The queue store talks to Postgres through diesel-async over a bb8
//! pool. Migrations are compiled into the binary and applied over a
//! separate blocking connection, since the diesel migration harness is
//! synchronous.

use diesel_async::AsyncPgConnection;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_migrations::{EmbeddedMigrations, embed_migrations};

use crate::config::settings::DatabaseConfig;
use crate::queue::StoreError;

/// Shared async connection pool.
///
/// Cloning is cheap (bb8 wraps an `Arc` internally), so structures
/// holding a pool can derive `Clone` without extra wrapping.
pub type AsyncDbPool = Pool<AsyncPgConnection>;

/// Migrations embedded at compile time from the `migrations/` directory.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Build the async pool described by `config`.
///
/// # Errors
///
/// Returns [`StoreError::Connection`] when the pool cannot be built,
/// for example when the database is unreachable within
/// [`DatabaseConfig::connect_timeout`].
///
/// # Example
///
/// ```ignore
/// let pool = establish_async_connection_pool(&settings.database).await?;
/// let mut conn = pool.get().await?;
/// ```
pub async fn establish_async_connection_pool(
    config: &DatabaseConfig,
) -> Result<AsyncDbPool, StoreError> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.url);
    let pool = Pool::builder()
        .max_size(config.max_connections)
        .min_idle(Some(config.min_connections))
        .connection_timeout(config.connect_timeout())
        .build(manager)
        .await
        .map_err(|e| StoreError::Connection {
            source: anyhow::Error::from(e),
        })?;
    Ok(pool)
}

/// Apply every pending embedded migration against `database_url`.
///
/// Returns the names of the migrations that ran.
pub async fn run_pending_migrations(database_url: &str) -> Result<Vec<String>, StoreError> {
    let database_url = database_url.to_string();
    let applied = tokio::task::spawn_blocking(move || {
        use diesel::Connection;
        use diesel::pg::PgConnection;
        use diesel_migrations::MigrationHarness;

        let mut conn =
            PgConnection::establish(&database_url).map_err(|e| StoreError::Migration {
                source: anyhow::anyhow!("connection failed: {e}"),
            })?;

        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| StoreError::Migration {
                source: anyhow::anyhow!("harness failed: {e}"),
            })?;

        Ok::<_, StoreError>(applied.iter().map(|m| m.to_string()).collect::<Vec<_>>())
    })
    .await
    .map_err(|e| StoreError::Migration {
        source: anyhow::Error::from(e),
    })??;

    Ok(applied)
}
