//! Job store for the Herald outbox.
//!
//! Provides the [`JobStore`] trait with a PostgreSQL implementation, the
//! transactional outbox writer, and an in-process store for tests and
//! single-node development.

pub mod error;
pub mod outbox;
pub mod repo;

pub use error::{DbError, DbResult};
pub use outbox::enqueue_in_tx;
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
