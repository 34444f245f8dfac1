use log::info;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

pub type DbPool = PgPool;

/// Connects to the catalog and brings the schema up to date.
///
/// The embedded migrator takes a Postgres advisory lock for the duration of
/// the run, so any number of services can start concurrently; whoever wins
/// applies the pending migrations and the rest see a no-op.
pub async fn create_db_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Catalog schema is up to date");

    Ok(pool)
}
