use crate::config::Settings;
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::info;

/// Build the connection pool and apply embedded migrations.
///
/// The pool keeps `db_pool_persistent_size` connections warm and grows to
/// `db_pool_max_size` under load; waiting longer than the acquire timeout
/// surfaces to callers as a 503.
pub async fn init_db(settings: &Settings) -> anyhow::Result<Pool<Postgres>> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .min_connections(settings.db_pool_persistent_size)
        .max_connections(settings.db_pool_max_size)
        .acquire_timeout(Duration::from_secs(3))
        .connect(&settings.db_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;
    info!("migrations applied");
    Ok(pool)
}
