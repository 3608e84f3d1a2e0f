//! Shared test helpers for integration tests.

#![allow(dead_code)]

use std::sync::Once;

use dbsemaphore::config::TableDescriptor;

/// Returns the test database URL from the `TEST_DATABASE_URL` environment variable.
/// Panics if the variable is not set.
pub fn test_db_url() -> String {
    std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set for integration tests")
}

/// Returns true if the test database URL is configured.
pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

static SCHEMA_INIT: Once = Once::new();
static LOG_INIT: Once = Once::new();

fn ensure_schema() {
    SCHEMA_INIT.call_once(|| {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let pool = sqlx::PgPool::connect(&test_db_url()).await.unwrap();
            run_migrations(&pool).await;
        });
    });
}

/// Initialize structured logging once per test binary so `tracing`
/// output (heartbeat ticks, acquire/release decisions, reclamation
/// rounds) is visible with `cargo test -- --nocapture`, same idea as
/// this codebase's binary entry point's `tracing_subscriber::fmt().init()`.
fn ensure_logging() {
    LOG_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().with_target(false).try_init();
    });
}

/// Connect to the test database, ensuring schema and a clean slate.
pub async fn setup_test_db() -> sqlx::PgPool {
    ensure_logging();
    ensure_schema();
    let pool = sqlx::PgPool::connect(&test_db_url()).await.expect("failed to connect to test database");
    truncate_all_tables(&pool).await;
    pool
}

pub fn table_descriptor() -> TableDescriptor {
    TableDescriptor::default()
}

async fn truncate_all_tables(pool: &sqlx::PgPool) {
    sqlx::raw_sql("TRUNCATE TABLE permits_by_owner, heartbeats, semaphores CASCADE")
        .execute(pool)
        .await
        .unwrap();
}

async fn run_migrations(pool: &sqlx::PgPool) {
    let migration_files = ["migrations/001_create_semaphore_tables.sql"];

    for file in &migration_files {
        let path = std::path::Path::new(file);
        if !path.exists() {
            panic!("migration file not found: {file}");
        }
        let sql = std::fs::read_to_string(path).unwrap();
        sqlx::raw_sql(&sql).execute(pool).await.unwrap_or_else(|e| {
            panic!("migration {file} failed: {e}");
        });
    }
}
