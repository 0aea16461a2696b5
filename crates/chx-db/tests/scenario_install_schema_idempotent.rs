//! Installing the store twice into a fresh schema is a no-op the second time,
//! and status reports the tables only once they exist.
//!
//! DB-backed test, skipped if CHX_DATABASE_URL is not set.

use chx_db::StoreTables;

#[tokio::test]
async fn install_schema_twice_then_status_reports_tables() -> anyhow::Result<()> {
    let url = match std::env::var(chx_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: CHX_DATABASE_URL not set");
            return Ok(());
        }
    };

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await?;

    let schema = format!("chx_it_{}", uuid::Uuid::new_v4().simple());
    let tables = StoreTables::in_schema(&schema);

    let before = chx_db::status(&pool, &tables).await?;
    assert!(before.ok);
    assert!(!before.has_store_tables);

    chx_db::install_schema(&pool, &tables).await?;
    chx_db::install_schema(&pool, &tables).await?;

    let after = chx_db::status(&pool, &tables).await?;
    assert!(after.has_store_tables);

    sqlx::query(&format!("drop schema \"{schema}\" cascade"))
        .execute(&pool)
        .await?;
    Ok(())
}
