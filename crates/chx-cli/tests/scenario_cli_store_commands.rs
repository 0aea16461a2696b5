use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::io::Write;
use std::process::Command;
use uuid::Uuid;

/// `chx db migrate`, `db status`, the subscriber commands and an empty
/// `publish run`, all against store tables in a throwaway schema.
///
/// This test is DB-backed and is skipped if CHX_DATABASE_URL is not set.
#[allow(deprecated)]
#[tokio::test]
async fn cli_store_commands_work_in_a_private_schema() -> anyhow::Result<()> {
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
    let schema = format!("chx_cli_{}", Uuid::new_v4().simple());
    sqlx::query(&format!("create schema \"{schema}\""))
        .execute(&pool)
        .await?;

    let base = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .join("config/base.yaml")
        .canonicalize()?;
    let mut layer = tempfile::NamedTempFile::new()?;
    writeln!(layer, "storage:\n  schema: {schema}")?;

    let chx = |args: &[&str]| -> anyhow::Result<Command> {
        let mut cmd = Command::cargo_bin("chx")?;
        cmd.env(chx_db::ENV_DB_URL, &url)
            .args(args)
            .arg("--config")
            .arg(&base)
            .arg("--config")
            .arg(layer.path());
        Ok(cmd)
    };

    chx(&["db", "status"])?
        .assert()
        .success()
        .stdout(predicate::str::contains("db_ok=true has_store_tables=false"));

    chx(&["db", "migrate"])?
        .assert()
        .success()
        .stdout(predicate::str::contains("migrations_applied=true"));
    // twice is fine
    chx(&["db", "migrate"])?.assert().success();

    chx(&["db", "status"])?
        .assert()
        .success()
        .stdout(predicate::str::contains("has_store_tables=true"));

    chx(&["subscriber", "add"])?
        .args(["--entity-type", "station", "--strategy", "log", "--priority", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("subscriber_id="));

    // unknown entity types never get a subscriber row
    chx(&["subscriber", "add"])?
        .args(["--entity-type", "lighthouse", "--strategy", "log"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown entity type: lighthouse"));

    let listed = chx(&["subscriber", "list"])?.output()?;
    let stdout = String::from_utf8_lossy(&listed.stdout).to_string();
    let line = stdout
        .lines()
        .find(|l| l.contains("entity_type=station"))
        .expect("station subscriber listed");
    assert!(line.contains("strategy=log status=active priority=5"));
    assert_eq!(stdout.lines().count(), 1);

    let id = line
        .split_whitespace()
        .find_map(|kv| kv.strip_prefix("subscriber_id="))
        .expect("subscriber id")
        .to_string();
    chx(&["subscriber", "set-status"])?
        .args(["--id", &id, "--status", "inactive"])
        .assert()
        .success()
        .stdout(predicate::str::contains("status=inactive"));

    // no delivery rows yet: an empty batch still takes and releases the lock
    chx(&["publish", "run"])?
        .assert()
        .success()
        .stdout(predicate::str::contains("lock_acquired=true"))
        .stdout(predicate::str::contains("claimed=0"))
        .stdout(predicate::str::contains("continuation_required=false"));

    chx(&["publish", "requeue-stale"])?
        .assert()
        .success()
        .stdout(predicate::str::contains("older_than_secs=900 requeued=0"));

    sqlx::query(&format!("drop schema \"{schema}\" cascade"))
        .execute(&pool)
        .await?;
    Ok(())
}
