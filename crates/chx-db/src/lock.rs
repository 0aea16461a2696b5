//! Process-wide batch lock on a Postgres advisory lock.
//!
//! The lock lives on a connection detached from the pool, so it is held
//! exactly as long as the [`BatchLock`] value: dropping it closes the
//! connection and the server releases the lock.

use anyhow::{Context, Result};
use sqlx::{Connection, PgConnection, PgPool};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// `None` when the timeout is too large for the clock: wait without limit.
fn deadline_after(now: Instant, timeout: Duration) -> Option<Instant> {
    now.checked_add(timeout)
}

#[derive(Debug)]
pub struct BatchLock {
    conn: PgConnection,
    name: String,
}

impl BatchLock {
    /// Try to take the lock `name`, polling until `timeout`. `None` when
    /// another holder kept it the whole time.
    pub async fn acquire(pool: &PgPool, name: &str, timeout: Duration) -> Result<Option<Self>> {
        let mut conn = pool
            .acquire()
            .await
            .context("batch lock connection failed")?
            .detach();
        let deadline = deadline_after(Instant::now(), timeout);

        loop {
            let (got,): (bool,) = sqlx::query_as("select pg_try_advisory_lock(hashtext($1))")
                .bind(name)
                .fetch_one(&mut conn)
                .await
                .context("pg_try_advisory_lock failed")?;
            if got {
                debug!(lock = name, "batch lock acquired");
                return Ok(Some(Self {
                    conn,
                    name: name.to_string(),
                }));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(lock = name, timeout_secs = timeout.as_secs(), "batch lock busy");
                let _ = conn.close().await;
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn release(mut self) -> Result<()> {
        sqlx::query("select pg_advisory_unlock(hashtext($1))")
            .bind(&self.name)
            .execute(&mut self.conn)
            .await
            .context("pg_advisory_unlock failed")?;
        debug!(lock = %self.name, "batch lock released");
        self.conn.close().await.context("batch lock close failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huge_timeout_means_no_deadline() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::from_secs(u64::MAX)), None);
        assert_eq!(
            deadline_after(now, Duration::from_secs(30)),
            Some(now + Duration::from_secs(30))
        );
        assert_eq!(deadline_after(now, Duration::ZERO), Some(now));
    }
}
