//! Change detection.
//!
//! An entity has changed when its freshly derived hashes differ from its
//! active hash row, or when it is in scope and has no active row at all.
//! Decided in one set-oriented query; rows are never loaded into the process.

use crate::sql::SqlContext;
use anyhow::{Context, Result};
use chx_core::HashableEntity;
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};

#[derive(Debug, Clone, Copy)]
pub struct ChangeDetector<'a> {
    ctx: SqlContext<'a>,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(ctx: SqlContext<'a>) -> Self {
        Self { ctx }
    }

    fn push_changed(
        &self,
        qb: &mut QueryBuilder<'_, Postgres>,
        entity: &dyn HashableEntity,
        select_list: &str,
    ) -> Result<()> {
        self.ctx.push_candidate_ctes(qb, entity, None)?;
        qb.push(format!(
            "select {select_list} from cand c left join {} h on h.entity_type = ",
            self.ctx.tables.hashes()
        ));
        qb.push_bind(entity.entity_type().to_string());
        qb.push(
            " and h.entity_id = c.entity_id \
             where h.id is null \
                or h.deleted_at is not null \
                or h.attribute_hash is distinct from c.attribute_hash \
                or h.composite_hash is distinct from c.composite_hash",
        );
        Ok(())
    }

    /// Ids of changed entities, ordered by id, at most `limit` of them.
    pub async fn changed_ids(
        &self,
        conn: &mut PgConnection,
        entity_type: &str,
        limit: Option<i64>,
    ) -> Result<Vec<String>> {
        let entity = self.ctx.registry.require(entity_type)?;
        let mut qb = QueryBuilder::<Postgres>::new("");
        self.push_changed(&mut qb, entity.as_ref(), "c.entity_id")?;
        qb.push(" order by c.entity_id");
        if let Some(n) = limit {
            qb.push(" limit ");
            qb.push_bind(n.max(0));
        }

        let rows = qb
            .build()
            .fetch_all(&mut *conn)
            .await
            .with_context(|| format!("changed_ids failed for {entity_type}"))?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("entity_id").map_err(Into::into))
            .collect()
    }

    /// Number of changed entities; used for dry runs.
    pub async fn count(&self, conn: &mut PgConnection, entity_type: &str) -> Result<i64> {
        let entity = self.ctx.registry.require(entity_type)?;
        let mut qb = QueryBuilder::<Postgres>::new("");
        self.push_changed(&mut qb, entity.as_ref(), "count(*)::bigint as n")?;

        let row = qb
            .build()
            .fetch_one(&mut *conn)
            .await
            .with_context(|| format!("changed count failed for {entity_type}"))?;
        Ok(row.try_get("n")?)
    }
}
