//! Hash rows, dependency edges, and the database forms of the hashers.

use crate::sql::{
    attribute_hash_sql, composite_sql, id_text_sql, quote_table, SqlContext,
};
use crate::tables::StoreTables;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chx_core::{EntityRegistry, HashAlgorithm, HashableEntity};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRow {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub attribute_hash: String,
    pub composite_hash: Option<String>,
    pub dependencies_built: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HashRow {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// The hash subscribers see.
    pub fn current_hash(&self) -> &str {
        self.composite_hash
            .as_deref()
            .unwrap_or(self.attribute_hash.as_str())
    }

    fn from_row(row: &PgRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            attribute_hash: row.try_get("attribute_hash")?,
            composite_hash: row.try_get("composite_hash")?,
            dependencies_built: row.try_get("dependencies_built")?,
            deleted_at: row.try_get("deleted_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// "Hash `hash_id` (of `entity_type`/`entity_id`) is consumed by
/// `dependent_type`/`dependent_id` via `relation_name`."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRow {
    pub id: i64,
    pub hash_id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub dependent_type: String,
    pub dependent_id: String,
    pub relation_name: String,
}

impl EdgeRow {
    fn from_row(row: &PgRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            hash_id: row.try_get("hash_id")?,
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            dependent_type: row.try_get("dependent_type")?,
            dependent_id: row.try_get("dependent_id")?,
            relation_name: row.try_get("relation_name")?,
        })
    }
}

const HASH_COLUMNS: &str = "id, entity_type, entity_id, attribute_hash, composite_hash, \
                            dependencies_built, deleted_at, created_at, updated_at";

/// Handle on the hash store for one registry and hash algorithm.
#[derive(Debug, Clone)]
pub struct HashStore {
    pool: PgPool,
    registry: Arc<EntityRegistry>,
    tables: StoreTables,
    algorithm: HashAlgorithm,
}

impl HashStore {
    pub fn new(
        pool: PgPool,
        registry: Arc<EntityRegistry>,
        tables: StoreTables,
        algorithm: HashAlgorithm,
    ) -> Self {
        Self {
            pool,
            registry,
            tables,
            algorithm,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn tables(&self) -> &StoreTables {
        &self.tables
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn sql(&self) -> SqlContext<'_> {
        SqlContext::new(&self.registry, &self.tables, self.algorithm)
    }

    fn entity(&self, entity_type: &str) -> Result<&Arc<dyn HashableEntity>> {
        Ok(self.registry.require(entity_type)?)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The hash row for an entity, active or tombstoned.
    pub async fn get(&self, entity_type: &str, entity_id: &str) -> Result<Option<HashRow>> {
        let row = sqlx::query(&format!(
            "select {HASH_COLUMNS} from {} where entity_type = $1 and entity_id = $2",
            self.tables.hashes()
        ))
        .bind(entity_type)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .context("hash get failed")?;
        row.as_ref().map(HashRow::from_row).transpose()
    }

    /// Every hash row of a type, tombstones included, by entity id.
    pub async fn list(&self, entity_type: &str) -> Result<Vec<HashRow>> {
        let rows = sqlx::query(&format!(
            "select {HASH_COLUMNS} from {} where entity_type = $1 order by entity_id",
            self.tables.hashes()
        ))
        .bind(entity_type)
        .fetch_all(&self.pool)
        .await
        .context("hash list failed")?;
        rows.iter().map(HashRow::from_row).collect()
    }

    pub async fn count_active(&self, entity_type: &str) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as(&format!(
            "select count(*)::bigint from {} where entity_type = $1 and deleted_at is null",
            self.tables.hashes()
        ))
        .bind(entity_type)
        .fetch_one(&self.pool)
        .await
        .context("hash count_active failed")?;
        Ok(n)
    }

    /// Edges whose dependent is the given entity, in dependency-hash order.
    pub async fn dependencies_of(
        &self,
        dependent_type: &str,
        dependent_id: &str,
    ) -> Result<Vec<EdgeRow>> {
        let rows = sqlx::query(&format!(
            r#"
            select d.id, d.hash_id, h.entity_type, h.entity_id,
                   d.dependent_type, d.dependent_id, d.relation_name
            from {} d
            join {} h on h.id = d.hash_id
            where d.dependent_type = $1 and d.dependent_id = $2
            order by d.id, h.entity_type collate "C", h.entity_id collate "C"
            "#,
            self.tables.hash_dependents(),
            self.tables.hashes()
        ))
        .bind(dependent_type)
        .bind(dependent_id)
        .fetch_all(&self.pool)
        .await
        .context("dependencies_of failed")?;
        rows.iter().map(EdgeRow::from_row).collect()
    }

    /// Edges consuming the given entity's hash.
    pub async fn dependents_of(&self, entity_type: &str, entity_id: &str) -> Result<Vec<EdgeRow>> {
        let rows = sqlx::query(&format!(
            r#"
            select d.id, d.hash_id, h.entity_type, h.entity_id,
                   d.dependent_type, d.dependent_id, d.relation_name
            from {} d
            join {} h on h.id = d.hash_id
            where h.entity_type = $1 and h.entity_id = $2
            order by d.dependent_type, d.dependent_id
            "#,
            self.tables.hash_dependents(),
            self.tables.hashes()
        ))
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .context("dependents_of failed")?;
        rows.iter().map(EdgeRow::from_row).collect()
    }

    /// The backing row as a JSON object, or `None` when it no longer exists.
    pub async fn entity_document(&self, entity_type: &str, entity_id: &str) -> Result<Option<Value>> {
        let entity = self.entity(entity_type)?;
        let row = sqlx::query(&format!(
            "select to_jsonb(e) as doc from {} e where {} = $1",
            quote_table(entity.table()),
            id_text_sql(entity.as_ref(), "e"),
        ))
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .context("entity_document failed")?;
        row.map(|r| r.try_get::<Value, _>("doc"))
            .transpose()
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Hashers, database form. These hash row content; scope is not applied.
    // -----------------------------------------------------------------------

    /// Bulk attribute hashes in one round trip. Ids without a backing row
    /// are absent from the result.
    pub async fn attribute_hashes_for(
        &self,
        entity_type: &str,
        ids: &[String],
    ) -> Result<BTreeMap<String, String>> {
        let entity = self.entity(entity_type)?;
        let id_text = id_text_sql(entity.as_ref(), "e");
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "select {id_text} as entity_id, {} as attribute_hash from {} e where {id_text} = any(",
            attribute_hash_sql(self.algorithm, entity.as_ref(), "e"),
            quote_table(entity.table()),
        ));
        qb.push_bind(ids.to_vec());
        qb.push(")");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("attribute_hashes_for failed")?;
        let mut out = BTreeMap::new();
        for row in rows {
            out.insert(row.try_get("entity_id")?, row.try_get("attribute_hash")?);
        }
        Ok(out)
    }

    pub async fn attribute_hash_for(&self, entity_type: &str, id: &str) -> Result<Option<String>> {
        let mut m = self
            .attribute_hashes_for(entity_type, &[id.to_string()])
            .await?;
        Ok(m.remove(id))
    }

    /// Bulk dependency hashes keyed by id. Every requested id is present;
    /// `None` means no active dependencies.
    pub async fn dependency_hashes_for(
        &self,
        entity_type: &str,
        ids: &[String],
    ) -> Result<BTreeMap<String, Option<String>>> {
        let mut qb = QueryBuilder::<Postgres>::new("");
        self.sql().push_dependency_cte(&mut qb, entity_type, Some(ids));

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("dependency_hashes_for failed")?;
        let mut found: BTreeMap<String, Option<String>> = BTreeMap::new();
        for row in rows {
            found.insert(row.try_get("dependent_id")?, row.try_get("dependency_hash")?);
        }
        Ok(ids
            .iter()
            .map(|id| (id.clone(), found.get(id).cloned().flatten()))
            .collect())
    }

    pub async fn dependency_hash_for(&self, entity_type: &str, id: &str) -> Result<Option<String>> {
        let m = self
            .dependency_hashes_for(entity_type, &[id.to_string()])
            .await?;
        Ok(m.get(id).cloned().flatten())
    }

    /// Bulk composite hashes keyed by id. Every requested id is present; an
    /// id without a backing row cannot be computed and maps to `None`.
    pub async fn composite_hashes_for(
        &self,
        entity_type: &str,
        ids: &[String],
    ) -> Result<BTreeMap<String, Option<String>>> {
        let entity = self.entity(entity_type)?;
        let id_text = id_text_sql(entity.as_ref(), "e");

        let mut qb = QueryBuilder::<Postgres>::new("with dep as (");
        self.sql().push_dependency_cte(&mut qb, entity_type, Some(ids));
        qb.push(format!(
            ") select {id_text} as entity_id, {} as composite_hash from {} e \
             left join dep on dep.dependent_id = {id_text} where {id_text} = any(",
            composite_sql(
                self.algorithm,
                &attribute_hash_sql(self.algorithm, entity.as_ref(), "e"),
                "dep.dependency_hash"
            ),
            quote_table(entity.table()),
        ));
        qb.push_bind(ids.to_vec());
        qb.push(")");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("composite_hashes_for failed")?;
        let mut found: BTreeMap<String, String> = BTreeMap::new();
        for row in rows {
            found.insert(row.try_get("entity_id")?, row.try_get("composite_hash")?);
        }
        Ok(ids
            .iter()
            .map(|id| (id.clone(), found.get(id).cloned()))
            .collect())
    }

    pub async fn composite_hash_for(&self, entity_type: &str, id: &str) -> Result<Option<String>> {
        let m = self
            .composite_hashes_for(entity_type, &[id.to_string()])
            .await?;
        Ok(m.get(id).cloned().flatten())
    }
}
