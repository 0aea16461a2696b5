//! Bulk reconciliation of one entity type.
//!
//! One pass, one transaction:
//!
//! 1. detect changed ids (optionally capped);
//! 2. upsert their hash rows in chunks, clearing tombstones;
//! 3. tombstone active hashes whose row vanished, is soft-deleted, or left
//!    scope (the row's own deletion time when known);
//! 4. prune edges whose link no longer holds, then materialize the edges of
//!    every relation touching this type and mark dependencies built;
//! 5. recompute composites of every dependent touched by 2-4, one level at a
//!    time, until nothing changes.
//!
//! Any storage error drops the transaction and nothing of the pass is kept.

use crate::detect::ChangeDetector;
use crate::hashes::HashStore;
use crate::sql::{column, composite_sql, id_text_sql, link_sql, quote_table, SqlContext};
use anyhow::{Context, Result};
use chx_config::EngineSettings;
use chx_core::{HashableEntity, Relation};
use serde::Serialize;
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Entity ids needing composite recomputation, by entity type.
type DirtySet = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub entity_type: String,
    pub changed: u64,
    pub created: u64,
    pub updated: u64,
    pub tombstoned: u64,
    pub edges_created: u64,
    pub edges_pruned: u64,
    pub cascaded: u64,
    pub cascade_rounds: u32,
    pub cascade_truncated: bool,
}

impl ReconcileReport {
    /// Rows written by the pass. Zero on a quiet second run.
    pub fn writes(&self) -> u64 {
        self.created
            + self.updated
            + self.tombstoned
            + self.edges_created
            + self.edges_pruned
            + self.cascaded
    }
}

#[derive(Debug, Clone)]
pub struct BulkHashProcessor {
    store: HashStore,
    chunk_size: usize,
    change_limit: Option<i64>,
    max_cascade_depth: u32,
}

impl BulkHashProcessor {
    pub fn new(store: HashStore, engine: &EngineSettings) -> Self {
        Self {
            store,
            chunk_size: engine.chunk_size.max(1),
            change_limit: engine.change_limit,
            max_cascade_depth: engine.max_cascade_depth,
        }
    }

    pub fn store(&self) -> &HashStore {
        &self.store
    }

    /// Overrides the configured change limit for this processor.
    pub fn with_change_limit(mut self, limit: Option<i64>) -> Self {
        self.change_limit = limit;
        self
    }

    /// Run one reconciliation pass for `entity_type`.
    pub async fn reconcile(&self, entity_type: &str) -> Result<ReconcileReport> {
        let ctx = self.store.sql();
        let entity = Arc::clone(ctx.registry.require(entity_type)?);
        let mut report = ReconcileReport {
            entity_type: entity_type.to_string(),
            ..Default::default()
        };

        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .context("reconcile begin failed")?;

        // 1. detect
        let changed = ChangeDetector::new(ctx)
            .changed_ids(&mut *tx, entity_type, self.change_limit)
            .await?;
        report.changed = changed.len() as u64;
        debug!(entity_type, changed = changed.len(), "change detection done");

        // 2. upsert
        let mut touched_hashes: Vec<i64> = Vec::new();
        for chunk in changed.chunks(self.chunk_size) {
            let up = upsert_chunk(&mut *tx, ctx, entity.as_ref(), chunk).await?;
            report.created += up.created;
            report.updated += up.updated;
            touched_hashes.extend(up.hash_ids);
        }

        // 3. tombstone
        let tombstoned = tombstone_out_of_scope(&mut *tx, ctx, entity.as_ref()).await?;
        report.tombstoned = tombstoned.len() as u64;
        touched_hashes.extend(tombstoned);

        // 4. edges
        let mut dirty = dependents_of_hashes(&mut *tx, ctx, &touched_hashes).await?;
        for spec in edge_specs_touching(ctx, entity_type) {
            let pruned = prune_edges(&mut *tx, ctx, &spec).await?;
            report.edges_pruned += pruned.len() as u64;
            let inserted = insert_edges(&mut *tx, ctx, &spec).await?;
            report.edges_created += inserted.len() as u64;
            for (ty, id) in pruned.into_iter().chain(inserted) {
                dirty.entry(ty).or_default().insert(id);
            }
        }
        mark_dependencies_built(&mut *tx, ctx, entity_type).await?;

        // 5. cascade
        let cascade = self.cascade(&mut *tx, ctx, dirty).await?;
        report.cascaded = cascade.recomputed;
        report.cascade_rounds = cascade.rounds;
        report.cascade_truncated = cascade.truncated;

        tx.commit().await.context("reconcile commit failed")?;

        info!(
            entity_type,
            changed = report.changed,
            created = report.created,
            updated = report.updated,
            tombstoned = report.tombstoned,
            edges_created = report.edges_created,
            edges_pruned = report.edges_pruned,
            cascaded = report.cascaded,
            "reconcile pass done"
        );
        Ok(report)
    }

    async fn cascade(
        &self,
        conn: &mut PgConnection,
        ctx: SqlContext<'_>,
        mut dirty: DirtySet,
    ) -> Result<CascadeOutcome> {
        let mut out = CascadeOutcome::default();

        while !dirty.is_empty() {
            if out.rounds >= self.max_cascade_depth {
                warn!(
                    max_depth = self.max_cascade_depth,
                    pending_types = dirty.len(),
                    "composite cascade did not settle; remaining dependents left for the next pass"
                );
                out.truncated = true;
                break;
            }
            out.rounds += 1;

            let mut changed_hashes: Vec<i64> = Vec::new();
            for (entity_type, ids) in std::mem::take(&mut dirty) {
                let Some(entity) = ctx.registry.get(&entity_type) else {
                    debug!(entity_type, "skipping dependents of unregistered type");
                    continue;
                };
                let ids: Vec<String> = ids.into_iter().collect();
                for chunk in ids.chunks(self.chunk_size) {
                    let changed = recompute_composites(conn, ctx, entity.as_ref(), chunk).await?;
                    out.recomputed += changed.len() as u64;
                    changed_hashes.extend(changed);
                }
            }
            dirty = dependents_of_hashes(conn, ctx, &changed_hashes).await?;
        }
        Ok(out)
    }
}

#[derive(Debug, Default)]
struct CascadeOutcome {
    recomputed: u64,
    rounds: u32,
    truncated: bool,
}

#[derive(Debug, Default)]
struct UpsertOutcome {
    created: u64,
    updated: u64,
    hash_ids: Vec<i64>,
}

async fn upsert_chunk(
    conn: &mut PgConnection,
    ctx: SqlContext<'_>,
    entity: &dyn HashableEntity,
    ids: &[String],
) -> Result<UpsertOutcome> {
    let mut qb = QueryBuilder::<Postgres>::new("");
    ctx.push_candidate_ctes(&mut qb, entity, Some(ids))?;
    qb.push(format!(
        "insert into {} as h (entity_type, entity_id, attribute_hash, composite_hash) select ",
        ctx.tables.hashes()
    ));
    qb.push_bind(entity.entity_type().to_string());
    qb.push(
        ", c.entity_id, c.attribute_hash, c.composite_hash from cand c \
         on conflict (entity_type, entity_id) do update set \
           attribute_hash = excluded.attribute_hash, \
           composite_hash = excluded.composite_hash, \
           deleted_at = null, \
           updated_at = now() \
         where h.deleted_at is not null \
            or h.attribute_hash is distinct from excluded.attribute_hash \
            or h.composite_hash is distinct from excluded.composite_hash \
         returning h.id, (xmax = 0) as inserted",
    );

    let rows = qb
        .build()
        .fetch_all(&mut *conn)
        .await
        .with_context(|| format!("hash upsert failed for {}", entity.entity_type()))?;

    let mut out = UpsertOutcome::default();
    for row in rows {
        let inserted: bool = row.try_get("inserted")?;
        if inserted {
            out.created += 1;
        } else {
            out.updated += 1;
        }
        out.hash_ids.push(row.try_get("id")?);
    }
    Ok(out)
}

/// Returns the ids of the hash rows tombstoned.
async fn tombstone_out_of_scope(
    conn: &mut PgConnection,
    ctx: SqlContext<'_>,
    entity: &dyn HashableEntity,
) -> Result<Vec<i64>> {
    let hashes = ctx.tables.hashes();
    let row_deleted_at = match entity.soft_delete_column() {
        Some(col) => format!("{}::timestamptz", column("e", col)),
        None => "null::timestamptz".to_string(),
    };

    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "update {hashes} h set deleted_at = coalesce(x.row_deleted_at, now()), updated_at = now() \
         from (select h2.id, {row_deleted_at} as row_deleted_at from {hashes} h2 \
         left join {} e on {} = h2.entity_id \
         where h2.deleted_at is null and h2.entity_type = ",
        quote_table(entity.table()),
        id_text_sql(entity, "e"),
    ));
    qb.push_bind(entity.entity_type().to_string());
    qb.push(format!(
        " and ({} is null or not ",
        column("e", entity.id_column())
    ));
    ctx.push_in_scope(&mut qb, entity, "e")?;
    qb.push(")) x where h.id = x.id returning h.id");

    let rows = qb
        .build()
        .fetch_all(&mut *conn)
        .await
        .with_context(|| format!("tombstone failed for {}", entity.entity_type()))?;
    rows.iter()
        .map(|r| r.try_get::<i64, _>("id").map_err(Into::into))
        .collect()
}

/// Dependents consuming any of `hash_ids`.
async fn dependents_of_hashes(
    conn: &mut PgConnection,
    ctx: SqlContext<'_>,
    hash_ids: &[i64],
) -> Result<DirtySet> {
    let mut out = DirtySet::new();
    if hash_ids.is_empty() {
        return Ok(out);
    }
    let rows = sqlx::query(&format!(
        "select distinct dependent_type, dependent_id from {} where hash_id = any($1)",
        ctx.tables.hash_dependents()
    ))
    .bind(hash_ids.to_vec())
    .fetch_all(&mut *conn)
    .await
    .context("dependents lookup failed")?;

    for row in rows {
        let ty: String = row.try_get("dependent_type")?;
        let id: String = row.try_get("dependent_id")?;
        out.entry(ty).or_default().insert(id);
    }
    Ok(out)
}

/// Returns the ids of hash rows whose composite changed.
async fn recompute_composites(
    conn: &mut PgConnection,
    ctx: SqlContext<'_>,
    entity: &dyn HashableEntity,
    ids: &[String],
) -> Result<Vec<i64>> {
    let hashes = ctx.tables.hashes();
    let mut qb = QueryBuilder::<Postgres>::new("with dep as (");
    ctx.push_dependency_cte(&mut qb, entity.entity_type(), Some(ids));
    qb.push(format!(
        ") update {hashes} h set composite_hash = x.composite_hash, updated_at = now() \
         from (select h2.id, {} as composite_hash from {hashes} h2 \
         left join dep on dep.dependent_id = h2.entity_id \
         where h2.deleted_at is null and h2.entity_type = ",
        composite_sql(ctx.algorithm, "h2.attribute_hash", "dep.dependency_hash"),
    ));
    qb.push_bind(entity.entity_type().to_string());
    qb.push(" and h2.entity_id = any(");
    qb.push_bind(ids.to_vec());
    qb.push(
        ")) x where h.id = x.id and h.composite_hash is distinct from x.composite_hash \
         returning h.id",
    );

    let rows = qb
        .build()
        .fetch_all(&mut *conn)
        .await
        .with_context(|| format!("composite recompute failed for {}", entity.entity_type()))?;
    rows.iter()
        .map(|r| r.try_get::<i64, _>("id").map_err(Into::into))
        .collect()
}

async fn mark_dependencies_built(
    conn: &mut PgConnection,
    ctx: SqlContext<'_>,
    entity_type: &str,
) -> Result<()> {
    sqlx::query(&format!(
        "update {} set dependencies_built = true \
         where entity_type = $1 and deleted_at is null and not dependencies_built",
        ctx.tables.hashes()
    ))
    .bind(entity_type)
    .execute(&mut *conn)
    .await
    .context("mark dependencies_built failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeKind {
    /// The target's hash feeds the owner's composite.
    Composite,
    /// The owner's hash feeds the target (its parent).
    Parent,
}

/// One declared relation, resolved on both sides.
#[derive(Debug, Clone)]
struct EdgeSpec {
    kind: EdgeKind,
    owner: Arc<dyn HashableEntity>,
    target: Arc<dyn HashableEntity>,
    relation: Relation,
}

impl EdgeSpec {
    /// (alias, entity) of the row whose hash is consumed.
    fn source(&self) -> (&'static str, &dyn HashableEntity) {
        match self.kind {
            EdgeKind::Composite => ("x", self.target.as_ref()),
            EdgeKind::Parent => ("o", self.owner.as_ref()),
        }
    }

    /// (alias, entity) of the consuming row.
    fn dependent(&self) -> (&'static str, &dyn HashableEntity) {
        match self.kind {
            EdgeKind::Composite => ("o", self.owner.as_ref()),
            EdgeKind::Parent => ("x", self.target.as_ref()),
        }
    }

    /// `from <owner> o join <target> x on <link>`
    fn join_sql(&self) -> String {
        format!(
            "from {} o join {} x on {}",
            quote_table(self.owner.table()),
            quote_table(self.target.table()),
            link_sql(
                &self.relation,
                self.owner.as_ref(),
                "o",
                self.target.as_ref(),
                "x"
            ),
        )
    }
}

/// Every relation with `entity_type` on either side, from any registered type.
fn edge_specs_touching(ctx: SqlContext<'_>, entity_type: &str) -> Vec<EdgeSpec> {
    let mut out = Vec::new();
    for name in ctx.registry.types() {
        let Some(owner) = ctx.registry.get(name) else {
            continue;
        };
        let declared = owner
            .composite_dependency_relations()
            .iter()
            .map(|r| (EdgeKind::Composite, r))
            .chain(
                owner
                    .parent_relations()
                    .iter()
                    .map(|r| (EdgeKind::Parent, r)),
            );
        for (kind, rel) in declared {
            if name != entity_type && rel.target != entity_type {
                continue;
            }
            let Some(target) = ctx.registry.get(&rel.target) else {
                continue;
            };
            out.push(EdgeSpec {
                kind,
                owner: Arc::clone(owner),
                target: Arc::clone(target),
                relation: rel.clone(),
            });
        }
    }
    out
}

/// Delete edges of `spec` whose link no longer holds. Returns the former
/// dependents.
async fn prune_edges(
    conn: &mut PgConnection,
    ctx: SqlContext<'_>,
    spec: &EdgeSpec,
) -> Result<Vec<(String, String)>> {
    let (src_alias, src) = spec.source();
    let (dep_alias, dep) = spec.dependent();

    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "delete from {} d using {} hs where hs.id = d.hash_id and hs.entity_type = ",
        ctx.tables.hash_dependents(),
        ctx.tables.hashes(),
    ));
    qb.push_bind(src.entity_type().to_string());
    qb.push(" and d.dependent_type = ");
    qb.push_bind(dep.entity_type().to_string());
    qb.push(" and d.relation_name = ");
    qb.push_bind(spec.relation.name.clone());
    qb.push(format!(
        " and not exists (select 1 {} where {} = hs.entity_id and {} = d.dependent_id) \
         returning d.dependent_type, d.dependent_id",
        spec.join_sql(),
        id_text_sql(src, src_alias),
        id_text_sql(dep, dep_alias),
    ));

    let rows = qb
        .build()
        .fetch_all(&mut *conn)
        .await
        .with_context(|| format!("edge prune failed for relation {}", spec.relation.name))?;
    rows.iter()
        .map(|r| -> Result<(String, String)> {
            Ok((r.try_get("dependent_type")?, r.try_get("dependent_id")?))
        })
        .collect()
}

/// Insert the missing edges of `spec` between rows that both have an active
/// hash. Returns the dependents that gained an edge.
async fn insert_edges(
    conn: &mut PgConnection,
    ctx: SqlContext<'_>,
    spec: &EdgeSpec,
) -> Result<Vec<(String, String)>> {
    let (src_alias, src) = spec.source();
    let (dep_alias, dep) = spec.dependent();
    let hashes = ctx.tables.hashes();

    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "insert into {} (hash_id, dependent_type, dependent_id, relation_name) \
         select hs.id, hd.entity_type, hd.entity_id, ",
        ctx.tables.hash_dependents(),
    ));
    qb.push_bind(spec.relation.name.clone());
    qb.push(format!(
        " {} join {hashes} hs on hs.deleted_at is null and hs.entity_id = {} and hs.entity_type = ",
        spec.join_sql(),
        id_text_sql(src, src_alias),
    ));
    qb.push_bind(src.entity_type().to_string());
    qb.push(format!(
        " join {hashes} hd on hd.deleted_at is null and hd.entity_id = {} and hd.entity_type = ",
        id_text_sql(dep, dep_alias),
    ));
    qb.push_bind(dep.entity_type().to_string());
    qb.push(
        " order by hd.entity_id collate \"C\", hs.entity_id collate \"C\" \
         on conflict (hash_id, dependent_type, dependent_id) do nothing \
         returning dependent_type, dependent_id",
    );

    let rows = qb
        .build()
        .fetch_all(&mut *conn)
        .await
        .with_context(|| format!("edge insert failed for relation {}", spec.relation.name))?;
    rows.iter()
        .map(|r| -> Result<(String, String)> {
            Ok((r.try_get("dependent_type")?, r.try_get("dependent_id")?))
        })
        .collect()
}
