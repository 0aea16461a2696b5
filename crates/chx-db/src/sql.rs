//! SQL composition for the hash engine.
//!
//! Everything the engine asks of Postgres is built here from the entity
//! contract: the attribute-hash expression, the dependency-hash aggregate, the
//! composite expression and the scope predicate. The single-row, bulk and
//! change-detection paths all use these same fragments, so they agree by
//! construction with each other and with the in-process hashers in chx-core.
//!
//! Identifiers are always quoted. Scope literals are always bound.

use crate::tables::StoreTables;
use anyhow::{bail, Result};
use chx_core::{
    AttributeHasher, EntityRegistry, HashAlgorithm, HashableEntity, Relation, RelationLink, Scope,
    ScopeValue, TableRef,
};
use sqlx::{Postgres, QueryBuilder};

/// Scope-parent chains deeper than this are rejected.
const MAX_SCOPE_PARENT_DEPTH: usize = 16;

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn quote_table(table: &TableRef) -> String {
    match &table.schema {
        Some(s) => format!("{}.{}", quote_ident(s), quote_ident(&table.name)),
        None => quote_ident(&table.name),
    }
}

pub fn column(alias: &str, name: &str) -> String {
    format!("{alias}.{}", quote_ident(name))
}

/// Hex digest of a text expression.
pub fn digest_sql(algorithm: HashAlgorithm, expr: &str) -> String {
    match algorithm {
        HashAlgorithm::Md5 => format!("md5({expr})"),
        HashAlgorithm::Sha256 => format!("encode(sha256(convert_to({expr}, 'UTF8')), 'hex')"),
    }
}

/// The entity id as text, the form stored in `hashes.entity_id`.
pub fn id_text_sql(entity: &dyn HashableEntity, alias: &str) -> String {
    format!("{}::text", column(alias, entity.id_column()))
}

/// Attribute hash of the row at `alias`: attribute names sorted, NULL as
/// empty string, joined with `|`.
pub fn attribute_hash_sql(
    algorithm: HashAlgorithm,
    entity: &dyn HashableEntity,
    alias: &str,
) -> String {
    let names = AttributeHasher::ordered_names(entity.hashable_attributes());
    if names.is_empty() {
        return digest_sql(algorithm, "''::text");
    }
    let parts = names
        .iter()
        .map(|n| format!("coalesce({}::text, '')", column(alias, n)))
        .collect::<Vec<_>>()
        .join(", ");
    digest_sql(algorithm, &format!("concat_ws('|', {parts})"))
}

/// Composite of an attribute hash and a nullable dependency hash.
pub fn composite_sql(algorithm: HashAlgorithm, attribute: &str, dependency: &str) -> String {
    format!(
        "case when {dependency} is null then {attribute} else {} end",
        digest_sql(algorithm, &format!("{attribute} || '|' || {dependency}"))
    )
}

/// Join condition between `owner` (at `owner_alias`) and the target of `rel`
/// (at `target_alias`).
pub fn link_sql(
    rel: &Relation,
    owner: &dyn HashableEntity,
    owner_alias: &str,
    target: &dyn HashableEntity,
    target_alias: &str,
) -> String {
    match &rel.link {
        RelationLink::HasMany { foreign_key } => format!(
            "{} = {}",
            column(target_alias, foreign_key),
            column(owner_alias, owner.id_column())
        ),
        RelationLink::BelongsTo { foreign_key } => format!(
            "{} = {}",
            column(owner_alias, foreign_key),
            column(target_alias, target.id_column())
        ),
    }
}

fn push_value(qb: &mut QueryBuilder<'_, Postgres>, value: &ScopeValue) {
    match value {
        ScopeValue::Bool(b) => {
            qb.push_bind(*b);
        }
        ScopeValue::Int(i) => {
            qb.push_bind(*i);
        }
        ScopeValue::Float(f) => {
            qb.push_bind(*f);
        }
        ScopeValue::Text(s) => {
            qb.push_bind(s.clone());
        }
    }
}

/// Render a scope predicate over the row at `alias`. NULL handling is left
/// to SQL; callers wrap the result in `coalesce(.., false)`.
pub fn push_scope(qb: &mut QueryBuilder<'_, Postgres>, scope: &Scope, alias: &str) {
    match scope {
        Scope::Compare { column: c, op, value } => {
            qb.push(format!("{} {} ", column(alias, c), op.sql()));
            push_value(qb, value);
        }
        Scope::IsNull { column: c } => {
            qb.push(format!("{} is null", column(alias, c)));
        }
        Scope::NotNull { column: c } => {
            qb.push(format!("{} is not null", column(alias, c)));
        }
        Scope::In { column: c, values } => {
            if values.is_empty() {
                qb.push("false");
                return;
            }
            qb.push(format!("{} in (", column(alias, c)));
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                push_value(qb, v);
            }
            qb.push(")");
        }
        Scope::All(items) => push_junction(qb, items, alias, " and ", "true"),
        Scope::Any(items) => push_junction(qb, items, alias, " or ", "false"),
        Scope::Not(inner) => {
            qb.push("not (");
            push_scope(qb, inner, alias);
            qb.push(")");
        }
    }
}

fn push_junction(
    qb: &mut QueryBuilder<'_, Postgres>,
    items: &[Scope],
    alias: &str,
    sep: &str,
    empty: &str,
) {
    if items.is_empty() {
        qb.push(empty);
        return;
    }
    qb.push("(");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            qb.push(sep);
        }
        qb.push("(");
        push_scope(qb, item, alias);
        qb.push(")");
    }
    qb.push(")");
}

/// Shared inputs of every statement the engine builds.
#[derive(Debug, Clone, Copy)]
pub struct SqlContext<'a> {
    pub registry: &'a EntityRegistry,
    pub tables: &'a StoreTables,
    pub algorithm: HashAlgorithm,
}

impl<'a> SqlContext<'a> {
    pub fn new(
        registry: &'a EntityRegistry,
        tables: &'a StoreTables,
        algorithm: HashAlgorithm,
    ) -> Self {
        Self {
            registry,
            tables,
            algorithm,
        }
    }

    /// Full inclusion test for the row at `alias`: not soft-deleted, passes
    /// its own scope, and its scope parent (recursively) is in scope too.
    /// Always definitely true or false, never NULL.
    pub fn push_in_scope(
        &self,
        qb: &mut QueryBuilder<'_, Postgres>,
        entity: &dyn HashableEntity,
        alias: &str,
    ) -> Result<()> {
        self.push_in_scope_at(qb, entity, alias, 0)
    }

    fn push_in_scope_at(
        &self,
        qb: &mut QueryBuilder<'_, Postgres>,
        entity: &dyn HashableEntity,
        alias: &str,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_SCOPE_PARENT_DEPTH {
            bail!(
                "scope_parent chain deeper than {MAX_SCOPE_PARENT_DEPTH} at {}",
                entity.entity_type()
            );
        }

        qb.push("(true");
        if let Some(col) = entity.soft_delete_column() {
            qb.push(format!(" and {} is null", column(alias, col)));
        }
        if let Some(scope) = entity.inclusion_scope() {
            qb.push(" and coalesce((");
            push_scope(qb, scope, alias);
            qb.push("), false)");
        }
        if let Some(rel_name) = entity.scope_parent() {
            let Some(rel) = entity.find_relation(rel_name) else {
                bail!(
                    "scope_parent of {} names unknown relation {rel_name}",
                    entity.entity_type()
                );
            };
            let parent = self.registry.require(&rel.target)?;
            let parent_alias = format!("sp{depth}");
            qb.push(format!(
                " and exists (select 1 from {} {parent_alias} where {} and ",
                quote_table(parent.table()),
                link_sql(rel, entity, alias, parent.as_ref(), &parent_alias),
            ));
            self.push_in_scope_at(qb, parent.as_ref(), &parent_alias, depth + 1)?;
            qb.push(")");
        }
        qb.push(")");
        Ok(())
    }

    /// Body of a CTE yielding `(dependent_id, dependency_hash)` for every
    /// dependent of `entity_type` with at least one active dependency.
    ///
    /// Ordering inside the aggregate is edge insertion order, then the
    /// referenced entity's type, then its id, all compared bytewise.
    pub fn push_dependency_cte(
        &self,
        qb: &mut QueryBuilder<'_, Postgres>,
        entity_type: &str,
        ids: Option<&[String]>,
    ) {
        let agg = "string_agg(coalesce(h.composite_hash, h.attribute_hash), '|' \
                   order by d.id, h.entity_type collate \"C\", h.entity_id collate \"C\")";
        qb.push(format!(
            "select d.dependent_id, {} as dependency_hash from {} d join {} h \
             on h.id = d.hash_id and h.deleted_at is null where d.dependent_type = ",
            digest_sql(self.algorithm, agg),
            self.tables.hash_dependents(),
            self.tables.hashes(),
        ));
        qb.push_bind(entity_type.to_string());
        if let Some(ids) = ids {
            qb.push(" and d.dependent_id = any(");
            qb.push_bind(ids.to_vec());
            qb.push(")");
        }
        qb.push(" group by d.dependent_id");
    }

    /// `with dep as (..), fresh as (..), cand as (..)`: the freshly derived
    /// hashes of every in-scope row of `entity` (restricted to `ids` when
    /// given). `cand` has `entity_id`, `attribute_hash`, `composite_hash`.
    pub fn push_candidate_ctes(
        &self,
        qb: &mut QueryBuilder<'_, Postgres>,
        entity: &dyn HashableEntity,
        ids: Option<&[String]>,
    ) -> Result<()> {
        let id_text = id_text_sql(entity, "e");

        qb.push("with dep as (");
        self.push_dependency_cte(qb, entity.entity_type(), ids);
        qb.push(format!(
            "), fresh as (select {id_text} as entity_id, {} as attribute_hash, \
             dep.dependency_hash from {} e left join dep on dep.dependent_id = {id_text} where ",
            attribute_hash_sql(self.algorithm, entity, "e"),
            quote_table(entity.table()),
        ));
        self.push_in_scope(qb, entity, "e")?;
        if let Some(ids) = ids {
            qb.push(format!(" and {id_text} = any("));
            qb.push_bind(ids.to_vec());
            qb.push(")");
        }
        qb.push(format!(
            "), cand as (select f.entity_id, f.attribute_hash, {} as composite_hash from fresh f) ",
            composite_sql(self.algorithm, "f.attribute_hash", "f.dependency_hash"),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chx_core::{CompareOp, DeclaredEntity};

    fn station() -> DeclaredEntity {
        DeclaredEntity::new(
            "station",
            TableRef::qualified("public", "stations"),
            &["name", "country"],
        )
        .with_soft_delete("deleted_at")
        .with_scope(Scope::equals("country", "NL"))
    }

    fn anemometer() -> DeclaredEntity {
        DeclaredEntity::new("anemometer", TableRef::new("anemometers"), &["speed"])
            .with_parent(Relation::belongs_to("station", "station", "station_id"))
            .with_scope(Scope::compare("accuracy", CompareOp::Gt, 90))
            .with_scope_parent("station")
    }

    #[test]
    fn attribute_expression_sorts_names_and_coalesces() {
        let e = DeclaredEntity::new("t", TableRef::new("t"), &["zeta", "alpha"]);
        assert_eq!(
            attribute_hash_sql(HashAlgorithm::Md5, &e, "e"),
            r#"md5(concat_ws('|', coalesce(e."alpha"::text, ''), coalesce(e."zeta"::text, '')))"#
        );
        let empty = DeclaredEntity::new("t", TableRef::new("t"), &[]);
        assert_eq!(
            attribute_hash_sql(HashAlgorithm::Sha256, &empty, "e"),
            "encode(sha256(convert_to(''::text, 'UTF8')), 'hex')"
        );
    }

    #[test]
    fn identifiers_are_escaped() {
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
        assert_eq!(
            quote_table(&TableRef::qualified("a", "b")),
            r#""a"."b""#
        );
    }

    #[test]
    fn in_scope_walks_scope_parent_and_binds_literals() {
        let reg = EntityRegistry::from_declared(vec![station(), anemometer()]).unwrap();
        let tables = StoreTables::default();
        let ctx = SqlContext::new(&reg, &tables, HashAlgorithm::Md5);
        let a = reg.require("anemometer").unwrap();

        let mut qb = QueryBuilder::<Postgres>::new("");
        ctx.push_in_scope(&mut qb, a.as_ref(), "e").unwrap();
        let sql = qb.sql();

        assert_eq!(
            sql,
            "(true and coalesce((e.\"accuracy\" > $1), false) and exists (select 1 from \
             \"public\".\"stations\" sp0 where e.\"station_id\" = sp0.\"id\" and (true and \
             sp0.\"deleted_at\" is null and coalesce((sp0.\"country\" = $2), false))))"
        );
    }

    #[test]
    fn empty_junctions_render_identities() {
        let mut qb = QueryBuilder::<Postgres>::new("");
        push_scope(&mut qb, &Scope::Any(vec![]), "e");
        qb.push(" ");
        push_scope(&mut qb, &Scope::All(vec![]), "e");
        qb.push(" ");
        push_scope(&mut qb, &Scope::In { column: "c".into(), values: vec![] }, "e");
        assert_eq!(qb.sql(), "false true false");
    }
}
