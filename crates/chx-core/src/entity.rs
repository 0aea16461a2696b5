//! Entity contract.
//!
//! Every hashable entity type implements [`HashableEntity`] once and is
//! resolved by name through the [`crate::EntityRegistry`]. The engine never
//! inspects rows by reflection; everything it needs to build SQL comes from
//! this capability interface.

use crate::scope::Scope;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ready-to-query table reference. Cross-database qualification happens
/// before this point; the engine only quotes the parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    #[serde(default)]
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    pub fn qualified(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(s) => write!(f, "{}.{}", s, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// How two entity rows are linked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationLink {
    /// `target.<foreign_key> = owner.id`
    HasMany { foreign_key: String },
    /// `owner.<foreign_key> = target.id`
    BelongsTo { foreign_key: String },
}

/// A named relation from the owning entity type to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub name: String,
    /// Entity type name of the other side.
    pub target: String,
    pub link: RelationLink,
}

impl Relation {
    pub fn has_many(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            link: RelationLink::HasMany {
                foreign_key: foreign_key.into(),
            },
        }
    }

    pub fn belongs_to(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            link: RelationLink::BelongsTo {
                foreign_key: foreign_key.into(),
            },
        }
    }
}

/// Capability interface implemented once per entity type.
pub trait HashableEntity: Send + Sync + fmt::Debug {
    /// Registry key, stored in `hashes.entity_type`.
    fn entity_type(&self) -> &str;

    fn table(&self) -> &TableRef;

    fn id_column(&self) -> &str {
        "id"
    }

    /// Timestamp column marking the backing row itself as soft-deleted.
    fn soft_delete_column(&self) -> Option<&str> {
        None
    }

    /// Attributes feeding the attribute hash. Order is irrelevant.
    fn hashable_attributes(&self) -> &[String];

    /// Relations whose targets' hashes feed this entity's composite hash.
    fn composite_dependency_relations(&self) -> &[Relation] {
        &[]
    }

    /// Relations to entities that consume this entity's hash.
    fn parent_relations(&self) -> &[Relation] {
        &[]
    }

    /// Row-level eligibility for an active hash. `None` means every live row.
    fn inclusion_scope(&self) -> Option<&Scope> {
        None
    }

    /// Name of a parent relation whose target must itself be in scope.
    fn scope_parent(&self) -> Option<&str> {
        None
    }

    fn find_relation(&self, name: &str) -> Option<&Relation> {
        self.composite_dependency_relations()
            .iter()
            .chain(self.parent_relations().iter())
            .find(|r| r.name == name)
    }
}

/// Entity type declared in configuration rather than in code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredEntity {
    pub entity_type: String,
    pub table: TableRef,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default)]
    pub soft_delete_column: Option<String>,
    pub attributes: Vec<String>,
    #[serde(default)]
    pub composite_dependencies: Vec<Relation>,
    #[serde(default)]
    pub parents: Vec<Relation>,
    #[serde(default)]
    pub scope: Option<Scope>,
    #[serde(default)]
    pub scope_parent: Option<String>,
}

fn default_id_column() -> String {
    "id".to_string()
}

impl DeclaredEntity {
    pub fn new(entity_type: impl Into<String>, table: TableRef, attributes: &[&str]) -> Self {
        Self {
            entity_type: entity_type.into(),
            table,
            id_column: default_id_column(),
            soft_delete_column: None,
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
            composite_dependencies: Vec::new(),
            parents: Vec::new(),
            scope: None,
            scope_parent: None,
        }
    }

    pub fn with_soft_delete(mut self, column: impl Into<String>) -> Self {
        self.soft_delete_column = Some(column.into());
        self
    }

    pub fn with_dependency(mut self, relation: Relation) -> Self {
        self.composite_dependencies.push(relation);
        self
    }

    pub fn with_parent(mut self, relation: Relation) -> Self {
        self.parents.push(relation);
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_scope_parent(mut self, relation_name: impl Into<String>) -> Self {
        self.scope_parent = Some(relation_name.into());
        self
    }
}

impl HashableEntity for DeclaredEntity {
    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn table(&self) -> &TableRef {
        &self.table
    }

    fn id_column(&self) -> &str {
        &self.id_column
    }

    fn soft_delete_column(&self) -> Option<&str> {
        self.soft_delete_column.as_deref()
    }

    fn hashable_attributes(&self) -> &[String] {
        &self.attributes
    }

    fn composite_dependency_relations(&self) -> &[Relation] {
        &self.composite_dependencies
    }

    fn parent_relations(&self) -> &[Relation] {
        &self.parents
    }

    fn inclusion_scope(&self) -> Option<&Scope> {
        self.scope.as_ref()
    }

    fn scope_parent(&self) -> Option<&str> {
        self.scope_parent.as_deref()
    }
}
