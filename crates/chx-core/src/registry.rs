//! Static registry of hashable entity types, keyed by type name.

use crate::entity::{DeclaredEntity, HashableEntity};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    Duplicate(String),
    UnknownType(String),
    UnknownRelationTarget {
        entity_type: String,
        relation: String,
        target: String,
    },
    UnknownScopeParent {
        entity_type: String,
        relation: String,
    },
    /// Types that could not be ordered (they sit on or behind a cycle).
    Cycle(Vec<String>),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Duplicate(t) => write!(f, "entity type registered twice: {t}"),
            RegistryError::UnknownType(t) => write!(f, "unknown entity type: {t}"),
            RegistryError::UnknownRelationTarget {
                entity_type,
                relation,
                target,
            } => write!(
                f,
                "relation {entity_type}.{relation} targets unregistered type {target}"
            ),
            RegistryError::UnknownScopeParent {
                entity_type,
                relation,
            } => write!(
                f,
                "scope_parent of {entity_type} names unknown relation {relation}"
            ),
            RegistryError::Cycle(types) => {
                write!(f, "dependency cycle between entity types: {}", types.join(", "))
            }
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    by_type: BTreeMap<String, Arc<dyn HashableEntity>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and validate a registry from config-declared entities.
    pub fn from_declared(entities: Vec<DeclaredEntity>) -> Result<Self, RegistryError> {
        let mut reg = Self::new();
        for e in entities {
            reg.register(Arc::new(e))?;
        }
        reg.validate()?;
        Ok(reg)
    }

    pub fn register(&mut self, entity: Arc<dyn HashableEntity>) -> Result<(), RegistryError> {
        let key = entity.entity_type().to_string();
        if self.by_type.contains_key(&key) {
            return Err(RegistryError::Duplicate(key));
        }
        self.by_type.insert(key, entity);
        Ok(())
    }

    pub fn get(&self, entity_type: &str) -> Option<&Arc<dyn HashableEntity>> {
        self.by_type.get(entity_type)
    }

    pub fn require(&self, entity_type: &str) -> Result<&Arc<dyn HashableEntity>, RegistryError> {
        self.get(entity_type)
            .ok_or_else(|| RegistryError::UnknownType(entity_type.to_string()))
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.by_type.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    /// Every relation target must be registered and every `scope_parent`
    /// must name a declared relation. Also rejects dependency cycles.
    pub fn validate(&self) -> Result<(), RegistryError> {
        for (name, entity) in &self.by_type {
            for rel in entity
                .composite_dependency_relations()
                .iter()
                .chain(entity.parent_relations().iter())
            {
                if !self.by_type.contains_key(&rel.target) {
                    return Err(RegistryError::UnknownRelationTarget {
                        entity_type: name.clone(),
                        relation: rel.name.clone(),
                        target: rel.target.clone(),
                    });
                }
            }
            if let Some(sp) = entity.scope_parent() {
                if entity.find_relation(sp).is_none() {
                    return Err(RegistryError::UnknownScopeParent {
                        entity_type: name.clone(),
                        relation: sp.to_string(),
                    });
                }
            }
        }
        self.dependency_order().map(|_| ())
    }

    /// Entity types ordered leaves first: a type comes after every type whose
    /// hashes feed its composite hash. Ties break by name.
    pub fn dependency_order(&self) -> Result<Vec<String>, RegistryError> {
        // feeds[x] = types that must come after x
        let mut feeds: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
        for name in self.by_type.keys() {
            feeds.entry(name.as_str()).or_default();
            indegree.entry(name.as_str()).or_insert(0);
        }

        let mut add_edge = |before: &'_ str, after: &'_ str| -> Option<()> {
            let before = self.by_type.get_key_value(before)?.0.as_str();
            let after = self.by_type.get_key_value(after)?.0.as_str();
            if before != after && feeds.entry(before).or_default().insert(after) {
                *indegree.entry(after).or_insert(0) += 1;
            }
            Some(())
        };

        for (name, entity) in &self.by_type {
            for rel in entity.composite_dependency_relations() {
                add_edge(&rel.target, name);
            }
            for rel in entity.parent_relations() {
                add_edge(name, &rel.target);
            }
        }

        let mut ready: BTreeSet<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut order = Vec::with_capacity(self.by_type.len());

        while let Some(next) = ready.pop_first() {
            order.push(next.to_string());
            if let Some(afters) = feeds.get(next) {
                for after in afters {
                    if let Some(d) = indegree.get_mut(after) {
                        *d -= 1;
                        if *d == 0 {
                            ready.insert(after);
                        }
                    }
                }
            }
        }

        if order.len() != self.by_type.len() {
            let stuck = indegree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(n, _)| n.to_string())
                .collect();
            return Err(RegistryError::Cycle(stuck));
        }
        Ok(order)
    }
}
