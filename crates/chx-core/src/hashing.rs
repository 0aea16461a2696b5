//! Content hashing.
//!
//! Three layers, each with a single-entity and a bulk form:
//!
//! ```text
//!   attribute_hash = H( v(a1) | v(a2) | ... )         names sorted, NULL -> ""
//!   dependency_hash = H( h(d1) | h(d2) | ... )        None when no edges
//!   composite_hash  = attribute_hash                   when dependency_hash is None
//!                   = H( attribute_hash | dependency_hash )
//! ```
//!
//! `h(d)` is the referenced hash row's composite hash, falling back to its
//! attribute hash. Dependencies are ordered by edge insertion sequence, then
//! entity type, then entity id (byte order). chx-db renders the same
//! expressions in SQL; both sides must produce identical digests.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Separator used between hashed fields at every layer.
pub const HASH_SEPARATOR: &str = "|";

/// Digest used for every layer of the hash tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "md5" => Some(HashAlgorithm::Md5),
            "sha256" | "sha-256" => Some(HashAlgorithm::Sha256),
            _ => None,
        }
    }

    /// Lowercase hex digest of `input` (UTF-8 bytes).
    pub fn digest_hex(&self, input: &str) -> String {
        match self {
            HashAlgorithm::Md5 => hex::encode(md5::Md5::digest(input.as_bytes())),
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
        }
    }

    /// Length of the hex digest this algorithm produces.
    pub fn hex_len(&self) -> usize {
        match self {
            HashAlgorithm::Md5 => 32,
            HashAlgorithm::Sha256 => 64,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AttributeHasher
// ---------------------------------------------------------------------------

/// Hashes an entity's own declared attributes.
#[derive(Debug, Clone, Copy)]
pub struct AttributeHasher {
    algorithm: HashAlgorithm,
}

impl AttributeHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Attribute names in hashing order: sorted, deduplicated.
    ///
    /// Declaration order never matters, so two entity types listing the same
    /// attributes differently hash identically.
    pub fn ordered_names<S: AsRef<str>>(names: &[S]) -> Vec<String> {
        names
            .iter()
            .map(|n| n.as_ref().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// The pre-image that gets hashed: values in attribute-name order joined
    /// by `|`, NULL (`None`) as the empty string. Only keys present in
    /// `values` take part; callers pass every declared attribute.
    pub fn canonical_string(values: &BTreeMap<String, Option<String>>) -> String {
        values
            .values()
            .map(|v| v.as_deref().unwrap_or(""))
            .collect::<Vec<_>>()
            .join(HASH_SEPARATOR)
    }

    /// Single-entity form. Keys are attribute names, values their textual form
    /// (`None` for NULL).
    pub fn hash(&self, values: &BTreeMap<String, Option<String>>) -> String {
        self.algorithm.digest_hex(&Self::canonical_string(values))
    }

    /// Bulk form; identical to calling [`AttributeHasher::hash`] per row.
    pub fn hash_many<K: Ord + Clone>(
        &self,
        rows: &BTreeMap<K, BTreeMap<String, Option<String>>>,
    ) -> BTreeMap<K, String> {
        rows.iter()
            .map(|(id, values)| (id.clone(), self.hash(values)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// DependencyHasher
// ---------------------------------------------------------------------------

/// One referenced hash row feeding a dependent entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyHashInput {
    /// Insertion sequence of the edge (the edge row id).
    pub edge_seq: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub attribute_hash: String,
    pub composite_hash: Option<String>,
}

impl DependencyHashInput {
    fn effective_hash(&self) -> &str {
        self.composite_hash
            .as_deref()
            .unwrap_or(self.attribute_hash.as_str())
    }
}

/// Aggregates the hashes of an entity's dependencies.
#[derive(Debug, Clone, Copy)]
pub struct DependencyHasher {
    algorithm: HashAlgorithm,
}

impl DependencyHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    /// `None` when there are no dependencies. This is not the hash of the
    /// empty string: callers fall back to the attribute hash alone.
    pub fn hash(&self, inputs: &[DependencyHashInput]) -> Option<String> {
        if inputs.is_empty() {
            return None;
        }
        let mut ordered: Vec<&DependencyHashInput> = inputs.iter().collect();
        ordered.sort_by(|a, b| {
            (a.edge_seq, a.entity_type.as_bytes(), a.entity_id.as_bytes()).cmp(&(
                b.edge_seq,
                b.entity_type.as_bytes(),
                b.entity_id.as_bytes(),
            ))
        });
        let joined = ordered
            .iter()
            .map(|d| d.effective_hash())
            .collect::<Vec<_>>()
            .join(HASH_SEPARATOR);
        Some(self.algorithm.digest_hex(&joined))
    }

    /// Bulk form keyed by entity id. Every id in `ids` gets an entry; ids
    /// without dependencies map to `None`.
    pub fn hash_many<K: Ord + Clone>(
        &self,
        ids: &[K],
        inputs: &BTreeMap<K, Vec<DependencyHashInput>>,
    ) -> BTreeMap<K, Option<String>> {
        ids.iter()
            .map(|id| {
                let h = inputs.get(id).and_then(|deps| self.hash(deps));
                (id.clone(), h)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// CompositeHashCalculator
// ---------------------------------------------------------------------------

/// Combines attribute and dependency hashes into one hash per entity.
#[derive(Debug, Clone, Copy)]
pub struct CompositeHashCalculator {
    algorithm: HashAlgorithm,
}

impl CompositeHashCalculator {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn composite(&self, attribute_hash: &str, dependency_hash: Option<&str>) -> String {
        match dependency_hash {
            None => attribute_hash.to_string(),
            Some(dep) => self
                .algorithm
                .digest_hex(&format!("{attribute_hash}{HASH_SEPARATOR}{dep}")),
        }
    }

    /// Bulk form. An id with no attribute hash cannot be computed and maps to
    /// `None`; it is never guessed from the dependency hash alone.
    pub fn composite_many<K: Ord + Clone>(
        &self,
        ids: &[K],
        attribute_hashes: &BTreeMap<K, String>,
        dependency_hashes: &BTreeMap<K, Option<String>>,
    ) -> BTreeMap<K, Option<String>> {
        ids.iter()
            .map(|id| {
                let composite = attribute_hashes.get(id).map(|attr| {
                    let dep = dependency_hashes.get(id).and_then(|d| d.as_deref());
                    self.composite(attr, dep)
                });
                (id.clone(), composite)
            })
            .collect()
    }
}
