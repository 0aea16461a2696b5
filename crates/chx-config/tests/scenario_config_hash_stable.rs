//! Scenario: config hash stability.
//!
//! GREEN when:
//! - The same inputs produce the same `config_hash`.
//! - Key order inside a document does not change the hash.
//! - A later layer overrides an earlier one and changes the hash.
//! - An empty overlay document changes nothing.

use chx_config::{load_layered_yaml, load_layered_yaml_from_strings};
use std::io::Write;

const BASE_YAML: &str = r#"
engine:
  hash_algorithm: md5
  chunk_size: 500
publish:
  retry_intervals: [30, 300, 21600]
storage:
  database_url_env: CHX_DATABASE_URL
"#;

const BASE_YAML_REORDERED: &str = r#"
storage:
  database_url_env: CHX_DATABASE_URL
publish:
  retry_intervals: [30, 300, 21600]
engine:
  chunk_size: 500
  hash_algorithm: md5
"#;

const OVERLAY_YAML: &str = r#"
engine:
  hash_algorithm: sha256
"#;

#[test]
fn same_input_produces_identical_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    assert_eq!(a.config_hash, b.config_hash);
    assert_eq!(a.canonical_json, b.canonical_json);
    assert_eq!(a.config_hash.len(), 64);
}

#[test]
fn reordered_keys_produce_same_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML_REORDERED]).unwrap();
    assert_eq!(a.config_hash, b.config_hash);
}

#[test]
fn overlay_overrides_and_changes_hash() {
    let base = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let merged = load_layered_yaml_from_strings(&[BASE_YAML, OVERLAY_YAML]).unwrap();
    assert_ne!(base.config_hash, merged.config_hash);

    let s = merged.settings().unwrap();
    assert_eq!(s.engine.hash_algorithm.as_str(), "sha256");
    // untouched sibling survives the merge
    assert_eq!(s.engine.chunk_size, 500);
}

#[test]
fn empty_overlay_is_a_no_op() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML, ""]).unwrap();
    assert_eq!(a.config_hash, b.config_hash);
}

#[test]
fn files_load_like_strings() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(BASE_YAML.as_bytes()).unwrap();
    let from_file = load_layered_yaml(&[f.path()]).unwrap();
    let from_str = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    assert_eq!(from_file.config_hash, from_str.config_hash);
}

#[test]
fn missing_file_is_an_error_naming_the_path() {
    let err = load_layered_yaml(&["/definitely/not/here.yaml"]).unwrap_err();
    assert!(format!("{err:#}").contains("/definitely/not/here.yaml"));
}
