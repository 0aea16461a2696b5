//! Scenario: strict scope comparisons exclude the boundary value.
//!
//! A `gt` threshold never admits the threshold itself, and an inherited
//! parent-scope declaration parses from configuration YAML.

use chx_core::{DeclaredEntity, EntityRegistry, HashableEntity, Scope};
use serde_json::{json, Map, Value};

fn row(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap_or_default()
}

#[test]
fn gt_excludes_exact_boundary() {
    let scope = Scope::gt("accuracy", 90);
    assert!(!scope.matches(&row(json!({"accuracy": 90}))));
    assert!(scope.matches(&row(json!({"accuracy": 91}))));
    assert!(Scope::gte("accuracy", 90).matches(&row(json!({"accuracy": 90}))));
}

#[test]
fn float_boundary_is_strict_too() {
    let scope = Scope::gt("accuracy", 90.0);
    assert!(!scope.matches(&row(json!({"accuracy": 90.0}))));
    assert!(scope.matches(&row(json!({"accuracy": 90.5}))));
}

const ENTITIES_YAML: &str = r#"
- entity_type: station
  table: { name: stations }
  soft_delete_column: deleted_at
  attributes: [name, country]
  composite_dependencies:
    - name: anemometers
      target: anemometer
      link: { has_many: { foreign_key: station_id } }
  scope:
    compare: { column: country, op: eq, value: NL }
- entity_type: anemometer
  table: { schema: weather, name: anemometers }
  attributes: [speed, accuracy]
  parents:
    - name: station
      target: station
      link: { belongs_to: { foreign_key: station_id } }
  scope:
    all:
      - compare: { column: accuracy, op: gte, value: 90 }
      - not_null: { column: station_id }
  scope_parent: station
"#;

#[test]
fn declared_entities_parse_and_validate() {
    let declared: Vec<DeclaredEntity> = serde_yaml::from_str(ENTITIES_YAML).unwrap();
    let reg = EntityRegistry::from_declared(declared).unwrap();

    let anemometer = reg.get("anemometer").unwrap();
    assert_eq!(anemometer.scope_parent(), Some("station"));
    assert_eq!(anemometer.table().to_string(), "weather.anemometers");
    assert_eq!(anemometer.id_column(), "id");

    let scope = anemometer.inclusion_scope().unwrap();
    assert_eq!(scope.columns(), vec!["accuracy".to_string(), "station_id".to_string()]);
    assert!(scope.matches(&row(json!({"accuracy": 95, "station_id": 1}))));
    assert!(!scope.matches(&row(json!({"accuracy": 95, "station_id": null}))));

    assert_eq!(
        reg.dependency_order().unwrap(),
        vec!["anemometer".to_string(), "station".to_string()]
    );
}
