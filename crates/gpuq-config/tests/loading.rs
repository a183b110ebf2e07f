use std::path::Path;

use gpuq_config::{ConfigError, Overrides, TemplateCatalog};
use gpuq_domain::{CapabilityClass, TaskMode};

fn fixture_catalog() -> TemplateCatalog {
    TemplateCatalog::new(Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures"))
}

#[test]
fn resolve_with_defaults() {
    let catalog = fixture_catalog();
    let resolved = catalog.resolve("loading-test", &Overrides::default()).unwrap();

    assert_eq!(resolved.definition.mode, TaskMode::Oneoff);
    assert_eq!(resolved.definition.class, CapabilityClass::Low);
    assert_eq!(resolved.definition.timeout_seconds, 60);
    assert_eq!(
        resolved.definition.model_id.as_ref().map(|m| m.as_str()),
        Some("demo")
    );
    assert_eq!(resolved.action.image, "gpuq/loading-worker:latest");
    let model = resolved.model_path.expect("loading-test names a model");
    assert_eq!(model.path, Path::new("/var/lib/gpuq/models/demo"));
}

#[test]
fn resolve_applies_overrides() {
    let catalog = fixture_catalog();
    let overrides = Overrides {
        class: Some(CapabilityClass::High),
        timeout_seconds: Some(120),
        metadata: [("warmup".to_string(), serde_json::json!(false))].into(),
    };
    let resolved = catalog.resolve("loading-test", &overrides).unwrap();

    assert_eq!(resolved.definition.class, CapabilityClass::High);
    assert_eq!(resolved.definition.timeout_seconds, 120);
    // Override wins per key; untouched keys survive.
    assert_eq!(resolved.definition.metadata["warmup"], serde_json::json!(false));
    // Mode and image are never overridable; they come from the catalog only.
    assert_eq!(resolved.definition.mode, TaskMode::Oneoff);
    assert_eq!(resolved.action.image, "gpuq/loading-worker:latest");
}

#[test]
fn resolve_is_idempotent_under_identical_overrides() {
    let catalog = fixture_catalog();
    let overrides = Overrides {
        class: Some(CapabilityClass::High),
        timeout_seconds: Some(90),
        metadata: [("k".to_string(), serde_json::json!("v"))].into(),
    };
    let a = catalog.resolve("chat", &overrides).unwrap();
    let b = catalog.resolve("chat", &overrides).unwrap();
    assert_eq!(a.definition, b.definition);
    assert_eq!(a.action, b.action);
    assert_eq!(a.model_path, b.model_path);
}

#[test]
fn task_without_model_resolves_no_path() {
    let catalog = fixture_catalog();
    let resolved = catalog.resolve("bench", &Overrides::default()).unwrap();
    assert!(resolved.definition.model_id.is_none());
    assert!(resolved.model_path.is_none());
}

#[test]
fn unknown_template_is_an_error() {
    let catalog = fixture_catalog();
    let err = catalog.resolve("nope", &Overrides::default()).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownTemplate(_)));
}

#[test]
fn fixture_catalog_validates() {
    fixture_catalog().validate().unwrap();
}

#[test]
fn validation_rejects_definition_without_action() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("task_definitions.yml"),
        "orphan:\n  timeout_seconds: 30\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("task_actions.yml"), "{}\n").unwrap();
    std::fs::write(dir.path().join("model_paths.yml"), "{}\n").unwrap();

    let err = TemplateCatalog::new(dir.path()).validate().unwrap_err();
    assert!(matches!(err, ConfigError::MissingAction(name) if name == "orphan"));
}

#[test]
fn validation_rejects_dangling_model_reference() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("task_definitions.yml"),
        "t:\n  model_id: ghost\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("task_actions.yml"),
        "t:\n  image: img\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("model_paths.yml"), "{}\n").unwrap();

    let err = TemplateCatalog::new(dir.path()).validate().unwrap_err();
    assert!(matches!(err, ConfigError::MissingModelPath { model, .. } if model == "ghost"));
}

#[test]
fn missing_dir_returns_error() {
    let catalog = TemplateCatalog::new("/nonexistent/path/does/not/exist");
    assert!(catalog.resolve("x", &Overrides::default()).is_err());
}
