use mcp_intercept::config::{DefendConfig, RuleDisposition};
use mcp_intercept::proxy::rules::{RuleRegistry, ANNOTATION_RULE, INJECTION_RULE};
use mcp_intercept::AppError;

fn sample_toml() -> &'static str {
    r#"
truncate_chars = 400

[rules]
tool-description-injection = "block"
annotation-suspicious = "warn"
"#
}

#[test]
fn parses_valid_config() {
    let config = DefendConfig::from_toml_str(sample_toml()).expect("config parses");

    assert_eq!(config.truncate_chars, 400);
    assert_eq!(
        config.rules.get(INJECTION_RULE),
        Some(&RuleDisposition::Block)
    );
    assert_eq!(
        config.rules.get(ANNOTATION_RULE),
        Some(&RuleDisposition::Warn)
    );
}

#[test]
fn empty_config_takes_defaults() {
    let config = DefendConfig::from_toml_str("").expect("empty config parses");

    assert_eq!(config, DefendConfig::default());
    assert!(config.rules.is_empty());
}

#[test]
fn rejects_unknown_disposition() {
    let toml = r#"
[rules]
tool-description-injection = "audit"
"#;

    let result = DefendConfig::from_toml_str(toml);
    assert!(
        matches!(result, Err(AppError::Config(_))),
        "unknown dispositions must be rejected, got: {result:?}"
    );
}

#[test]
fn rejects_tiny_truncate_chars() {
    let result = DefendConfig::from_toml_str("truncate_chars = 8");

    match result {
        Err(AppError::Config(msg)) => assert!(
            msg.contains("at least 16"),
            "error must name the lower bound, got: {msg}"
        ),
        other => panic!("expected Err(AppError::Config), got: {other:?}"),
    }
}

#[test]
fn apply_arms_and_unregisters_rules() {
    let config = DefendConfig::from_toml_str(
        r#"
[rules]
tool-description-injection = "block"
annotation-suspicious = "off"
"#,
    )
    .expect("config parses");

    let mut registry = RuleRegistry::builtin();
    config.apply(&mut registry).expect("dispositions apply");

    assert!(registry.has_blocking(), "injection rule must now block");
    assert_eq!(registry.len(), 1, "annotation rule must be unregistered");
    assert_eq!(registry.rules()[0].name, INJECTION_RULE);
}

#[test]
fn apply_rejects_unknown_rule_name() {
    let config = DefendConfig::from_toml_str(
        r#"
[rules]
no-such-rule = "block"
"#,
    )
    .expect("config parses");

    let mut registry = RuleRegistry::builtin();
    let result = config.apply(&mut registry);

    match result {
        Err(AppError::Config(msg)) => assert!(
            msg.contains("no-such-rule"),
            "error must name the unknown rule, got: {msg}"
        ),
        other => panic!("expected Err(AppError::Config), got: {other:?}"),
    }
}

#[test]
fn loads_config_from_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("defend.toml");
    std::fs::write(&path, sample_toml()).expect("write config");

    let config = DefendConfig::load_from_path(&path).expect("config loads");
    assert_eq!(config.truncate_chars, 400);
}

#[test]
fn missing_config_file_is_reported() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("does-not-exist.toml");

    let result = DefendConfig::load_from_path(&path);

    match result {
        Err(AppError::Config(msg)) => assert!(
            msg.contains("failed to read config"),
            "error must mention the read failure, got: {msg}"
        ),
        other => panic!("expected Err(AppError::Config), got: {other:?}"),
    }
}
