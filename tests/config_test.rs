//! 配置加载测试 - 随仓库提供的示例配置必须能通过校验

use auto_continue::config::PROJECT_CONFIG_PATH;
use auto_continue::{Config, ConfigError, OutputClassifier, OutputEvent, Phase};
use chrono::NaiveTime;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn sample_config() -> Config {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(PROJECT_CONFIG_PATH);
    Config::load(&path).expect("sample config should load")
}

#[test]
fn test_sample_config_loads() {
    let config = sample_config();
    assert_eq!(config.idle_timeout, Duration::from_secs(180));
    assert_eq!(config.max_iterations, None);
    assert!(config.quota_wait);
    assert_eq!(config.prompts.get(Phase::A).name, "Implement");
    assert_eq!(config.prompts.get(Phase::C).model_preference, "sonnet");
}

#[test]
fn test_sample_patterns_match_claude_output() {
    let config = sample_config();
    let classifier = OutputClassifier::new(config.classifier_rules());

    assert!(classifier
        .detect_permission("Bash command\n  rm -rf target\nDo you want to proceed?\n❯ 1. Yes")
        .is_some());

    let deadline = classifier
        .detect_rate_limit("Claude usage limit reached. Try again at 5pm")
        .expect("rate limit notice");
    assert_eq!(deadline.hour_24(), 17);
    assert_eq!(
        deadline.wait_from(NaiveTime::from_hms_opt(14, 0, 0).unwrap()),
        Duration::from_secs(3 * 3600)
    );
}

#[test]
fn test_classifier_built_from_config() {
    let config = sample_config();
    let mut classifier = OutputClassifier::new(config.classifier_rules());
    assert!(matches!(
        classifier.classify("Do you want to proceed?"),
        OutputEvent::PermissionRequest { .. }
    ));
    assert!(classifier.classify("? for shortcuts").is_noise());
}

#[test]
fn test_project_config_preferred_over_user_config() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join(PROJECT_CONFIG_PATH);
    fs::create_dir_all(target.parent().unwrap()).unwrap();
    fs::copy(Path::new(env!("CARGO_MANIFEST_DIR")).join(PROJECT_CONFIG_PATH), &target).unwrap();

    let resolved = Config::resolve_path(None, dir.path());
    assert_eq!(resolved, target);
    assert!(Config::load(&resolved).is_ok());
}

#[test]
fn test_state_and_log_paths_relative_to_project() {
    let config = sample_config();
    let root = Path::new("/tmp/project");
    assert_eq!(config.state_path(root), root.join(".auto-continue-state"));
    assert_eq!(config.log_path(root), root.join(".auto-continue.log"));
}

#[test]
fn test_missing_command_reported() {
    let json = fs::read_to_string(Path::new(env!("CARGO_MANIFEST_DIR")).join(PROJECT_CONFIG_PATH))
        .unwrap()
        .replace(r#""command": "claude""#, r#""command": "definitely-not-installed-cli-xyz""#);
    let config = Config::parse(&json, "test").unwrap();
    assert!(matches!(
        config.resolve_command(),
        Err(ConfigError::CommandNotFound(name)) if name == "definitely-not-installed-cli-xyz"
    ));
}
