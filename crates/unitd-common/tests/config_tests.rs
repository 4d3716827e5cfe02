//! ---
//! unitd_section: "15-testing-qa-runbook"
//! unitd_subsection: "tests"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "Configuration loading integration tests."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
use std::path::PathBuf;

use tempfile::tempdir;
use unitd_common::config::AgentConfig;
use unitd_common::LogFormat;

#[test]
fn load_picks_first_existing_candidate() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("missing.toml");
    let present = dir.path().join("agent.toml");
    std::fs::write(
        &present,
        r#"
            unit_name = "mysql/3"
            data_dir = "/srv/unitd"
            charm_repository = "/srv/charms"

            [logging]
            format = "pretty"

            [state]
            seed = "/srv/seed.json"
        "#,
    )
    .unwrap();

    let loaded = AgentConfig::load_with_source(&[missing, present.clone()]).unwrap();
    assert_eq!(loaded.source, present);
    assert_eq!(loaded.config.unit_name, "mysql/3");
    assert_eq!(loaded.config.logging.format, LogFormat::Pretty);
    assert_eq!(loaded.config.state.seed, Some(PathBuf::from("/srv/seed.json")));

    let paths = loaded.config.uniter().paths();
    assert_eq!(paths.root, PathBuf::from("/srv/unitd/units/mysql-3"));
}

#[test]
fn load_reports_inspected_candidates() {
    let dir = tempdir().unwrap();
    let candidate = dir.path().join("absent.toml");
    let err = AgentConfig::load(&[candidate]).unwrap_err();
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn shipped_example_config_parses() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../configs/unitd.example.toml");
    let raw = std::fs::read_to_string(path).unwrap();
    let config: AgentConfig = raw.parse().unwrap();
    assert_eq!(config.unit_name, "wordpress/0");
    assert_eq!(config.hooks.timeout, std::time::Duration::from_secs(300));
    assert_eq!(config.commit_retry.delay, std::time::Duration::from_millis(500));
    assert!(config.metrics.enabled);
}
