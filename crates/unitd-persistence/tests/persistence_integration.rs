//! ---
//! unitd_section: "15-testing-qa-runbook"
//! unitd_subsection: "tests"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "Hook and charm record integration tests."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
use tempfile::tempdir;
use unitd_persistence::record::write_record;
use unitd_persistence::{
    CharmChangeKind, CharmRef, CharmState, CharmStateFile, CharmStatus, HookInfo, HookKind,
    HookPhase, HookStateStore, UnitProgress,
};

#[test]
fn hook_phases_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hook");
    let hook = HookInfo::new(HookKind::ConfigChanged);

    let mut store = HookStateStore::new(&path);
    assert!(store.read().unwrap().is_none());
    store.start(&hook, Some("abc".into())).unwrap();
    store.write(&hook, HookPhase::Succeeded).unwrap();

    let mut reopened = HookStateStore::new(&path);
    let state = reopened.read().unwrap().unwrap();
    assert_eq!(state.hook, hook);
    assert_eq!(state.phase, HookPhase::Succeeded);
    assert!(state.in_flight());
    assert_eq!(state.config_digest.as_deref(), Some("abc"));
}

#[test]
fn progress_is_carried_across_hooks() {
    let dir = tempdir().unwrap();
    let mut store = HookStateStore::new(dir.path().join("hook"));
    let start = HookInfo::new(HookKind::Start);
    store.start(&start, None).unwrap();
    store
        .commit(
            &start,
            UnitProgress {
                started: true,
                applied_config: Some("abc".into()),
            },
        )
        .unwrap();

    let stop = HookInfo::new(HookKind::Stop);
    store.start(&stop, None).unwrap();
    let progress = store.progress();
    assert!(progress.started);
    assert_eq!(progress.applied_config.as_deref(), Some("abc"));
    assert!(store.current().unwrap().in_flight());
}

#[test]
fn malformed_hook_info_is_corrupt() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hook");
    // A relation hook without its relation id passes the envelope checks only.
    write_record(
        &path,
        &serde_json::json!({
            "hook": { "kind": "relation-joined" },
            "phase": "started"
        }),
    )
    .unwrap();
    let err = HookStateStore::new(&path).read().unwrap_err();
    assert!(err.is_corrupt());
}

#[test]
fn charm_intent_survives_reopen_until_installed() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("charm");
    let charm = CharmRef::parse("cs:precise/mysql-12").unwrap();
    CharmStateFile::new(&path)
        .write(&CharmState {
            status: CharmChangeKind::Upgrading.into(),
            charm: Some(charm.clone()),
        })
        .unwrap();

    let record = CharmStateFile::new(&path);
    let intent = record.read().unwrap().unwrap().intent().unwrap();
    assert_eq!(intent.kind, CharmChangeKind::Upgrading);
    assert_eq!(intent.charm, charm);

    record
        .write(&CharmState {
            status: CharmStatus::Installed,
            charm: Some(charm),
        })
        .unwrap();
    assert!(record.read().unwrap().unwrap().intent().is_none());
}
