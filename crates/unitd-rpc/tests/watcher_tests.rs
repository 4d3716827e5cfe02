//! ---
//! unitd_section: "15-testing-qa-runbook"
//! unitd_subsection: "tests"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "Entity watcher delivery and shutdown tests."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::timeout;
use unitd_rpc::{
    EntityWatcher, InMemoryState, Life, MachineDoc, RpcCaller, ServiceDoc, StateClient, UnitDoc,
    MACHINE_FACADE, SERVICE_FACADE, UNIT_FACADE,
};

const QUIET: Duration = Duration::from_millis(100);
const PROMPT: Duration = Duration::from_secs(2);

fn state() -> InMemoryState {
    let state = InMemoryState::new();
    state.add_service(ServiceDoc {
        name: "wordpress".into(),
        charm_url: "local:wordpress-1".into(),
        config: BTreeMap::new(),
        life: Life::Alive,
    });
    state.add_unit(UnitDoc::new("wordpress/0", "wordpress"));
    state
}

fn config(title: &str) -> BTreeMap<String, Value> {
    BTreeMap::from([("title".to_owned(), Value::from(title))])
}

async fn watch_service(state: &InMemoryState) -> EntityWatcher {
    let caller: Arc<dyn RpcCaller> = Arc::new(state.clone());
    EntityWatcher::watch(caller, SERVICE_FACADE, "wordpress")
        .await
        .unwrap()
}

#[tokio::test]
async fn first_notification_is_immediate() {
    let state = state();
    let mut watcher = watch_service(&state).await;
    assert_eq!(timeout(PROMPT, watcher.changed()).await.unwrap(), Some(()));
    assert!(timeout(QUIET, watcher.changed()).await.is_err());
    watcher.stop().await.unwrap();
}

#[tokio::test]
async fn updates_between_deliveries_coalesce() {
    let state = state();
    let mut watcher = watch_service(&state).await;

    assert!(state.update_config("wordpress", config("one")));
    assert!(state.update_config("wordpress", config("two")));
    timeout(PROMPT, watcher.changed()).await.unwrap();
    timeout(PROMPT, watcher.changed()).await.unwrap();
    assert!(timeout(QUIET, watcher.changed()).await.is_err());

    assert!(!state.update_config("wordpress", config("two")));
    assert!(timeout(QUIET, watcher.changed()).await.is_err());

    watcher.stop().await.unwrap();
}

#[tokio::test]
async fn stop_issues_exactly_one_remote_stop() {
    let state = state();
    let mut watcher = watch_service(&state).await;
    timeout(PROMPT, watcher.changed()).await.unwrap();
    // Let the delivery task block in Next.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let id = watcher.watcher_id().to_owned();
    timeout(PROMPT, watcher.stop()).await.unwrap().unwrap();
    assert_eq!(state.stop_calls(&id), 1);
    assert!(state.watcher_ids().is_empty());
    assert!(watcher.err().is_none());

    state.update_config("wordpress", config("after"));
    assert_eq!(watcher.changed().await, None);
    assert_eq!(state.stop_calls(&id), 1);
}

#[tokio::test]
async fn stop_discards_undelivered_notification() {
    let state = state();
    let mut watcher = watch_service(&state).await;
    // The initial notification is buffered but never taken.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let id = watcher.watcher_id().to_owned();
    watcher.stop().await.unwrap();
    assert_eq!(watcher.changed().await, None);
    assert_eq!(state.stop_calls(&id), 1);
}

#[tokio::test]
async fn server_side_stop_is_an_error() {
    let state = state();
    let mut watcher = watch_service(&state).await;
    timeout(PROMPT, watcher.changed()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let id = watcher.watcher_id().to_owned();
    assert!(state.kill_watcher(&id));
    assert_eq!(timeout(PROMPT, watcher.changed()).await.unwrap(), None);
    let err = watcher.wait().await.unwrap_err();
    assert!(err.is_stopped_or_not_found());
    assert_eq!(watcher.err(), Some(err));
    assert_eq!(state.stop_calls(&id), 1);
}

#[tokio::test]
async fn next_transport_failure_is_surfaced() {
    let state = state();
    let mut watcher = watch_service(&state).await;
    state.fail_next("Next", 1);
    timeout(PROMPT, watcher.changed()).await.unwrap();
    assert_eq!(timeout(PROMPT, watcher.changed()).await.unwrap(), None);
    assert!(watcher.wait().await.unwrap_err().is_transport());
}

#[tokio::test]
async fn registration_failure_can_be_retried() {
    let state = state();
    let caller: Arc<dyn RpcCaller> = Arc::new(state.clone());
    state.fail_next("Watch", 1);
    let err = EntityWatcher::watch(caller.clone(), UNIT_FACADE, "wordpress/0")
        .await
        .unwrap_err();
    assert!(err.is_transport());
    let mut watcher = EntityWatcher::watch(caller, UNIT_FACADE, "wordpress/0")
        .await
        .unwrap();
    watcher.stop().await.unwrap();
}

#[tokio::test]
async fn accessors_watch_and_refresh() {
    let state = state();
    let client = StateClient::new(Arc::new(state.clone()));
    let mut unit = client.unit("wordpress/0").await.unwrap();
    let mut watcher = unit.watch().await.unwrap();
    timeout(PROMPT, watcher.changed()).await.unwrap();

    state.set_unit_life("wordpress/0", Life::Dying);
    timeout(PROMPT, watcher.changed()).await.unwrap();
    unit.refresh().await.unwrap();
    assert_eq!(unit.life(), Life::Dying);

    unit.set_password("s3cret").await.unwrap();
    assert_eq!(state.password(UNIT_FACADE, "wordpress/0").as_deref(), Some("s3cret"));
    watcher.stop().await.unwrap();

    assert!(client.unit("mysql/0").await.unwrap_err().is_stopped_or_not_found());
}

#[tokio::test]
async fn machine_password_and_watch() {
    let state = state();
    state.add_machine(MachineDoc {
        id: "3".into(),
        instance_id: None,
        life: Life::Alive,
    });
    let client = StateClient::new(Arc::new(state.clone()));
    let machine = client.machine("3").await.unwrap();
    assert!(machine.instance_id().is_none());
    machine.set_password("m4ch1ne").await.unwrap();
    assert_eq!(state.password(MACHINE_FACADE, "3").as_deref(), Some("m4ch1ne"));

    let mut watcher = machine.watch().await.unwrap();
    timeout(PROMPT, watcher.changed()).await.unwrap();
    assert_eq!(watcher.entity(), "Machine:3");
    watcher.stop().await.unwrap();
    assert!(state.watcher_ids().is_empty());
}
