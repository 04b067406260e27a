// Common test utilities and fixtures
// All workflows run against the in-memory mock backend.
#![allow(dead_code)]

use axum::Router;
use provisio_common::{CapacityMode, Nic, OsFamily};
use provisio_orchestrator::commands::CommandRegistry;
use provisio_orchestrator::routes::create_router;
use provisio_orchestrator::tasks::TaskInfo;
use provisio_orchestrator::{AppState, Orchestrator, ProvisioningRequest, Settings};
use provisio_providers::mock::{MockBackend, MockBootstrap};
use provisio_providers::{BootstrapTrigger, CloudBackend};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

pub const USERS_GROUP: i64 = 1;

pub struct Harness {
    pub backend: Arc<MockBackend>,
    pub bootstrap: Arc<MockBootstrap>,
    pub orchestrator: Arc<Orchestrator>,
}

/// Settings with short timers so paused-clock tests stay cheap.
pub fn test_settings() -> Settings {
    Settings {
        users_group_id: USERS_GROUP,
        default_host_id: 0,
        datastore_ssd_id: 1,
        datastore_hdd_id: 100,
        bootstrap_initial_delay: Duration::from_secs(5),
        bootstrap_backoff: Duration::from_secs(5),
        bootstrap_max_attempts: 3,
        instantiate_retry_delay: Duration::from_secs(3),
        poll_interval: Duration::from_millis(100),
        running_timeout: Duration::from_secs(60),
        terminal_timeout: Duration::from_secs(30),
        ..Settings::default()
    }
}

pub fn harness() -> Harness {
    harness_with(test_settings(), MockBootstrap::new())
}

pub fn harness_with(settings: Settings, bootstrap: MockBootstrap) -> Harness {
    let backend = Arc::new(MockBackend::new());
    let bootstrap = Arc::new(bootstrap);
    let orchestrator = Arc::new(Orchestrator::new(
        backend.clone() as Arc<dyn CloudBackend>,
        bootstrap.clone() as Arc<dyn BootstrapTrigger>,
        Arc::new(settings),
    ));
    Harness {
        backend,
        bootstrap,
        orchestrator,
    }
}

/// Router wired to a fresh harness, for axum-test.
pub fn create_test_app() -> (Harness, Router) {
    let h = harness();
    let commands = CommandRegistry::with_defaults().expect("default commands");
    let app = create_router(AppState::new(h.orchestrator.clone(), commands));
    (h, app)
}

pub fn params(v: Value) -> Map<String, Value> {
    v.as_object().cloned().expect("params must be an object")
}

pub fn request(v: Value) -> ProvisioningRequest {
    ProvisioningRequest::from_map(&params(v))
}

pub fn fixed_template(backend: &MockBackend, id: i64) {
    backend.add_template(id, CapacityMode::Fixed, OsFamily::Linux, Some(100));
}

pub fn variable_template(backend: &MockBackend, id: i64) {
    backend.add_template(id, CapacityMode::Variable, OsFamily::Linux, Some(100));
}

pub fn nic(ip: &str) -> Nic {
    Nic {
        ip: ip.to_string(),
        dns: "10.0.0.1".to_string(),
        gateway: "10.0.0.1".to_string(),
        network: "public".to_string(),
        network_uname: "oneadmin".to_string(),
    }
}

pub fn tasks_of_kind(orchestrator: &Orchestrator, kind: &str) -> Vec<TaskInfo> {
    orchestrator
        .tasks()
        .list()
        .into_iter()
        .filter(|t| t.kind == kind)
        .collect()
}

/// Waits (on the test clock) until a task of `kind` has been spawned.
pub async fn wait_for_task(orchestrator: &Orchestrator, kind: &str) -> TaskInfo {
    for _ in 0..1000 {
        if let Some(task) = tasks_of_kind(orchestrator, kind).into_iter().next() {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no '{}' task was spawned", kind);
}

/// Index of the first journaled call named `op`.
pub fn position(calls: &[&'static str], op: &str) -> Option<usize> {
    calls.iter().position(|c| *c == op)
}
