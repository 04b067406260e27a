// Integration tests for the reinstall workflow (mock backend only)

mod common;

use common::{fixed_template, harness, harness_with, nic, position, request, test_settings, variable_template, USERS_GROUP};
use provisio_common::{BackendFault, STATE_DONE, STATE_RUNNING};
use provisio_orchestrator::{ErrorKind, ProvisioningResult};
use provisio_providers::mock::MockBootstrap;
use serde_json::json;
use std::time::Duration;

fn base() -> serde_json::Value {
    json!({
        "vmid": 10,
        "groupid": 2,
        "userid": 7,
        "templateid": 5,
        "login": "bob",
        "passwd": "new-guest-pw",
        "cpu": 2,
        "ram": 2048,
        "drive": 10240,
    })
}

#[tokio::test]
async fn test_reinstall_preserves_network_identity() {
    let h = harness();
    fixed_template(&h.backend, 5);
    h.backend.add_vm(10, 7, STATE_RUNNING, nic("10.0.0.5"));

    let result = h.orchestrator.reinstall_vm(request(base())).await;
    assert_eq!(
        result,
        ProvisioningResult::Reinstalled {
            vm_id: 11,
            vm_id_old: 10,
            ip: "10.0.0.5".to_string(),
            ip_old: "10.0.0.5".to_string(),
        }
    );

    let old = h.backend.vm(10).unwrap();
    assert_eq!(old.state, STATE_DONE);

    let new = h.backend.vm(11).unwrap();
    assert_eq!(new.name, "bob_vm");
    assert_eq!((new.owner_id, new.group_id), (7, USERS_GROUP));
    assert_eq!(new.extra_template.matches("NIC = [").count(), 1);
    assert!(new.extra_template.contains("IP=\"10.0.0.5\""));
    assert!(new.extra_template.contains("ETH0_IP=\"10.0.0.5\""));
    assert!(new.extra_template.contains("ETH0_GATEWAY=\"10.0.0.1\""));
    assert!(new.extra_template.contains("PASSWORD=\"new-guest-pw\""));
    assert!(!new.extra_template.contains("VCPU"));
}

#[tokio::test]
async fn test_without_release_no_state_reads_before_instantiate() {
    let h = harness();
    fixed_template(&h.backend, 5);
    h.backend.add_vm(10, 7, STATE_RUNNING, nic("10.0.0.5"));
    h.backend.set_terminate_reads(5);

    let result = h.orchestrator.reinstall_vm(request(base())).await;
    assert!(result.is_success(), "{:?}", result);

    let calls = h.backend.calls();
    assert_eq!(position(&calls, "read_lifecycle_state"), None);
    assert_eq!(h.backend.call_count("deploy"), 0);
    assert!(h.orchestrator.tasks().list().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_release_waits_for_old_vm_then_deploys() {
    let h = harness();
    fixed_template(&h.backend, 5);
    h.backend.add_vm(10, 7, STATE_RUNNING, nic("10.0.0.5"));
    h.backend.set_terminate_reads(3);
    h.backend.set_boot_reads(2);

    let mut req = base();
    req["release"] = json!(true);
    req["ds_type"] = json!("HDD");
    req["host"] = json!(4);
    let result = h.orchestrator.reinstall_vm(request(req)).await;
    let ProvisioningResult::Reinstalled { vm_id, .. } = result else {
        panic!("expected Reinstalled, got {:?}", result);
    };

    let calls = h.backend.calls();
    let instantiate = position(&calls, "instantiate_template").unwrap();
    let reads_before = calls[..instantiate]
        .iter()
        .filter(|c| **c == "read_lifecycle_state")
        .count();
    assert_eq!(reads_before, 3);

    h.orchestrator.tasks().join_all().await;
    let new = h.backend.vm(vm_id).unwrap();
    assert_eq!(new.deployed_to, Some((4, 100)));
    assert_eq!(new.state, STATE_RUNNING);
}

#[tokio::test(start_paused = true)]
async fn test_release_times_out_when_old_vm_never_finishes() {
    let settings = common::test_settings();
    let h = harness_with(settings, MockBootstrap::new());
    fixed_template(&h.backend, 5);
    h.backend.add_vm(10, 7, STATE_RUNNING, nic("10.0.0.5"));
    h.backend.set_terminate_reads(u32::MAX);

    let mut req = base();
    req["release"] = json!(true);
    let result = h.orchestrator.reinstall_vm(request(req)).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::UnhandledError));
    assert_eq!(h.backend.call_count("instantiate_template"), 0);
}

#[tokio::test]
async fn test_missing_ids_are_rejected_without_backend_calls() {
    let h = harness();
    let mut req = base();
    req["templateid"] = json!(0);
    let result = h.orchestrator.reinstall_vm(request(req)).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::InvalidRequest));
    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_vm_is_unhandled_and_nothing_is_terminated() {
    let h = harness();
    fixed_template(&h.backend, 5);
    let result = h.orchestrator.reinstall_vm(request(base())).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::UnhandledError));
    assert_eq!(h.backend.call_count("terminate"), 0);
}

#[tokio::test]
async fn test_unknown_template_keeps_old_vm() {
    let h = harness();
    h.backend.add_vm(10, 7, STATE_RUNNING, nic("10.0.0.5"));
    let result = h.orchestrator.reinstall_vm(request(base())).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::TemplateLoadError));
    assert_eq!(h.backend.vm(10).unwrap().state, STATE_RUNNING);
}

#[tokio::test]
async fn test_variable_template_overrides_capacity() {
    let h = harness();
    variable_template(&h.backend, 5);
    h.backend.add_vm(10, 7, STATE_RUNNING, nic("10.0.0.5"));
    let result = h.orchestrator.reinstall_vm(request(base())).await;
    let ProvisioningResult::Reinstalled { vm_id, .. } = result else {
        panic!("expected Reinstalled");
    };
    let extra = h.backend.vm(vm_id).unwrap().extra_template;
    assert!(extra.contains("VCPU = \"2\""));
    assert!(extra.contains("SIZE=\"10240\""));
    assert_eq!(h.backend.call_count("update_resource_quota"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_address_conflict_is_retried_once() {
    let h = harness();
    fixed_template(&h.backend, 5);
    h.backend.add_vm(10, 7, STATE_RUNNING, nic("10.0.0.5"));
    h.backend
        .fail_instantiate(BackendFault::AddressConflict("IP/MAC 10.0.0.5 still leased".into()));

    let started = tokio::time::Instant::now();
    let result = h.orchestrator.reinstall_vm(request(base())).await;
    assert!(result.is_success(), "{:?}", result);
    assert_eq!(h.backend.call_count("instantiate_template"), 2);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(test_settings().instantiate_retry_delay, Duration::from_secs(3));
}

#[tokio::test]
async fn test_fake_data_mode() {
    let h = harness();
    let mut req = base();
    req["debug"] = json!("data");
    let result = h.orchestrator.reinstall_vm(request(req)).await;
    assert_eq!(
        serde_json::to_value(&result).unwrap(),
        json!({ "vmid": 1010, "vmid_old": 10, "ip": "0.0.0.0", "ip_old": "0.0.0.0" })
    );
    assert!(h.backend.calls().is_empty());
}
