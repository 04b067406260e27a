use crate::{BootstrapTrigger, CloudBackend};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use provisio_common::{
    BackendFault, CapacityMode, ClusterKind, Nic, OsFamily, VirtualMachine, VmTemplate,
    STATE_DONE, STATE_HOLD, STATE_PENDING, STATE_RUNNING,
};
use std::collections::{HashMap, HashSet, VecDeque};

/// Account as stored by the mock backend.
#[derive(Clone, Debug)]
pub struct MockAccount {
    pub id: i64,
    pub login: String,
    pub password: String,
    pub groups: Vec<i64>,
    pub quota_cpu: i64,
    pub quota_ram_mb: i64,
    pub quota_drive_mb: i64,
}

/// VM as stored by the mock backend.
#[derive(Clone, Debug)]
pub struct MockVm {
    pub id: i64,
    pub name: String,
    pub template_id: i64,
    pub owner_id: i64,
    pub group_id: i64,
    pub state: String,
    pub nic: Nic,
    /// Template fragment passed at instantiation.
    pub extra_template: String,
    /// Fragments applied through `reconfigure`, in order.
    pub reconfigurations: Vec<String>,
    pub deployed_to: Option<(i64, i64)>,
    pub limits: Option<(f64, i64, i64)>,
    pub scheduled_actions: Vec<(String, i64)>,
    // (state reads left, state reached once they run out)
    pending_transition: Option<(u32, &'static str)>,
}

#[derive(Default)]
struct MockState {
    next_account_id: i64,
    next_vm_id: i64,
    accounts: HashMap<i64, MockAccount>,
    templates: HashMap<i64, VmTemplate>,
    vms: HashMap<i64, MockVm>,
    hosts: HashMap<i64, ClusterKind>,
    assigned_ips: HashMap<i64, String>,
    instantiate_faults: VecDeque<BackendFault>,
    failing_ops: HashSet<&'static str>,
    boot_reads: u32,
    terminate_reads: u32,
    calls: Vec<&'static str>,
}

/// In-memory orchestration backend for local runs and tests.
///
/// Every trait call is journaled by operation name, faults can be scripted per
/// operation, and lifecycle transitions complete after a configurable number of
/// state reads (emulates the asynchronous backend scheduler).
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_account_id: 1,
                next_vm_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Seeds a few templates so `PROVIDER=mock` is usable without fixtures.
    pub fn with_demo_catalog() -> Self {
        let backend = Self::new();
        backend.add_template(1, CapacityMode::Fixed, OsFamily::Linux, Some(100));
        backend.add_template(2, CapacityMode::Variable, OsFamily::Linux, Some(101));
        backend.add_template(3, CapacityMode::Variable, OsFamily::Windows, Some(102));
        backend
    }

    pub fn add_template(&self, id: i64, capacity: CapacityMode, os: OsFamily, image_id: Option<i64>) {
        self.state.lock().templates.insert(
            id,
            VmTemplate {
                id,
                name: format!("template-{}", id),
                capacity,
                image_id,
                os,
            },
        );
    }

    /// Inserts an existing VM (e.g. the subject of a reinstall).
    pub fn add_vm(&self, id: i64, owner_id: i64, state: &str, nic: Nic) {
        let mut st = self.state.lock();
        st.next_vm_id = st.next_vm_id.max(id + 1);
        st.vms.insert(
            id,
            MockVm {
                id,
                name: format!("vm-{}", id),
                template_id: 0,
                owner_id,
                group_id: 0,
                state: state.to_string(),
                nic,
                extra_template: String::new(),
                reconfigurations: Vec::new(),
                deployed_to: None,
                limits: None,
                scheduled_actions: Vec::new(),
                pending_transition: None,
            },
        );
    }

    pub fn set_next_ids(&self, account_id: i64, vm_id: i64) {
        let mut st = self.state.lock();
        st.next_account_id = account_id;
        st.next_vm_id = vm_id;
    }

    /// Fixes the address handed to the VM that will receive `vm_id`.
    pub fn assign_ip(&self, vm_id: i64, ip: &str) {
        self.state.lock().assigned_ips.insert(vm_id, ip.to_string());
    }

    pub fn set_cluster_kind(&self, host_id: i64, kind: ClusterKind) {
        self.state.lock().hosts.insert(host_id, kind);
    }

    /// Queues a fault for the next instantiate call. Queued faults are consumed in order.
    pub fn fail_instantiate(&self, fault: BackendFault) {
        self.state.lock().instantiate_faults.push_back(fault);
    }

    /// Makes every call of the named operation fail.
    pub fn fail_op(&self, op: &'static str) {
        self.state.lock().failing_ops.insert(op);
    }

    /// Number of state reads a VM spends booting after deploy (or after a non-held instantiate).
    pub fn set_boot_reads(&self, reads: u32) {
        self.state.lock().boot_reads = reads;
    }

    /// Number of state reads a VM spends shutting down after terminate.
    pub fn set_terminate_reads(&self, reads: u32) {
        self.state.lock().terminate_reads = reads;
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == op).count()
    }

    pub fn vm(&self, vm_id: i64) -> Option<MockVm> {
        self.state.lock().vms.get(&vm_id).cloned()
    }

    pub fn account(&self, account_id: i64) -> Option<MockAccount> {
        self.state.lock().accounts.get(&account_id).cloned()
    }

    pub fn account_count(&self) -> usize {
        self.state.lock().accounts.len()
    }

    /// Journals the call and applies any scripted failure for it.
    fn enter(st: &mut MockState, op: &'static str) -> Result<()> {
        st.calls.push(op);
        if st.failing_ops.contains(op) {
            return Err(BackendFault::Rejected(format!("mock: {} disabled", op)).into());
        }
        Ok(())
    }

    fn vm_mut(st: &mut MockState, vm_id: i64) -> Result<&mut MockVm> {
        st.vms
            .get_mut(&vm_id)
            .ok_or_else(|| BackendFault::NotFound(format!("VM {}", vm_id)).into())
    }
}

#[async_trait]
impl CloudBackend for MockBackend {
    async fn allocate_account(&self, login: &str, password: &str, groups: &[i64]) -> Result<i64> {
        let mut st = self.state.lock();
        Self::enter(&mut st, "allocate_account")?;
        if login.trim().is_empty() {
            return Err(BackendFault::Rejected("empty login".to_string()).into());
        }
        if st.accounts.values().any(|a| a.login == login) {
            return Err(BackendFault::Rejected(format!("NAME is already taken by USER: {}", login)).into());
        }
        let id = st.next_account_id;
        st.next_account_id += 1;
        st.accounts.insert(
            id,
            MockAccount {
                id,
                login: login.to_string(),
                password: password.to_string(),
                groups: groups.to_vec(),
                quota_cpu: 0,
                quota_ram_mb: 0,
                quota_drive_mb: 0,
            },
        );
        Ok(id)
    }

    async fn load_template(&self, template_id: i64) -> Result<VmTemplate> {
        let mut st = self.state.lock();
        Self::enter(&mut st, "load_template")?;
        st.templates
            .get(&template_id)
            .cloned()
            .ok_or_else(|| BackendFault::NotFound(format!("VMTEMPLATE {}", template_id)).into())
    }

    async fn instantiate_template(
        &self,
        template_id: i64,
        name: &str,
        on_hold: bool,
        extra_template: &str,
    ) -> Result<i64> {
        let mut st = self.state.lock();
        Self::enter(&mut st, "instantiate_template")?;
        if let Some(fault) = st.instantiate_faults.pop_front() {
            return Err(fault.into());
        }
        if !st.templates.contains_key(&template_id) {
            return Err(BackendFault::NotFound(format!("VMTEMPLATE {}", template_id)).into());
        }
        let id = st.next_vm_id;
        st.next_vm_id += 1;
        let ip = st
            .assigned_ips
            .remove(&id)
            .or_else(|| requested_ip(extra_template))
            .unwrap_or_else(|| format!("10.0.{}.{}", (id / 250) % 250, id % 250 + 2));
        let (state, pending_transition) = if on_hold {
            (STATE_HOLD, None)
        } else if st.boot_reads == 0 {
            (STATE_RUNNING, None)
        } else {
            (STATE_PENDING, Some((st.boot_reads, STATE_RUNNING)))
        };
        st.vms.insert(
            id,
            MockVm {
                id,
                name: name.to_string(),
                template_id,
                owner_id: 0,
                group_id: 0,
                state: state.to_string(),
                nic: Nic {
                    ip,
                    dns: "10.0.0.1".to_string(),
                    gateway: "10.0.0.1".to_string(),
                    network: "public".to_string(),
                    network_uname: "oneadmin".to_string(),
                },
                extra_template: extra_template.to_string(),
                reconfigurations: Vec::new(),
                deployed_to: None,
                limits: None,
                scheduled_actions: Vec::new(),
                pending_transition,
            },
        );
        Ok(id)
    }

    async fn change_owner(&self, vm_id: i64, owner_id: i64, group_id: i64) -> Result<()> {
        let mut st = self.state.lock();
        Self::enter(&mut st, "change_owner")?;
        let vm = Self::vm_mut(&mut st, vm_id)?;
        vm.owner_id = owner_id;
        vm.group_id = group_id;
        Ok(())
    }

    async fn update_resource_quota(
        &self,
        account_id: i64,
        cpu: i64,
        ram_mb: i64,
        drive_mb: i64,
    ) -> Result<()> {
        let mut st = self.state.lock();
        Self::enter(&mut st, "update_resource_quota")?;
        let account = st
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| BackendFault::NotFound(format!("USER {}", account_id)))?;
        account.quota_cpu += cpu;
        account.quota_ram_mb += ram_mb;
        account.quota_drive_mb += drive_mb;
        Ok(())
    }

    async fn reconfigure(&self, vm_id: i64, template: &str) -> Result<()> {
        let mut st = self.state.lock();
        Self::enter(&mut st, "reconfigure")?;
        Self::vm_mut(&mut st, vm_id)?
            .reconfigurations
            .push(template.to_string());
        Ok(())
    }

    async fn deploy(&self, vm_id: i64, host_id: i64, _enforce: bool, datastore_id: i64) -> Result<()> {
        let mut st = self.state.lock();
        Self::enter(&mut st, "deploy")?;
        let boot_reads = st.boot_reads;
        let vm = Self::vm_mut(&mut st, vm_id)?;
        if vm.state != STATE_HOLD && vm.state != STATE_PENDING {
            return Err(BackendFault::Rejected(format!(
                "VM {} cannot be deployed in state {}",
                vm_id, vm.state
            ))
            .into());
        }
        vm.deployed_to = Some((host_id, datastore_id));
        if boot_reads == 0 {
            vm.state = STATE_RUNNING.to_string();
            vm.pending_transition = None;
        } else {
            vm.state = STATE_PENDING.to_string();
            vm.pending_transition = Some((boot_reads, STATE_RUNNING));
        }
        Ok(())
    }

    async fn terminate(&self, vm_id: i64, _force: bool) -> Result<()> {
        let mut st = self.state.lock();
        Self::enter(&mut st, "terminate")?;
        let terminate_reads = st.terminate_reads;
        let vm = Self::vm_mut(&mut st, vm_id)?;
        if terminate_reads == 0 {
            vm.state = STATE_DONE.to_string();
            vm.pending_transition = None;
        } else {
            vm.state = "EPILOG".to_string();
            vm.pending_transition = Some((terminate_reads, STATE_DONE));
        }
        Ok(())
    }

    async fn schedule_deferred_action(&self, vm_id: i64, action: &str, at_epoch: i64) -> Result<()> {
        let mut st = self.state.lock();
        Self::enter(&mut st, "schedule_deferred_action")?;
        Self::vm_mut(&mut st, vm_id)?
            .scheduled_actions
            .push((action.to_string(), at_epoch));
        Ok(())
    }

    async fn read_lifecycle_state(&self, vm_id: i64) -> Result<String> {
        let mut st = self.state.lock();
        Self::enter(&mut st, "read_lifecycle_state")?;
        let vm = Self::vm_mut(&mut st, vm_id)?;
        if let Some((reads_left, target)) = vm.pending_transition {
            if reads_left <= 1 {
                vm.state = target.to_string();
                vm.pending_transition = None;
            } else {
                vm.pending_transition = Some((reads_left - 1, target));
            }
        }
        Ok(vm.state.clone())
    }

    async fn read_vm(&self, vm_id: i64) -> Result<VirtualMachine> {
        let mut st = self.state.lock();
        Self::enter(&mut st, "read_vm")?;
        let vm = Self::vm_mut(&mut st, vm_id)?;
        let context = vm
            .reconfigurations
            .iter()
            .rev()
            .find(|t| t.contains("CONTEXT"))
            .cloned()
            .or_else(|| Some(vm.extra_template.clone()).filter(|t| !t.is_empty()));
        Ok(VirtualMachine {
            id: vm.id,
            owner_id: vm.owner_id,
            state: vm.state.clone(),
            nic: Some(vm.nic.clone()),
            context,
        })
    }

    async fn cluster_kind(&self, host_id: i64) -> Result<ClusterKind> {
        let mut st = self.state.lock();
        Self::enter(&mut st, "cluster_kind")?;
        Ok(st.hosts.get(&host_id).copied().unwrap_or(ClusterKind::Standard))
    }

    async fn set_resource_limits(&self, vm_id: i64, cpu: f64, ram_mb: i64, iops: i64) -> Result<bool> {
        let mut st = self.state.lock();
        Self::enter(&mut st, "set_resource_limits")?;
        Self::vm_mut(&mut st, vm_id)?.limits = Some((cpu, ram_mb, iops));
        Ok(true)
    }
}

// IP pinned by a `NIC = [ IP="..." ]` block, as a reinstall passes it.
fn requested_ip(extra_template: &str) -> Option<String> {
    let nic = &extra_template[extra_template.find("NIC = [")?..];
    let nic = &nic[..nic.find(']').unwrap_or(nic.len())];
    let start = nic.find("IP=\"")? + 4;
    let len = nic[start..].find('"')?;
    Some(nic[start..start + len].to_string()).filter(|ip| !ip.is_empty())
}

/// Bootstrap trigger that fails a fixed number of times before succeeding.
pub struct MockBootstrap {
    failures_left: Mutex<u32>,
    calls: Mutex<Vec<(String, u16, String)>>,
}

impl MockBootstrap {
    pub fn new() -> Self {
        Self::failing(0)
    }

    pub fn failing(times: u32) -> Self {
        Self {
            failures_left: Mutex::new(times),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, u16, String)> {
        self.calls.lock().clone()
    }
}

impl Default for MockBootstrap {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BootstrapTrigger for MockBootstrap {
    async fn install(&self, host: &str, port: u16, service: &str) -> Result<()> {
        self.calls
            .lock()
            .push((host.to_string(), port, service.to_string()));
        let mut left = self.failures_left.lock();
        if *left > 0 {
            *left -= 1;
            return Err(BackendFault::Transport(format!("mock: {}:{} unreachable", host, port)).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_login_is_rejected() {
        let backend = MockBackend::new();
        let first = backend.allocate_account("bob", "x", &[1]).await.unwrap();
        assert_eq!(first, 1);
        let err = backend.allocate_account("bob", "y", &[1]).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BackendFault>(),
            Some(BackendFault::Rejected(_))
        ));
        assert_eq!(backend.account_count(), 1);
    }

    #[tokio::test]
    async fn terminate_completes_after_configured_reads() {
        let backend = MockBackend::new();
        backend.add_vm(5, 1, STATE_RUNNING, Nic::default());
        backend.set_terminate_reads(3);
        backend.terminate(5, true).await.unwrap();
        assert_eq!(backend.read_lifecycle_state(5).await.unwrap(), "EPILOG");
        assert_eq!(backend.read_lifecycle_state(5).await.unwrap(), "EPILOG");
        assert_eq!(backend.read_lifecycle_state(5).await.unwrap(), STATE_DONE);
    }

    #[tokio::test]
    async fn held_vm_runs_after_deploy() {
        let backend = MockBackend::new();
        backend.add_template(9, CapacityMode::Fixed, OsFamily::Linux, None);
        let vm = backend.instantiate_template(9, "t_vm", true, "").await.unwrap();
        assert_eq!(backend.read_lifecycle_state(vm).await.unwrap(), STATE_HOLD);
        backend.deploy(vm, 0, false, 1).await.unwrap();
        assert_eq!(backend.read_lifecycle_state(vm).await.unwrap(), STATE_RUNNING);
        assert_eq!(backend.vm(vm).unwrap().deployed_to, Some((0, 1)));
    }

    #[tokio::test]
    async fn scripted_instantiate_faults_are_consumed_in_order() {
        let backend = MockBackend::new();
        backend.add_template(1, CapacityMode::Fixed, OsFamily::Linux, None);
        backend.fail_instantiate(BackendFault::AddressConflict("IP/MAC lease".into()));
        assert!(backend.instantiate_template(1, "a", true, "").await.is_err());
        assert!(backend.instantiate_template(1, "a", true, "").await.is_ok());
        assert_eq!(backend.call_count("instantiate_template"), 2);
    }

    #[tokio::test]
    async fn preserved_nic_pins_the_address() {
        let backend = MockBackend::new();
        backend.add_template(1, CapacityMode::Fixed, OsFamily::Linux, None);
        let extra = "NIC = [\n  IP=\"10.0.0.5\",\n  DNS=\"10.0.0.1\" ]\nCONTEXT = [\n  NETWORK=\"YES\" ]";
        let vm = backend.instantiate_template(1, "a", false, extra).await.unwrap();
        assert_eq!(backend.vm(vm).unwrap().nic.ip, "10.0.0.5");
        let other = backend.instantiate_template(1, "b", false, "").await.unwrap();
        assert_ne!(backend.vm(other).unwrap().nic.ip, "10.0.0.5");
    }

    #[tokio::test]
    async fn bootstrap_fails_then_succeeds() {
        let bootstrap = MockBootstrap::failing(1);
        assert!(bootstrap.install("10.0.0.2", 22, "nginx").await.is_err());
        assert!(bootstrap.install("10.0.0.2", 22, "nginx").await.is_ok());
        assert_eq!(bootstrap.calls().len(), 2);
    }
}
