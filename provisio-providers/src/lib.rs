use anyhow::Result;
use async_trait::async_trait;
use provisio_common::{ClusterKind, VirtualMachine, VmTemplate};

pub mod bootstrap;

/// Seam to the cloud orchestration backend that owns accounts, templates and VMs.
///
/// Implementations report typed faults by wrapping `provisio_common::BackendFault`
/// in the returned `anyhow::Error`; callers downcast to tell transient conflicts apart.
#[async_trait]
pub trait CloudBackend: Send + Sync {
    /// Allocates a tenant account in the given groups (first is primary). Returns the account id.
    async fn allocate_account(&self, login: &str, password: &str, groups: &[i64]) -> Result<i64>;

    /// Loads a template, including its capacity mode.
    async fn load_template(&self, template_id: i64) -> Result<VmTemplate>;

    /// Instantiates a template. `extra_template` is merged over the template body.
    async fn instantiate_template(
        &self,
        template_id: i64,
        name: &str,
        on_hold: bool,
        extra_template: &str,
    ) -> Result<i64>;

    async fn change_owner(&self, vm_id: i64, owner_id: i64, group_id: i64) -> Result<()>;

    /// Grows the account's VM quota by the given amounts (ram and drive in MB).
    async fn update_resource_quota(
        &self,
        account_id: i64,
        cpu: i64,
        ram_mb: i64,
        drive_mb: i64,
    ) -> Result<()>;

    async fn reconfigure(&self, vm_id: i64, template: &str) -> Result<()>;

    async fn deploy(&self, vm_id: i64, host_id: i64, enforce: bool, datastore_id: i64)
        -> Result<()>;

    async fn terminate(&self, vm_id: i64, force: bool) -> Result<()>;

    /// Registers a one-shot action (e.g. "suspend") at the given unix time.
    async fn schedule_deferred_action(&self, vm_id: i64, action: &str, at_epoch: i64)
        -> Result<()>;

    async fn read_lifecycle_state(&self, vm_id: i64) -> Result<String>;

    async fn read_vm(&self, vm_id: i64) -> Result<VirtualMachine>;

    // Optional: host classification. Default treats every host as standard (no caps needed).
    async fn cluster_kind(&self, _host_id: i64) -> Result<ClusterKind> {
        Ok(ClusterKind::Standard)
    }

    // Optional: hard per-VM caps. Default is a no-op returning false (not supported).
    async fn set_resource_limits(
        &self,
        _vm_id: i64,
        _cpu: f64,
        _ram_mb: i64,
        _iops: i64,
    ) -> Result<bool> {
        Ok(false)
    }
}

/// Configuration-management bootstrap (e.g. an Ansible runner) for a freshly deployed guest.
#[async_trait]
pub trait BootstrapTrigger: Send + Sync {
    async fn install(&self, host: &str, port: u16, service: &str) -> Result<()>;
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "opennebula")]
pub mod opennebula;
