use serde::{Deserialize, Serialize};

pub mod bus;

// --- Lifecycle states ---

// State strings as reported by the orchestration backend. Comparisons are case-insensitive.
pub const STATE_HOLD: &str = "HOLD";
pub const STATE_PENDING: &str = "PENDING";
pub const STATE_RUNNING: &str = "RUNNING";
pub const STATE_DONE: &str = "DONE";

pub fn state_matches(state: &str, target: &str) -> bool {
    state.trim().eq_ignore_ascii_case(target.trim())
}

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CapacityMode {
    Fixed,    // CPU/RAM/disk come from the template
    Variable, // caller may override CPU/RAM/disk
}

impl CapacityMode {
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("fixed") {
            CapacityMode::Fixed
        } else {
            CapacityMode::Variable
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CapacityMode::Fixed => "FIXED",
            CapacityMode::Variable => "VARIABLE",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Windows,
    Linux,
}

/// Host class a VM lands on. Constrained clusters need explicit per-VM resource caps.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterKind {
    Constrained,
    Standard,
}

// --- Entities ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TenantAccount {
    pub id: i64,
    pub login: String,
    pub primary_group: i64,
    pub secondary_group: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct VmTemplate {
    pub id: i64,
    pub name: String,
    pub capacity: CapacityMode,
    pub image_id: Option<i64>,
    pub os: OsFamily,
}

impl VmTemplate {
    pub fn capacity_mode(&self) -> CapacityMode {
        self.capacity
    }

    pub fn is_windows(&self) -> bool {
        self.os == OsFamily::Windows
    }
}

/// Network interface as attached to a VM.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Nic {
    pub ip: String,
    pub dns: String,
    pub gateway: String,
    pub network: String,
    pub network_uname: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct VirtualMachine {
    pub id: i64,
    pub owner_id: i64,
    pub state: String,
    pub nic: Option<Nic>,
    /// Raw contextualization block currently applied to the VM, if any.
    pub context: Option<String>,
}

impl VirtualMachine {
    pub fn ip(&self) -> Option<&str> {
        self.nic
            .as_ref()
            .map(|n| n.ip.as_str())
            .filter(|ip| !ip.is_empty())
    }
}

// --- Backend faults ---

/// Typed faults carried inside `anyhow::Error` by backend implementations.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum BackendFault {
    /// Lease collision on an IP/MAC address. Usually clears after a short wait.
    #[error("address conflict: {0}")]
    AddressConflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rejected by backend: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
}
