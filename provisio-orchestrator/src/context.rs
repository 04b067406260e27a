//! Rendering of the template fragments passed to the backend: network (NIC),
//! guest contextualization (CONTEXT), capacity override and remote console.

use crate::request::ProvisioningRequest;
use provisio_common::{Nic, VmTemplate};
use std::fmt::Write as _;

/// Where the new VM's network parameters come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NicSource {
    /// Reuse the parameters of an existing VM (reinstall keeps the address).
    Preserved(Nic),
    /// Let the backend lease an address.
    BackendAssigned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub password: String,
    pub windows: bool,
}

/// CPU/RAM/disk overrides applied to variable-capacity templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityOverride {
    pub vcpu: i64,
    pub memory_mb: i64,
    pub image_id: Option<i64>,
    pub disk_mb: i64,
}

impl CapacityOverride {
    pub fn from_request(req: &ProvisioningRequest, template: &VmTemplate) -> Self {
        Self {
            vcpu: req.cpu,
            memory_mb: req.ram_mb(),
            image_id: template.image_id,
            disk_mb: req.drive_mb(),
        }
    }
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn block(name: &str, attrs: &[(&str, String)]) -> String {
    let mut out = format!("{} = [\n", name);
    for (i, (key, value)) in attrs.iter().enumerate() {
        let sep = if i + 1 == attrs.len() { " ]" } else { "," };
        let _ = writeln!(out, "  {}={}{}", key, value, sep);
    }
    out.truncate(out.trim_end().len());
    out
}

/// Everything needed to describe a guest to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestContext {
    pub nic: NicSource,
    pub credentials: Credentials,
    pub capacity: Option<CapacityOverride>,
}

impl GuestContext {
    pub fn new(nic: NicSource, credentials: Credentials, capacity: Option<CapacityOverride>) -> Self {
        Self {
            nic,
            credentials,
            capacity,
        }
    }

    /// `NIC = [...]` when an existing NIC is preserved, `None` when the backend assigns one.
    pub fn network_block(&self) -> Option<String> {
        match &self.nic {
            NicSource::Preserved(nic) => Some(block(
                "NIC",
                &[
                    ("IP", quote(&nic.ip)),
                    ("DNS", quote(&nic.dns)),
                    ("GATEWAY", quote(&nic.gateway)),
                    ("NETWORK", quote(&nic.network)),
                    ("NETWORK_UNAME", quote(&nic.network_uname)),
                ],
            )),
            NicSource::BackendAssigned => None,
        }
    }

    /// `CONTEXT = [...]`: guest password, network contextualization and SSH key.
    pub fn credential_block(&self) -> String {
        let mut attrs: Vec<(&str, String)> = Vec::new();
        attrs.push(("NETWORK", quote("YES")));
        if let NicSource::Preserved(nic) = &self.nic {
            attrs.push(("ETH0_IP", quote(&nic.ip)));
            attrs.push(("ETH0_GATEWAY", quote(&nic.gateway)));
            attrs.push(("ETH0_DNS", quote(&nic.dns)));
        }
        attrs.push(("PASSWORD", quote(&self.credentials.password)));
        attrs.push(("SSH_PUBLIC_KEY", "\"$USER[SSH_PUBLIC_KEY]\"".to_string()));
        if self.credentials.windows {
            attrs.push(("USERNAME", quote("Administrator")));
        }
        block("CONTEXT", &attrs)
    }

    /// `VCPU`/`MEMORY`/`DISK` overrides, only for variable-capacity templates.
    pub fn capacity_block(&self) -> Option<String> {
        let cap = self.capacity?;
        let mut out = format!("VCPU = \"{}\"\nMEMORY = \"{}\"\n", cap.vcpu, cap.memory_mb);
        let mut disk: Vec<(&str, String)> = Vec::new();
        if let Some(image_id) = cap.image_id {
            disk.push(("IMAGE_ID", quote(&image_id.to_string())));
        }
        disk.push(("SIZE", quote(&cap.disk_mb.to_string())));
        disk.push(("OPENNEBULA_MANAGED", quote("NO")));
        out.push_str(&block("DISK", &disk));
        Some(out)
    }

    /// Full fragment: capacity (if any), network (if preserved) and credentials.
    pub fn render(&self) -> String {
        [self.capacity_block(), self.network_block(), Some(self.credential_block())]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Builds the full context string for a VM.
pub fn build(
    nic: NicSource,
    credentials: Credentials,
    capacity: Option<CapacityOverride>,
) -> String {
    GuestContext::new(nic, credentials, capacity).render()
}

/// Remote console block; the port is offset by the VM id to stay unique per host.
pub fn vnc_block(base_port: i64, vm_id: i64) -> String {
    block(
        "GRAPHICS",
        &[
            ("LISTEN", quote("0.0.0.0")),
            ("PORT", quote(&(base_port + vm_id).to_string())),
            ("TYPE", quote("VNC")),
        ],
    )
}
