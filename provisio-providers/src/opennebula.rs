use crate::CloudBackend;
use anyhow::{Context, Result};
use async_trait::async_trait;
use provisio_common::{
    BackendFault, CapacityMode, ClusterKind, Nic, OsFamily, VirtualMachine, VmTemplate,
};
use reqwest::Client;
use std::time::Duration;

/// OpenNebula XML-RPC backend (`one.*` API).
pub struct OpenNebulaBackend {
    client: Client,
    endpoint: String,
    session: String,
}

/// Scalar/array parameters understood by the `one.*` calls we make.
#[derive(Debug, Clone)]
enum Param<'a> {
    Str(&'a str),
    Int(i64),
    Bool(bool),
    Ints(&'a [i64]),
}

impl OpenNebulaBackend {
    pub fn new(endpoint: &str, username: &str, password: &str) -> Result<Self> {
        // Default reqwest client has no overall timeout; a stalled frontend would hang the workflow.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .build()
            .context("building OpenNebula HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim().to_string(),
            session: format!("{}:{}", username.trim(), password.trim()),
        })
    }

    /// Performs one XML-RPC call and returns the payload of a successful response.
    async fn call(&self, method: &str, params: &[Param<'_>]) -> Result<String> {
        let body = render_call(method, &self.session, params);
        let resp = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(body)
            .send()
            .await
            .map_err(|e| BackendFault::Transport(format!("{}: {}", method, e)))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| BackendFault::Transport(format!("{}: {}", method, e)))?;
        if !status.is_success() {
            return Err(BackendFault::Transport(format!("{}: HTTP {}", method, status)).into());
        }
        match parse_response(&text) {
            Ok(payload) => Ok(payload),
            Err(message) => {
                tracing::debug!(method, %message, "one.* call failed");
                Err(classify_fault(message).into())
            }
        }
    }

    async fn call_id(&self, method: &str, params: &[Param<'_>]) -> Result<i64> {
        let payload = self.call(method, params).await?;
        payload
            .trim()
            .parse::<i64>()
            .with_context(|| format!("{} returned a non-numeric id: {}", method, payload))
    }
}

#[async_trait]
impl CloudBackend for OpenNebulaBackend {
    async fn allocate_account(&self, login: &str, password: &str, groups: &[i64]) -> Result<i64> {
        self.call_id(
            "one.user.allocate",
            &[
                Param::Str(login),
                Param::Str(password),
                Param::Str("core"),
                Param::Ints(groups),
            ],
        )
        .await
    }

    async fn load_template(&self, template_id: i64) -> Result<VmTemplate> {
        let doc = self
            .call(
                "one.template.info",
                &[Param::Int(template_id), Param::Bool(false), Param::Bool(false)],
            )
            .await?;
        parse_template(template_id, &doc)
    }

    async fn instantiate_template(
        &self,
        template_id: i64,
        name: &str,
        on_hold: bool,
        extra_template: &str,
    ) -> Result<i64> {
        self.call_id(
            "one.template.instantiate",
            &[
                Param::Int(template_id),
                Param::Str(name),
                Param::Bool(on_hold),
                Param::Str(extra_template),
                Param::Bool(false),
            ],
        )
        .await
    }

    async fn change_owner(&self, vm_id: i64, owner_id: i64, group_id: i64) -> Result<()> {
        self.call(
            "one.vm.chown",
            &[Param::Int(vm_id), Param::Int(owner_id), Param::Int(group_id)],
        )
        .await?;
        Ok(())
    }

    async fn update_resource_quota(
        &self,
        account_id: i64,
        cpu: i64,
        ram_mb: i64,
        drive_mb: i64,
    ) -> Result<()> {
        // one.user.quota replaces the quota template, so grow the current limits ourselves.
        let doc = self.call("one.user.info", &[Param::Int(account_id)]).await?;
        let current = |tag: &str| own_vm_quota(&doc, tag).unwrap_or(-1);
        let grow = |limit: i64, by: i64| match limit {
            -2 => -2, // unlimited stays unlimited
            l if l < 0 => by,
            l => l + by,
        };
        let quota = format!(
            "VM = [ CPU = \"{}\", MEMORY = \"{}\", SYSTEM_DISK_SIZE = \"{}\" ]",
            grow(current("CPU"), cpu),
            grow(current("MEMORY"), ram_mb),
            grow(current("SYSTEM_DISK_SIZE"), drive_mb),
        );
        self.call("one.user.quota", &[Param::Int(account_id), Param::Str(&quota)])
            .await?;
        Ok(())
    }

    async fn reconfigure(&self, vm_id: i64, template: &str) -> Result<()> {
        self.call("one.vm.updateconf", &[Param::Int(vm_id), Param::Str(template)])
            .await?;
        Ok(())
    }

    async fn deploy(&self, vm_id: i64, host_id: i64, enforce: bool, datastore_id: i64) -> Result<()> {
        self.call(
            "one.vm.deploy",
            &[
                Param::Int(vm_id),
                Param::Int(host_id),
                Param::Bool(enforce),
                Param::Int(datastore_id),
            ],
        )
        .await?;
        Ok(())
    }

    async fn terminate(&self, vm_id: i64, force: bool) -> Result<()> {
        let action = if force { "terminate-hard" } else { "terminate" };
        self.call("one.vm.action", &[Param::Str(action), Param::Int(vm_id)])
            .await?;
        Ok(())
    }

    async fn schedule_deferred_action(&self, vm_id: i64, action: &str, at_epoch: i64) -> Result<()> {
        let template = format!(
            "SCHED_ACTION = [ ACTION = \"{}\", TIME = \"{}\" ]",
            action, at_epoch
        );
        // 1 = merge into the existing user template
        self.call(
            "one.vm.update",
            &[Param::Int(vm_id), Param::Str(&template), Param::Int(1)],
        )
        .await?;
        Ok(())
    }

    async fn read_lifecycle_state(&self, vm_id: i64) -> Result<String> {
        let doc = self.call("one.vm.info", &[Param::Int(vm_id)]).await?;
        vm_state(&doc).ok_or_else(|| {
            BackendFault::Rejected(format!("VM {} info carries no STATE", vm_id)).into()
        })
    }

    async fn read_vm(&self, vm_id: i64) -> Result<VirtualMachine> {
        let doc = self.call("one.vm.info", &[Param::Int(vm_id)]).await?;
        parse_vm(vm_id, &doc)
    }

    async fn cluster_kind(&self, host_id: i64) -> Result<ClusterKind> {
        let doc = self.call("one.host.info", &[Param::Int(host_id)]).await?;
        let vm_mad = xml_text(&doc, &["HOST", "VM_MAD"]).unwrap_or_default();
        let im_mad = xml_text(&doc, &["HOST", "IM_MAD"]).unwrap_or_default();
        if vm_mad.eq_ignore_ascii_case("vcenter") || im_mad.eq_ignore_ascii_case("vcenter") {
            Ok(ClusterKind::Constrained)
        } else {
            Ok(ClusterKind::Standard)
        }
    }

    async fn set_resource_limits(&self, vm_id: i64, cpu: f64, ram_mb: i64, iops: i64) -> Result<bool> {
        // Picked up by the vCenter driver hook on the frontend.
        let template = format!(
            "LIMITS = [ CPU = \"{}\", MEMORY = \"{}\", IOPS = \"{}\" ]",
            cpu, ram_mb, iops
        );
        self.call(
            "one.vm.update",
            &[Param::Int(vm_id), Param::Str(&template), Param::Int(1)],
        )
        .await?;
        Ok(true)
    }
}

// -----------------------------------------------------------------------------
// XML-RPC encoding
// -----------------------------------------------------------------------------

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn render_param(p: &Param<'_>) -> String {
    match p {
        Param::Str(s) => format!("<value><string>{}</string></value>", escape(s)),
        Param::Int(i) => format!("<value><int>{}</int></value>", i),
        Param::Bool(b) => format!("<value><boolean>{}</boolean></value>", u8::from(*b)),
        Param::Ints(items) => {
            let data: String = items
                .iter()
                .map(|i| format!("<value><int>{}</int></value>", i))
                .collect();
            format!("<value><array><data>{}</data></array></value>", data)
        }
    }
}

fn render_call(method: &str, session: &str, params: &[Param<'_>]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodCall><methodName>");
    out.push_str(method);
    out.push_str("</methodName><params>");
    for p in std::iter::once(&Param::Str(session)).chain(params.iter()) {
        out.push_str("<param>");
        out.push_str(&render_param(p));
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

/// Extracts the scalar content of a `<value>` body, dropping its type wrapper.
fn scalar(value_body: &str) -> String {
    let body = value_body.trim();
    for tag in ["string", "i4", "int", "i8", "boolean", "double"] {
        let open = format!("<{}>", tag);
        let close = format!("</{}>", tag);
        if let Some(rest) = body.strip_prefix(open.as_str()) {
            if let Some(inner) = rest.strip_suffix(close.as_str()) {
                return unescape(inner);
            }
        }
        if body == format!("<{}/>", tag) {
            return String::new();
        }
    }
    unescape(body)
}

/// Parses a `one.*` response `[success, payload, ...]`.
/// Returns the payload on success, the backend's error message otherwise.
fn parse_response(body: &str) -> std::result::Result<String, String> {
    if body.contains("<fault>") {
        let message = body
            .find("faultString")
            .and_then(|i| {
                let rest = &body[i..];
                let start = rest.find("<value>")? + "<value>".len();
                let end = rest[start..].find("</value>")? + start;
                Some(scalar(&rest[start..end]))
            })
            .unwrap_or_else(|| "unknown XML-RPC fault".to_string());
        return Err(message);
    }

    let data_start = body
        .find("<data>")
        .ok_or_else(|| "malformed XML-RPC response".to_string())?
        + "<data>".len();
    let data = &body[data_start..];

    let mut values = Vec::with_capacity(2);
    let mut cursor = 0;
    while values.len() < 2 {
        let Some(open) = data[cursor..].find("<value>") else {
            break;
        };
        let start = cursor + open + "<value>".len();
        let Some(close) = data[start..].find("</value>") else {
            break;
        };
        values.push(scalar(&data[start..start + close]));
        cursor = start + close + "</value>".len();
    }

    let ok = values
        .first()
        .map(|v| v.trim() == "1" || v.trim().eq_ignore_ascii_case("true"))
        .ok_or_else(|| "empty XML-RPC response".to_string())?;
    let payload = values.get(1).cloned().unwrap_or_default();
    if ok {
        Ok(payload)
    } else {
        Err(payload)
    }
}

fn mentions_lease(message: &str) -> bool {
    message
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| word.eq_ignore_ascii_case("lease") || word.eq_ignore_ascii_case("leases"))
}

fn classify_fault(message: String) -> BackendFault {
    if message.contains("IP/MAC") || mentions_lease(&message) {
        BackendFault::AddressConflict(message)
    } else if message.contains("Error getting") || message.contains("does not exist") {
        BackendFault::NotFound(message)
    } else {
        BackendFault::Rejected(message)
    }
}

// -----------------------------------------------------------------------------
// Object documents (one.*.info payloads)
// -----------------------------------------------------------------------------

fn strip_cdata(s: &str) -> String {
    let t = s.trim();
    t.strip_prefix("<![CDATA[")
        .and_then(|r| r.strip_suffix("]]>"))
        .unwrap_or(t)
        .to_string()
}

/// Inner XML of the first `<tag>...</tag>` element in `doc`.
fn element<'a>(doc: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = doc.find(&open)? + open.len();
    let end = doc[start..].find(&close)? + start;
    Some(&doc[start..end])
}

fn xml_text(doc: &str, path: &[&str]) -> Option<String> {
    let mut cur = doc;
    for tag in path {
        cur = element(cur, tag)?;
    }
    let text = strip_cdata(cur);
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// The user's own VM quota limit for `tag`, ignoring `DEFAULT_USER_QUOTAS`.
///
/// A fresh account carries an empty `<VM_QUOTA/>`, which reads as no limit set.
fn own_vm_quota(user_doc: &str, tag: &str) -> Option<i64> {
    let own = user_doc
        .split("<DEFAULT_USER_QUOTAS>")
        .next()
        .unwrap_or(user_doc);
    xml_text(own, &["VM_QUOTA", "VM", tag])
        .and_then(|v| v.parse::<f64>().ok())
        .map(|v| v as i64)
}

/// Direct `<KEY>value</KEY>` children of an element, in document order.
fn xml_children(doc: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = doc;
    while let Some(open) = rest.find('<') {
        let after = &rest[open + 1..];
        let Some(gt) = after.find('>') else {
            break;
        };
        let tag = &after[..gt];
        if tag.starts_with('/') || tag.starts_with('!') || tag.ends_with('/') {
            rest = &after[gt + 1..];
            continue;
        }
        let close = format!("</{}>", tag);
        let body = &after[gt + 1..];
        let Some(end) = body.find(&close) else {
            break;
        };
        out.push((tag.to_string(), strip_cdata(&body[..end])));
        rest = &body[end + close.len()..];
    }
    out
}

fn parse_template(template_id: i64, doc: &str) -> Result<VmTemplate> {
    let body = element(doc, "TEMPLATE").ok_or_else(|| {
        BackendFault::Rejected(format!("VMTEMPLATE {} has no TEMPLATE body", template_id))
    })?;
    let name = xml_text(doc, &["VMTEMPLATE", "NAME"]).unwrap_or_default();
    let capacity = xml_text(body, &["CAPACITY"])
        .map(|c| CapacityMode::parse(&c))
        .unwrap_or(CapacityMode::Variable);
    let image_id = xml_text(body, &["DISK", "IMAGE_ID"]).and_then(|v| v.parse().ok());
    let os_hint = [
        xml_text(body, &["LOGO"]),
        xml_text(body, &["GUEST_OS"]),
        xml_text(body, &["OS", "GUEST_OS"]),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join(" ")
    .to_ascii_lowercase();
    let os = if os_hint.contains("windows") {
        OsFamily::Windows
    } else {
        OsFamily::Linux
    };
    Ok(VmTemplate {
        id: template_id,
        name,
        capacity,
        image_id,
        os,
    })
}

fn vm_state(doc: &str) -> Option<String> {
    const STATES: [&str; 12] = [
        "INIT", "PENDING", "HOLD", "ACTIVE", "STOPPED", "SUSPENDED", "DONE", "FAILED",
        "POWEROFF", "UNDEPLOYED", "CLONING", "CLONING_FAILURE",
    ];
    let state: usize = xml_text(doc, &["VM", "STATE"])?.parse().ok()?;
    let name = STATES.get(state).copied().unwrap_or("UNKNOWN");
    if name != "ACTIVE" {
        return Some(name.to_string());
    }
    let lcm: u32 = xml_text(doc, &["VM", "LCM_STATE"])
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let lcm_name = match lcm {
        1 => "PROLOG",
        2 => "BOOT",
        3 => "RUNNING",
        4 => "MIGRATE",
        5 => "SAVE_STOP",
        6 => "SAVE_SUSPEND",
        7 => "SAVE_MIGRATE",
        8 => "PROLOG_MIGRATE",
        9 => "PROLOG_RESUME",
        10 => "EPILOG_STOP",
        11 => "EPILOG",
        12 => "SHUTDOWN",
        15 => "CLEANUP_RESUBMIT",
        16 => "UNKNOWN",
        17 => "HOTPLUG",
        18 => "SHUTDOWN_POWEROFF",
        _ => "ACTIVE",
    };
    Some(lcm_name.to_string())
}

fn parse_vm(vm_id: i64, doc: &str) -> Result<VirtualMachine> {
    let owner_id = xml_text(doc, &["VM", "UID"])
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let state = vm_state(doc).unwrap_or_else(|| "UNKNOWN".to_string());
    let template = element(doc, "TEMPLATE").unwrap_or_default();
    let context = element(template, "CONTEXT");

    let ctx_value = |key: &str| context.and_then(|c| xml_text(c, &[key]));
    let nic = element(template, "NIC").map(|nic| Nic {
        ip: xml_text(nic, &["IP"])
            .or_else(|| ctx_value("ETH0_IP"))
            .unwrap_or_default(),
        dns: xml_text(nic, &["DNS"])
            .or_else(|| ctx_value("ETH0_DNS"))
            .unwrap_or_default(),
        gateway: xml_text(nic, &["GATEWAY"])
            .or_else(|| ctx_value("ETH0_GATEWAY"))
            .unwrap_or_default(),
        network: xml_text(nic, &["NETWORK"]).unwrap_or_default(),
        network_uname: xml_text(nic, &["NETWORK_UNAME"]).unwrap_or_default(),
    });

    let context = context.map(|c| {
        let pairs: Vec<String> = xml_children(c)
            .into_iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect();
        format!("CONTEXT = [ {} ]", pairs.join(", "))
    });

    Ok(VirtualMachine {
        id: vm_id,
        owner_id,
        state,
        nic,
        context,
    })
}
