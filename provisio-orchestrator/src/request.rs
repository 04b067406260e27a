use crate::error::ProvisionError;
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Units {
    #[default]
    Mb,
    Gb,
}

impl Units {
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("GB") {
            Units::Gb
        } else {
            Units::Mb
        }
    }

    /// Converts a size expressed in these units to MB.
    pub fn to_mb(self, value: i64) -> i64 {
        match self {
            Units::Mb => value,
            Units::Gb => value.saturating_mul(1024),
        }
    }
}

/// Drive class requested for the VM; picks the deploy datastore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriveClass {
    Ssd,
    #[default]
    Hdd,
}

impl DriveClass {
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("SSD") {
            DriveClass::Ssd
        } else {
            DriveClass::Hdd
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugMode {
    #[default]
    Off,
    /// Entry point returns a null result without touching the backend.
    Disabled,
    /// Entry point returns synthetic data without touching the backend.
    FakeData,
}

impl DebugMode {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "disabled" | "turn_method_off" | "off_method" => DebugMode::Disabled,
            "data" | "fake-data" | "fake_data" => DebugMode::FakeData,
            _ => DebugMode::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    /// Deploy right away (otherwise the VM stays on hold).
    pub release: bool,
    pub trial: bool,
    /// Run configuration-management bootstrap once the VM is up.
    pub ansible: bool,
    /// Reuse the account given by `userid` instead of allocating one.
    pub nouser: bool,
    pub test: bool,
}

/// Strongly typed view of an incoming provisioning request.
///
/// Built from the flat key/value map the command surface receives; numeric
/// fields are coerced up front so no backend call ever sees a raw string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisioningRequest {
    pub login: String,
    pub password: String,
    pub vm_password: String,
    pub template_id: i64,
    pub cpu: i64,
    pub ram: i64,
    pub drive: i64,
    pub iops: i64,
    pub units: Units,
    pub group_id: i64,
    pub user_id: i64,
    pub vm_id: i64,
    pub flags: Flags,
    pub debug: DebugMode,
    pub host: Option<i64>,
    pub drive_class: DriveClass,
    pub template_override: Option<String>,
    pub trial_suspend_delay: Option<Duration>,
    pub bootstrap_service: Option<String>,
}

/// Integer coercion with the same leniency as the billing side expects:
/// numbers, numeric strings, and strings with a numeric prefix ("12GB" -> 12).
fn coerce_int(v: Option<&Value>) -> i64 {
    match v {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => {
            let s = s.trim();
            let (sign, digits) = match s.strip_prefix('-') {
                Some(rest) => (-1, rest),
                None => (1, s.strip_prefix('+').unwrap_or(s)),
            };
            let prefix: String = digits.chars().take_while(|c| c.is_ascii_digit()).collect();
            prefix.parse::<i64>().map(|n| sign * n).unwrap_or(0)
        }
        Some(Value::Bool(b)) => i64::from(*b),
        _ => 0,
    }
}

fn coerce_bool(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        _ => false,
    }
}

fn coerce_str(v: Option<&Value>) -> Option<String> {
    match v {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    }
}

impl ProvisioningRequest {
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let int = |k: &str| coerce_int(map.get(k));
        let flag = |k: &str| coerce_bool(map.get(k));
        let text = |k: &str| coerce_str(map.get(k));

        let present = |k: &str| map.get(k).map(|v| !v.is_null()).unwrap_or(false);

        Self {
            login: text("login").unwrap_or_default(),
            password: text("password").unwrap_or_default(),
            vm_password: text("passwd").unwrap_or_default(),
            template_id: int("templateid"),
            cpu: int("cpu"),
            ram: int("ram"),
            drive: int("drive"),
            iops: int("iops"),
            units: text("units").map(|u| Units::parse(&u)).unwrap_or_default(),
            group_id: int("groupid"),
            user_id: int("userid"),
            vm_id: int("vmid"),
            flags: Flags {
                release: flag("release"),
                trial: flag("trial"),
                ansible: flag("ansible"),
                nouser: flag("nouser"),
                test: flag("test"),
            },
            debug: text("debug").map(|d| DebugMode::parse(&d)).unwrap_or_default(),
            host: present("host").then(|| int("host")),
            drive_class: text("ds_type").map(|d| DriveClass::parse(&d)).unwrap_or_default(),
            template_override: text("user-template").filter(|t| !t.trim().is_empty()),
            trial_suspend_delay: present("trial-suspend-delay")
                .then(|| Duration::from_secs(int("trial-suspend-delay").max(0) as u64)),
            bootstrap_service: text("ansible-service").filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn ram_mb(&self) -> i64 {
        self.units.to_mb(self.ram)
    }

    pub fn drive_mb(&self) -> i64 {
        self.units.to_mb(self.drive)
    }

    /// Login the account is allocated under (`_test` suffix for test orders).
    pub fn account_login(&self) -> String {
        if self.flags.test {
            format!("{}_test", self.login)
        } else {
            self.login.clone()
        }
    }

    /// Name given to the new VM.
    pub fn vm_name(&self) -> String {
        if self.login.trim().is_empty() {
            format!("user{}_vm", self.user_id)
        } else {
            format!("{}_vm", self.login)
        }
    }

    pub fn validate_create(&self) -> Result<(), ProvisionError> {
        let mut missing: Vec<&str> = [("cpu", self.cpu), ("ram", self.ram), ("drive", self.drive)]
            .into_iter()
            .filter(|(_, v)| *v <= 0)
            .map(|(k, _)| k)
            .collect();
        if self.flags.nouser {
            if self.user_id <= 0 {
                missing.push("userid");
            }
        } else {
            if self.login.trim().is_empty() {
                missing.push("login");
            }
            if self.password.is_empty() {
                missing.push("password");
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ProvisionError::InvalidRequest(format!(
                "missing or zero fields: {}",
                missing.join(", ")
            )))
        }
    }

    pub fn validate_reinstall(&self) -> Result<(), ProvisionError> {
        let missing: Vec<&str> = [
            ("vmid", self.vm_id),
            ("groupid", self.group_id),
            ("userid", self.user_id),
            ("templateid", self.template_id),
        ]
        .into_iter()
        .filter(|(_, v)| *v <= 0)
        .map(|(k, _)| k)
        .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ProvisionError::InvalidRequest(format!(
                "missing or zero fields: {}",
                missing.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn numeric_strings_are_coerced() {
        let req = ProvisioningRequest::from_map(&map(json!({
            "cpu": "4", "ram": " 8 ", "drive": "40GB", "iops": 350.7, "templateid": "abc"
        })));
        assert_eq!(req.cpu, 4);
        assert_eq!(req.ram, 8);
        assert_eq!(req.drive, 40);
        assert_eq!(req.iops, 350);
        assert_eq!(req.template_id, 0);
    }

    #[test]
    fn flags_and_enums() {
        let req = ProvisioningRequest::from_map(&map(json!({
            "release": "true", "trial": 1, "ansible": true, "nouser": "no",
            "units": "gb", "ds_type": "SSD", "debug": "turn_method_off", "host": "3",
            "trial-suspend-delay": "120"
        })));
        assert!(req.flags.release && req.flags.trial && req.flags.ansible);
        assert!(!req.flags.nouser && !req.flags.test);
        assert_eq!(req.units, Units::Gb);
        assert_eq!(req.drive_class, DriveClass::Ssd);
        assert_eq!(req.debug, DebugMode::Disabled);
        assert_eq!(req.host, Some(3));
        assert_eq!(req.trial_suspend_delay, Some(Duration::from_secs(120)));
    }

    #[test]
    fn absent_optionals_stay_empty() {
        let req = ProvisioningRequest::from_map(&map(json!({ "login": "bob", "host": null })));
        assert_eq!(req.host, None);
        assert_eq!(req.trial_suspend_delay, None);
        assert_eq!(req.template_override, None);
        assert_eq!(req.units, Units::Mb);
        assert_eq!(req.drive_class, DriveClass::Hdd);
        assert_eq!(req.debug, DebugMode::Off);
    }

    #[test]
    fn units_scale_sizes() {
        let req = ProvisioningRequest::from_map(&map(json!({ "ram": 2, "drive": 20, "units": "GB" })));
        assert_eq!(req.ram_mb(), 2048);
        assert_eq!(req.drive_mb(), 20480);
    }

    #[test]
    fn create_requires_sizes_and_credentials() {
        let req = ProvisioningRequest::from_map(&map(json!({ "login": "bob", "password": "x", "cpu": 1, "ram": 0, "drive": 10 })));
        let err = req.validate_create().unwrap_err();
        assert!(err.to_string().contains("ram"));

        let req = ProvisioningRequest::from_map(&map(json!({ "cpu": 1, "ram": 1, "drive": 10, "nouser": true })));
        assert!(req.validate_create().unwrap_err().to_string().contains("userid"));
    }

    #[test]
    fn reinstall_requires_ids() {
        let req = ProvisioningRequest::from_map(&map(json!({ "vmid": 10, "groupid": 2, "userid": 7 })));
        let err = req.validate_reinstall().unwrap_err();
        assert!(err.to_string().contains("templateid"));
    }

    #[test]
    fn test_orders_get_suffixed_login() {
        let req = ProvisioningRequest::from_map(&map(json!({ "login": "bob", "test": true })));
        assert_eq!(req.account_login(), "bob_test");
        assert_eq!(req.vm_name(), "bob_vm");
    }
}
