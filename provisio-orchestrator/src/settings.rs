use anyhow::{anyhow, Context, Result};
use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Which orchestration backend the binary talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Mock,
    OpenNebula,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(BackendKind::Mock),
            "opennebula" | "one" => Ok(BackendKind::OpenNebula),
            other => Err(anyhow!("unknown provider '{}'", other)),
        }
    }
}

/// Immutable orchestrator configuration, built once at startup and shared via `Arc`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub provider: BackendKind,
    pub one_endpoint: String,
    pub one_username: String,
    pub one_password: String,

    /// Group every tenant account is allocated into (also the VM group after chown).
    pub users_group_id: i64,
    pub default_host_id: i64,
    pub datastore_ssd_id: i64,
    pub datastore_hdd_id: i64,
    pub vnc_base_port: i64,
    /// Multiplier applied to the requested vCPU count when capping constrained clusters.
    pub cpu_limits_coef: f64,
    pub trial_suspend_delay: Duration,

    pub guest_ssh_port: u16,
    pub bootstrap_endpoint: Option<String>,
    pub bootstrap_token: Option<String>,
    pub bootstrap_service: String,
    pub bootstrap_initial_delay: Duration,
    pub bootstrap_backoff: Duration,
    pub bootstrap_max_attempts: u32,

    pub instantiate_retry_delay: Duration,
    pub poll_interval: Duration,
    pub running_timeout: Duration,
    pub terminal_timeout: Duration,

    pub listen_addr: SocketAddr,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: BackendKind::Mock,
            one_endpoint: "http://localhost:2633/RPC2".to_string(),
            one_username: "oneadmin".to_string(),
            one_password: String::new(),
            users_group_id: 1,
            default_host_id: 0,
            datastore_ssd_id: 1,
            datastore_hdd_id: 100,
            vnc_base_port: 5900,
            cpu_limits_coef: 1.0,
            trial_suspend_delay: Duration::from_secs(14 * 24 * 3600),
            guest_ssh_port: 22,
            bootstrap_endpoint: None,
            bootstrap_token: None,
            bootstrap_service: "base".to_string(),
            bootstrap_initial_delay: Duration::from_secs(60),
            bootstrap_backoff: Duration::from_secs(60),
            bootstrap_max_attempts: 30,
            instantiate_retry_delay: Duration::from_secs(3),
            poll_interval: Duration::from_millis(500),
            running_timeout: Duration::from_secs(30 * 60),
            terminal_timeout: Duration::from_secs(10 * 60),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8001)),
        }
    }
}

fn var_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match var_opt(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow!("{}", e))
            .with_context(|| format!("invalid value for {}: '{}'", key, raw)),
        None => Ok(default),
    }
}

fn secs_or(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(parse_or(key, default.as_secs())?))
}

fn millis_or(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_millis(parse_or(
        key,
        default.as_millis() as u64,
    )?))
}

/// Prefer `*_FILE` for secrets (Docker/K8s friendly), fallback to the plain env var.
fn secret(key: &str) -> Option<String> {
    var_opt(&format!("{}_FILE", key))
        .and_then(|path| std::fs::read_to_string(path).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| var_opt(key))
}

impl Settings {
    /// Reads the configuration from the environment (after loading `.env`, if present).
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let d = Settings::default();
        let settings = Self {
            provider: parse_or("PROVIDER", d.provider)?,
            one_endpoint: var_opt("ONE_ENDPOINT").unwrap_or(d.one_endpoint),
            one_username: var_opt("ONE_USERNAME").unwrap_or(d.one_username),
            one_password: secret("ONE_PASSWORD").unwrap_or(d.one_password),
            users_group_id: parse_or("USERS_GROUP_ID", d.users_group_id)?,
            default_host_id: parse_or("DEFAULT_HOST_ID", d.default_host_id)?,
            datastore_ssd_id: parse_or("DATASTORE_SSD_ID", d.datastore_ssd_id)?,
            datastore_hdd_id: parse_or("DATASTORE_HDD_ID", d.datastore_hdd_id)?,
            vnc_base_port: parse_or("VNC_BASE_PORT", d.vnc_base_port)?,
            cpu_limits_coef: parse_or("CPU_LIMITS_COEF", d.cpu_limits_coef)?,
            trial_suspend_delay: secs_or("TRIAL_SUSPEND_DELAY_SECS", d.trial_suspend_delay)?,
            guest_ssh_port: parse_or("GUEST_SSH_PORT", d.guest_ssh_port)?,
            bootstrap_endpoint: var_opt("BOOTSTRAP_ENDPOINT"),
            bootstrap_token: secret("BOOTSTRAP_TOKEN"),
            bootstrap_service: var_opt("BOOTSTRAP_SERVICE").unwrap_or(d.bootstrap_service),
            bootstrap_initial_delay: secs_or(
                "BOOTSTRAP_INITIAL_DELAY_SECS",
                d.bootstrap_initial_delay,
            )?,
            bootstrap_backoff: secs_or("BOOTSTRAP_BACKOFF_SECS", d.bootstrap_backoff)?,
            bootstrap_max_attempts: parse_or("BOOTSTRAP_MAX_ATTEMPTS", d.bootstrap_max_attempts)?,
            instantiate_retry_delay: millis_or(
                "INSTANTIATE_RETRY_DELAY_MS",
                d.instantiate_retry_delay,
            )?,
            poll_interval: millis_or("STATE_POLL_INTERVAL_MS", d.poll_interval)?,
            running_timeout: secs_or("RUNNING_TIMEOUT_SECS", d.running_timeout)?,
            terminal_timeout: secs_or("TERMINAL_TIMEOUT_SECS", d.terminal_timeout)?,
            listen_addr: parse_or("LISTEN_ADDR", d.listen_addr)?,
        };
        if settings.bootstrap_max_attempts == 0 {
            return Err(anyhow!("BOOTSTRAP_MAX_ATTEMPTS must be at least 1"));
        }
        Ok(settings)
    }

    /// Datastore for the requested drive class.
    pub fn datastore_for(&self, class: crate::request::DriveClass) -> i64 {
        match class {
            crate::request::DriveClass::Ssd => self.datastore_ssd_id,
            crate::request::DriveClass::Hdd => self.datastore_hdd_id,
        }
    }
}
