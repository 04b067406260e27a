use crate::accounts;
use crate::context::{self, CapacityOverride, Credentials, GuestContext, NicSource};
use crate::error::{ErrorKind, ProvisionError};
use crate::logger::ActionJournal;
use crate::poller;
use crate::post_deploy::{PostDeployPlan, PostDeployRunner};
use crate::request::{DebugMode, ProvisioningRequest};
use crate::settings::Settings;
use crate::stats::CallStats;
use crate::tasks::TaskPool;
use crate::template;
use crate::trace::{self, TraceLog};
use anyhow::{anyhow, Context};
use futures_util::FutureExt;
use provisio_common::{BackendFault, CapacityMode, STATE_DONE};
use provisio_providers::{BootstrapTrigger, CloudBackend};
use serde::Serialize;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

/// Outcome of a workflow call, serialized as the caller-facing mapping.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProvisioningResult {
    Created {
        #[serde(rename = "userid")]
        account_id: i64,
        #[serde(rename = "vmid")]
        vm_id: i64,
        ip: String,
    },
    Reinstalled {
        #[serde(rename = "vmid")]
        vm_id: i64,
        #[serde(rename = "vmid_old")]
        vm_id_old: i64,
        ip: String,
        ip_old: String,
    },
    Failed {
        error: ErrorKind,
        message: String,
        trace: Vec<String>,
    },
    /// Entry point switched off by the `debug` field; serializes as null.
    Disabled,
}

impl ProvisioningResult {
    pub fn failed(err: &ProvisionError, trace: TraceLog) -> Self {
        ProvisioningResult::Failed {
            error: err.kind(),
            message: err.to_string(),
            trace: trace.into_steps(),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ProvisioningResult::Failed { error, .. } => Some(*error),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ProvisioningResult::Created { .. } | ProvisioningResult::Reinstalled { .. }
        )
    }
}

fn is_address_conflict(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<BackendFault>(),
        Some(BackendFault::AddressConflict(_))
    )
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Provisioning and reinstall workflows against one orchestration backend.
pub struct Orchestrator {
    backend: Arc<dyn CloudBackend>,
    settings: Arc<Settings>,
    tasks: TaskPool,
    stats: Arc<CallStats>,
    journal: Arc<ActionJournal>,
    post_deploy: PostDeployRunner,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn CloudBackend>,
        bootstrap: Arc<dyn BootstrapTrigger>,
        settings: Arc<Settings>,
    ) -> Self {
        let tasks = TaskPool::new();
        let journal = Arc::new(ActionJournal::default());
        let post_deploy = PostDeployRunner::new(
            backend.clone(),
            bootstrap,
            settings.clone(),
            tasks.clone(),
            journal.clone(),
        );
        Self {
            backend,
            settings,
            tasks,
            stats: Arc::new(CallStats::default()),
            journal,
            post_deploy,
        }
    }

    pub fn tasks(&self) -> &TaskPool {
        &self.tasks
    }

    pub fn stats(&self) -> &CallStats {
        &self.stats
    }

    pub fn journal(&self) -> &ActionJournal {
        &self.journal
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Creates a tenant account (unless reused) and a VM from a template.
    pub async fn create_vm(&self, req: ProvisioningRequest) -> ProvisioningResult {
        self.stats.record("create_vm");
        match req.debug {
            DebugMode::Disabled => return ProvisioningResult::Disabled,
            DebugMode::FakeData => {
                return ProvisioningResult::Created {
                    account_id: req.user_id,
                    vm_id: req.vm_id + 1000,
                    ip: "0.0.0.0".to_string(),
                }
            }
            DebugMode::Off => {}
        }

        let start = Instant::now();
        let log_id = self.journal.log_event_with_metadata(
            "EXECUTE_CREATE_VM",
            "in_progress",
            None,
            None,
            Some(json!({ "login": req.login, "templateid": req.template_id, "release": req.flags.release })),
        );
        let mut trace = TraceLog::new("create_vm");
        let outcome = AssertUnwindSafe(self.try_create(&req, &mut trace))
            .catch_unwind()
            .await;
        self.finish(log_id, start, outcome, trace)
    }

    /// Replaces a VM with a fresh one from a template, keeping its network identity.
    pub async fn reinstall_vm(&self, req: ProvisioningRequest) -> ProvisioningResult {
        self.stats.record("reinstall_vm");
        match req.debug {
            DebugMode::Disabled => return ProvisioningResult::Disabled,
            DebugMode::FakeData => {
                return ProvisioningResult::Reinstalled {
                    vm_id: req.vm_id + 1000,
                    vm_id_old: req.vm_id,
                    ip: "0.0.0.0".to_string(),
                    ip_old: "0.0.0.0".to_string(),
                }
            }
            DebugMode::Off => {}
        }

        let start = Instant::now();
        let log_id = self.journal.log_event_with_metadata(
            "EXECUTE_REINSTALL_VM",
            "in_progress",
            (req.vm_id > 0).then_some(req.vm_id),
            None,
            Some(json!({ "templateid": req.template_id, "userid": req.user_id, "release": req.flags.release })),
        );
        let mut trace = TraceLog::new("reinstall_vm");
        let outcome = AssertUnwindSafe(self.try_reinstall(&req, &mut trace))
            .catch_unwind()
            .await;
        self.finish(log_id, start, outcome, trace)
    }

    fn finish(
        &self,
        log_id: uuid::Uuid,
        start: Instant,
        outcome: std::thread::Result<Result<ProvisioningResult, ProvisionError>>,
        trace: TraceLog,
    ) -> ProvisioningResult {
        let duration_ms = start.elapsed().as_millis() as i64;
        let result = match outcome {
            Ok(Ok(result)) => {
                self.journal.log_event_complete_with_metadata(
                    log_id,
                    "success",
                    duration_ms,
                    None,
                    serde_json::to_value(&result).ok(),
                );
                return result;
            }
            Ok(Err(err)) => err,
            Err(payload) => ProvisionError::Other(anyhow!("panic: {}", panic_message(payload.as_ref()))),
        };
        tracing::error!(kind = result.kind().as_str(), error = %result, steps = trace.steps().len(), "workflow failed");
        self.journal
            .log_event_complete(log_id, "failed", duration_ms, Some(&result.to_string()));
        ProvisioningResult::failed(&result, trace)
    }

    async fn try_create(
        &self,
        req: &ProvisioningRequest,
        trace: &mut TraceLog,
    ) -> Result<ProvisioningResult, ProvisionError> {
        let backend = self.backend.as_ref();
        let settings = self.settings.as_ref();

        trace.checkpoint("Checking params");
        req.validate_create()?;

        let template = trace::step(trace, "Checking template", template::resolve(backend, req.template_id)).await?;

        let account = if req.flags.nouser {
            trace.checkpoint("Reusing existing account");
            accounts::existing(req.user_id, &req.login, settings.users_group_id)
        } else {
            let login = req.account_login();
            trace::step(
                trace,
                "Creating new user",
                accounts::create(
                    backend,
                    settings.users_group_id,
                    &login,
                    &req.password,
                    (req.group_id > 0).then_some(req.group_id),
                ),
            )
            .await?
        };

        let capacity = match template.capacity_mode() {
            CapacityMode::Variable => {
                // The account already exists, so a quota failure must not abort the order.
                if let Err(e) = trace::step(
                    trace,
                    "Updating user quota",
                    backend.update_resource_quota(account.id, req.cpu, req.ram_mb(), req.drive_mb()),
                )
                .await
                {
                    tracing::warn!(account_id = account.id, error = %e, "quota update failed");
                    trace.checkpoint(format!("Updating user quota failed: {}", e));
                }
                Some(CapacityOverride::from_request(req, &template))
            }
            CapacityMode::Fixed => None,
        };

        let guest = GuestContext::new(
            NicSource::BackendAssigned,
            Credentials {
                password: req.vm_password.clone(),
                windows: template.is_windows(),
            },
            capacity,
        );
        let extra = [guest.capacity_block(), req.template_override.clone()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join("\n");

        let vm_id = self
            .instantiate_with_retry(trace, template.id, &req.vm_name(), true, &extra)
            .await?;
        tracing::info!(vm_id, account_id = account.id, template_id = template.id, "VM instantiated on hold");

        // Everything below is best effort: the VM exists and is returned either way.
        if let Err(e) = trace::step(
            trace,
            "Changing VM owner",
            backend.change_owner(vm_id, account.id, settings.users_group_id),
        )
        .await
        {
            tracing::warn!(vm_id, error = %e, "ownership change failed");
            trace.checkpoint(format!("Changing VM owner failed: {}", e));
        }
        if let Err(e) = trace::step(trace, "Setting VM context", backend.reconfigure(vm_id, &guest.credential_block())).await {
            tracing::warn!(vm_id, error = %e, "context update failed");
            trace.checkpoint(format!("Setting VM context failed: {}", e));
        }
        if let Err(e) = trace::step(
            trace,
            "Setting VM VNC settings",
            backend.reconfigure(vm_id, &context::vnc_block(settings.vnc_base_port, vm_id)),
        )
        .await
        {
            tracing::warn!(vm_id, error = %e, "console setup failed");
            trace.checkpoint(format!("Setting VM VNC settings failed: {}", e));
        }

        if req.flags.release {
            let host_id = req.host.unwrap_or(settings.default_host_id);
            let datastore_id = settings.datastore_for(req.drive_class);
            if let Err(e) = trace::step(trace, "Deploying VM", backend.deploy(vm_id, host_id, false, datastore_id)).await {
                tracing::warn!(vm_id, host_id, datastore_id, error = %e, "deploy failed");
                trace.checkpoint(format!("Deploying VM failed: {}", e));
            }
            trace.checkpoint("Starting post-deploy tasks");
            self.post_deploy
                .spawn(PostDeployPlan::from_request(req, vm_id, settings));
        }

        let ip = self.current_ip(vm_id).await.unwrap_or_default();
        Ok(ProvisioningResult::Created {
            account_id: account.id,
            vm_id,
            ip,
        })
    }

    async fn try_reinstall(
        &self,
        req: &ProvisioningRequest,
        trace: &mut TraceLog,
    ) -> Result<ProvisioningResult, ProvisionError> {
        let backend = self.backend.as_ref();
        let settings = self.settings.as_ref();

        trace.checkpoint("Checking params");
        req.validate_reinstall()?;

        let old_vm = trace::step(trace, "Reading old VM", backend.read_vm(req.vm_id))
            .await
            .with_context(|| format!("loading VM {}", req.vm_id))?;
        let nic = old_vm
            .nic
            .clone()
            .filter(|n| !n.ip.is_empty())
            .ok_or_else(|| anyhow!("VM {} has no network interface to preserve", req.vm_id))?;
        tracing::debug!(vm_id = req.vm_id, ip = %nic.ip, has_context = old_vm.context.is_some(), "old VM network captured");

        let template = trace::step(trace, "Checking template", template::resolve(backend, req.template_id)).await?;
        let capacity = (template.capacity_mode() == CapacityMode::Variable)
            .then(|| CapacityOverride::from_request(req, &template));

        let mut extra = context::build(
            NicSource::Preserved(nic.clone()),
            Credentials {
                password: req.vm_password.clone(),
                windows: template.is_windows(),
            },
            capacity,
        );
        if let Some(user_template) = &req.template_override {
            extra.push('\n');
            extra.push_str(user_template);
        }

        trace::step(trace, "Terminating old VM", backend.terminate(req.vm_id, true))
            .await
            .with_context(|| format!("terminating VM {}", req.vm_id))?;

        if req.flags.release {
            let token = self.tasks.child_token();
            trace::step(
                trace,
                "Waiting for old VM to be released",
                poller::await_state(
                    backend,
                    req.vm_id,
                    STATE_DONE,
                    settings.poll_interval,
                    settings.terminal_timeout,
                    &token,
                ),
            )
            .await
            .map_err(anyhow::Error::new)?;
        }

        let vm_id = self
            .instantiate_with_retry(trace, template.id, &req.vm_name(), false, &extra)
            .await?;
        tracing::info!(vm_id, vm_id_old = req.vm_id, "replacement VM instantiated");

        if let Err(e) = trace::step(
            trace,
            "Changing VM owner",
            backend.change_owner(vm_id, req.user_id, settings.users_group_id),
        )
        .await
        {
            tracing::warn!(vm_id, error = %e, "ownership change failed");
            trace.checkpoint(format!("Changing VM owner failed: {}", e));
        }

        if req.flags.release {
            trace.checkpoint("Starting post-deploy tasks");
            let plan = PostDeployPlan::from_request(req, vm_id, settings)
                .with_deploy(settings.datastore_for(req.drive_class));
            self.post_deploy.spawn(plan);
        }

        let ip = self
            .current_ip(vm_id)
            .await
            .unwrap_or_else(|| nic.ip.clone());
        Ok(ProvisioningResult::Reinstalled {
            vm_id,
            vm_id_old: req.vm_id,
            ip,
            ip_old: nic.ip,
        })
    }

    /// Instantiates a template, retrying exactly once after an address conflict.
    async fn instantiate_with_retry(
        &self,
        trace: &mut TraceLog,
        template_id: i64,
        name: &str,
        on_hold: bool,
        extra: &str,
    ) -> Result<i64, ProvisionError> {
        let backend = self.backend.as_ref();
        let first = trace::step(
            trace,
            "Instantiating template",
            backend.instantiate_template(template_id, name, on_hold, extra),
        )
        .await;
        let err = match first {
            Ok(vm_id) => return Ok(vm_id),
            Err(e) if is_address_conflict(&e) => e,
            Err(e) => return Err(ProvisionError::Instantiation(e)),
        };

        tracing::warn!(template_id, error = %err, delay_ms = self.settings.instantiate_retry_delay.as_millis() as u64, "address conflict; retrying once");
        tokio::time::sleep(self.settings.instantiate_retry_delay).await;
        trace::step(
            trace,
            "Retrying template instantiation",
            backend.instantiate_template(template_id, name, on_hold, extra),
        )
        .await
        .map_err(|e| {
            if is_address_conflict(&e) {
                ProvisionError::AddressConflict(e)
            } else {
                ProvisionError::Instantiation(e)
            }
        })
    }

    async fn current_ip(&self, vm_id: i64) -> Option<String> {
        match self.backend.read_vm(vm_id).await {
            Ok(vm) => vm.ip().map(str::to_string),
            Err(e) => {
                tracing::warn!(vm_id, error = %e, "could not read VM address");
                None
            }
        }
    }
}
