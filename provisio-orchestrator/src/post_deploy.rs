use crate::logger::ActionJournal;
use crate::poller;
use crate::request::ProvisioningRequest;
use crate::settings::Settings;
use crate::tasks::TaskPool;
use anyhow::{anyhow, Context, Result};
use provisio_common::{ClusterKind, STATE_RUNNING};
use provisio_providers::{BootstrapTrigger, CloudBackend};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What to do with a VM once the synchronous workflow has returned.
#[derive(Debug, Clone, PartialEq)]
pub struct PostDeployPlan {
    pub vm_id: i64,
    pub host_id: i64,
    /// Datastore to deploy to before waiting (reinstall path). `None` when already deployed.
    pub deploy_to: Option<i64>,
    pub cpu: i64,
    pub ram_mb: i64,
    pub iops: i64,
    /// Suspend delay when the order is a trial.
    pub trial: Option<Duration>,
    /// Service to bootstrap when configuration management was requested.
    pub bootstrap: Option<String>,
}

impl PostDeployPlan {
    pub fn from_request(req: &ProvisioningRequest, vm_id: i64, settings: &Settings) -> Self {
        Self {
            vm_id,
            host_id: req.host.unwrap_or(settings.default_host_id),
            deploy_to: None,
            cpu: req.cpu,
            ram_mb: req.ram_mb(),
            iops: req.iops,
            trial: req
                .flags
                .trial
                .then(|| req.trial_suspend_delay.unwrap_or(settings.trial_suspend_delay)),
            bootstrap: req.flags.ansible.then(|| {
                req.bootstrap_service
                    .clone()
                    .unwrap_or_else(|| settings.bootstrap_service.clone())
            }),
        }
    }

    pub fn with_deploy(mut self, datastore_id: i64) -> Self {
        self.deploy_to = Some(datastore_id);
        self
    }
}

/// Runs limits, trial scheduling and bootstrap as independent pool tasks
/// once the VM reports RUNNING.
#[derive(Clone)]
pub struct PostDeployRunner {
    backend: Arc<dyn CloudBackend>,
    bootstrap: Arc<dyn BootstrapTrigger>,
    settings: Arc<Settings>,
    pool: TaskPool,
    journal: Arc<ActionJournal>,
}

impl PostDeployRunner {
    pub fn new(
        backend: Arc<dyn CloudBackend>,
        bootstrap: Arc<dyn BootstrapTrigger>,
        settings: Arc<Settings>,
        pool: TaskPool,
        journal: Arc<ActionJournal>,
    ) -> Self {
        Self {
            backend,
            bootstrap,
            settings,
            pool,
            journal,
        }
    }

    /// Spawns the post-deploy job and returns its task id.
    pub fn spawn(&self, plan: PostDeployPlan) -> Uuid {
        let runner = self.clone();
        let vm_id = plan.vm_id;
        self.pool
            .spawn("post_deploy", vm_id, move |token| async move { runner.run(plan, token).await })
    }

    async fn run(self, plan: PostDeployPlan, token: CancellationToken) -> Result<()> {
        let vm_id = plan.vm_id;
        if let Some(datastore_id) = plan.deploy_to {
            if let Err(e) = self
                .backend
                .deploy(vm_id, plan.host_id, false, datastore_id)
                .await
            {
                tracing::warn!(vm_id, host_id = plan.host_id, datastore_id, error = %e, "deploy failed; waiting for scheduler placement");
            }
        }

        let started = Instant::now();
        let log_id = self.journal.log_event("AWAIT_RUNNING", "in_progress", Some(vm_id), None);
        let waited = poller::await_state(
            self.backend.as_ref(),
            vm_id,
            STATE_RUNNING,
            self.settings.poll_interval,
            self.settings.running_timeout,
            &token,
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as i64;
        if let Err(e) = waited {
            let msg = e.to_string();
            self.journal
                .log_event_complete(log_id, "failed", duration_ms, Some(&msg));
            return Err(anyhow::Error::new(e).context("post-deploy aborted"));
        }
        self.journal.log_event_complete(log_id, "success", duration_ms, None);

        {
            let backend = self.backend.clone();
            let settings = self.settings.clone();
            let journal = self.journal.clone();
            let plan = plan.clone();
            self.pool.spawn("limits", vm_id, move |_| async move {
                journaled(&journal, "SET_LIMITS", vm_id, enforce_limits(backend.as_ref(), &settings, &plan)).await
            });
        }

        if let Some(delay) = plan.trial {
            let backend = self.backend.clone();
            let journal = self.journal.clone();
            self.pool.spawn("trial", vm_id, move |_| async move {
                journaled(&journal, "SCHEDULE_TRIAL_SUSPEND", vm_id, schedule_trial(backend.as_ref(), vm_id, delay)).await
            });
        }

        if let Some(service) = plan.bootstrap.clone() {
            let backend = self.backend.clone();
            let trigger = self.bootstrap.clone();
            let settings = self.settings.clone();
            let journal = self.journal.clone();
            self.pool.spawn("bootstrap", vm_id, move |token| async move {
                journaled(
                    &journal,
                    "BOOTSTRAP",
                    vm_id,
                    bootstrap_loop(backend.as_ref(), trigger.as_ref(), &settings, vm_id, &service, &token),
                )
                .await
            });
        }
        Ok(())
    }
}

async fn journaled<F>(journal: &ActionJournal, action: &str, vm_id: i64, fut: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    let started = Instant::now();
    let log_id = journal.log_event(action, "in_progress", Some(vm_id), None);
    let res = fut.await;
    let duration_ms = started.elapsed().as_millis() as i64;
    match &res {
        Ok(()) => journal.log_event_complete(log_id, "success", duration_ms, None),
        Err(e) => journal.log_event_complete(log_id, "failed", duration_ms, Some(&format!("{:#}", e))),
    }
    res
}

/// Caps CPU, RAM and IOPS on constrained clusters. No-op elsewhere.
pub async fn enforce_limits(
    backend: &dyn CloudBackend,
    settings: &Settings,
    plan: &PostDeployPlan,
) -> Result<()> {
    let kind = backend
        .cluster_kind(plan.host_id)
        .await
        .with_context(|| format!("classifying host {}", plan.host_id))?;
    if kind != ClusterKind::Constrained {
        tracing::debug!(vm_id = plan.vm_id, host_id = plan.host_id, "standard cluster; no limits applied");
        return Ok(());
    }
    let cpu = plan.cpu as f64 * settings.cpu_limits_coef;
    let applied = backend
        .set_resource_limits(plan.vm_id, cpu, plan.ram_mb, plan.iops)
        .await
        .with_context(|| format!("setting limits on VM {}", plan.vm_id))?;
    if applied {
        tracing::info!(vm_id = plan.vm_id, cpu, ram_mb = plan.ram_mb, iops = plan.iops, "resource limits applied");
    } else {
        tracing::warn!(vm_id = plan.vm_id, "backend does not support resource limits");
    }
    Ok(())
}

/// Schedules exactly one suspend action at now + `delay`.
pub async fn schedule_trial(backend: &dyn CloudBackend, vm_id: i64, delay: Duration) -> Result<()> {
    let at = chrono::Utc::now().timestamp() + delay.as_secs() as i64;
    backend
        .schedule_deferred_action(vm_id, "suspend", at)
        .await
        .with_context(|| format!("scheduling trial suspend for VM {}", vm_id))?;
    tracing::info!(vm_id, at, "trial suspend scheduled");
    Ok(())
}

/// Retries the bootstrap trigger until it succeeds, attempts run out, or the task is cancelled.
pub async fn bootstrap_loop(
    backend: &dyn CloudBackend,
    trigger: &dyn BootstrapTrigger,
    settings: &Settings,
    vm_id: i64,
    service: &str,
    token: &CancellationToken,
) -> Result<()> {
    pause(settings.bootstrap_initial_delay, token).await?;

    let mut last_error = anyhow!("no attempt made");
    for attempt in 1..=settings.bootstrap_max_attempts {
        let host = match backend.read_vm(vm_id).await {
            Ok(vm) => vm.ip().map(str::to_string),
            Err(e) => {
                last_error = e.context(format!("reading VM {}", vm_id));
                None
            }
        };
        if let Some(host) = host {
            match trigger.install(&host, settings.guest_ssh_port, service).await {
                Ok(()) => {
                    tracing::info!(vm_id, attempt, host = %host, service, "bootstrap completed");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(vm_id, attempt, error = %e, "bootstrap attempt failed");
                    last_error = e;
                }
            }
        } else {
            tracing::debug!(vm_id, attempt, "VM has no address yet");
        }
        if attempt < settings.bootstrap_max_attempts {
            pause(settings.bootstrap_backoff, token).await?;
        }
    }
    Err(last_error.context(format!(
        "bootstrap of VM {} gave up after {} attempts",
        vm_id, settings.bootstrap_max_attempts
    )))
}

async fn pause(delay: Duration, token: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(anyhow!("cancelled")),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provisio_common::{Nic, STATE_HOLD};
    use provisio_providers::mock::{MockBackend, MockBootstrap};

    fn fast_settings() -> Settings {
        Settings {
            bootstrap_initial_delay: Duration::from_secs(1),
            bootstrap_backoff: Duration::from_secs(1),
            bootstrap_max_attempts: 3,
            ..Settings::default()
        }
    }

    fn plan(vm_id: i64) -> PostDeployPlan {
        PostDeployPlan {
            vm_id,
            host_id: 4,
            deploy_to: None,
            cpu: 2,
            ram_mb: 2048,
            iops: 300,
            trial: None,
            bootstrap: None,
        }
    }

    #[tokio::test]
    async fn limits_only_on_constrained_clusters() {
        let backend = MockBackend::new();
        backend.add_vm(9, 1, STATE_RUNNING, Nic::default());
        let settings = Settings {
            cpu_limits_coef: 1.5,
            ..Settings::default()
        };

        enforce_limits(&backend, &settings, &plan(9)).await.unwrap();
        assert_eq!(backend.call_count("set_resource_limits"), 0);

        backend.set_cluster_kind(4, ClusterKind::Constrained);
        enforce_limits(&backend, &settings, &plan(9)).await.unwrap();
        assert_eq!(backend.vm(9).unwrap().limits, Some((3.0, 2048, 300)));
    }

    #[tokio::test]
    async fn trial_schedules_one_suspend() {
        let backend = MockBackend::new();
        backend.add_vm(9, 1, STATE_RUNNING, Nic::default());
        let before = chrono::Utc::now().timestamp();
        schedule_trial(&backend, 9, Duration::from_secs(600)).await.unwrap();
        let actions = backend.vm(9).unwrap().scheduled_actions;
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].0, "suspend");
        assert!(actions[0].1 >= before + 600 && actions[0].1 <= before + 605);
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_retries_until_success() {
        let backend = MockBackend::new();
        backend.add_vm(
            9,
            1,
            STATE_RUNNING,
            Nic {
                ip: "10.0.0.9".into(),
                ..Nic::default()
            },
        );
        let trigger = MockBootstrap::failing(2);
        bootstrap_loop(&backend, &trigger, &fast_settings(), 9, "nginx", &CancellationToken::new())
            .await
            .unwrap();
        let calls = trigger.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2], ("10.0.0.9".to_string(), 22, "nginx".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_gives_up_after_max_attempts() {
        let backend = MockBackend::new();
        backend.add_vm(
            9,
            1,
            STATE_RUNNING,
            Nic {
                ip: "10.0.0.9".into(),
                ..Nic::default()
            },
        );
        let trigger = MockBootstrap::failing(10);
        let err = bootstrap_loop(&backend, &trigger, &fast_settings(), 9, "base", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("gave up after 3 attempts"));
        assert_eq!(trigger.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_stops_when_cancelled() {
        let backend = MockBackend::new();
        backend.add_vm(9, 1, STATE_HOLD, Nic::default());
        let trigger = MockBootstrap::new();
        let token = CancellationToken::new();
        token.cancel();
        assert!(bootstrap_loop(&backend, &trigger, &fast_settings(), 9, "base", &token)
            .await
            .is_err());
        assert!(trigger.calls().is_empty());
    }

    #[test]
    fn trial_delay_override_wins() {
        let settings = Settings::default();
        let mut req = ProvisioningRequest::default();
        req.flags.trial = true;
        assert_eq!(
            PostDeployPlan::from_request(&req, 1, &settings).trial,
            Some(settings.trial_suspend_delay)
        );
        req.trial_suspend_delay = Some(Duration::from_secs(30));
        assert_eq!(
            PostDeployPlan::from_request(&req, 1, &settings).trial,
            Some(Duration::from_secs(30))
        );
        req.flags.trial = false;
        assert_eq!(PostDeployPlan::from_request(&req, 1, &settings).trial, None);
    }
}
