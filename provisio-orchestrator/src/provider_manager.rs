use crate::settings::{BackendKind, Settings};
use anyhow::{bail, Result};
use provisio_providers::bootstrap::{DisabledBootstrap, HttpBootstrapTrigger};
use provisio_providers::{BootstrapTrigger, CloudBackend};
use std::sync::Arc;

pub struct ProviderManager;

impl ProviderManager {
    pub fn backend(settings: &Settings) -> Result<Arc<dyn CloudBackend>> {
        match settings.provider {
            #[cfg(feature = "provider-mock")]
            BackendKind::Mock => Ok(Arc::new(
                provisio_providers::mock::MockBackend::with_demo_catalog(),
            )),
            #[cfg(feature = "provider-opennebula")]
            BackendKind::OpenNebula => {
                if settings.one_password.is_empty() {
                    bail!("ONE_PASSWORD (or ONE_PASSWORD_FILE) is required for the opennebula provider");
                }
                Ok(Arc::new(provisio_providers::opennebula::OpenNebulaBackend::new(
                    &settings.one_endpoint,
                    &settings.one_username,
                    &settings.one_password,
                )?))
            }
            #[allow(unreachable_patterns)]
            other => bail!("provider {:?} is not compiled in", other),
        }
    }

    /// HTTP trigger when an endpoint is configured, otherwise a trigger that always fails.
    pub fn bootstrap(settings: &Settings) -> Result<Arc<dyn BootstrapTrigger>> {
        match &settings.bootstrap_endpoint {
            Some(endpoint) => Ok(Arc::new(HttpBootstrapTrigger::new(
                endpoint,
                settings.bootstrap_token.clone(),
            )?)),
            None => Ok(Arc::new(DisabledBootstrap)),
        }
    }
}
