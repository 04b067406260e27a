use crate::error::ProvisionError;
use provisio_common::VmTemplate;
use provisio_providers::CloudBackend;

/// Loads a template and exposes its capacity mode and OS family.
///
/// Id 0 is never a valid template and is rejected without a backend call.
pub async fn resolve(backend: &dyn CloudBackend, template_id: i64) -> Result<VmTemplate, ProvisionError> {
    if template_id <= 0 {
        return Err(ProvisionError::TemplateLoad(format!(
            "template id {} is not valid",
            template_id
        )));
    }
    let template = backend
        .load_template(template_id)
        .await
        .map_err(|e| ProvisionError::TemplateLoad(format!("template {}: {}", template_id, e)))?;
    tracing::debug!(
        template_id,
        capacity = template.capacity_mode().as_str(),
        windows = template.is_windows(),
        "template resolved"
    );
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use provisio_common::{CapacityMode, OsFamily};
    use provisio_providers::mock::MockBackend;

    #[tokio::test]
    async fn zero_id_fails_without_backend_call() {
        let backend = MockBackend::new();
        let err = resolve(&backend, 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TemplateLoadError);
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_template_is_a_load_error() {
        let backend = MockBackend::new();
        let err = resolve(&backend, 77).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TemplateLoadError);
        assert_eq!(backend.call_count("load_template"), 1);
    }

    #[tokio::test]
    async fn exposes_capacity_and_os() {
        let backend = MockBackend::new();
        backend.add_template(3, CapacityMode::Variable, OsFamily::Windows, Some(12));
        let t = resolve(&backend, 3).await.unwrap();
        assert_eq!(t.capacity_mode(), CapacityMode::Variable);
        assert!(t.is_windows());
    }
}
