use crate::error::ProvisionError;
use provisio_common::TenantAccount;
use provisio_providers::CloudBackend;

/// Allocates a tenant account in the default users group, plus `secondary_group` if given.
pub async fn create(
    backend: &dyn CloudBackend,
    users_group: i64,
    login: &str,
    password: &str,
    secondary_group: Option<i64>,
) -> Result<TenantAccount, ProvisionError> {
    let secondary_group = secondary_group.filter(|g| *g > 0 && *g != users_group);
    let mut groups = vec![users_group];
    groups.extend(secondary_group);

    let id = backend
        .allocate_account(login, password, &groups)
        .await
        .map_err(ProvisionError::AccountAllocation)?;
    if id <= 0 {
        return Err(ProvisionError::AccountAllocation(anyhow::anyhow!(
            "backend returned account id {} for '{}'",
            id,
            login
        )));
    }
    tracing::info!(account_id = id, login, "tenant account allocated");
    Ok(TenantAccount {
        id,
        login: login.to_string(),
        primary_group: users_group,
        secondary_group,
    })
}

/// Account handle for an already existing tenant (no backend call).
pub fn existing(account_id: i64, login: &str, users_group: i64) -> TenantAccount {
    TenantAccount {
        id: account_id,
        login: login.to_string(),
        primary_group: users_group,
        secondary_group: None,
    }
}
