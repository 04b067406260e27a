use serde::Serialize;
use thiserror::Error;

/// Failure classes surfaced to callers in the `error` field of a failed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    InvalidRequest,
    AccountAllocationError,
    TemplateLoadError,
    TransientInstantiationConflict,
    UnhandledError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::AccountAllocationError => "AccountAllocationError",
            ErrorKind::TemplateLoadError => "TemplateLoadError",
            ErrorKind::TransientInstantiationConflict => "TransientInstantiationConflict",
            ErrorKind::UnhandledError => "UnhandledError",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("account allocation failed: {0}")]
    AccountAllocation(#[source] anyhow::Error),

    #[error("template load failed: {0}")]
    TemplateLoad(String),

    /// Address lease still conflicting after the single retry.
    #[error("address conflict persisted after retry: {0}")]
    AddressConflict(#[source] anyhow::Error),

    #[error("template instantiate failed: {0}")]
    Instantiation(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ProvisionError::AccountAllocation(_) => ErrorKind::AccountAllocationError,
            ProvisionError::TemplateLoad(_) => ErrorKind::TemplateLoadError,
            ProvisionError::AddressConflict(_) => ErrorKind::TransientInstantiationConflict,
            ProvisionError::Instantiation(_) | ProvisionError::Other(_) => {
                ErrorKind::UnhandledError
            }
        }
    }
}
