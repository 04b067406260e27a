// Library entry point for the binary and the integration tests

pub mod accounts;
pub mod app;
pub mod commands;
pub mod context;
pub mod error;
pub mod logger;
pub mod poller;
pub mod post_deploy;
pub mod provider_manager;
pub mod request;
pub mod routes;
pub mod services;
pub mod settings;
pub mod stats;
pub mod tasks;
pub mod template;
pub mod trace;

// Re-export commonly used types
pub use app::AppState;
pub use error::{ErrorKind, ProvisionError};
pub use request::ProvisioningRequest;
pub use services::{Orchestrator, ProvisioningResult};
pub use settings::Settings;
