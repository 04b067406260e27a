use crate::request::ProvisioningRequest;
use crate::services::Orchestrator;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use provisio_common::bus::CommandType;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

pub type CommandHandler =
    Arc<dyn Fn(Arc<Orchestrator>, Map<String, Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid command name '{0}' (lowercase letters, digits and '_' only)")]
    InvalidName(String),
    #[error("command '{0}' is already registered")]
    Duplicate(String),
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("command '{name}' failed: {source:#}")]
    Failed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Named operations callable through the command surface.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    handlers: HashMap<String, CommandHandler>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in command.
    pub fn with_defaults() -> Result<Self, CommandError> {
        let mut registry = Self::new();
        for command in CommandType::ALL {
            match command {
                CommandType::Ping => registry.register(command.as_str(), |orch, params| async move {
                    orch.stats().record("ping");
                    anyhow::Ok(ping(&params))
                })?,
                CommandType::CreateVm => registry.register(command.as_str(), |orch, params| async move {
                    let req = ProvisioningRequest::from_map(&params);
                    let result = orch.create_vm(req).await;
                    anyhow::Ok(serde_json::to_value(result)?)
                })?,
                CommandType::ReinstallVm => registry.register(command.as_str(), |orch, params| async move {
                    let req = ProvisioningRequest::from_map(&params);
                    let result = orch.reinstall_vm(req).await;
                    anyhow::Ok(serde_json::to_value(result)?)
                })?,
                CommandType::Statistics => registry.register(command.as_str(), |orch, params| async move {
                    anyhow::Ok(statistics(&orch, &params))
                })?,
                CommandType::Tasks => registry.register(command.as_str(), |orch, _params| async move {
                    anyhow::Ok(serde_json::to_value(orch.tasks().list())?)
                })?,
            }
        }
        Ok(registry)
    }

    pub fn register<F, Fut>(&mut self, name: &str, handler: F) -> Result<(), CommandError>
    where
        F: Fn(Arc<Orchestrator>, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        if !valid_name(name) {
            return Err(CommandError::InvalidName(name.to_string()));
        }
        if self.handlers.contains_key(name) {
            return Err(CommandError::Duplicate(name.to_string()));
        }
        self.handlers.insert(
            name.to_string(),
            Arc::new(move |orch, params| handler(orch, params).boxed()),
        );
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn dispatch(
        &self,
        orch: Arc<Orchestrator>,
        name: &str,
        params: Map<String, Value>,
    ) -> Result<Value, CommandError> {
        let handler = self
            .handlers
            .get(name)
            .cloned()
            .ok_or_else(|| CommandError::Unknown(name.to_string()))?;
        tracing::debug!(command = name, "dispatching command");
        handler(orch, params)
            .await
            .map_err(|source| CommandError::Failed {
                name: name.to_string(),
                source,
            })
    }
}

/// Connectivity probe: "PING" answers "PONG", anything else "DONE".
fn ping(params: &Map<String, Value>) -> Value {
    match params.get("msg").and_then(Value::as_str) {
        Some("PING") => json!("PONG"),
        _ => json!("DONE"),
    }
}

fn statistics(orch: &Orchestrator, params: &Map<String, Value>) -> Value {
    match params.get("method").and_then(Value::as_str) {
        Some(method) => {
            let mut out = Map::new();
            out.insert(method.to_string(), json!(orch.stats().method(method)));
            Value::Object(out)
        }
        None => json!(orch.stats().snapshot()),
    }
}
