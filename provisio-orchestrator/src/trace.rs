use std::fmt::Display;
use std::future::Future;
use std::time::Instant;
use tracing::Instrument;

/// Ordered checkpoints of one workflow call. Returned to the caller on failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceLog {
    steps: Vec<String>,
}

impl TraceLog {
    pub fn new(method: &str) -> Self {
        Self {
            steps: vec![format!("{} called", method)],
        }
    }

    pub fn checkpoint(&mut self, step: impl Into<String>) {
        self.steps.push(step.into());
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<String> {
        self.steps
    }
}

/// Runs one named workflow step: records the checkpoint and wraps the future in a
/// `provision_step` span with start/complete events.
pub async fn step<T, E, F>(trace: &mut TraceLog, name: &'static str, fut: F) -> Result<T, E>
where
    E: Display,
    F: Future<Output = Result<T, E>>,
{
    trace.checkpoint(name);
    let span = tracing::info_span!("provision_step", step = name);
    let started = Instant::now();
    async move {
        tracing::debug!("step started");
        let res = fut.await;
        let duration_ms = started.elapsed().as_millis() as u64;
        match &res {
            Ok(_) => tracing::debug!(status = "success", duration_ms, "step completed"),
            Err(e) => tracing::warn!(status = "failed", duration_ms, error = %e, "step completed"),
        }
        res
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn steps_are_recorded_in_order() {
        let mut trace = TraceLog::new("create_vm");
        let ok: Result<u8, String> = step(&mut trace, "Checking params", async { Ok(1) }).await;
        assert_eq!(ok, Ok(1));
        let failed: Result<u8, String> =
            step(&mut trace, "Creating new user", async { Err("taken".to_string()) }).await;
        assert!(failed.is_err());
        assert_eq!(
            trace.into_steps(),
            vec!["create_vm called", "Checking params", "Creating new user"]
        );
    }
}
