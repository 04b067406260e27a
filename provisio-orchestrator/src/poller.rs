use provisio_common::state_matches;
use provisio_providers::CloudBackend;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("VM {vm_id} did not reach {target} within {waited:?} (last state: {last_state}, last error: {last_error})")]
    Timeout {
        vm_id: i64,
        target: String,
        waited: Duration,
        last_state: String,
        last_error: String,
    },
    #[error("wait for VM {vm_id} cancelled")]
    Cancelled { vm_id: i64 },
}

/// Polls a VM's lifecycle state until it matches `target` (case-insensitive).
///
/// Read errors are logged and retried until the deadline. Returns the observed
/// state on success.
pub async fn await_state(
    backend: &dyn CloudBackend,
    vm_id: i64,
    target: &str,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<String, PollError> {
    let started = Instant::now();
    let deadline = started + timeout;
    let mut last_state = String::from("unknown");
    let mut last_error = String::from("none");

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Cancelled { vm_id }),
            read = tokio::time::timeout_at(deadline, backend.read_lifecycle_state(vm_id)) => read,
        };
        match read {
            Ok(Ok(state)) if state_matches(&state, target) => {
                tracing::debug!(vm_id, state = %state, waited_ms = started.elapsed().as_millis() as u64, "target state reached");
                return Ok(state);
            }
            Ok(Ok(state)) => last_state = state,
            Ok(Err(e)) => {
                tracing::warn!(vm_id, error = %e, "state read failed");
                last_error = e.to_string();
            }
            Err(_) => last_error = "state read timed out".to_string(),
        }

        if Instant::now() >= deadline {
            return Err(PollError::Timeout {
                vm_id,
                target: target.to_string(),
                waited: started.elapsed(),
                last_state,
                last_error,
            });
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Cancelled { vm_id }),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
