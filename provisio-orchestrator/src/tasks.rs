use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// Finished tasks kept for inspection before the oldest are pruned.
const FINISHED_RETENTION: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: Uuid,
    pub kind: String,
    pub vm_id: i64,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

struct Entry {
    info: TaskInfo,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    root: CancellationToken,
    tasks: Mutex<HashMap<Uuid, Entry>>,
}

/// Registry of background jobs spawned after a workflow returns.
///
/// Every task gets a child of the pool's root token; `shutdown` cancels the root
/// and waits for all tasks to observe it. A failing or panicking task only marks
/// its own entry.
#[derive(Clone)]
pub struct TaskPool {
    inner: Arc<Inner>,
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                root: CancellationToken::new(),
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Token cancelled on shutdown; for waits that run inside a request.
    pub fn child_token(&self) -> CancellationToken {
        self.inner.root.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.root.is_cancelled()
    }

    pub fn spawn<F, Fut>(&self, kind: &str, vm_id: i64, job: F) -> Uuid
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let token = self.inner.root.child_token();
        let work = job(token.clone());

        {
            let mut tasks = self.inner.tasks.lock();
            prune_finished(&mut tasks);
            tasks.insert(
                id,
                Entry {
                    info: TaskInfo {
                        id,
                        kind: kind.to_string(),
                        vm_id,
                        status: TaskStatus::Running,
                        started_at: Utc::now(),
                        finished_at: None,
                        error: None,
                    },
                    token: token.clone(),
                    handle: None,
                },
            );
        }

        let inner = self.inner.clone();
        let kind_owned = kind.to_string();
        let handle = tokio::spawn(async move {
            let worker = tokio::spawn(work);
            let abort = worker.abort_handle();
            let (status, error) = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    abort.abort();
                    (TaskStatus::Cancelled, None)
                }
                joined = worker => match joined {
                    Ok(Ok(())) => (TaskStatus::Succeeded, None),
                    Ok(Err(e)) => (TaskStatus::Failed, Some(format!("{:#}", e))),
                    Err(e) if e.is_cancelled() => (TaskStatus::Cancelled, None),
                    Err(e) => (TaskStatus::Failed, Some(format!("task panicked: {}", e))),
                },
            };
            match &error {
                Some(err) => tracing::warn!(task_id = %id, kind = %kind_owned, vm_id, error = %err, "background task failed"),
                None => tracing::info!(task_id = %id, kind = %kind_owned, vm_id, status = ?status, "background task finished"),
            }
            if let Some(entry) = inner.tasks.lock().get_mut(&id) {
                entry.info.status = status;
                entry.info.error = error;
                entry.info.finished_at = Some(Utc::now());
            }
        });

        if let Some(entry) = self.inner.tasks.lock().get_mut(&id) {
            entry.handle = Some(handle);
        }
        id
    }

    pub fn get(&self, id: Uuid) -> Option<TaskInfo> {
        self.inner.tasks.lock().get(&id).map(|e| e.info.clone())
    }

    /// All known tasks, oldest first.
    pub fn list(&self) -> Vec<TaskInfo> {
        let mut all: Vec<TaskInfo> = self
            .inner
            .tasks
            .lock()
            .values()
            .map(|e| e.info.clone())
            .collect();
        all.sort_by_key(|t| t.started_at);
        all
    }

    pub fn running(&self) -> usize {
        self.inner
            .tasks
            .lock()
            .values()
            .filter(|e| e.info.status == TaskStatus::Running)
            .count()
    }

    /// Cancels one running task. Returns false if it is unknown or already finished.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.inner.tasks.lock().get(&id) {
            Some(entry) if entry.info.status == TaskStatus::Running => {
                entry.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Waits until every task (including ones spawned while waiting) has finished.
    pub async fn join_all(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = self
                .inner
                .tasks
                .lock()
                .values_mut()
                .filter_map(|e| e.handle.take())
                .collect();
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    /// Cancels every task and waits up to `grace` for them to wind down.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.root.cancel();
        if tokio::time::timeout(grace, self.join_all()).await.is_err() {
            tracing::warn!(running = self.running(), "background tasks still running after grace period");
        }
    }
}

fn prune_finished(tasks: &mut HashMap<Uuid, Entry>) {
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = tasks
        .values()
        .filter(|e| e.info.status != TaskStatus::Running)
        .map(|e| (e.info.finished_at.unwrap_or(e.info.started_at), e.info.id))
        .collect();
    if finished.len() <= FINISHED_RETENTION {
        return;
    }
    finished.sort();
    let excess = finished.len() - FINISHED_RETENTION;
    for (_, id) in finished.into_iter().take(excess) {
        tasks.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_success_and_failure() {
        let pool = TaskPool::new();
        let ok = pool.spawn("limits", 1, |_| async { Ok(()) });
        let bad = pool.spawn("trial", 1, |_| async { Err(anyhow::anyhow!("backend down")) });
        pool.join_all().await;

        assert_eq!(pool.get(ok).unwrap().status, TaskStatus::Succeeded);
        let failed = pool.get(bad).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("backend down"));
        assert!(failed.finished_at.is_some());
    }

    #[tokio::test]
    async fn panic_is_isolated_to_its_task() {
        let pool = TaskPool::new();
        let boom = pool.spawn("bootstrap", 1, |_| async { panic!("boom") });
        let fine = pool.spawn("trial", 1, |_| async { Ok(()) });
        pool.join_all().await;
        assert_eq!(pool.get(boom).unwrap().status, TaskStatus::Failed);
        assert_eq!(pool.get(fine).unwrap().status, TaskStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_a_running_task() {
        let pool = TaskPool::new();
        let id = pool.spawn("bootstrap", 3, |_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        assert!(pool.cancel(id));
        pool.join_all().await;
        assert_eq!(pool.get(id).unwrap().status, TaskStatus::Cancelled);
        assert!(!pool.cancel(id));
        assert!(!pool.cancel(Uuid::new_v4()));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_everything() {
        let pool = TaskPool::new();
        for vm in 0..3 {
            pool.spawn("post_deploy", vm, |token| async move {
                token.cancelled().await;
                Ok(())
            });
        }
        assert_eq!(pool.running(), 3);
        pool.shutdown(Duration::from_secs(5)).await;
        assert_eq!(pool.running(), 0);
        assert!(pool.is_shutting_down());
        assert!(pool.list().iter().all(|t| t.status == TaskStatus::Cancelled));
    }
}
