//! Process-wide index of live runners, keyed by task.
//!
//! The registry is an explicit dependency: construct one with
//! [`RunnerRegistry::new`] and share the `Arc`. Tests build their own.

use std::collections::HashMap;
use std::sync::Arc;

use cnap_core::{RunnerStatus, TaskId};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{ExecutionBackend, RunnerConfig};
use crate::error::RunnerError;
use crate::invoker::ModelInvoker;
use crate::observer::StatusCallback;
use crate::runner::{AgentInfo, Runner};

pub struct RunnerRegistry {
    runners: RwLock<HashMap<TaskId, Arc<Runner>>>,
    invoker: Arc<dyn ModelInvoker>,
}

impl RunnerRegistry {
    /// Create an empty registry whose runners share `invoker`.
    pub fn new(invoker: Arc<dyn ModelInvoker>) -> Arc<Self> {
        Arc::new(Self {
            runners: RwLock::new(HashMap::new()),
            invoker,
        })
    }

    pub fn invoker(&self) -> Arc<dyn ModelInvoker> {
        Arc::clone(&self.invoker)
    }

    /// Create and register a backend-less runner for one-shot invocation.
    ///
    /// Fails with [`RunnerError::DuplicateRunner`] while a non-terminal runner
    /// exists for the task; a terminal one is replaced.
    pub async fn create_runner(
        &self,
        task_id: TaskId,
        agent: AgentInfo,
        callback: Option<Arc<dyn StatusCallback>>,
    ) -> Result<Arc<Runner>, RunnerError> {
        let runner = Runner::new(task_id, agent, self.invoker()).with_callback(callback);
        self.insert(runner).await
    }

    /// Create, register, and start a runner driving `backend`.
    ///
    /// The runner is registered before the backend starts. If start fails the
    /// runner stays registered in `Failed` (or `Canceled`) so callers can
    /// inspect it, and the start error is returned.
    pub async fn create_runner_with_backend(
        &self,
        task_id: TaskId,
        agent: AgentInfo,
        backend: Box<dyn ExecutionBackend>,
        config: &RunnerConfig,
        callback: Option<Arc<dyn StatusCallback>>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Runner>, RunnerError> {
        let runner = Runner::new(task_id, agent, self.invoker())
            .with_backend(backend)
            .with_callback(callback);
        let runner = self.insert(runner).await?;

        // Start outside the map lock; a slow backend must not block lookups.
        runner.start(config, cancel).await?;
        Ok(runner)
    }

    async fn insert(&self, runner: Runner) -> Result<Arc<Runner>, RunnerError> {
        let task_id = runner.task_id().clone();
        let mut runners = self.runners.write().await;

        if let Some(existing) = runners.get(&task_id) {
            let status = existing.status();
            if !status.is_terminal() {
                warn!(task_id = %task_id, status = %status, "Runner already registered");
                return Err(RunnerError::DuplicateRunner(task_id));
            }
            debug!(task_id = %task_id, status = %status, "Replacing finished runner");
        }

        let runner = Arc::new(runner);
        runners.insert(task_id.clone(), Arc::clone(&runner));
        info!(
            task_id = %task_id,
            agent = %runner.agent().agent_id,
            backend = runner.has_backend(),
            total = runners.len(),
            "Runner registered"
        );
        Ok(runner)
    }

    pub async fn get_runner(&self, task_id: &TaskId) -> Option<Arc<Runner>> {
        self.runners.read().await.get(task_id).cloned()
    }

    /// Snapshot of registered runners, ordered by task ID.
    pub async fn list_runners(&self) -> Vec<Arc<Runner>> {
        let mut runners: Vec<_> = self.runners.read().await.values().cloned().collect();
        runners.sort_by(|a, b| a.task_id().cmp(b.task_id()));
        runners
    }

    /// Task IDs and statuses of registered runners.
    pub async fn statuses(&self) -> Vec<(TaskId, RunnerStatus)> {
        self.list_runners()
            .await
            .iter()
            .map(|r| (r.task_id().clone(), r.status()))
            .collect()
    }

    /// Unregister a runner. Does not stop its backend; call
    /// [`Runner::stop`] first if that is wanted.
    pub async fn delete_runner(&self, task_id: &TaskId) -> Option<Arc<Runner>> {
        let removed = self.runners.write().await.remove(task_id);
        if removed.is_some() {
            info!(task_id = %task_id, "Runner removed");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.runners.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runners.read().await.is_empty()
    }

    /// Drop every registered runner.
    pub async fn reset(&self) {
        let mut runners = self.runners.write().await;
        let dropped = runners.len();
        *runners = HashMap::new();
        debug!(dropped, "Runner registry reset");
    }
}

#[cfg(test)]
mod tests {
    use cnap_core::{ChatMessage, RunnerStatus};

    use super::*;
    use crate::runner::InvokeRequest;
    use crate::testing::{ScriptedBackend, ScriptedInvoker};

    fn registry() -> Arc<RunnerRegistry> {
        RunnerRegistry::new(ScriptedInvoker::replying("ok"))
    }

    fn agent() -> AgentInfo {
        AgentInfo::new("a1", "test-model")
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let registry = registry();
        let runner = registry
            .create_runner(TaskId::new("t1"), agent(), None)
            .await
            .unwrap();
        assert_eq!(runner.status(), RunnerStatus::Pending);

        let found = registry.get_runner(&TaskId::new("t1")).await.unwrap();
        assert!(Arc::ptr_eq(&runner, &found));
        assert!(registry.get_runner(&TaskId::new("t2")).await.is_none());

        assert!(registry.delete_runner(&TaskId::new("t1")).await.is_some());
        assert!(registry.delete_runner(&TaskId::new("t1")).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_until_finished() {
        let registry = registry();
        let task_id = TaskId::new("t1");
        let runner = registry
            .create_runner(task_id.clone(), agent(), None)
            .await
            .unwrap();

        let err = registry
            .create_runner(task_id.clone(), agent(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::DuplicateRunner(ref id) if *id == task_id));

        runner
            .invoke(
                InvokeRequest::new("m", vec![ChatMessage::user("hi")]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(runner.status(), RunnerStatus::Completed);

        // A finished runner is replaced in place.
        let replacement = registry
            .create_runner(task_id.clone(), agent(), None)
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&runner, &replacement));
        assert_eq!(registry.len().await, 1);

        registry.delete_runner(&task_id).await;
        assert!(registry.create_runner(task_id, agent(), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_create_single_winner() {
        let registry = registry();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry
                    .create_runner(TaskId::new("shared"), agent(), None)
                    .await
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_list_is_a_snapshot() {
        let registry = registry();
        for id in ["t3", "t1", "t2"] {
            registry
                .create_runner(TaskId::new(id), agent(), None)
                .await
                .unwrap();
        }

        let listed = registry.list_runners().await;
        registry.delete_runner(&TaskId::new("t2")).await;
        registry
            .create_runner(TaskId::new("t4"), agent(), None)
            .await
            .unwrap();

        let ids: Vec<_> = listed.iter().map(|r| r.task_id().as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
        assert_eq!(registry.len().await, 3);
    }

    #[tokio::test]
    async fn test_backend_start_failure_stays_registered() {
        let registry = registry();
        let err = registry
            .create_runner_with_backend(
                TaskId::new("t1"),
                agent(),
                Box::new(ScriptedBackend::failing_start("no such image")),
                &RunnerConfig::new("missing:latest"),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::BackendStart(_)));

        let runner = registry.get_runner(&TaskId::new("t1")).await.unwrap();
        assert_eq!(runner.status(), RunnerStatus::Failed);

        // Failed counts as finished, so a retry may register again.
        let backend = ScriptedBackend::new();
        let runner = registry
            .create_runner_with_backend(
                TaskId::new("t1"),
                agent(),
                Box::new(backend.clone()),
                &RunnerConfig::new("img:latest"),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(runner.status(), RunnerStatus::Running);
        assert!(backend.started_with().is_some());
    }

    #[tokio::test]
    async fn test_reset_and_statuses() {
        let registry = registry();
        registry
            .create_runner(TaskId::new("t1"), agent(), None)
            .await
            .unwrap();
        assert_eq!(
            registry.statuses().await,
            vec![(TaskId::new("t1"), RunnerStatus::Pending)]
        );

        registry.reset().await;
        assert!(registry.is_empty().await);
    }
}
