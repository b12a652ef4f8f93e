//! Session manager: owns the in-flight transfer workers.
//!
//! One task is spawned per transfer. Each task carries a completion guard
//! that deregisters it and posts exactly one [`TaskCompletion`] when the task
//! ends, including when the worker panics or is aborted. Registry mutations
//! are serialised by a single mutex that is never held across an await.

use crate::error::{Error, Result};
use crate::event::{Event, EventSender};
use crate::session::SessionId;
use crate::worker::TransferSummary;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use wisp_transport::SharedBytestream;

/// Handle identifying one transfer task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Posted once when a transfer task ends
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    /// Task that finished
    pub task: TaskId,
    /// Session the task belonged to
    pub sid: SessionId,
    /// Worker outcome
    pub result: Result<TransferSummary>,
}

struct TransferTask {
    sid: SessionId,
    handle: Option<JoinHandle<()>>,
    transport: SharedBytestream,
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<TaskId, TransferTask>,
    /// Handles of deregistered tasks that may still be running
    detached: Vec<JoinHandle<()>>,
    shutting_down: bool,
    next_id: u64,
}

impl Registry {
    fn remove(&mut self, task: TaskId) -> bool {
        self.detached.retain(|handle| !handle.is_finished());
        match self.tasks.remove(&task) {
            Some(entry) => {
                if let Some(handle) = entry.handle {
                    self.detached.push(handle);
                }
                true
            }
            None => false,
        }
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deregisters the task and reports its completion when dropped
struct CompletionGuard {
    task: TaskId,
    sid: SessionId,
    manager: SessionManager,
    result: Option<Result<TransferSummary>>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.manager.remove_task(self.task);

        let result = self
            .result
            .take()
            .unwrap_or_else(|| Err(Error::Internal(Cow::Borrowed("worker ended without a result"))));

        if let Err(e) = &result {
            tracing::debug!(task = %self.task, sid = %self.sid.short(), error = %e, "Transfer task failed");
        }

        let _ = self.manager.events.send(Event::TaskFinished(TaskCompletion {
            task: self.task,
            sid: self.sid.clone(),
            result,
        }));
    }
}

/// Registry of transfer tasks
#[derive(Clone)]
pub struct SessionManager {
    registry: Arc<Mutex<Registry>>,
    events: EventSender,
}

impl SessionManager {
    /// Create a manager that posts completions to `events`
    #[must_use]
    pub fn new(events: EventSender) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            events,
        }
    }

    /// Spawn `work` as the transfer task for `sid` over `transport`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ShuttingDown` once [`shutdown`](Self::shutdown) has
    /// begun, or `Error::InvalidState` if `sid` already has a task
    pub fn create_task<F>(
        &self,
        sid: SessionId,
        transport: SharedBytestream,
        work: F,
    ) -> Result<TaskId>
    where
        F: Future<Output = Result<TransferSummary>> + Send + 'static,
    {
        let mut registry = lock(&self.registry);

        if registry.shutting_down {
            return Err(Error::ShuttingDown);
        }
        if registry.tasks.values().any(|task| task.sid == sid) {
            return Err(Error::InvalidState(Cow::Owned(format!(
                "session {} already has a transfer task",
                sid.short()
            ))));
        }

        registry.next_id += 1;
        let task = TaskId(registry.next_id);

        let mut guard = CompletionGuard {
            task,
            sid: sid.clone(),
            manager: self.clone(),
            result: None,
        };

        // The guard blocks on the registry lock, so the entry below is
        // inserted before any completion can remove it.
        let handle = tokio::spawn(async move {
            let result = work.await;
            guard.result = Some(result);
        });

        tracing::debug!(task = %task, sid = %sid.short(), "Transfer task created");

        registry.tasks.insert(
            task,
            TransferTask {
                sid,
                handle: Some(handle),
                transport,
            },
        );

        Ok(task)
    }

    /// Deregister `task`. Returns false if it was already gone.
    ///
    /// A task that is still running stays joinable by
    /// [`shutdown`](Self::shutdown).
    pub(crate) fn remove_task(&self, task: TaskId) -> bool {
        lock(&self.registry).remove(task)
    }

    /// Transport of the task running for `sid`
    #[must_use]
    pub fn transport(&self, sid: &SessionId) -> Option<SharedBytestream> {
        lock(&self.registry)
            .tasks
            .values()
            .find(|task| &task.sid == sid)
            .map(|task| Arc::clone(&task.transport))
    }

    /// Transports of every running task
    #[must_use]
    pub fn transports(&self) -> Vec<SharedBytestream> {
        lock(&self.registry)
            .tasks
            .values()
            .map(|task| Arc::clone(&task.transport))
            .collect()
    }

    /// Number of registered tasks
    #[must_use]
    pub fn task_count(&self) -> usize {
        lock(&self.registry).tasks.len()
    }

    /// Whether `sid` has a registered task
    #[must_use]
    pub fn has_task(&self, sid: &SessionId) -> bool {
        lock(&self.registry).tasks.values().any(|task| &task.sid == sid)
    }

    /// Whether shutdown has begun
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        lock(&self.registry).shutting_down
    }

    /// Refuse new tasks and wait for every outstanding task to finish,
    /// including tasks already deregistered but still running.
    ///
    /// Transports are not closed here; the driver closes them before
    /// calling this during teardown.
    pub async fn shutdown(&self) {
        let (handles, detached) = {
            let mut registry = lock(&self.registry);
            registry.shutting_down = true;
            let handles: Vec<(TaskId, JoinHandle<()>)> = registry
                .tasks
                .iter_mut()
                .filter_map(|(id, task)| task.handle.take().map(|handle| (*id, handle)))
                .collect();
            (handles, std::mem::take(&mut registry.detached))
        };

        if !handles.is_empty() {
            tracing::info!(tasks = handles.len(), "Waiting for transfer tasks");
        }

        for (task, handle) in handles {
            if let Err(e) = handle.await {
                tracing::warn!(task = %task, error = %e, "Transfer task panicked");
            }
        }
        for handle in detached {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Transfer task panicked");
            }
        }
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = lock(&self.registry);
        f.debug_struct("SessionManager")
            .field("tasks", &registry.tasks.len())
            .field("shutting_down", &registry.shutting_down)
            .finish()
    }
}
