//! In-process task bus. A controller's collateral phase submits a task
//! by spawning it onto the Tokio runtime and registering its
//! [`CancellationToken`] under the task's id; an abort request looks the
//! token up and cancels it. Workers cooperatively check the token while
//! polling the container runtime and stop early if it's cancelled.
//!
//! This plays the role Celery + Redis play in the system this was
//! modeled on: "revoke a task before it starts" falls out of the
//! dispatcher's `WHERE status = 'PENDING'` claim guard never matching a
//! row that was moved to `ABORTED` first, and "kill a running task"
//! falls out of cancelling its token.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Default)]
pub struct TaskRegistry {
    tokens: DashMap<Uuid, CancellationToken>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new task, returning the token its worker should
    /// select on.
    pub fn register(&self, task_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.insert(task_id, token.clone());
        token
    }

    /// Cancels a task's token if it's still registered. Returns `true`
    /// if a live registration was found and cancelled.
    pub fn abort(&self, task_id: Uuid) -> bool {
        if let Some(token) = self.tokens.get(&task_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Drops the registration once a task reaches a terminal state, so
    /// the map doesn't grow unbounded.
    pub fn unregister(&self, task_id: Uuid) {
        self.tokens.remove(&task_id);
    }

    pub fn is_registered(&self, task_id: Uuid) -> bool {
        self.tokens.contains_key(&task_id)
    }
}
