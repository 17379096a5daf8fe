use std::{future::Future, sync::Mutex, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// Tracks background tasks so nothing outlives its owner. Every long-running
// task in the engine is spawned through one of these; the owner cancels and
// awaits the lot on shutdown before releasing any shared state.
pub struct TaskSupervisor {

    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,

    cancel: Mutex<CancellationToken>,

}

impl TaskSupervisor {

    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    // Token the spawned future should select on at suspension points.
    pub fn token(&self) -> CancellationToken {
        self.cancel.lock().expect("cancel token poisoned").child_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.lock().expect("cancel token poisoned").is_cancelled()
    }

    // Arms the supervisor for a fresh generation of tasks after a
    // cancel_all/await_all cycle.
    pub fn reset(&self) {
        let mut cancel = self.cancel.lock().expect("cancel token poisoned");
        if cancel.is_cancelled() {
            *cancel = CancellationToken::new();
        }
    }

    pub fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut tasks = self.tasks.lock().expect("task list poisoned");
        // Reap finished tasks opportunistically.
        tasks.retain(|(_, h)| !h.is_finished());
        tasks.push((name.to_string(), handle));
    }

    pub fn cancel_all(&self) {
        self.cancel.lock().expect("cancel token poisoned").cancel();
    }

    pub fn task_count(&self) -> usize {
        let mut tasks = self.tasks.lock().expect("task list poisoned");
        tasks.retain(|(_, h)| !h.is_finished());
        tasks.len()
    }

    // Waits for every tracked task, treating cancellation as a normal exit.
    // Panics are logged, never propagated into the caller.
    pub async fn await_all(&self, timeout: Duration) {

        let tasks: Vec<(String, JoinHandle<()>)> =
            std::mem::take(&mut *self.tasks.lock().expect("task list poisoned"));
        if tasks.is_empty() {
            return;
        }

        let join = async {
            for (name, handle) in tasks {
                match handle.await {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => tracing::error!("background task {} panicked: {}", name, e),
                }
            }
        };

        if tokio::time::timeout(timeout, join).await.is_err() {
            tracing::warn!("background tasks still running after {:?} shutdown grace", timeout);
        }
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self { Self::new() }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        // Best effort; await_all is the orderly path.
        self.cancel.lock().expect("cancel token poisoned").cancel();
        for (_, handle) in self.tasks.lock().expect("task list poisoned").drain(..) {
            handle.abort();
        }
    }
}

// Sleep that wakes promptly on cancellation. Long backoffs throughout the
// engine go through this so shutdown is never stuck behind a timer; returns
// false if cancelled before the full duration elapsed.
pub async fn sleep_cancellable(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
