//! Live environment guard
//!
//! One `LiveEnvironment` exists per created container, from the moment the
//! runtime hands back an id until removal has been issued:
//!
//! ```text
//! create ──► LiveEnvironment ──► teardown().await   (normal path)
//!                   │
//!                   └──────────► Drop               (panic / cancellation)
//! ```
//!
//! Whichever happens first issues the single removal; the other is a no-op.
//! Removal runs in its own task, so cancelling the caller mid-teardown does
//! not abort it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::runtime::{ContainerRuntime, RuntimeError};
use crate::metrics::{SANDBOX_LIVE, SANDBOX_TEARDOWN_FAILURES};

pub struct LiveEnvironment {
    id: String,
    runtime: Arc<dyn ContainerRuntime>,
    live: Arc<AtomicUsize>,
    released: bool,
}

impl LiveEnvironment {
    pub(crate) fn new(id: String, runtime: Arc<dyn ContainerRuntime>, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        SANDBOX_LIVE.inc();
        Self {
            id,
            runtime,
            live,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remove the container and wait for the runtime to confirm
    pub async fn teardown(mut self) -> Result<(), RuntimeError> {
        let task = self.release();
        match task.await {
            Ok(result) => result,
            Err(e) => Err(RuntimeError::Transport(format!("teardown task failed: {}", e))),
        }
    }

    /// Mark released and spawn the removal
    fn release(&mut self) -> tokio::task::JoinHandle<Result<(), RuntimeError>> {
        self.released = true;
        self.live.fetch_sub(1, Ordering::SeqCst);
        SANDBOX_LIVE.dec();

        let id = self.id.clone();
        let runtime = Arc::clone(&self.runtime);
        tokio::spawn(async move {
            let result = runtime.remove(&id).await;
            match &result {
                Ok(()) => debug!(container = %id, "Sandbox removed"),
                Err(e) => {
                    SANDBOX_TEARDOWN_FAILURES.inc();
                    warn!(container = %id, error = %e, "Sandbox removal failed");
                }
            }
            result
        })
    }
}

impl Drop for LiveEnvironment {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        if tokio::runtime::Handle::try_current().is_ok() {
            warn!(container = %self.id, "Sandbox dropped without teardown, removing in background");
            drop(self.release());
        } else {
            // No runtime to drive the removal; the container outlives us
            self.released = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
            SANDBOX_LIVE.dec();
            SANDBOX_TEARDOWN_FAILURES.inc();
            warn!(container = %self.id, "Sandbox leaked: dropped outside a Tokio runtime");
        }
    }
}

impl std::fmt::Debug for LiveEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveEnvironment")
            .field("id", &self.id)
            .field("released", &self.released)
            .finish()
    }
}
