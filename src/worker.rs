use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ConnectionRole;
use crate::error::UsageError;


/// A blocking operation that a [RepeatingWorker] runs over and over until it is stopped.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RepeatingTask: Send + Sync + 'static {
    /// Perform one unit of work. Stopping the worker does not interrupt a running step - steps
    ///  that may wait for a long time should race their work against [WorkerSignal::stopped].
    async fn step(&self, signal: &WorkerSignal);
}

/// A step's view of its worker's state
#[derive(Clone)]
pub struct WorkerSignal {
    active: watch::Receiver<bool>,
}
impl WorkerSignal {
    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    /// resolves once the worker is stopped (immediately if it is not active)
    pub async fn stopped(&self) {
        let mut active = self.active.clone();
        // an error means the worker was dropped, which stops it as well
        let _ = active.wait_for(|active| !*active).await;
    }
}

/// Runs a [RepeatingTask] on a dedicated task until told to stop.
///
/// Starting an active worker or stopping an inactive one is reported as an error rather than
///  ignored. There is no forced interruption: [RepeatingWorker::stop] clears the flag, and the
///  loop exits after the current step returned. [RepeatingWorker::join] waits for that.
pub struct RepeatingWorker {
    name: &'static str,
    role: ConnectionRole,
    active: watch::Sender<bool>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RepeatingWorker {
    pub fn new(name: &'static str, role: ConnectionRole) -> RepeatingWorker {
        let (active, _) = watch::channel(false);
        RepeatingWorker {
            name,
            role,
            active,
            join_handle: Default::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    pub async fn start(&self, executor: &Handle, task: Arc<dyn RepeatingTask>) -> anyhow::Result<()> {
        info!(role = %self.role, "starting worker {}", self.name);

        let was_started = self.active.send_if_modified(|active| {
            if *active {
                return false;
            }
            *active = true;
            true
        });
        if !was_started {
            return Err(UsageError::WorkerAlreadyActive(self.name).into());
        }

        let signal = WorkerSignal {
            active: self.active.subscribe(),
        };
        let name = self.name;
        let span = info_span!("worker", worker = name, role = %self.role);

        let join_handle = executor.spawn(async move {
            while signal.is_active() {
                task.step(&signal).await;
                // steps that complete without ever waiting would otherwise starve other tasks
                tokio::task::yield_now().await;
            }
            debug!("worker loop terminated");
        }.instrument(span));

        if self.join_handle.lock().await
            .replace(join_handle)
            .is_some()
        {
            debug!("worker {} was restarted without joining the previous loop", self.name);
        }
        Ok(())
    }

    pub fn stop(&self) -> anyhow::Result<()> {
        info!(role = %self.role, "stopping worker {}", self.name);

        let was_stopped = self.active.send_if_modified(|active| {
            if !*active {
                return false;
            }
            *active = false;
            true
        });
        if !was_stopped {
            return Err(UsageError::WorkerNotActive(self.name).into());
        }
        Ok(())
    }

    /// Wait for the worker's loop to terminate after it was stopped. Returns immediately if the
    ///  worker was never started or was joined before.
    pub async fn join(&self) {
        let join_handle = self.join_handle.lock().await
            .take();
        if let Some(join_handle) = join_handle {
            if let Err(e) = join_handle.await {
                warn!(role = %self.role, "worker {} terminated abnormally: {}", self.name, e);
            }
        }
    }
}

impl Drop for RepeatingWorker {
    fn drop(&mut self) {
        // the loop must not outlive its worker
        self.active.send_replace(false);
    }
}
