use tokio::sync::oneshot;
use tracing::debug;

use crate::common::error::EscrowError;

/// Pauses a task runner right before a named task until the paired handle resumes it.
pub struct TaskInterceptor {
    task_name: &'static str,
    paused_tx: Option<oneshot::Sender<()>>,
    resume_rx: Option<oneshot::Receiver<()>>,
}

pub struct InterceptorHandle {
    task_name: &'static str,
    paused_rx: Option<oneshot::Receiver<()>>,
    resume_tx: Option<oneshot::Sender<()>>,
}

impl TaskInterceptor {
    pub(crate) fn new(task_name: &'static str) -> (Self, InterceptorHandle) {
        let (paused_tx, paused_rx) = oneshot::channel::<()>();
        let (resume_tx, resume_rx) = oneshot::channel::<()>();
        let interceptor = Self {
            task_name,
            paused_tx: Some(paused_tx),
            resume_rx: Some(resume_rx),
        };
        let handle = InterceptorHandle {
            task_name,
            paused_rx: Some(paused_rx),
            resume_tx: Some(resume_tx),
        };
        (interceptor, handle)
    }

    pub(crate) async fn before(&mut self, task_name: &str) {
        if task_name != self.task_name {
            return;
        }
        let (Some(paused_tx), Some(resume_rx)) = (self.paused_tx.take(), self.resume_rx.take())
        else {
            return;
        };

        debug!("Task runner paused before task {}", task_name);
        // A dropped handle releases the runner
        let _ = paused_tx.send(());
        let _ = resume_rx.await;
        debug!("Task runner resumed before task {}", task_name);
    }
}

impl InterceptorHandle {
    /// Resolves once the runner reached the intercepted task.
    pub async fn paused(&mut self) -> Result<(), EscrowError> {
        match self.paused_rx.take() {
            Some(paused_rx) => Ok(paused_rx.await?),
            None => Err(EscrowError::Simple(format!(
                "Interceptor for task {} already reported pause",
                self.task_name
            ))),
        }
    }

    pub fn resume(&mut self) {
        if let Some(resume_tx) = self.resume_tx.take() {
            let _ = resume_tx.send(());
        }
    }
}
