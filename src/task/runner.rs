use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use super::interceptor::{InterceptorHandle, TaskInterceptor};
use crate::common::error::EscrowError;

/// A single protocol step over a shared context.
#[async_trait]
pub trait Task<C: Send>: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, ctx: &mut C) -> Result<(), EscrowError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskFailure {
    pub task: &'static str,
    pub message: String,
    pub integrity_violation: bool,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Task {} failed - {}", self.task, self.message)
    }
}

impl From<TaskFailure> for EscrowError {
    fn from(failure: TaskFailure) -> Self {
        EscrowError::TaskFailed(failure.to_string())
    }
}

type CompleteHandler<C> = Box<dyn FnOnce(&mut C) + Send>;
type FaultHandler<C> = Box<dyn FnOnce(&mut C, &TaskFailure) + Send>;

/// Runs tasks strictly in order. The first failing task stops the run, and exactly one of the
/// completion or fault handlers fires.
pub struct TaskRunner<C, T> {
    label: String,
    tasks: Vec<T>,
    complete_handler: Option<CompleteHandler<C>>,
    fault_handler: Option<FaultHandler<C>>,
    task_timeout: Option<Duration>,
    interceptor: Option<TaskInterceptor>,
    finished: bool,
}

impl<C: Send, T: Task<C>> TaskRunner<C, T> {
    pub fn new(tasks: Vec<T>) -> Self {
        Self {
            label: "TaskRunner".to_string(),
            tasks,
            complete_handler: None,
            fault_handler: None,
            task_timeout: None,
            interceptor: None,
            finished: false,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn on_complete(mut self, handler: impl FnOnce(&mut C) + Send + 'static) -> Self {
        self.complete_handler = Some(Box::new(handler));
        self
    }

    pub fn on_fault(mut self, handler: impl FnOnce(&mut C, &TaskFailure) + Send + 'static) -> Self {
        self.fault_handler = Some(Box::new(handler));
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn intercept_before(&mut self, task_name: &'static str) -> InterceptorHandle {
        let (interceptor, handle) = TaskInterceptor::new(task_name);
        self.interceptor = Some(interceptor);
        handle
    }

    pub async fn run(&mut self, ctx: &mut C) -> Result<(), TaskFailure> {
        if self.finished {
            return Err(TaskFailure {
                task: "TaskRunner",
                message: format!("{} already finished", self.label),
                integrity_violation: false,
            });
        }

        let tasks = std::mem::take(&mut self.tasks);
        for task in tasks.iter() {
            let name = task.name();
            if let Some(interceptor) = self.interceptor.as_mut() {
                interceptor.before(name).await;
            }

            debug!("{} running task {}", self.label, name);
            let result = match self.task_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, task.run(ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(EscrowError::Timeout(format!(
                        "Task {} did not complete within {} ms",
                        name,
                        timeout.as_millis()
                    ))),
                },
                None => task.run(ctx).await,
            };

            if let Err(error) = result {
                let failure = TaskFailure {
                    task: name,
                    message: error.to_string(),
                    integrity_violation: error.is_integrity_violation(),
                };
                self.handle_fault(ctx, &failure);
                return Err(failure);
            }
        }

        self.handle_complete(ctx);
        Ok(())
    }

    pub fn handle_complete(&mut self, ctx: &mut C) {
        if self.finished {
            warn!("{} already finished, completion ignored", self.label);
            return;
        }
        self.finished = true;
        if let Some(handler) = self.complete_handler.take() {
            handler(ctx);
        }
    }

    pub fn handle_fault(&mut self, ctx: &mut C, failure: &TaskFailure) {
        if self.finished {
            warn!(
                "{} already finished, fault from {} ignored",
                self.label, failure.task
            );
            return;
        }
        self.finished = true;
        if let Some(handler) = self.fault_handler.take() {
            handler(ctx, failure);
        }
    }
}
