mod interceptor;
mod runner;

pub use interceptor::InterceptorHandle;
pub use runner::{Task, TaskFailure, TaskRunner};
