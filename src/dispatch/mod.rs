//! Call dispatch: admission, retry and statistics.

mod dispatcher;
mod retry;

pub use dispatcher::{CallDispatcher, DispatchStats};
pub use retry::{RetryExecutor, RetryPolicy};
