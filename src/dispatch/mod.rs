pub use dead_letter::DeadLetterQueue;
pub use dispatcher::BoundedDispatcher;
pub use retry::{RetryDecision, RetryPolicy};

mod dead_letter;
mod dispatcher;
mod retry;
