//! Generator plumbing that sits between the dialog engine and a model
//! backend: bounded retries and a scripted double for tests.

pub mod mock;
pub mod reliable;

pub use mock::{Script, ScriptedGenerator};
pub use reliable::{ReliableGenerator, RetryPolicy};
