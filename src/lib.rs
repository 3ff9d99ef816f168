pub mod config;
pub mod error;
pub mod executor;
pub mod protocol;
pub mod sandbox;
pub mod scheduler;
pub mod shutdown;

pub use error::{Error, Result};
pub use executor::Executor;
pub use scheduler::Scheduler;
