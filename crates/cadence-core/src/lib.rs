pub mod config;
pub mod error;

pub use config::{CadenceConfig, DatabaseConfig, SchedulerConfig};
pub use error::{CadenceError, Result};
