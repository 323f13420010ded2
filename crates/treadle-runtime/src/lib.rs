pub mod config;
pub mod executor;
pub mod service;
pub mod store;

pub use config::{ExecutorConfig, RuntimeConfig};
pub use executor::{JobExecutor, LockMonitor};
pub use service::{ProcessEngine, TokenRef};
pub use store::MemoryStore;
