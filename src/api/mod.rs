//! Public surface: the chain runner and the library's error types.

mod error;
pub(crate) mod llm_bridge;
mod runner;

pub use error::{ChainError, ConfigError, StoreError};
pub use runner::{ChainRun, ChainRunner};
