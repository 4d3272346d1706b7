pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod search;

// Re-export commonly used types
pub use cache::{CacheStats, MemoryCache};
pub use config::CoreConfig;
pub use error::{CoreError, Result};
pub use executor::{BatchExecutor, BatchResult, BatchStats, TaskFailure, TaskOutcome};
pub use search::{FileIndex, IndexStats, SearchEngine, SearchResult};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
