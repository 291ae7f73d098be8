pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod mapping;
pub mod scheduler;
pub mod storage;
pub mod sync;

pub use config::{Config, DeviceEndpoint, StorageConfig, SyncConfig};
pub use context::AppContext;
pub use error::{AppError, Result};
pub use mapping::Point;
pub use storage::Storage;
pub use sync::{CycleOutcome, SyncSummary, Syncer};
