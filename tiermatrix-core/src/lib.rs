pub mod repository;
pub mod memory;
pub mod cache;

pub use repository::{StoreResult, TierStore};
pub use memory::{MemoryTierStore, StoreCall};
pub use cache::{CachedTierStore, MemoryTierCache, TierCache, TierSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
