pub mod changelog;
pub mod session;
pub mod reconciler;
pub mod editor;

pub use changelog::{BoundaryOp, Changelog, VariantChange, VariantChangeKind};
pub use session::{EditSession, NewVariant};
pub use reconciler::{AppliedOp, FailedOp, FlushReport, PlannedOp, Reconciler, ReconcilerConfig};
pub use editor::DebouncedPriceEditor;

use tiermatrix_shared::VariantId;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Variant not found: {0}")]
    VariantNotFound(VariantId),

    #[error("Invalid boundary: {0}")]
    InvalidBoundary(u32),

    #[error("Negative price: {0}")]
    NegativePrice(i64),

    #[error("Invalid variant change: {0}")]
    InvalidChange(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Flush incomplete: {} of {} operations failed", .0.failed.len(), .0.total())]
    FlushFailed(Box<FlushReport>),
}

pub type SessionResult<T> = Result<T, SessionError>;
