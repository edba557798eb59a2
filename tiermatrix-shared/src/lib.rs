pub mod models;

pub use models::ids::{CellKey, ServiceId, TierId, TypeGroupId, VariantId};
pub use models::events::{MatrixFlushedEvent, PriceEditEvent, PriceEditOutcome};
pub use models::tier::{Tier, TierDraft, TierPatch};
pub use models::variant::{Matrix, Variant, VariantDraft, VariantPatch, PARENT_VARIANT_KEY};
