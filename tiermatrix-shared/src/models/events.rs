use uuid::Uuid;

use super::ids::VariantId;

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceEditOutcome {
    Saved,
    RolledBack,
}

/// Emitted once per debounced cell edit, after the store call settles.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct PriceEditEvent {
    pub service_id: Uuid,
    pub variant_id: VariantId,
    pub min_quantity: u32,
    pub price_cents: i64,
    pub outcome: PriceEditOutcome,
    pub error: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct MatrixFlushedEvent {
    pub service_id: Uuid,
    pub applied: usize,
    pub failed: usize,
    pub timestamp: i64,
}
