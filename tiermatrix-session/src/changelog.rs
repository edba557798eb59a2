use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tiermatrix_shared::{CellKey, VariantDraft, VariantId};

/// A structural edit of a shared column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BoundaryOp {
    Add { boundary: u32 },
    Edit { from: u32, to: u32 },
    Remove { boundary: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VariantChangeKind {
    Create,
    Update,
    Delete,
}

/// Pending lifecycle change of a variant, with its state at the time of the edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantChange {
    pub variant_id: VariantId,
    pub kind: VariantChangeKind,
    pub snapshot: VariantDraft,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceEdit {
    pub variant_id: VariantId,
    pub min_quantity: u32,
    pub price_cents: i64,
}

/// Edits made in a session since the last successful flush.
#[derive(Debug, Clone, Default)]
pub struct Changelog {
    boundary_ops: Vec<BoundaryOp>,
    price_edits: BTreeMap<CellKey, i64>,
    variant_changes: Vec<VariantChange>,
}

impl Changelog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.boundary_ops.is_empty() && self.price_edits.is_empty() && self.variant_changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.boundary_ops.len() + self.price_edits.len() + self.variant_changes.len()
    }

    pub fn clear(&mut self) {
        self.boundary_ops.clear();
        self.price_edits.clear();
        self.variant_changes.clear();
    }

    pub fn boundary_ops(&self) -> &[BoundaryOp] {
        &self.boundary_ops
    }

    pub fn price_edits(&self) -> Vec<PriceEdit> {
        self.price_edits
            .iter()
            .map(|(key, price)| PriceEdit {
                variant_id: key.variant_id,
                min_quantity: key.min_quantity,
                price_cents: *price,
            })
            .collect()
    }

    pub fn variant_changes(&self) -> &[VariantChange] {
        &self.variant_changes
    }

    pub fn record_boundary(&mut self, op: BoundaryOp) {
        self.boundary_ops.push(op);
    }

    /// Repeated edits to one cell keep only the latest price.
    pub fn record_price(&mut self, key: CellKey, price_cents: i64) {
        self.price_edits.insert(key, price_cents);
    }

    pub fn record_create(&mut self, variant_id: VariantId, snapshot: VariantDraft) {
        self.variant_changes.push(VariantChange {
            variant_id,
            kind: VariantChangeKind::Create,
            snapshot,
        });
    }

    /// Folds into a pending create or update for the same variant.
    pub fn record_update(&mut self, variant_id: VariantId, snapshot: VariantDraft) {
        if let Some(existing) = self.variant_changes.iter_mut().find(|c| c.variant_id == variant_id) {
            if existing.kind != VariantChangeKind::Delete {
                existing.snapshot = snapshot;
            }
            return;
        }
        self.variant_changes.push(VariantChange {
            variant_id,
            kind: VariantChangeKind::Update,
            snapshot,
        });
    }

    /// Supersedes every pending change of the variant.
    ///
    /// Returns `false` when the variant was never persisted, in which case
    /// nothing is left to send.
    pub fn record_delete(&mut self, variant_id: VariantId, snapshot: VariantDraft) -> bool {
        self.variant_changes.retain(|c| c.variant_id != variant_id);
        self.price_edits.retain(|key, _| key.variant_id != variant_id);
        if !variant_id.is_persisted() {
            return false;
        }
        self.variant_changes.push(VariantChange {
            variant_id,
            kind: VariantChangeKind::Delete,
            snapshot,
        });
        true
    }

    pub fn complete_variant_change(&mut self, variant_id: VariantId) {
        self.variant_changes.retain(|c| c.variant_id != variant_id);
    }

    /// Rewrites a session-local id to its store identity everywhere.
    pub fn remap_variant(&mut self, from: VariantId, to: VariantId) {
        for change in &mut self.variant_changes {
            if change.variant_id == from {
                change.variant_id = to;
            }
            if change.snapshot.parent_variant_id == Some(from) {
                change.snapshot.parent_variant_id = Some(to);
            }
        }
        let moved: Vec<(CellKey, i64)> = self
            .price_edits
            .iter()
            .filter(|(key, _)| key.variant_id == from)
            .map(|(key, price)| (*key, *price))
            .collect();
        for (key, price) in moved {
            self.price_edits.remove(&key);
            self.price_edits.insert(CellKey::new(to, key.min_quantity), price);
        }
    }
}
