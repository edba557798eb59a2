use serde::{Deserialize, Serialize};

use super::ids::TierId;

/// A quantity breakpoint and its price (in minor currency units).
///
/// The upper bound of a tier is never stored; it is derived from the next
/// tier's `min_quantity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    /// `None` until the tier has been written to the store.
    pub id: Option<TierId>,
    pub min_quantity: u32,
    pub price_cents: i64,
    pub is_active: bool,
}

impl Tier {
    pub fn new(min_quantity: u32, price_cents: i64) -> Self {
        Self {
            id: None,
            min_quantity,
            price_cents,
            is_active: true,
        }
    }

    /// The tier every variant starts with: from 1, unbounded, free.
    pub fn default_tier() -> Self {
        Self::new(1, 0)
    }

    pub fn with_id(mut self, id: TierId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn is_saved(&self) -> bool {
        self.id.is_some()
    }

    pub fn draft(&self) -> TierDraft {
        TierDraft {
            min_quantity: self.min_quantity,
            price_cents: self.price_cents,
            is_active: self.is_active,
        }
    }
}

/// Payload for creating a tier in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierDraft {
    pub min_quantity: u32,
    pub price_cents: i64,
    pub is_active: bool,
}

/// Partial tier update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPatch {
    pub min_quantity: Option<u32>,
    pub price_cents: Option<i64>,
    pub is_active: Option<bool>,
}

impl TierPatch {
    pub fn price(price_cents: i64) -> Self {
        Self {
            price_cents: Some(price_cents),
            ..Default::default()
        }
    }

    pub fn apply(&self, tier: &mut Tier) {
        if let Some(min) = self.min_quantity {
            tier.min_quantity = min;
        }
        if let Some(price) = self.price_cents {
            tier.price_cents = price;
        }
        if let Some(active) = self.is_active {
            tier.is_active = active;
        }
    }
}
