use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tiermatrix_catalog::hierarchy::{classify_level, group_by_type};
use tiermatrix_catalog::projector::{build_grid, common_ranges};
use tiermatrix_catalog::ranges::{check_invariants, edit_boundary, insert_boundary, normalize, remove_range};
use tiermatrix_catalog::{CommonRange, Grid, HierarchyConfig, TypeGroup, VariantLevel};
use tiermatrix_core::TierStore;
use tiermatrix_shared::{
    CellKey, Matrix, ServiceId, Tier, TierId, TypeGroupId, Variant, VariantId, VariantPatch,
};
use tracing::{debug, info, warn};

use crate::changelog::{BoundaryOp, Changelog};
use crate::reconciler::{persisted_tiers, plan, AppliedOp, FlushReport, PlannedOp, Reconciler};
use crate::{SessionError, SessionResult};

/// Request for a new variant inside a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewVariant {
    pub display_name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Explicit type group; derived from the parent or the display name when absent.
    #[serde(default)]
    pub type_group: Option<TypeGroupId>,
    #[serde(default)]
    pub parent_variant_id: Option<VariantId>,
}

/// In-memory working copy of one service's matrix.
///
/// Edits touch only the working copy and the changelog; nothing reaches the
/// store before [`EditSession::flush`]. The baseline mirrors what the store
/// is known to hold.
#[derive(Debug, Clone)]
pub struct EditSession {
    service_id: ServiceId,
    hierarchy: HierarchyConfig,
    baseline: Matrix,
    working: Matrix,
    changelog: Changelog,
    unsynced: HashSet<CellKey>,
    /// Cells with a debounced write pending or in flight.
    held: HashSet<CellKey>,
    next_local_id: u64,
}

impl EditSession {
    pub fn new(mut baseline: Matrix, hierarchy: HierarchyConfig) -> Self {
        for variant in &mut baseline.variants {
            variant.lift_parent_reference();
            if let Err(e) = check_invariants(&variant.tiers) {
                warn!("Variant {} loaded with inconsistent tiers: {}", variant.id, e);
            }
            variant.tiers = normalize(&variant.tiers);
        }
        Self {
            service_id: baseline.service_id,
            hierarchy,
            working: baseline.clone(),
            baseline,
            changelog: Changelog::new(),
            unsynced: HashSet::new(),
            held: HashSet::new(),
            next_local_id: 1,
        }
    }

    /// Loads every variant of a service and its tiers through the store.
    pub async fn open(
        store: &dyn TierStore,
        service_id: ServiceId,
        hierarchy: HierarchyConfig,
    ) -> SessionResult<Self> {
        let variants = store
            .list_variants(service_id)
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?;
        let mut tiers = store
            .list_all_tiers(service_id)
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?;

        let variants = variants
            .into_iter()
            .map(|mut variant| {
                variant.tiers = variant
                    .id
                    .persisted()
                    .and_then(|id| tiers.remove(&id))
                    .unwrap_or_default();
                variant
            })
            .collect();

        let session = Self::new(Matrix::new(service_id, variants), hierarchy);
        info!(
            "Opened edit session for service {} with {} variants",
            service_id,
            session.working.variants.len()
        );
        Ok(session)
    }

    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    pub fn working(&self) -> &Matrix {
        &self.working
    }

    pub fn baseline(&self) -> &Matrix {
        &self.baseline
    }

    pub fn changelog(&self) -> &Changelog {
        &self.changelog
    }

    pub fn unsynced(&self) -> &HashSet<CellKey> {
        &self.unsynced
    }

    pub fn held_cells(&self) -> &HashSet<CellKey> {
        &self.held
    }

    /// Pending changes or cells whose last write failed.
    pub fn is_dirty(&self) -> bool {
        !self.changelog.is_empty() || !self.unsynced.is_empty()
    }

    /// Operations the next flush would issue against the baseline, leaving
    /// out held cells.
    pub fn pending_ops(&self) -> Vec<PlannedOp> {
        let mut ops = plan(&self.working, &persisted_tiers(&self.baseline), &self.changelog);
        ops.retain(|op| op.cell().map_or(true, |key| !self.held.contains(&key)));
        ops
    }

    pub fn hierarchy_config(&self) -> &HierarchyConfig {
        &self.hierarchy
    }

    pub fn variant(&self, variant_id: VariantId) -> SessionResult<&Variant> {
        self.working
            .get(&variant_id)
            .ok_or(SessionError::VariantNotFound(variant_id))
    }

    pub fn level(&self, variant_id: VariantId) -> SessionResult<VariantLevel> {
        Ok(classify_level(self.variant(variant_id)?, &self.hierarchy))
    }

    pub fn common_ranges(&self) -> Vec<CommonRange> {
        common_ranges(&self.working.variants)
    }

    pub fn grid(&self) -> Grid {
        build_grid(&self.working, &self.hierarchy, &self.unsynced)
    }

    pub fn hierarchy(&self) -> Vec<TypeGroup> {
        group_by_type(&self.working.variants, &self.hierarchy)
    }

    /// Applies a column edit to every variant in lock-step.
    ///
    /// Returns whether any variant changed. Collisions and removal of a
    /// variant's last tier are silent no-ops.
    pub fn apply_boundary_op(&mut self, op: BoundaryOp) -> SessionResult<bool> {
        match op {
            BoundaryOp::Add { boundary } | BoundaryOp::Remove { boundary } if boundary < 1 => {
                return Err(SessionError::InvalidBoundary(boundary));
            }
            BoundaryOp::Edit { from, to } if from < 1 || to < 1 => {
                return Err(SessionError::InvalidBoundary(from.min(to)));
            }
            BoundaryOp::Edit { to, .. } if self.common_ranges().iter().any(|c| c.min_quantity == to) => {
                debug!("Column {} already exists, ignoring move", to);
                return Ok(false);
            }
            _ => {}
        }

        let mut changed = false;
        for variant in &mut self.working.variants {
            let updated = match op {
                BoundaryOp::Add { boundary } => insert_boundary(&variant.tiers, boundary),
                BoundaryOp::Edit { from, to } => match position(&variant.tiers, from) {
                    Some(index) => edit_boundary(&variant.tiers, index, to),
                    None => continue,
                },
                BoundaryOp::Remove { boundary } => match position(&variant.tiers, boundary) {
                    Some(index) => remove_range(&variant.tiers, index),
                    None => continue,
                },
            };
            if updated != variant.tiers {
                variant.tiers = updated;
                changed = true;
            }
        }

        if changed {
            self.changelog.record_boundary(op);
        } else {
            debug!("Boundary op {:?} left every variant unchanged", op);
        }
        Ok(changed)
    }

    /// Sets one cell's price, inserting the boundary into that variant first
    /// when it only exists as a shared column.
    pub fn set_price(&mut self, variant_id: VariantId, min_quantity: u32, price_cents: i64) -> SessionResult<()> {
        self.write_cell(variant_id, min_quantity, price_cents)?;
        self.changelog
            .record_price(CellKey::new(variant_id, min_quantity), price_cents);
        Ok(())
    }

    /// Creates a variant with a default tier.
    ///
    /// A variant row joins the type group of the first type row carrying the
    /// same display name; anything else starts its own group.
    pub fn create_variant(&mut self, display_name: impl Into<String>, parameters: Map<String, Value>) -> SessionResult<VariantId> {
        self.create_variant_in(NewVariant {
            display_name: display_name.into(),
            parameters,
            type_group: None,
            parent_variant_id: None,
        })
    }

    pub fn create_variant_in(&mut self, new: NewVariant) -> SessionResult<VariantId> {
        let id = VariantId::Local(self.next_local_id);
        let mut variant = Variant::new(id, new.display_name, TypeGroupId::default())
            .with_parameters(new.parameters);
        variant.parent_variant_id = new.parent_variant_id;
        variant.lift_parent_reference();
        variant.sort_order = self.working.next_sort_order();

        let parent_group = match variant.parent_variant_id {
            Some(parent) => Some(self.variant(parent)?.type_group),
            None => None,
        };
        variant.type_group = match (new.type_group, parent_group) {
            (Some(group), _) | (None, Some(group)) => group,
            (None, None) => self.group_for(&variant),
        };

        self.next_local_id += 1;
        self.changelog.record_create(id, variant.draft());
        debug!("Created variant {} ({}) in group {}", id, variant.display_name, variant.type_group);
        self.working.variants.push(variant);
        Ok(id)
    }

    /// Renames, re-parameterizes or re-parents a variant. Never changes its group.
    pub fn update_variant(&mut self, variant_id: VariantId, patch: VariantPatch) -> SessionResult<()> {
        if patch.is_empty() {
            return Ok(());
        }
        if let Some(Some(parent)) = patch.parent_variant_id {
            if parent == variant_id {
                return Err(SessionError::InvalidChange(format!(
                    "variant {} cannot be its own parent",
                    variant_id
                )));
            }
            self.variant(parent)?;
        }
        let variant = self
            .working
            .get_mut(&variant_id)
            .ok_or(SessionError::VariantNotFound(variant_id))?;
        patch.apply(variant);
        variant.lift_parent_reference();
        let snapshot = variant.draft();
        self.changelog.record_update(variant_id, snapshot);
        Ok(())
    }

    /// Removes a variant from the working copy. Children keep their now
    /// dangling parent reference.
    pub fn delete_variant(&mut self, variant_id: VariantId) -> SessionResult<()> {
        let removed = self
            .working
            .remove(&variant_id)
            .ok_or(SessionError::VariantNotFound(variant_id))?;
        self.unsynced.retain(|key| key.variant_id != variant_id);
        if !self.changelog.record_delete(variant_id, removed.draft()) {
            debug!("Dropped unsaved variant {}", variant_id);
        }
        Ok(())
    }

    /// Sends pending changes through the reconciler.
    ///
    /// Whatever succeeded is folded into the baseline even when other
    /// operations failed; the failed cells are flagged unsynced and the
    /// changelog is kept for a retry.
    pub async fn flush(&mut self, reconciler: &Reconciler) -> SessionResult<FlushReport> {
        if self.pending_ops().is_empty() {
            debug!("Nothing to flush for service {}", self.service_id);
            self.changelog.clear();
            self.unsynced.clear();
            self.promote_working();
            return Ok(FlushReport::default());
        }

        let report = reconciler
            .reconcile(self.service_id, &self.working, &self.baseline, &self.changelog, &self.held)
            .await?;
        let remap = self.fold(&report);

        if report.is_success() {
            self.changelog.clear();
            self.unsynced.clear();
            self.promote_working();
            info!(
                "Flushed service {}: {} operations applied",
                self.service_id,
                report.applied.len()
            );
            return Ok(report);
        }

        self.unsynced.clear();
        for failed in &report.failed {
            if let Some(mut key) = failed.op.cell() {
                if let Some(to) = remap.get(&key.variant_id) {
                    key.variant_id = *to;
                }
                self.unsynced.insert(key);
            } else if let Some(variant) = self.working.get(&failed.op.variant()) {
                self.unsynced
                    .extend(variant.tiers.iter().map(|t| CellKey::new(variant.id, t.min_quantity)));
            }
        }
        warn!(
            "Flush for service {} incomplete: {} applied, {} failed",
            self.service_id,
            report.applied.len(),
            report.failed.len()
        );
        Err(SessionError::FlushFailed(Box::new(report)))
    }

    /// Restores the baseline and drops every pending change.
    pub fn cancel(&mut self) {
        self.working = self.baseline.clone();
        self.changelog.clear();
        self.unsynced.clear();
    }

    /// Writes a cell without recording it in the changelog and returns the
    /// explicit price it replaced, if the variant had a tier there.
    ///
    /// The cell stays held, and out of every flush, until it is confirmed,
    /// rolled back or released.
    pub fn apply_price_optimistic(&mut self, key: CellKey, price_cents: i64) -> SessionResult<Option<i64>> {
        let previous = self
            .variant(key.variant_id)?
            .tier_at(key.min_quantity)
            .map(|t| t.price_cents);
        self.write_cell(key.variant_id, key.min_quantity, price_cents)?;
        self.held.insert(key);
        Ok(previous)
    }

    /// Hands a held cell back to the flush path without touching it.
    pub fn release_cell(&mut self, key: CellKey) {
        self.held.remove(&key);
    }

    /// Store identity of the persisted tier behind a cell, if any.
    pub fn persisted_tier(&self, key: CellKey) -> Option<TierId> {
        self.baseline
            .get(&key.variant_id)
            .and_then(|v| v.tier_at(key.min_quantity))
            .and_then(|t| t.id)
    }

    /// Records a tier the store accepted outside of a flush.
    pub fn confirm_cell(&mut self, key: CellKey, saved: Tier) {
        if let Some(tier) = self
            .working
            .get_mut(&key.variant_id)
            .and_then(|v| v.tier_at_mut(key.min_quantity))
        {
            tier.id = saved.id;
        }
        if let Some(variant) = self.baseline.get_mut(&key.variant_id) {
            upsert_tier(&mut variant.tiers, saved);
        }
        self.unsynced.remove(&key);
        self.held.remove(&key);
    }

    /// Puts a cell back to the value it had before a failed write. A cell
    /// that had no tier of its own loses the boundary again.
    pub fn rollback_cell(&mut self, key: CellKey, original: Option<i64>) {
        self.held.remove(&key);
        let Some(variant) = self.working.get_mut(&key.variant_id) else {
            return;
        };
        match original {
            Some(price) => {
                if let Some(tier) = variant.tier_at_mut(key.min_quantity) {
                    tier.price_cents = price;
                }
            }
            None => {
                if let Some(index) = position(&variant.tiers, key.min_quantity) {
                    variant.tiers = remove_range(&variant.tiers, index);
                }
            }
        }
    }

    fn write_cell(&mut self, variant_id: VariantId, min_quantity: u32, price_cents: i64) -> SessionResult<()> {
        if min_quantity < 1 {
            return Err(SessionError::InvalidBoundary(min_quantity));
        }
        if price_cents < 0 {
            return Err(SessionError::NegativePrice(price_cents));
        }
        let variant = self
            .working
            .get_mut(&variant_id)
            .ok_or(SessionError::VariantNotFound(variant_id))?;
        if variant.tier_at(min_quantity).is_none() {
            variant.tiers = insert_boundary(&variant.tiers, min_quantity);
        }
        if let Some(tier) = variant.tier_at_mut(min_quantity) {
            tier.price_cents = price_cents;
        }
        Ok(())
    }

    fn group_for(&self, variant: &Variant) -> TypeGroupId {
        if classify_level(variant, &self.hierarchy) != VariantLevel::Variant {
            return TypeGroupId::new();
        }
        self.working
            .variants
            .iter()
            .find(|v| {
                v.display_name == variant.display_name
                    && classify_level(v, &self.hierarchy) == VariantLevel::Type
            })
            .map_or_else(TypeGroupId::new, |v| v.type_group)
    }

    /// Folds applied operations into the baseline and the working copy.
    /// Returns the local to persisted id mapping of created variants.
    fn fold(&mut self, report: &FlushReport) -> HashMap<VariantId, VariantId> {
        let mut remap = HashMap::new();
        for applied in &report.applied {
            if let AppliedOp::VariantCreated { local_id, variant } = applied {
                remap.insert(*local_id, variant.id);
                self.remap_variant(*local_id, variant.id);
                self.changelog.complete_variant_change(variant.id);
                let mut saved = variant.clone();
                saved.tiers.clear();
                self.baseline.variants.push(saved);
            }
        }
        let resolve = |id: &VariantId| remap.get(id).copied().unwrap_or(*id);

        for applied in &report.applied {
            match applied {
                AppliedOp::VariantCreated { .. } => {}
                AppliedOp::VariantDeleted { variant_id } => {
                    let id = VariantId::Persisted(*variant_id);
                    self.baseline.remove(&id);
                    self.changelog.complete_variant_change(id);
                }
                AppliedOp::VariantUpdated { variant_id, variant } => {
                    let id = VariantId::Persisted(*variant_id);
                    if let Some(base) = self.baseline.get_mut(&id) {
                        base.display_name = variant.display_name.clone();
                        base.parameters = variant.parameters.clone();
                        base.parent_variant_id = variant.parent_variant_id;
                    }
                    self.changelog.complete_variant_change(id);
                }
                AppliedOp::TierDeleted { variant_id, min_quantity } => {
                    if let Some(base) = self.baseline.get_mut(&resolve(variant_id)) {
                        base.tiers.retain(|t| t.min_quantity != *min_quantity);
                    }
                }
                AppliedOp::TierUpdated { variant_id, tier } | AppliedOp::TierCreated { variant_id, tier } => {
                    let id = resolve(variant_id);
                    if let Some(working) = self
                        .working
                        .get_mut(&id)
                        .and_then(|v| v.tier_at_mut(tier.min_quantity))
                    {
                        working.id = tier.id;
                    }
                    if let Some(base) = self.baseline.get_mut(&id) {
                        upsert_tier(&mut base.tiers, tier.clone());
                    }
                }
            }
        }
        remap
    }

    /// Makes the working copy the new baseline after a clean flush.
    ///
    /// Working tiers without an id take the id of the baseline tier at the same
    /// lower bound. Held cells keep their last known stored state.
    fn promote_working(&mut self) {
        for variant in &mut self.working.variants {
            let Some(base) = self.baseline.get(&variant.id) else {
                continue;
            };
            for tier in variant.tiers.iter_mut().filter(|t| t.id.is_none()) {
                tier.id = base.tier_at(tier.min_quantity).and_then(|t| t.id);
            }
        }

        let previous = std::mem::replace(&mut self.baseline, self.working.clone());
        for key in &self.held {
            let Some(base) = self.baseline.get_mut(&key.variant_id) else {
                continue;
            };
            base.tiers.retain(|t| t.min_quantity != key.min_quantity);
            if let Some(stored) = previous
                .get(&key.variant_id)
                .and_then(|v| v.tier_at(key.min_quantity))
            {
                upsert_tier(&mut base.tiers, stored.clone());
            }
        }
    }

    fn remap_variant(&mut self, from: VariantId, to: VariantId) {
        for variant in &mut self.working.variants {
            if variant.id == from {
                variant.id = to;
            }
            if variant.parent_variant_id == Some(from) {
                variant.parent_variant_id = Some(to);
            }
        }
        self.changelog.remap_variant(from, to);
    }
}

fn position(tiers: &[Tier], min_quantity: u32) -> Option<usize> {
    tiers.iter().position(|t| t.min_quantity == min_quantity)
}

fn upsert_tier(tiers: &mut Vec<Tier>, tier: Tier) {
    match tiers.iter_mut().find(|t| t.min_quantity == tier.min_quantity) {
        Some(existing) => *existing = tier,
        None => {
            tiers.push(tier);
            tiers.sort_by_key(|t| t.min_quantity);
        }
    }
}
