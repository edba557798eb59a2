use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tiermatrix_core::TierStore;
use tiermatrix_shared::{
    CellKey, Matrix, ServiceId, Tier, TierId, TierPatch, Variant, VariantDraft, VariantId,
    VariantPatch,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::changelog::{Changelog, VariantChangeKind};
use crate::{SessionError, SessionResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Maximum number of store calls in flight during one phase.
    pub batch_size: usize,
    /// Re-read persisted tiers through the store instead of trusting the
    /// session baseline.
    pub refresh_baseline: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            refresh_baseline: false,
        }
    }
}

/// One store operation of a flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlannedOp {
    DeleteVariant { variant_id: Uuid },
    CreateVariant { local_id: VariantId, draft: VariantDraft },
    UpdateVariant { variant_id: Uuid, patch: VariantPatch },
    DeleteTier { variant_id: VariantId, tier_id: TierId, min_quantity: u32 },
    UpdateTier { variant_id: VariantId, tier_id: TierId, tier: Tier },
    CreateTier { variant_id: VariantId, tier: Tier },
}

impl PlannedOp {
    fn phase(&self) -> u8 {
        match self {
            PlannedOp::DeleteVariant { .. } => 0,
            PlannedOp::CreateVariant { .. } => 1,
            PlannedOp::UpdateVariant { .. } => 2,
            PlannedOp::DeleteTier { .. } => 3,
            PlannedOp::UpdateTier { .. } => 4,
            PlannedOp::CreateTier { .. } => 5,
        }
    }

    /// The price cell this operation writes, for tier operations.
    pub fn cell(&self) -> Option<CellKey> {
        match self {
            PlannedOp::DeleteTier { variant_id, min_quantity, .. } => {
                Some(CellKey::new(*variant_id, *min_quantity))
            }
            PlannedOp::UpdateTier { variant_id, tier, .. }
            | PlannedOp::CreateTier { variant_id, tier } => {
                Some(CellKey::new(*variant_id, tier.min_quantity))
            }
            _ => None,
        }
    }

    pub fn variant(&self) -> VariantId {
        match self {
            PlannedOp::DeleteVariant { variant_id } | PlannedOp::UpdateVariant { variant_id, .. } => {
                VariantId::Persisted(*variant_id)
            }
            PlannedOp::CreateVariant { local_id, .. } => *local_id,
            PlannedOp::DeleteTier { variant_id, .. }
            | PlannedOp::UpdateTier { variant_id, .. }
            | PlannedOp::CreateTier { variant_id, .. } => *variant_id,
        }
    }
}

/// A store operation that succeeded, with what the store returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AppliedOp {
    VariantDeleted { variant_id: Uuid },
    VariantCreated { local_id: VariantId, variant: Variant },
    VariantUpdated { variant_id: Uuid, variant: Variant },
    TierDeleted { variant_id: VariantId, min_quantity: u32 },
    TierUpdated { variant_id: VariantId, tier: Tier },
    TierCreated { variant_id: VariantId, tier: Tier },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedOp {
    pub op: PlannedOp,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlushReport {
    pub applied: Vec<AppliedOp>,
    pub failed: Vec<FailedOp>,
}

impl FlushReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.applied.len() + self.failed.len()
    }

    fn absorb(&mut self, results: Vec<Result<AppliedOp, FailedOp>>) {
        for result in results {
            match result {
                Ok(applied) => self.applied.push(applied),
                Err(failed) => self.failed.push(failed),
            }
        }
    }
}

/// Tier operations that bring `persisted` in line with `working`, keyed by
/// lower bound.
pub fn diff_tiers(variant_id: VariantId, persisted: &[Tier], working: &[Tier]) -> Vec<PlannedOp> {
    let before: BTreeMap<u32, &Tier> = persisted.iter().map(|t| (t.min_quantity, t)).collect();
    let after: BTreeMap<u32, &Tier> = working.iter().map(|t| (t.min_quantity, t)).collect();

    let mut ops = Vec::new();
    for (min_quantity, old) in &before {
        if after.contains_key(min_quantity) {
            continue;
        }
        if let Some(tier_id) = old.id {
            ops.push(PlannedOp::DeleteTier {
                variant_id,
                tier_id,
                min_quantity: *min_quantity,
            });
        }
    }
    for (min_quantity, new) in &after {
        match before.get(min_quantity) {
            Some(old) => {
                let changed = old.price_cents != new.price_cents || old.is_active != new.is_active;
                match old.id {
                    Some(tier_id) if changed => ops.push(PlannedOp::UpdateTier {
                        variant_id,
                        tier_id,
                        tier: (*new).clone(),
                    }),
                    Some(_) => {}
                    None => ops.push(PlannedOp::CreateTier {
                        variant_id,
                        tier: (*new).clone(),
                    }),
                }
            }
            None => ops.push(PlannedOp::CreateTier {
                variant_id,
                tier: (*new).clone(),
            }),
        }
    }
    ops
}

/// Ordered operation list for a flush: variant deletes, creates and updates,
/// then tier deletes, updates and creates.
pub fn plan(
    working: &Matrix,
    persisted: &HashMap<VariantId, Vec<Tier>>,
    changelog: &Changelog,
) -> Vec<PlannedOp> {
    let mut ops = Vec::new();

    for change in changelog.variant_changes() {
        match (change.kind, change.variant_id) {
            (VariantChangeKind::Delete, VariantId::Persisted(id)) => {
                ops.push(PlannedOp::DeleteVariant { variant_id: id })
            }
            (VariantChangeKind::Create, VariantId::Local(_)) => ops.push(PlannedOp::CreateVariant {
                local_id: change.variant_id,
                draft: change.snapshot.clone(),
            }),
            (VariantChangeKind::Update, VariantId::Persisted(id))
            | (VariantChangeKind::Create, VariantId::Persisted(id)) => {
                ops.push(PlannedOp::UpdateVariant {
                    variant_id: id,
                    patch: VariantPatch {
                        display_name: Some(change.snapshot.display_name.clone()),
                        parameters: Some(change.snapshot.parameters.clone()),
                        parent_variant_id: Some(change.snapshot.parent_variant_id),
                    },
                })
            }
            _ => {}
        }
    }

    let empty = Vec::new();
    for variant in &working.variants {
        let before = persisted.get(&variant.id).unwrap_or(&empty);
        ops.extend(diff_tiers(variant.id, before, &variant.tiers));
    }

    ops.sort_by_key(PlannedOp::phase);
    ops
}

/// Tiers of every variant in `baseline`, keyed the way [`plan`] expects.
pub fn persisted_tiers(baseline: &Matrix) -> HashMap<VariantId, Vec<Tier>> {
    baseline
        .variants
        .iter()
        .map(|v| (v.id, v.tiers.clone()))
        .collect()
}

/// Pushes a session's changes to the store.
pub struct Reconciler {
    store: Arc<dyn TierStore>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(store: Arc<dyn TierStore>, config: ReconcilerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn TierStore> {
        &self.store
    }

    /// Executes the plan for one flush and reports every operation.
    ///
    /// Individual failures do not stop the remaining operations. Tier
    /// operations on a variant whose creation failed are reported as failed.
    /// Cells in `held` are written elsewhere and left out of the plan.
    pub async fn reconcile(
        &self,
        service_id: ServiceId,
        working: &Matrix,
        baseline: &Matrix,
        changelog: &Changelog,
        held: &HashSet<CellKey>,
    ) -> SessionResult<FlushReport> {
        let persisted = if self.config.refresh_baseline {
            self.load_persisted(service_id).await?
        } else {
            persisted_tiers(baseline)
        };

        let mut ops = plan(working, &persisted, changelog);
        ops.retain(|op| op.cell().map_or(true, |key| !held.contains(&key)));
        info!("Flushing service {}: {} planned operations", service_id, ops.len());

        let mut phases: BTreeMap<u8, Vec<PlannedOp>> = BTreeMap::new();
        for op in ops {
            phases.entry(op.phase()).or_default().push(op);
        }

        let mut report = FlushReport::default();
        let mut ids: HashMap<VariantId, Uuid> = HashMap::new();
        for (phase, ops) in phases {
            if phase == 1 {
                self.create_variants(service_id, ops, &mut ids, &mut report).await;
            } else {
                let results = self.run_batch(service_id, ops, &ids).await;
                report.absorb(results);
            }
        }

        for failed in &report.failed {
            warn!("Flush operation failed for service {}: {:?}: {}", service_id, failed.op, failed.error);
        }
        // a partial flush has still changed the store
        if !report.applied.is_empty() {
            self.store.invalidate_cache(service_id).await;
        }
        Ok(report)
    }

    async fn load_persisted(&self, service_id: ServiceId) -> SessionResult<HashMap<VariantId, Vec<Tier>>> {
        let all = self
            .store
            .list_all_tiers(service_id)
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?;
        Ok(all
            .into_iter()
            .map(|(id, tiers)| (VariantId::Persisted(id), tiers))
            .collect())
    }

    /// Creates variants in waves so a parent is saved before its children.
    async fn create_variants(
        &self,
        service_id: ServiceId,
        mut pending: Vec<PlannedOp>,
        ids: &mut HashMap<VariantId, Uuid>,
        report: &mut FlushReport,
    ) {
        while !pending.is_empty() {
            let (ready, waiting): (Vec<PlannedOp>, Vec<PlannedOp>) =
                pending.into_iter().partition(|op| match op {
                    PlannedOp::CreateVariant { draft, .. } => match draft.parent_variant_id {
                        Some(parent @ VariantId::Local(_)) => ids.contains_key(&parent),
                        _ => true,
                    },
                    _ => true,
                });

            if ready.is_empty() {
                // parents failed or are missing from this flush
                for op in waiting {
                    report.failed.push(FailedOp {
                        op,
                        error: "parent variant was not saved".to_string(),
                    });
                }
                return;
            }

            let results = self.run_batch(service_id, ready, ids).await;
            for result in &results {
                if let Ok(AppliedOp::VariantCreated { local_id, variant }) = result {
                    if let Some(id) = variant.id.persisted() {
                        ids.insert(*local_id, id);
                    }
                }
            }
            report.absorb(results);
            pending = waiting;
        }
    }

    async fn run_batch(
        &self,
        service_id: ServiceId,
        ops: Vec<PlannedOp>,
        ids: &HashMap<VariantId, Uuid>,
    ) -> Vec<Result<AppliedOp, FailedOp>> {
        stream::iter(ops)
            .map(|op| self.execute(service_id, op, ids))
            .buffer_unordered(self.config.batch_size.max(1))
            .collect()
            .await
    }

    async fn execute(
        &self,
        service_id: ServiceId,
        op: PlannedOp,
        ids: &HashMap<VariantId, Uuid>,
    ) -> Result<AppliedOp, FailedOp> {
        let resolve = |id: VariantId| match id {
            VariantId::Persisted(uuid) => Some(uuid),
            VariantId::Local(_) => ids.get(&id).copied(),
        };
        let fail = |op: &PlannedOp, error: String| FailedOp { op: op.clone(), error };

        let Some(variant_id) = resolve(op.variant()).or(match &op {
            PlannedOp::CreateVariant { .. } => Some(Uuid::nil()),
            _ => None,
        }) else {
            return Err(fail(&op, "variant was not saved".to_string()));
        };

        let result = match &op {
            PlannedOp::DeleteVariant { variant_id } => self
                .store
                .delete_variant(service_id, *variant_id)
                .await
                .map(|_| AppliedOp::VariantDeleted { variant_id: *variant_id }),
            PlannedOp::CreateVariant { local_id, draft } => {
                let mut draft = draft.clone();
                if let Some(parent) = draft.parent_variant_id {
                    match resolve(parent) {
                        Some(uuid) => draft.parent_variant_id = Some(VariantId::Persisted(uuid)),
                        None => return Err(fail(&op, "parent variant was not saved".to_string())),
                    }
                }
                self.store
                    .create_variant(service_id, &draft)
                    .await
                    .map(|variant| AppliedOp::VariantCreated { local_id: *local_id, variant })
            }
            PlannedOp::UpdateVariant { variant_id, patch } => {
                let mut patch = patch.clone();
                if let Some(Some(parent)) = patch.parent_variant_id {
                    match resolve(parent) {
                        Some(uuid) => patch.parent_variant_id = Some(Some(VariantId::Persisted(uuid))),
                        None => return Err(fail(&op, "parent variant was not saved".to_string())),
                    }
                }
                self.store
                    .update_variant(service_id, *variant_id, &patch)
                    .await
                    .map(|variant| AppliedOp::VariantUpdated { variant_id: *variant_id, variant })
            }
            PlannedOp::DeleteTier { variant_id: vid, tier_id, min_quantity } => self
                .store
                .delete_tier(service_id, *tier_id)
                .await
                .map(|_| AppliedOp::TierDeleted { variant_id: *vid, min_quantity: *min_quantity }),
            PlannedOp::UpdateTier { variant_id: vid, tier_id, tier } => {
                let patch = TierPatch {
                    min_quantity: None,
                    price_cents: Some(tier.price_cents),
                    is_active: Some(tier.is_active),
                };
                self.store
                    .update_tier(service_id, variant_id, *tier_id, &patch)
                    .await
                    .map(|saved| AppliedOp::TierUpdated { variant_id: *vid, tier: saved })
            }
            PlannedOp::CreateTier { variant_id: vid, tier } => self
                .store
                .create_tier(service_id, variant_id, &tier.draft())
                .await
                .map(|saved| AppliedOp::TierCreated { variant_id: *vid, tier: saved }),
        };

        result.map_err(|e| fail(&op, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiermatrix_core::{MemoryTierStore, StoreCall};
    use tiermatrix_shared::TypeGroupId;

    fn saved(pairs: &[(u32, i64)]) -> Vec<Tier> {
        pairs
            .iter()
            .map(|&(m, p)| Tier::new(m, p).with_id(Uuid::new_v4()))
            .collect()
    }

    fn unsaved(pairs: &[(u32, i64)]) -> Vec<Tier> {
        pairs.iter().map(|&(m, p)| Tier::new(m, p)).collect()
    }

    #[test]
    fn test_diff_update_and_create_only() {
        let id = VariantId::Persisted(Uuid::new_v4());
        let persisted = saved(&[(1, 10), (50, 8)]);
        let working = unsaved(&[(1, 10), (50, 9), (200, 7)]);

        let ops = diff_tiers(id, &persisted, &working);
        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[0], PlannedOp::UpdateTier { tier, .. } if tier.min_quantity == 50 && tier.price_cents == 9));
        assert!(matches!(&ops[1], PlannedOp::CreateTier { tier, .. } if tier.min_quantity == 200 && tier.price_cents == 7));
    }

    #[test]
    fn test_diff_delete_missing_boundary() {
        let id = VariantId::Persisted(Uuid::new_v4());
        let persisted = saved(&[(1, 5), (50, 4), (500, 3)]);
        let working = unsaved(&[(1, 5), (500, 3)]);

        let ops = diff_tiers(id, &persisted, &working);
        assert_eq!(ops.len(), 1);
        assert!(matches!(ops[0], PlannedOp::DeleteTier { min_quantity: 50, .. }));
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let persisted = saved(&[(1, 5), (50, 4)]);
        let ops = diff_tiers(VariantId::Local(1), &persisted, &persisted);
        assert!(ops.is_empty());
    }

    #[test]
    fn test_plan_orders_phases() {
        let group = TypeGroupId::new();
        let kept = VariantId::Persisted(Uuid::new_v4());
        let mut working = Matrix::new(Uuid::new_v4(), vec![
            Variant::new(kept, "A", group).with_tiers(unsaved(&[(1, 3), (60, 2)])),
            Variant::new(VariantId::Local(1), "B", group),
        ]);
        working.variants[1].tiers = unsaved(&[(1, 0)]);

        let mut persisted = HashMap::new();
        persisted.insert(kept, saved(&[(1, 3), (50, 2)]));

        let mut log = Changelog::new();
        log.record_create(VariantId::Local(1), working.variants[1].draft());
        log.record_delete(VariantId::Persisted(Uuid::new_v4()), working.variants[1].draft());

        let ops = plan(&working, &persisted, &log);
        let phases: Vec<u8> = ops.iter().map(PlannedOp::phase).collect();
        let mut sorted = phases.clone();
        sorted.sort();
        assert_eq!(phases, sorted);
        assert!(matches!(ops[0], PlannedOp::DeleteVariant { .. }));
        assert!(matches!(ops[1], PlannedOp::CreateVariant { .. }));
        // delete 50, create 60 for A, create 1 for B
        assert_eq!(ops.len(), 5);
    }

    #[tokio::test]
    async fn test_batch_window_is_bounded() {
        let store = Arc::new(MemoryTierStore::new().with_latency(std::time::Duration::from_millis(20)));
        let service = Uuid::new_v4();
        let seeded = store
            .seed_variant(service, Variant::new(VariantId::Local(0), "A", TypeGroupId::new()).draft(), &[(1, 1)])
            .await;

        let mut working_variant = seeded.clone();
        for m in 2..=13 {
            working_variant.tiers.push(Tier::new(m * 10, 1));
        }
        let working = Matrix::new(service, vec![working_variant]);
        let baseline = Matrix::new(service, vec![seeded]);
        let mut log = Changelog::new();
        log.record_price(CellKey::new(working.variants[0].id, 20), 1);

        let reconciler = Reconciler::new(store.clone(), ReconcilerConfig { batch_size: 3, refresh_baseline: false });
        let report = reconciler.reconcile(service, &working, &baseline, &log, &HashSet::new()).await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.applied.len(), 12);
        assert!(store.peak_in_flight() <= 3);
        assert!(store.peak_in_flight() >= 2);
    }

    #[tokio::test]
    async fn test_partial_failure_reported() {
        let store = Arc::new(MemoryTierStore::new());
        let service = Uuid::new_v4();
        let seeded = store
            .seed_variant(service, Variant::new(VariantId::Local(0), "A", TypeGroupId::new()).draft(), &[(1, 10), (50, 8)])
            .await;
        store
            .fail_when(|call| matches!(call, StoreCall::CreateTier { min_quantity: 200, .. }))
            .await;

        let mut working_variant = seeded.clone();
        working_variant.tiers[1].price_cents = 9;
        working_variant.tiers.push(Tier::new(200, 7));
        let working = Matrix::new(service, vec![working_variant]);
        let baseline = Matrix::new(service, vec![seeded.clone()]);
        let mut log = Changelog::new();
        log.record_price(CellKey::new(seeded.id, 50), 9);

        let reconciler = Reconciler::new(store.clone(), ReconcilerConfig::default());
        let report = reconciler.reconcile(service, &working, &baseline, &log, &HashSet::new()).await.unwrap();

        assert!(!report.is_success());
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].op.cell(), Some(CellKey::new(seeded.id, 200)));

        let stored = store.stored_tiers(seeded.id.persisted().unwrap()).await;
        assert_eq!(stored[1].price_cents, 9);
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn test_child_created_after_local_parent() {
        let store = Arc::new(MemoryTierStore::new());
        let service = Uuid::new_v4();
        let group = TypeGroupId::new();

        let parent = Variant::new(VariantId::Local(1), "Paper", group);
        let child = Variant::new(VariantId::Local(2), "Paper", group).with_parent(VariantId::Local(1));
        let mut log = Changelog::new();
        log.record_create(parent.id, parent.draft());
        log.record_create(child.id, child.draft());
        let working = Matrix::new(service, vec![parent, child]);

        let reconciler = Reconciler::new(store.clone(), ReconcilerConfig::default());
        let report = reconciler
            .reconcile(service, &working, &Matrix::new(service, vec![]), &log, &HashSet::new())
            .await
            .unwrap();

        assert!(report.is_success(), "{:?}", report.failed);
        let created: Vec<&Variant> = report
            .applied
            .iter()
            .filter_map(|a| match a {
                AppliedOp::VariantCreated { variant, .. } => Some(variant),
                _ => None,
            })
            .collect();
        assert_eq!(created.len(), 2);
        let saved_parent = created.iter().find(|v| v.parent_variant_id.is_none()).unwrap();
        let saved_child = created.iter().find(|v| v.parent_variant_id.is_some()).unwrap();
        assert_eq!(saved_child.parent_variant_id, Some(saved_parent.id));
    }

    #[tokio::test]
    async fn test_held_cells_are_skipped() {
        let store = Arc::new(MemoryTierStore::new());
        let service = Uuid::new_v4();
        let seeded = store
            .seed_variant(service, Variant::new(VariantId::Local(0), "A", TypeGroupId::new()).draft(), &[(1, 10), (50, 8)])
            .await;

        let mut working_variant = seeded.clone();
        working_variant.tiers[1].price_cents = 9;
        working_variant.tiers.push(Tier::new(500, 4));
        let working = Matrix::new(service, vec![working_variant]);
        let baseline = Matrix::new(service, vec![seeded.clone()]);
        let mut log = Changelog::new();
        log.record_price(CellKey::new(seeded.id, 50), 9);
        let held: HashSet<CellKey> = [CellKey::new(seeded.id, 500)].into_iter().collect();

        let reconciler = Reconciler::new(store.clone(), ReconcilerConfig::default());
        let report = reconciler.reconcile(service, &working, &baseline, &log, &held).await.unwrap();

        assert!(report.is_success());
        assert!(matches!(
            store.write_calls().await.as_slice(),
            [StoreCall::UpdateTier { price_cents: Some(9), .. }]
        ));
    }
}
