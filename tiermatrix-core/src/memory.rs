use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tiermatrix_shared::{
    ServiceId, Tier, TierDraft, TierId, TierPatch, Variant, VariantDraft, VariantId, VariantPatch,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::repository::{StoreResult, TierStore};
use crate::CoreError;

/// A store call as observed by [`MemoryTierStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    ListVariants,
    ListTiersForVariant { variant_id: Uuid },
    ListAllTiers,
    CreateVariant { display_name: String },
    UpdateVariant { variant_id: Uuid },
    DeleteVariant { variant_id: Uuid },
    CreateTier { variant_id: Uuid, min_quantity: u32, price_cents: i64 },
    UpdateTier { tier_id: TierId, price_cents: Option<i64> },
    DeleteTier { tier_id: TierId },
}

impl StoreCall {
    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            StoreCall::ListVariants | StoreCall::ListTiersForVariant { .. } | StoreCall::ListAllTiers
        )
    }
}

type FailureRule = Box<dyn Fn(&StoreCall) -> bool + Send + Sync>;

struct StoredVariant {
    service_id: ServiceId,
    variant: Variant,
}

struct StoredTier {
    service_id: ServiceId,
    variant_id: Uuid,
    tier: Tier,
}

#[derive(Default)]
struct MemoryState {
    variants: HashMap<Uuid, StoredVariant>,
    tiers: HashMap<TierId, StoredTier>,
}

/// In-process store used for local runs and tests.
///
/// Records every call, can inject failures per call and can add latency so
/// concurrent callers overlap.
pub struct MemoryTierStore {
    state: Mutex<MemoryState>,
    calls: Mutex<Vec<StoreCall>>,
    failures: Mutex<Vec<FailureRule>>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryTierStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            latency: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes every call matching `rule` fail until failures are cleared.
    pub async fn fail_when<F>(&self, rule: F)
    where
        F: Fn(&StoreCall) -> bool + Send + Sync + 'static,
    {
        self.failures.lock().await.push(Box::new(rule));
    }

    pub async fn clear_failures(&self) {
        self.failures.lock().await.clear();
    }

    pub async fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().await.clone()
    }

    pub async fn write_calls(&self) -> Vec<StoreCall> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.is_write())
            .cloned()
            .collect()
    }

    pub async fn reset_calls(&self) {
        self.calls.lock().await.clear();
        self.peak_in_flight.store(0, Ordering::SeqCst);
    }

    /// Highest number of calls that were in progress at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Inserts a variant with tiers directly, bypassing call recording.
    pub async fn seed_variant(
        &self,
        service_id: ServiceId,
        draft: VariantDraft,
        tiers: &[(u32, i64)],
    ) -> Variant {
        let id = Uuid::new_v4();
        let mut variant = variant_from_draft(id, &draft);
        let mut state = self.state.lock().await;
        for &(min_quantity, price_cents) in tiers {
            let tier_id = Uuid::new_v4();
            let tier = Tier::new(min_quantity, price_cents).with_id(tier_id);
            variant.tiers.push(tier.clone());
            state
                .tiers
                .insert(tier_id, StoredTier { service_id, variant_id: id, tier });
        }
        variant.tiers.sort_by_key(|t| t.min_quantity);
        let mut stored = variant.clone();
        stored.tiers.clear();
        state.variants.insert(id, StoredVariant { service_id, variant: stored });
        variant
    }

    /// Current persisted tiers of a variant, sorted by lower bound.
    pub async fn stored_tiers(&self, variant_id: Uuid) -> Vec<Tier> {
        let state = self.state.lock().await;
        sorted_tiers(&state, variant_id)
    }

    async fn enter(&self, call: StoreCall) -> StoreResult<InFlight<'_>> {
        self.calls.lock().await.push(call.clone());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight { store: self };

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let failing = self.failures.lock().await.iter().any(|rule| rule(&call));
        if failing {
            return Err(Box::new(CoreError::Unavailable(format!("injected failure on {:?}", call))));
        }
        Ok(guard)
    }
}

impl Default for MemoryTierStore {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlight<'a> {
    store: &'a MemoryTierStore,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.store.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn variant_from_draft(id: Uuid, draft: &VariantDraft) -> Variant {
    let mut variant = Variant::new(VariantId::Persisted(id), draft.display_name.clone(), draft.type_group)
        .with_parameters(draft.parameters.clone())
        .with_tiers(Vec::new());
    variant.parent_variant_id = draft.parent_variant_id;
    variant.sort_order = draft.sort_order;
    variant.is_active = draft.is_active;
    variant
}

fn sorted_tiers(state: &MemoryState, variant_id: Uuid) -> Vec<Tier> {
    let mut tiers: Vec<Tier> = state
        .tiers
        .values()
        .filter(|t| t.variant_id == variant_id)
        .map(|t| t.tier.clone())
        .collect();
    tiers.sort_by_key(|t| t.min_quantity);
    tiers
}

fn reject_unsaved_parent(parent: Option<VariantId>) -> StoreResult<()> {
    match parent {
        Some(VariantId::Local(n)) => Err(Box::new(CoreError::ValidationError(format!(
            "parent variant local-{} has not been saved",
            n
        )))),
        _ => Ok(()),
    }
}

#[async_trait]
impl TierStore for MemoryTierStore {
    async fn list_variants(&self, service_id: ServiceId) -> StoreResult<Vec<Variant>> {
        let _guard = self.enter(StoreCall::ListVariants).await?;
        let state = self.state.lock().await;
        let mut variants: Vec<Variant> = state
            .variants
            .values()
            .filter(|v| v.service_id == service_id)
            .map(|v| v.variant.clone())
            .collect();
        variants.sort_by_key(|v| v.sort_order);
        Ok(variants)
    }

    async fn list_tiers_for_variant(
        &self,
        service_id: ServiceId,
        variant_id: Uuid,
    ) -> StoreResult<Vec<Tier>> {
        let _guard = self.enter(StoreCall::ListTiersForVariant { variant_id }).await?;
        let state = self.state.lock().await;
        match state.variants.get(&variant_id) {
            Some(v) if v.service_id == service_id => Ok(sorted_tiers(&state, variant_id)),
            _ => Err(Box::new(CoreError::NotFound(format!("variant {}", variant_id)))),
        }
    }

    async fn list_all_tiers(&self, service_id: ServiceId) -> StoreResult<HashMap<Uuid, Vec<Tier>>> {
        let _guard = self.enter(StoreCall::ListAllTiers).await?;
        let state = self.state.lock().await;
        Ok(state
            .variants
            .iter()
            .filter(|(_, v)| v.service_id == service_id)
            .map(|(id, _)| (*id, sorted_tiers(&state, *id)))
            .collect())
    }

    async fn create_variant(&self, service_id: ServiceId, draft: &VariantDraft) -> StoreResult<Variant> {
        let _guard = self
            .enter(StoreCall::CreateVariant { display_name: draft.display_name.clone() })
            .await?;
        reject_unsaved_parent(draft.parent_variant_id)?;

        let id = Uuid::new_v4();
        let variant = variant_from_draft(id, draft);
        self.state
            .lock()
            .await
            .variants
            .insert(id, StoredVariant { service_id, variant: variant.clone() });
        Ok(variant)
    }

    async fn update_variant(
        &self,
        service_id: ServiceId,
        variant_id: Uuid,
        patch: &VariantPatch,
    ) -> StoreResult<Variant> {
        let _guard = self.enter(StoreCall::UpdateVariant { variant_id }).await?;
        reject_unsaved_parent(patch.parent_variant_id.flatten())?;

        let mut state = self.state.lock().await;
        let stored = state
            .variants
            .get_mut(&variant_id)
            .filter(|v| v.service_id == service_id)
            .ok_or_else(|| CoreError::NotFound(format!("variant {}", variant_id)))?;
        patch.apply(&mut stored.variant);
        Ok(stored.variant.clone())
    }

    async fn delete_variant(&self, service_id: ServiceId, variant_id: Uuid) -> StoreResult<()> {
        let _guard = self.enter(StoreCall::DeleteVariant { variant_id }).await?;
        let mut state = self.state.lock().await;
        let owned = state
            .variants
            .get(&variant_id)
            .is_some_and(|v| v.service_id == service_id);
        if !owned {
            return Err(Box::new(CoreError::NotFound(format!("variant {}", variant_id))));
        }
        state.variants.remove(&variant_id);
        state.tiers.retain(|_, t| t.variant_id != variant_id);
        Ok(())
    }

    async fn create_tier(
        &self,
        service_id: ServiceId,
        variant_id: Uuid,
        draft: &TierDraft,
    ) -> StoreResult<Tier> {
        let _guard = self
            .enter(StoreCall::CreateTier {
                variant_id,
                min_quantity: draft.min_quantity,
                price_cents: draft.price_cents,
            })
            .await?;

        let mut state = self.state.lock().await;
        if !state.variants.contains_key(&variant_id) {
            return Err(Box::new(CoreError::NotFound(format!("variant {}", variant_id))));
        }
        let duplicate = state
            .tiers
            .values()
            .any(|t| t.variant_id == variant_id && t.tier.min_quantity == draft.min_quantity);
        if duplicate {
            return Err(Box::new(CoreError::Conflict(format!(
                "variant {} already has a tier from {}",
                variant_id, draft.min_quantity
            ))));
        }

        let id = Uuid::new_v4();
        let tier = Tier {
            id: Some(id),
            min_quantity: draft.min_quantity,
            price_cents: draft.price_cents,
            is_active: draft.is_active,
        };
        state
            .tiers
            .insert(id, StoredTier { service_id, variant_id, tier: tier.clone() });
        Ok(tier)
    }

    async fn update_tier(
        &self,
        service_id: ServiceId,
        variant_id: Uuid,
        tier_id: TierId,
        patch: &TierPatch,
    ) -> StoreResult<Tier> {
        let _guard = self
            .enter(StoreCall::UpdateTier { tier_id, price_cents: patch.price_cents })
            .await?;

        let mut state = self.state.lock().await;
        if let Some(min) = patch.min_quantity {
            let collides = state.tiers.iter().any(|(id, t)| {
                *id != tier_id && t.variant_id == variant_id && t.tier.min_quantity == min
            });
            if collides {
                return Err(Box::new(CoreError::Conflict(format!(
                    "variant {} already has a tier from {}",
                    variant_id, min
                ))));
            }
        }
        let stored = state
            .tiers
            .get_mut(&tier_id)
            .filter(|t| t.service_id == service_id && t.variant_id == variant_id)
            .ok_or_else(|| CoreError::NotFound(format!("tier {}", tier_id)))?;
        patch.apply(&mut stored.tier);
        Ok(stored.tier.clone())
    }

    async fn delete_tier(&self, service_id: ServiceId, tier_id: TierId) -> StoreResult<()> {
        let _guard = self.enter(StoreCall::DeleteTier { tier_id }).await?;
        let mut state = self.state.lock().await;
        let owned = state
            .tiers
            .get(&tier_id)
            .is_some_and(|t| t.service_id == service_id);
        if !owned {
            return Err(Box::new(CoreError::NotFound(format!("tier {}", tier_id))));
        }
        state.tiers.remove(&tier_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiermatrix_shared::TypeGroupId;

    fn draft(name: &str) -> VariantDraft {
        VariantDraft {
            display_name: name.to_string(),
            type_group: TypeGroupId::new(),
            parent_variant_id: None,
            parameters: serde_json::Map::new(),
            sort_order: 0,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn test_batched_listing_matches_per_variant() {
        let store = MemoryTierStore::new();
        let service = Uuid::new_v4();
        let a = store.seed_variant(service, draft("A"), &[(1, 10), (50, 8)]).await;
        let b = store.seed_variant(service, draft("B"), &[(1, 7)]).await;
        store.seed_variant(Uuid::new_v4(), draft("other"), &[(1, 1)]).await;

        let batched = store.list_all_tiers(service).await.unwrap();
        assert_eq!(batched.len(), 2);
        for variant in [&a, &b] {
            let id = variant.id.persisted().unwrap();
            let single = store.list_tiers_for_variant(service, id).await.unwrap();
            assert_eq!(batched[&id], single);
        }
    }

    #[tokio::test]
    async fn test_duplicate_tier_rejected() {
        let store = MemoryTierStore::new();
        let service = Uuid::new_v4();
        let a = store.seed_variant(service, draft("A"), &[(1, 10)]).await;
        let id = a.id.persisted().unwrap();

        let result = store
            .create_tier(service, id, &TierDraft { min_quantity: 1, price_cents: 3, is_active: true })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_injected_failure_and_call_log() {
        let store = MemoryTierStore::new();
        let service = Uuid::new_v4();
        store
            .fail_when(|call| matches!(call, StoreCall::CreateVariant { .. }))
            .await;

        assert!(store.create_variant(service, &draft("A")).await.is_err());
        store.clear_failures().await;
        assert!(store.create_variant(service, &draft("A")).await.is_ok());
        assert_eq!(store.write_calls().await.len(), 2);

        store.list_variants(service).await.unwrap();
        assert_eq!(store.write_calls().await.len(), 2);
        assert_eq!(store.calls().await.len(), 3);
    }

    #[tokio::test]
    async fn test_unsaved_parent_rejected() {
        let store = MemoryTierStore::new();
        let mut d = draft("child");
        d.parent_variant_id = Some(VariantId::Local(4));
        assert!(store.create_variant(Uuid::new_v4(), &d).await.is_err());
    }
}
