use async_trait::async_trait;
use std::collections::HashMap;
use tiermatrix_shared::{ServiceId, Tier, TierDraft, TierId, TierPatch, Variant, VariantDraft, VariantPatch};
use uuid::Uuid;

pub type StoreResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Persistence collaborator for variants and their tiers.
///
/// Variant ids here are always store identities; unsaved variants never reach
/// the store.
#[async_trait]
pub trait TierStore: Send + Sync {
    /// Variants of a service, without tiers.
    async fn list_variants(&self, service_id: ServiceId) -> StoreResult<Vec<Variant>>;

    async fn list_tiers_for_variant(
        &self,
        service_id: ServiceId,
        variant_id: Uuid,
    ) -> StoreResult<Vec<Tier>>;

    /// Tiers of every variant of a service, keyed by variant id.
    ///
    /// Must match calling `list_tiers_for_variant` for each listed variant;
    /// implementations override it only to batch the reads.
    async fn list_all_tiers(&self, service_id: ServiceId) -> StoreResult<HashMap<Uuid, Vec<Tier>>> {
        let variants = self.list_variants(service_id).await?;
        let mut all = HashMap::with_capacity(variants.len());
        for variant in variants {
            let Some(id) = variant.id.persisted() else {
                continue;
            };
            let tiers = self.list_tiers_for_variant(service_id, id).await?;
            all.insert(id, tiers);
        }
        Ok(all)
    }

    async fn create_variant(&self, service_id: ServiceId, draft: &VariantDraft) -> StoreResult<Variant>;

    async fn update_variant(
        &self,
        service_id: ServiceId,
        variant_id: Uuid,
        patch: &VariantPatch,
    ) -> StoreResult<Variant>;

    async fn delete_variant(&self, service_id: ServiceId, variant_id: Uuid) -> StoreResult<()>;

    async fn create_tier(
        &self,
        service_id: ServiceId,
        variant_id: Uuid,
        draft: &TierDraft,
    ) -> StoreResult<Tier>;

    async fn update_tier(
        &self,
        service_id: ServiceId,
        variant_id: Uuid,
        tier_id: TierId,
        patch: &TierPatch,
    ) -> StoreResult<Tier>;

    async fn delete_tier(&self, service_id: ServiceId, tier_id: TierId) -> StoreResult<()>;

    /// Drops any cached `list_all_tiers` result for the service.
    async fn invalidate_cache(&self, _service_id: ServiceId) {}
}
