use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tiermatrix_shared::{ServiceId, Tier, TierDraft, TierId, TierPatch, Variant, VariantDraft, VariantPatch};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::repository::{StoreResult, TierStore};

pub type TierSnapshot = HashMap<Uuid, Vec<Tier>>;

/// Short-lived cache for the batched tier listing of a service.
///
/// Cache backends are best effort: a broken cache behaves like a miss.
#[async_trait]
pub trait TierCache: Send + Sync {
    async fn get(&self, service_id: ServiceId) -> Option<TierSnapshot>;
    async fn put(&self, service_id: ServiceId, tiers: &TierSnapshot);
    async fn invalidate(&self, service_id: ServiceId);
}

pub struct MemoryTierCache {
    ttl: Duration,
    entries: RwLock<HashMap<ServiceId, (Instant, TierSnapshot)>>,
}

impl MemoryTierCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TierCache for MemoryTierCache {
    async fn get(&self, service_id: ServiceId) -> Option<TierSnapshot> {
        let entries = self.entries.read().await;
        entries
            .get(&service_id)
            .filter(|(stored_at, _)| stored_at.elapsed() < self.ttl)
            .map(|(_, tiers)| tiers.clone())
    }

    async fn put(&self, service_id: ServiceId, tiers: &TierSnapshot) {
        self.entries
            .write()
            .await
            .insert(service_id, (Instant::now(), tiers.clone()));
    }

    async fn invalidate(&self, service_id: ServiceId) {
        self.entries.write().await.remove(&service_id);
    }
}

/// Serves `list_all_tiers` from a [`TierCache`]; everything else passes through.
pub struct CachedTierStore {
    inner: Arc<dyn TierStore>,
    cache: Arc<dyn TierCache>,
}

impl CachedTierStore {
    pub fn new(inner: Arc<dyn TierStore>, cache: Arc<dyn TierCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl TierStore for CachedTierStore {
    async fn list_variants(&self, service_id: ServiceId) -> StoreResult<Vec<Variant>> {
        self.inner.list_variants(service_id).await
    }

    async fn list_tiers_for_variant(
        &self,
        service_id: ServiceId,
        variant_id: Uuid,
    ) -> StoreResult<Vec<Tier>> {
        self.inner.list_tiers_for_variant(service_id, variant_id).await
    }

    async fn list_all_tiers(&self, service_id: ServiceId) -> StoreResult<TierSnapshot> {
        if let Some(hit) = self.cache.get(service_id).await {
            debug!("Tier cache hit for service {}", service_id);
            return Ok(hit);
        }
        let tiers = self.inner.list_all_tiers(service_id).await?;
        self.cache.put(service_id, &tiers).await;
        Ok(tiers)
    }

    async fn create_variant(&self, service_id: ServiceId, draft: &VariantDraft) -> StoreResult<Variant> {
        self.inner.create_variant(service_id, draft).await
    }

    async fn update_variant(
        &self,
        service_id: ServiceId,
        variant_id: Uuid,
        patch: &VariantPatch,
    ) -> StoreResult<Variant> {
        self.inner.update_variant(service_id, variant_id, patch).await
    }

    async fn delete_variant(&self, service_id: ServiceId, variant_id: Uuid) -> StoreResult<()> {
        self.inner.delete_variant(service_id, variant_id).await
    }

    async fn create_tier(
        &self,
        service_id: ServiceId,
        variant_id: Uuid,
        draft: &TierDraft,
    ) -> StoreResult<Tier> {
        self.inner.create_tier(service_id, variant_id, draft).await
    }

    async fn update_tier(
        &self,
        service_id: ServiceId,
        variant_id: Uuid,
        tier_id: TierId,
        patch: &TierPatch,
    ) -> StoreResult<Tier> {
        self.inner.update_tier(service_id, variant_id, tier_id, patch).await
    }

    async fn delete_tier(&self, service_id: ServiceId, tier_id: TierId) -> StoreResult<()> {
        self.inner.delete_tier(service_id, tier_id).await
    }

    async fn invalidate_cache(&self, service_id: ServiceId) {
        debug!("Invalidating tier cache for service {}", service_id);
        self.cache.invalidate(service_id).await;
        self.inner.invalidate_cache(service_id).await;
    }
}
