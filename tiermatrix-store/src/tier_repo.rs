use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use tiermatrix_core::{CoreError, StoreResult, TierStore};
use tiermatrix_shared::{
    ServiceId, Tier, TierDraft, TierId, TierPatch, TypeGroupId, Variant, VariantDraft, VariantId,
    VariantPatch,
};
use tracing::info;
use uuid::Uuid;

/// PostgreSQL-backed tier store.
pub struct PgTierStore {
    pool: PgPool,
}

impl PgTierStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct VariantRow {
    id: Uuid,
    type_group: Uuid,
    display_name: String,
    parent_variant_id: Option<Uuid>,
    parameters: Value,
    sort_order: i32,
    is_active: bool,
}

impl VariantRow {
    fn into_variant(self) -> Variant {
        let mut variant = Variant::new(VariantId::Persisted(self.id), self.display_name, TypeGroupId(self.type_group))
            .with_tiers(Vec::new());
        variant.parent_variant_id = self.parent_variant_id.map(VariantId::Persisted);
        if let Value::Object(parameters) = self.parameters {
            variant.parameters = parameters;
        }
        variant.sort_order = self.sort_order;
        variant.is_active = self.is_active;
        variant
    }
}

#[derive(sqlx::FromRow)]
struct TierRow {
    id: Uuid,
    variant_id: Uuid,
    min_quantity: i32,
    price_cents: i64,
    is_active: bool,
}

impl TierRow {
    fn into_tier(self) -> StoreResult<Tier> {
        Ok(Tier {
            id: Some(self.id),
            min_quantity: u32::try_from(self.min_quantity)?,
            price_cents: self.price_cents,
            is_active: self.is_active,
        })
    }
}

const VARIANT_COLUMNS: &str =
    "id, type_group, display_name, parent_variant_id, parameters, sort_order, is_active";
const TIER_COLUMNS: &str = "id, variant_id, min_quantity, price_cents, is_active";

fn stored_parent(parent: Option<VariantId>) -> StoreResult<Option<Uuid>> {
    match parent {
        None => Ok(None),
        Some(VariantId::Persisted(id)) => Ok(Some(id)),
        Some(local) => Err(Box::new(CoreError::ValidationError(format!(
            "parent variant {} has not been saved",
            local
        )))),
    }
}

fn not_found(what: &str, id: Uuid) -> Box<dyn std::error::Error + Send + Sync> {
    Box::new(CoreError::NotFound(format!("{} {}", what, id)))
}

#[async_trait]
impl TierStore for PgTierStore {
    async fn list_variants(&self, service_id: ServiceId) -> StoreResult<Vec<Variant>> {
        let rows: Vec<VariantRow> = sqlx::query_as(&format!(
            "SELECT {} FROM variants WHERE service_id = $1 ORDER BY sort_order, created_at",
            VARIANT_COLUMNS
        ))
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(VariantRow::into_variant).collect())
    }

    async fn list_tiers_for_variant(&self, service_id: ServiceId, variant_id: Uuid) -> StoreResult<Vec<Tier>> {
        let rows: Vec<TierRow> = sqlx::query_as(&format!(
            "SELECT {} FROM tiers WHERE service_id = $1 AND variant_id = $2 ORDER BY min_quantity",
            TIER_COLUMNS
        ))
        .bind(service_id)
        .bind(variant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TierRow::into_tier).collect()
    }

    async fn list_all_tiers(&self, service_id: ServiceId) -> StoreResult<HashMap<Uuid, Vec<Tier>>> {
        let variant_ids: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM variants WHERE service_id = $1")
            .bind(service_id)
            .fetch_all(&self.pool)
            .await?;
        let rows: Vec<TierRow> = sqlx::query_as(&format!(
            "SELECT {} FROM tiers WHERE service_id = $1 ORDER BY variant_id, min_quantity",
            TIER_COLUMNS
        ))
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;

        let mut all: HashMap<Uuid, Vec<Tier>> =
            variant_ids.into_iter().map(|(id,)| (id, Vec::new())).collect();
        for row in rows {
            let variant_id = row.variant_id;
            all.entry(variant_id).or_default().push(row.into_tier()?);
        }
        Ok(all)
    }

    async fn create_variant(&self, service_id: ServiceId, draft: &VariantDraft) -> StoreResult<Variant> {
        let id = Uuid::new_v4();
        let parent = stored_parent(draft.parent_variant_id)?;

        let row: VariantRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO variants (id, service_id, type_group, display_name, parent_variant_id, parameters, sort_order, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            VARIANT_COLUMNS
        ))
        .bind(id)
        .bind(service_id)
        .bind(draft.type_group.0)
        .bind(&draft.display_name)
        .bind(parent)
        .bind(Value::Object(draft.parameters.clone()))
        .bind(draft.sort_order)
        .bind(draft.is_active)
        .fetch_one(&self.pool)
        .await?;

        info!("Variant created: {} ({})", id, draft.display_name);
        Ok(row.into_variant())
    }

    async fn update_variant(
        &self,
        service_id: ServiceId,
        variant_id: Uuid,
        patch: &VariantPatch,
    ) -> StoreResult<Variant> {
        let (set_parent, parent) = match patch.parent_variant_id {
            Some(parent) => (true, stored_parent(parent)?),
            None => (false, None),
        };

        let row: Option<VariantRow> = sqlx::query_as(&format!(
            r#"
            UPDATE variants SET
                display_name = COALESCE($3, display_name),
                parameters = COALESCE($4, parameters),
                parent_variant_id = CASE WHEN $5 THEN $6 ELSE parent_variant_id END,
                updated_at = NOW()
            WHERE service_id = $1 AND id = $2
            RETURNING {}
            "#,
            VARIANT_COLUMNS
        ))
        .bind(service_id)
        .bind(variant_id)
        .bind(patch.display_name.as_deref())
        .bind(patch.parameters.clone().map(Value::Object))
        .bind(set_parent)
        .bind(parent)
        .fetch_optional(&self.pool)
        .await?;

        row.map(VariantRow::into_variant)
            .ok_or_else(|| not_found("variant", variant_id))
    }

    async fn delete_variant(&self, service_id: ServiceId, variant_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM variants WHERE service_id = $1 AND id = $2")
            .bind(service_id)
            .bind(variant_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(not_found("variant", variant_id));
        }
        info!("Variant deleted: {}", variant_id);
        Ok(())
    }

    async fn create_tier(&self, service_id: ServiceId, variant_id: Uuid, draft: &TierDraft) -> StoreResult<Tier> {
        let row: TierRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO tiers (id, service_id, variant_id, min_quantity, price_cents, is_active)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            TIER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(service_id)
        .bind(variant_id)
        .bind(i32::try_from(draft.min_quantity)?)
        .bind(draft.price_cents)
        .bind(draft.is_active)
        .fetch_one(&self.pool)
        .await?;

        row.into_tier()
    }

    async fn update_tier(
        &self,
        service_id: ServiceId,
        variant_id: Uuid,
        tier_id: TierId,
        patch: &TierPatch,
    ) -> StoreResult<Tier> {
        let min_quantity = patch.min_quantity.map(i32::try_from).transpose()?;

        let row: Option<TierRow> = sqlx::query_as(&format!(
            r#"
            UPDATE tiers SET
                min_quantity = COALESCE($4, min_quantity),
                price_cents = COALESCE($5, price_cents),
                is_active = COALESCE($6, is_active),
                updated_at = NOW()
            WHERE service_id = $1 AND variant_id = $2 AND id = $3
            RETURNING {}
            "#,
            TIER_COLUMNS
        ))
        .bind(service_id)
        .bind(variant_id)
        .bind(tier_id)
        .bind(min_quantity)
        .bind(patch.price_cents)
        .bind(patch.is_active)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_tier(),
            None => Err(not_found("tier", tier_id)),
        }
    }

    async fn delete_tier(&self, service_id: ServiceId, tier_id: TierId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM tiers WHERE service_id = $1 AND id = $2")
            .bind(service_id)
            .bind(tier_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(not_found("tier", tier_id));
        }
        Ok(())
    }
}
