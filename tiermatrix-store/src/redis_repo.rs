use async_trait::async_trait;
use redis::{AsyncCommands, RedisResult};
use tiermatrix_core::{TierCache, TierSnapshot};
use tiermatrix_shared::ServiceId;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client })
    }

    pub async fn set_json(&self, key: &str, payload: &str, ttl_seconds: u64) -> RedisResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.set_ex::<_, _, ()>(key, payload, ttl_seconds).await
    }

    pub async fn get_json(&self, key: &str) -> RedisResult<Option<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.get(key).await
    }

    pub async fn del_key(&self, key: &str) -> RedisResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del(key).await
    }
}

/// `list_all_tiers` cache kept in Redis as JSON with a TTL.
pub struct RedisTierCache {
    redis: RedisClient,
    ttl_seconds: u64,
}

impl RedisTierCache {
    pub fn new(redis: RedisClient, ttl_seconds: u64) -> Self {
        Self { redis, ttl_seconds }
    }

    fn key(service_id: ServiceId) -> String {
        format!("tiers:{}", service_id)
    }
}

#[async_trait]
impl TierCache for RedisTierCache {
    async fn get(&self, service_id: ServiceId) -> Option<TierSnapshot> {
        let payload = match self.redis.get_json(&Self::key(service_id)).await {
            Ok(payload) => payload?,
            Err(e) => {
                warn!("Tier cache read failed for service {}: {}", service_id, e);
                return None;
            }
        };
        match serde_json::from_str(&payload) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Discarding unreadable tier cache entry for service {}: {}", service_id, e);
                None
            }
        }
    }

    async fn put(&self, service_id: ServiceId, tiers: &TierSnapshot) {
        let payload = match serde_json::to_string(tiers) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Could not encode tier snapshot for service {}: {}", service_id, e);
                return;
            }
        };
        if let Err(e) = self
            .redis
            .set_json(&Self::key(service_id), &payload, self.ttl_seconds)
            .await
        {
            warn!("Tier cache write failed for service {}: {}", service_id, e);
        }
    }

    async fn invalidate(&self, service_id: ServiceId) {
        debug!("Dropping cached tiers for service {}", service_id);
        if let Err(e) = self.redis.del_key(&Self::key(service_id)).await {
            warn!("Tier cache invalidation failed for service {}: {}", service_id, e);
        }
    }
}
