pub mod app_config;
pub mod database;
pub mod redis_repo;
pub mod tier_repo;

pub use app_config::Config;
pub use database::DbClient;
pub use redis_repo::{RedisClient, RedisTierCache};
pub use tier_repo::PgTierStore;
