pub mod events;
pub mod ids;
pub mod tier;
pub mod variant;
