pub mod ranges;
pub mod projector;
pub mod hierarchy;

pub use ranges::{RangeError, TierRange};
pub use projector::{CommonRange, Grid, GridCell, GridRow};
pub use hierarchy::{HierarchyConfig, HierarchyNode, TypeGroup, VariantLevel};
