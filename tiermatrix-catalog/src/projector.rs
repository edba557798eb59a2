use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tiermatrix_shared::{CellKey, Matrix, Variant, VariantId};

use crate::hierarchy::{classify_level, HierarchyConfig, VariantLevel};
use crate::ranges::{ranges, TierRange};

/// One shared column of the matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonRange {
    pub min_quantity: u32,
    pub max_quantity: Option<u32>,
}

/// Union of every lower bound across every variant, with derived upper bounds.
pub fn common_ranges<'a, I>(variants: I) -> Vec<CommonRange>
where
    I: IntoIterator<Item = &'a Variant>,
{
    let boundaries: Vec<u32> = variants
        .into_iter()
        .flat_map(|v| v.tiers.iter().map(|t| t.min_quantity))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    boundaries
        .iter()
        .enumerate()
        .map(|(i, &min_quantity)| CommonRange {
            min_quantity,
            max_quantity: boundaries.get(i + 1).map(|next| next - 1),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridCell {
    pub min_quantity: u32,
    pub price_cents: i64,
    /// The variant has no tier at this column yet; the price shown is zero.
    pub implicit: bool,
    /// A store write for this cell failed and has not been retried successfully.
    pub unsynced: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridRow {
    pub variant_id: VariantId,
    pub display_name: String,
    pub level: VariantLevel,
    /// Indentation of the row in the grid.
    pub depth: u8,
    /// The variant's own tiers with their upper bounds.
    pub ranges: Vec<TierRange>,
    pub cells: Vec<GridCell>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    pub columns: Vec<CommonRange>,
    pub rows: Vec<GridRow>,
}

/// Renders the matrix against its common columns.
pub fn build_grid(matrix: &Matrix, config: &HierarchyConfig, unsynced: &HashSet<CellKey>) -> Grid {
    let columns = common_ranges(&matrix.variants);

    let rows = matrix
        .variants
        .iter()
        .map(|variant| {
            let cells = columns
                .iter()
                .map(|column| {
                    let key = CellKey::new(variant.id, column.min_quantity);
                    match variant.tier_at(column.min_quantity) {
                        Some(tier) => GridCell {
                            min_quantity: column.min_quantity,
                            price_cents: tier.price_cents,
                            implicit: false,
                            unsynced: unsynced.contains(&key),
                        },
                        None => GridCell {
                            min_quantity: column.min_quantity,
                            price_cents: 0,
                            implicit: true,
                            unsynced: unsynced.contains(&key),
                        },
                    }
                })
                .collect();

            let level = classify_level(variant, config);
            GridRow {
                variant_id: variant.id,
                display_name: variant.display_name.clone(),
                level,
                depth: level.depth(),
                ranges: ranges(&variant.tiers),
                cells,
            }
        })
        .collect();

    Grid { columns, rows }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiermatrix_shared::{Tier, TypeGroupId};
    use uuid::Uuid;

    fn variant(n: u64, boundaries: &[(u32, i64)]) -> Variant {
        Variant::new(VariantId::Local(n), format!("V{}", n), TypeGroupId::new())
            .with_tiers(boundaries.iter().map(|&(m, p)| Tier::new(m, p)).collect())
    }

    #[test]
    fn test_union_of_boundaries() {
        let a = variant(1, &[(1, 10), (50, 8)]);
        let b = variant(2, &[(1, 12), (100, 9)]);

        let columns = common_ranges([&a, &b]);
        let mins: Vec<u32> = columns.iter().map(|c| c.min_quantity).collect();
        assert_eq!(mins, vec![1, 50, 100]);
        assert_eq!(columns[0].max_quantity, Some(49));
        assert_eq!(columns[1].max_quantity, Some(99));
        assert_eq!(columns[2].max_quantity, None);
    }

    #[test]
    fn test_empty_matrix_has_no_columns() {
        assert!(common_ranges(std::iter::empty::<&Variant>()).is_empty());
    }

    #[test]
    fn test_grid_marks_implicit_cells() {
        let a = variant(1, &[(1, 10), (50, 8)]);
        let b = variant(2, &[(1, 12), (100, 9)]);
        let matrix = Matrix::new(Uuid::new_v4(), vec![a, b]);

        let mut unsynced = HashSet::new();
        unsynced.insert(CellKey::new(VariantId::Local(2), 100));

        let grid = build_grid(&matrix, &HierarchyConfig::default(), &unsynced);
        assert_eq!(grid.columns.len(), 3);

        let row_a = &grid.rows[0];
        assert_eq!(row_a.cells[1].price_cents, 8);
        assert!(row_a.cells[2].implicit);
        assert_eq!(row_a.cells[2].price_cents, 0);

        assert_eq!(row_a.depth, 0);
        assert_eq!(row_a.ranges.len(), 2);
        assert_eq!(row_a.ranges[0].max_quantity, Some(49));
        assert_eq!(row_a.ranges[1].max_quantity, None);

        let row_b = &grid.rows[1];
        assert_eq!(row_b.ranges[0].max_quantity, Some(99));
        assert!(row_b.cells[1].implicit);
        assert!(row_b.cells[2].unsynced);
        assert!(!row_b.cells[0].unsynced);
    }
}
