use serde::{Deserialize, Serialize};
use tiermatrix_shared::Tier;

/// A tier as rendered: lower bound, derived upper bound, price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierRange {
    pub min_quantity: u32,
    /// `None` means unbounded.
    pub max_quantity: Option<u32>,
    pub price_cents: i64,
}

/// Sorts tiers by lower bound and restores the structural invariants.
///
/// An empty list becomes the single default tier. Duplicate lower bounds keep
/// the first occurrence, and the first tier is anchored at 1.
pub fn normalize(tiers: &[Tier]) -> Vec<Tier> {
    if tiers.is_empty() {
        return vec![Tier::default_tier()];
    }

    let mut sorted: Vec<Tier> = tiers
        .iter()
        .cloned()
        .map(|mut t| {
            t.min_quantity = t.min_quantity.max(1);
            t
        })
        .collect();
    sorted.sort_by_key(|t| t.min_quantity);
    sorted.dedup_by_key(|t| t.min_quantity);
    sorted[0].min_quantity = 1;
    sorted
}

/// Upper bound of the tier at `index`: next lower bound minus one, or unbounded.
pub fn max_quantity(tiers: &[Tier], index: usize) -> Option<u32> {
    tiers.get(index + 1).map(|next| next.min_quantity - 1)
}

pub fn ranges(tiers: &[Tier]) -> Vec<TierRange> {
    tiers
        .iter()
        .enumerate()
        .map(|(i, t)| TierRange {
            min_quantity: t.min_quantity,
            max_quantity: max_quantity(tiers, i),
            price_cents: t.price_cents,
        })
        .collect()
}

/// Splits the tier containing `boundary` so a new tier starts there.
///
/// Both halves keep the original price. Existing boundaries are left alone.
/// `boundary` must be at least 1; the caller validates that.
pub fn insert_boundary(tiers: &[Tier], boundary: u32) -> Vec<Tier> {
    let mut out = normalize(tiers);
    if boundary == 0 || out.iter().any(|t| t.min_quantity == boundary) {
        return out;
    }

    // The first tier starts at 1, so some tier always contains the boundary.
    let containing = out
        .iter()
        .rposition(|t| t.min_quantity <= boundary)
        .unwrap_or(0);
    let source = &out[containing];
    let right = Tier {
        id: None,
        min_quantity: boundary,
        price_cents: source.price_cents,
        is_active: source.is_active,
    };
    out.insert(containing + 1, right);
    out
}

/// Moves the lower bound of the tier at `index` to `new_boundary`.
///
/// Collisions with another tier, a zero boundary, an index out of range and
/// moving the first tier off 1 are all no-ops.
pub fn edit_boundary(tiers: &[Tier], index: usize, new_boundary: u32) -> Vec<Tier> {
    let mut out = normalize(tiers);
    if index == 0 || index >= out.len() || new_boundary == 0 {
        return out;
    }
    if out.iter().any(|t| t.min_quantity == new_boundary) {
        return out;
    }

    out[index].min_quantity = new_boundary;
    normalize(&out)
}

/// Deletes the tier at `index`; its neighbour absorbs the freed range.
///
/// Removing the first tier pulls the next one down to 1. A list with a
/// single tier is returned unchanged.
pub fn remove_range(tiers: &[Tier], index: usize) -> Vec<Tier> {
    let mut out = normalize(tiers);
    if out.len() <= 1 || index >= out.len() {
        return out;
    }

    out.remove(index);
    if index == 0 {
        out[0].min_quantity = 1;
    }
    normalize(&out)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("Tier list is empty")]
    Empty,

    #[error("First tier starts at {0}, expected 1")]
    FirstNotAnchored(u32),

    #[error("Tier {index} starts at {min_quantity}, not above the previous tier")]
    Unordered { index: usize, min_quantity: u32 },

    #[error("Negative price {price_cents} at tier starting {min_quantity}")]
    NegativePrice { min_quantity: u32, price_cents: i64 },
}

/// Checks a tier list without repairing it.
pub fn check_invariants(tiers: &[Tier]) -> Result<(), RangeError> {
    let first = tiers.first().ok_or(RangeError::Empty)?;
    if first.min_quantity != 1 {
        return Err(RangeError::FirstNotAnchored(first.min_quantity));
    }
    for (index, pair) in tiers.windows(2).enumerate() {
        if pair[1].min_quantity <= pair[0].min_quantity {
            return Err(RangeError::Unordered {
                index: index + 1,
                min_quantity: pair[1].min_quantity,
            });
        }
    }
    if let Some(t) = tiers.iter().find(|t| t.price_cents < 0) {
        return Err(RangeError::NegativePrice {
            min_quantity: t.min_quantity,
            price_cents: t.price_cents,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiers(pairs: &[(u32, i64)]) -> Vec<Tier> {
        pairs.iter().map(|&(min, price)| Tier::new(min, price)).collect()
    }

    fn pairs(tiers: &[Tier]) -> Vec<(u32, i64)> {
        tiers.iter().map(|t| (t.min_quantity, t.price_cents)).collect()
    }

    fn samples() -> Vec<Vec<Tier>> {
        vec![
            vec![],
            tiers(&[(1, 10)]),
            tiers(&[(1, 5), (50, 4), (500, 3)]),
            tiers(&[(500, 3), (1, 5), (50, 4)]),
            tiers(&[(3, 9), (10, 8), (10, 7)]),
            tiers(&[(0, 2), (1, 1), (1000, 0)]),
        ]
    }

    #[test]
    fn test_normalize_invariants() {
        for sample in samples() {
            let normalized = normalize(&sample);
            assert!(check_invariants(&normalized).is_ok(), "{:?}", normalized);

            let rendered = ranges(&normalized);
            let unbounded = rendered.iter().filter(|r| r.max_quantity.is_none()).count();
            assert_eq!(unbounded, 1);
            assert_eq!(rendered.last().unwrap().max_quantity, None);
            for pair in rendered.windows(2) {
                assert_eq!(pair[0].max_quantity, Some(pair[1].min_quantity - 1));
            }
        }
    }

    #[test]
    fn test_normalize_empty_yields_default() {
        assert_eq!(normalize(&[]), vec![Tier::default_tier()]);
    }

    #[test]
    fn test_normalize_keeps_first_duplicate() {
        let normalized = normalize(&tiers(&[(1, 5), (10, 8), (10, 7)]));
        assert_eq!(pairs(&normalized), vec![(1, 5), (10, 8)]);
    }

    #[test]
    fn test_insert_inherits_price() {
        let out = insert_boundary(&tiers(&[(1, 10)]), 200);
        assert_eq!(pairs(&out), vec![(1, 10), (200, 10)]);
        assert_eq!(max_quantity(&out, 0), Some(199));
        assert_eq!(max_quantity(&out, 1), None);
    }

    #[test]
    fn test_insert_splits_middle_tier() {
        let out = insert_boundary(&tiers(&[(1, 5), (50, 4), (500, 3)]), 100);
        assert_eq!(pairs(&out), vec![(1, 5), (50, 4), (100, 4), (500, 3)]);
    }

    #[test]
    fn test_insert_is_idempotent() {
        for sample in samples() {
            for boundary in [1, 2, 50, 75, 501, 10_000] {
                let once = insert_boundary(&sample, boundary);
                let twice = insert_boundary(&once, boundary);
                assert_eq!(once, twice);
            }
        }
    }

    #[test]
    fn test_insert_zero_is_ignored() {
        let base = tiers(&[(1, 5), (50, 4)]);
        assert_eq!(insert_boundary(&base, 0), base);
    }

    #[test]
    fn test_insert_then_remove_round_trip() {
        for sample in samples() {
            let base = normalize(&sample);
            for boundary in [2, 49, 75, 777, 5000] {
                if base.iter().any(|t| t.min_quantity == boundary) {
                    continue;
                }
                let inserted = insert_boundary(&base, boundary);
                let index = inserted
                    .iter()
                    .position(|t| t.min_quantity == boundary)
                    .unwrap();
                let restored = remove_range(&inserted, index);
                assert_eq!(restored, base);
            }
        }
    }

    #[test]
    fn test_remove_middle_range() {
        let out = remove_range(&tiers(&[(1, 5), (50, 4), (500, 3)]), 1);
        assert_eq!(pairs(&out), vec![(1, 5), (500, 3)]);
        assert_eq!(max_quantity(&out, 0), Some(499));
    }

    #[test]
    fn test_remove_first_pulls_next_down() {
        let out = remove_range(&tiers(&[(1, 5), (50, 4), (500, 3)]), 0);
        assert_eq!(pairs(&out), vec![(1, 4), (500, 3)]);
    }

    #[test]
    fn test_remove_never_empties() {
        let mut current = tiers(&[(1, 5), (50, 4), (500, 3)]);
        for _ in 0..5 {
            current = remove_range(&current, 0);
            assert!(!current.is_empty());
        }
        assert_eq!(pairs(&current), vec![(1, 3)]);
        assert_eq!(remove_range(&current, 0), current);
    }

    #[test]
    fn test_edit_boundary_moves_lower_bound() {
        let out = edit_boundary(&tiers(&[(1, 5), (50, 4), (500, 3)]), 1, 100);
        assert_eq!(pairs(&out), vec![(1, 5), (100, 4), (500, 3)]);
        assert_eq!(max_quantity(&out, 0), Some(99));
    }

    #[test]
    fn test_edit_boundary_collision_is_noop() {
        let base = tiers(&[(1, 5), (50, 4), (500, 3)]);
        assert_eq!(edit_boundary(&base, 1, 500), base);
        assert_eq!(edit_boundary(&base, 1, 50), base);
        assert_eq!(edit_boundary(&base, 0, 10), base);
        assert_eq!(edit_boundary(&base, 7, 10), base);
        assert_eq!(edit_boundary(&base, 2, 0), base);
    }

    #[test]
    fn test_edit_boundary_past_neighbour_resorts() {
        let out = edit_boundary(&tiers(&[(1, 5), (50, 4), (500, 3)]), 1, 600);
        assert_eq!(pairs(&out), vec![(1, 5), (500, 3), (600, 4)]);
    }

    #[test]
    fn test_check_invariants_reports_violations() {
        assert_eq!(check_invariants(&[]), Err(RangeError::Empty));
        assert_eq!(
            check_invariants(&tiers(&[(2, 1)])),
            Err(RangeError::FirstNotAnchored(2))
        );
        assert_eq!(
            check_invariants(&tiers(&[(1, 1), (10, 1), (10, 1)])),
            Err(RangeError::Unordered { index: 2, min_quantity: 10 })
        );
        assert!(matches!(
            check_invariants(&tiers(&[(1, -1)])),
            Err(RangeError::NegativePrice { .. })
        ));
    }
}
