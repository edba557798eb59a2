use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tiermatrix_shared::{TypeGroupId, Variant, VariantId, PARENT_VARIANT_KEY};
use tracing::debug;

/// Structural row level of a variant in the matrix view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VariantLevel {
    Type,
    Variant,
    SubVariant,
}

impl VariantLevel {
    pub fn depth(&self) -> u8 {
        match self {
            VariantLevel::Type => 0,
            VariantLevel::Variant => 1,
            VariantLevel::SubVariant => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchyConfig {
    /// Parameter keys whose presence turns a type row into a variant row.
    pub discriminating_keys: Vec<String>,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            discriminating_keys: vec!["type".to_string(), "density".to_string()],
        }
    }
}

/// Derives the level from the variant's parent reference and parameters.
pub fn classify_level(variant: &Variant, config: &HierarchyConfig) -> VariantLevel {
    let legacy_parent = variant
        .parameters
        .get(PARENT_VARIANT_KEY)
        .is_some_and(|v| !v.is_null());
    if variant.parent_variant_id.is_some() || legacy_parent {
        return VariantLevel::SubVariant;
    }

    let discriminated = !variant.parameters.is_empty()
        && config
            .discriminating_keys
            .iter()
            .any(|key| variant.parameters.contains_key(key));
    if discriminated {
        VariantLevel::Variant
    } else {
        VariantLevel::Type
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyNode {
    pub variant_id: VariantId,
    pub display_name: String,
    pub level: VariantLevel,
    pub parameters: serde_json::Map<String, Value>,
    pub children: Vec<HierarchyNode>,
}

impl HierarchyNode {
    fn leaf(variant: &Variant, level: VariantLevel) -> Self {
        Self {
            variant_id: variant.id,
            display_name: variant.display_name.clone(),
            level,
            parameters: variant.parameters.clone(),
            children: Vec::new(),
        }
    }

    pub fn count(&self) -> usize {
        1 + self.children.iter().map(HierarchyNode::count).sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeGroup {
    pub id: TypeGroupId,
    pub label: String,
    pub roots: Vec<HierarchyNode>,
}

/// Builds the type → variant → sub-variant tree.
///
/// Variant rows hang under the group's first type row, or become roots when
/// the group has none. Sub-variants whose parent is not a variant row of the
/// same group are left out of the tree; they stay in the matrix.
pub fn group_by_type(variants: &[Variant], config: &HierarchyConfig) -> Vec<TypeGroup> {
    let mut order: Vec<TypeGroupId> = Vec::new();
    let mut members: HashMap<TypeGroupId, Vec<&Variant>> = HashMap::new();
    for variant in variants {
        members
            .entry(variant.type_group)
            .or_insert_with(|| {
                order.push(variant.type_group);
                Vec::new()
            })
            .push(variant);
    }

    order
        .into_iter()
        .map(|group_id| {
            let group = members.remove(&group_id).unwrap_or_default();
            build_group(group_id, &group, config)
        })
        .collect()
}

fn build_group(id: TypeGroupId, group: &[&Variant], config: &HierarchyConfig) -> TypeGroup {
    let mut types = Vec::new();
    let mut variant_rows = Vec::new();
    let mut sub_variants = Vec::new();
    for variant in group {
        match classify_level(variant, config) {
            VariantLevel::Type => types.push(HierarchyNode::leaf(variant, VariantLevel::Type)),
            VariantLevel::Variant => {
                variant_rows.push(HierarchyNode::leaf(variant, VariantLevel::Variant))
            }
            VariantLevel::SubVariant => sub_variants.push(*variant),
        }
    }

    for sub in sub_variants {
        let parent = match sub.parent_variant_id {
            Some(pid) => variant_rows.iter_mut().find(|n| n.variant_id == pid),
            None => None,
        };
        match parent {
            Some(node) => node
                .children
                .push(HierarchyNode::leaf(sub, VariantLevel::SubVariant)),
            None => debug!(
                "Sub-variant {} has no variant row parent in group {}, leaving it out",
                sub.id, id
            ),
        }
    }

    let label = types
        .first()
        .map(|n| n.display_name.clone())
        .or_else(|| group.first().map(|v| v.display_name.clone()))
        .unwrap_or_default();

    let roots = if types.is_empty() {
        variant_rows
    } else {
        types[0].children = variant_rows;
        types
    };

    TypeGroup { id, label, roots }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn variant(n: u64, group: TypeGroupId, name: &str, p: Value) -> Variant {
        Variant::new(VariantId::Local(n), name, group).with_parameters(params(p))
    }

    #[test]
    fn test_legacy_parent_is_sub_variant() {
        let config = HierarchyConfig::default();
        let v = variant(1, TypeGroupId::new(), "Gloss", json!({"parentVariantId": 7, "subType": "A"}));
        assert_eq!(classify_level(&v, &config), VariantLevel::SubVariant);

        let v = variant(1, TypeGroupId::new(), "Gloss", json!({"parentVariantId": null, "type": "x"}));
        assert_eq!(classify_level(&v, &config), VariantLevel::Variant);
    }

    #[test]
    fn test_levels() {
        let config = HierarchyConfig::default();
        let group = TypeGroupId::new();

        assert_eq!(classify_level(&variant(1, group, "Paper", json!({})), &config), VariantLevel::Type);
        assert_eq!(
            classify_level(&variant(2, group, "Paper", json!({"finish": "matte"})), &config),
            VariantLevel::Type
        );
        assert_eq!(
            classify_level(&variant(3, group, "Paper", json!({"density": ""})), &config),
            VariantLevel::Variant
        );
        let typed = variant(4, group, "Paper", json!({})).with_parent(VariantId::Local(3));
        assert_eq!(classify_level(&typed, &config), VariantLevel::SubVariant);
        assert_eq!(VariantLevel::SubVariant.depth(), 2);
    }

    #[test]
    fn test_group_tree() {
        let config = HierarchyConfig::default();
        let paper = TypeGroupId::new();
        let vinyl = TypeGroupId::new();

        let variants = vec![
            variant(1, paper, "Paper", json!({})),
            variant(2, paper, "Paper", json!({"density": "120g"})),
            variant(3, paper, "Paper", json!({"density": "300g"})),
            variant(4, paper, "Paper", json!({"subType": "A"})).with_parent(VariantId::Local(3)),
            variant(5, paper, "Paper", json!({})).with_parent(VariantId::Local(99)),
            variant(6, vinyl, "Vinyl", json!({"type": "outdoor"})),
        ];

        let groups = group_by_type(&variants, &config);
        assert_eq!(groups.len(), 2);

        let paper_group = &groups[0];
        assert_eq!(paper_group.label, "Paper");
        assert_eq!(paper_group.roots.len(), 1);
        let root = &paper_group.roots[0];
        assert_eq!(root.variant_id, VariantId::Local(1));
        assert_eq!(root.children.len(), 2);
        assert_eq!(root.children[1].children[0].variant_id, VariantId::Local(4));
        // orphan 5 is not rendered
        assert_eq!(root.count(), 4);

        let vinyl_group = &groups[1];
        assert_eq!(vinyl_group.roots.len(), 1);
        assert_eq!(vinyl_group.roots[0].level, VariantLevel::Variant);
    }

    #[test]
    fn test_same_name_different_groups_stay_apart() {
        let config = HierarchyConfig::default();
        let variants = vec![
            variant(1, TypeGroupId::new(), "Flyer", json!({})),
            variant(2, TypeGroupId::new(), "Flyer", json!({})),
        ];
        assert_eq!(group_by_type(&variants, &config).len(), 2);
    }

    #[test]
    fn test_orphan_reappears_when_parent_restored() {
        let config = HierarchyConfig::default();
        let group = TypeGroupId::new();
        let child = variant(3, group, "Paper", json!({})).with_parent(VariantId::Local(2));
        let root = variant(1, group, "Paper", json!({}));

        let without_parent = group_by_type(&[root.clone(), child.clone()], &config);
        assert_eq!(without_parent[0].roots[0].count(), 1);

        let parent = variant(2, group, "Paper", json!({"type": "a"}));
        let with_parent = group_by_type(&[root, parent, child], &config);
        assert_eq!(with_parent[0].roots[0].count(), 3);
    }
}
