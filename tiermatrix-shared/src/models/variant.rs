use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids::{ServiceId, TypeGroupId, VariantId};
use super::tier::Tier;

/// Legacy parameter key that used to carry the parent reference.
pub const PARENT_VARIANT_KEY: &str = "parentVariantId";

/// One priced variant of a service (e.g. a paper type, a density, a finish).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    pub display_name: String,
    pub type_group: TypeGroupId,
    /// Weak, non-owning reference to a level-1 variant. Never cascades.
    pub parent_variant_id: Option<VariantId>,
    pub parameters: Map<String, Value>,
    pub sort_order: i32,
    pub is_active: bool,
    pub tiers: Vec<Tier>,
}

impl Variant {
    pub fn new(id: VariantId, display_name: impl Into<String>, type_group: TypeGroupId) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            type_group,
            parent_variant_id: None,
            parameters: Map::new(),
            sort_order: 0,
            is_active: true,
            tiers: vec![Tier::default_tier()],
        }
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_parent(mut self, parent: VariantId) -> Self {
        self.parent_variant_id = Some(parent);
        self
    }

    pub fn with_tiers(mut self, tiers: Vec<Tier>) -> Self {
        self.tiers = tiers;
        self
    }

    /// Moves a `parentVariantId` found in the parameter bag into the typed field.
    ///
    /// Values that are not a variant id (null, numbers from older rows) stay in
    /// the bag untouched.
    pub fn lift_parent_reference(&mut self) {
        if self.parent_variant_id.is_some() {
            return;
        }
        let parsed = self
            .parameters
            .get(PARENT_VARIANT_KEY)
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<VariantId>().ok());
        if let Some(parent) = parsed {
            self.parameters.remove(PARENT_VARIANT_KEY);
            self.parent_variant_id = Some(parent);
        }
    }

    pub fn tier_at(&self, min_quantity: u32) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.min_quantity == min_quantity)
    }

    pub fn tier_at_mut(&mut self, min_quantity: u32) -> Option<&mut Tier> {
        self.tiers.iter_mut().find(|t| t.min_quantity == min_quantity)
    }

    pub fn draft(&self) -> VariantDraft {
        VariantDraft {
            display_name: self.display_name.clone(),
            type_group: self.type_group,
            parent_variant_id: self.parent_variant_id,
            parameters: self.parameters.clone(),
            sort_order: self.sort_order,
            is_active: self.is_active,
        }
    }
}

/// Payload for creating a variant in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantDraft {
    pub display_name: String,
    pub type_group: TypeGroupId,
    pub parent_variant_id: Option<VariantId>,
    pub parameters: Map<String, Value>,
    pub sort_order: i32,
    pub is_active: bool,
}

/// Partial variant update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantPatch {
    pub display_name: Option<String>,
    pub parameters: Option<Map<String, Value>>,
    /// `Some(None)` detaches the variant from its parent.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "double_option")]
    pub parent_variant_id: Option<Option<VariantId>>,
}

impl VariantPatch {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none() && self.parameters.is_none() && self.parent_variant_id.is_none()
    }

    pub fn apply(&self, variant: &mut Variant) {
        if let Some(name) = &self.display_name {
            variant.display_name = name.clone();
        }
        if let Some(parameters) = &self.parameters {
            variant.parameters = parameters.clone();
        }
        if let Some(parent) = self.parent_variant_id {
            variant.parent_variant_id = parent;
        }
    }

    /// Folds a later patch into this one.
    pub fn merge(&mut self, later: VariantPatch) {
        if later.display_name.is_some() {
            self.display_name = later.display_name;
        }
        if later.parameters.is_some() {
            self.parameters = later.parameters;
        }
        if later.parent_variant_id.is_some() {
            self.parent_variant_id = later.parent_variant_id;
        }
    }
}

mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T: Serialize, S: Serializer>(
        value: &Option<Option<T>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T: Deserialize<'de>, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Option<T>>, D::Error> {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

/// Every variant of one service, in display order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    pub service_id: ServiceId,
    pub variants: Vec<Variant>,
}

impl Matrix {
    pub fn new(service_id: ServiceId, mut variants: Vec<Variant>) -> Self {
        variants.sort_by_key(|v| v.sort_order);
        Self { service_id, variants }
    }

    pub fn get(&self, id: &VariantId) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == *id)
    }

    pub fn get_mut(&mut self, id: &VariantId) -> Option<&mut Variant> {
        self.variants.iter_mut().find(|v| v.id == *id)
    }

    pub fn remove(&mut self, id: &VariantId) -> Option<Variant> {
        let index = self.variants.iter().position(|v| v.id == *id)?;
        Some(self.variants.remove(index))
    }

    pub fn next_sort_order(&self) -> i32 {
        self.variants.iter().map(|v| v.sort_order).max().map_or(0, |m| m + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_lift_parent_reference() {
        let parent = Uuid::new_v4();
        let mut params = Map::new();
        params.insert(PARENT_VARIANT_KEY.to_string(), Value::String(parent.to_string()));
        params.insert("subType".to_string(), Value::String("A".to_string()));

        let mut variant = Variant::new(VariantId::Local(1), "Matte", TypeGroupId::new())
            .with_parameters(params);
        variant.lift_parent_reference();

        assert_eq!(variant.parent_variant_id, Some(VariantId::Persisted(parent)));
        assert!(!variant.parameters.contains_key(PARENT_VARIANT_KEY));
        assert!(variant.parameters.contains_key("subType"));
    }

    #[test]
    fn test_lift_ignores_numeric_parent() {
        let mut params = Map::new();
        params.insert(PARENT_VARIANT_KEY.to_string(), Value::from(7));
        let mut variant = Variant::new(VariantId::Local(1), "Matte", TypeGroupId::new())
            .with_parameters(params);
        variant.lift_parent_reference();

        assert_eq!(variant.parent_variant_id, None);
        assert!(variant.parameters.contains_key(PARENT_VARIANT_KEY));
    }

    #[test]
    fn test_patch_detach_parent() {
        let patch: VariantPatch =
            serde_json::from_value(serde_json::json!({ "parent_variant_id": null })).unwrap();
        assert_eq!(patch.parent_variant_id, Some(None));

        let patch: VariantPatch = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(patch.is_empty());
    }
}
