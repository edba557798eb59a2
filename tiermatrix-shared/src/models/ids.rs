use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type ServiceId = Uuid;
pub type TierId = Uuid;

/// Identity of a variant.
///
/// Variants created inside an edit session have no store identity until the
/// next flush, so they carry a session-local number instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VariantId {
    Persisted(Uuid),
    Local(u64),
}

impl VariantId {
    pub fn is_persisted(&self) -> bool {
        matches!(self, VariantId::Persisted(_))
    }

    pub fn persisted(&self) -> Option<Uuid> {
        match self {
            VariantId::Persisted(id) => Some(*id),
            VariantId::Local(_) => None,
        }
    }
}

impl fmt::Display for VariantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariantId::Persisted(id) => write!(f, "{}", id),
            VariantId::Local(n) => write!(f, "local-{}", n),
        }
    }
}

impl FromStr for VariantId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(n) = s.strip_prefix("local-") {
            return n
                .parse::<u64>()
                .map(VariantId::Local)
                .map_err(|_| format!("Invalid local variant id: {}", s));
        }
        Uuid::parse_str(s)
            .map(VariantId::Persisted)
            .map_err(|_| format!("Invalid variant id: {}", s))
    }
}

impl TryFrom<String> for VariantId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VariantId> for String {
    fn from(id: VariantId) -> Self {
        id.to_string()
    }
}

impl From<Uuid> for VariantId {
    fn from(id: Uuid) -> Self {
        VariantId::Persisted(id)
    }
}

/// Stable identifier of a type-group. Display names are labels only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeGroupId(pub Uuid);

impl TypeGroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TypeGroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TypeGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Addresses one price cell: a variant at a quantity breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellKey {
    pub variant_id: VariantId,
    pub min_quantity: u32,
}

impl CellKey {
    pub fn new(variant_id: VariantId, min_quantity: u32) -> Self {
        Self { variant_id, min_quantity }
    }
}
