//! Limiter scope identification.

use serde::{Deserialize, Serialize};

/// The limiter scope that made an admission decision.
///
/// Every call passes the global scope first; calls whose category is
/// registered additionally pass that category's scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// The process-wide quota shared by all categories
    Global,
    /// A per-category quota, keyed by category name
    Category(String),
}

impl Scope {
    /// Create a category scope.
    pub fn category(name: impl Into<String>) -> Self {
        Scope::Category(name.into())
    }

    /// Whether this is the global scope.
    pub fn is_global(&self) -> bool {
        matches!(self, Scope::Global)
    }

    /// The label used in logs and statistics.
    pub fn as_str(&self) -> &str {
        match self {
            Scope::Global => "global",
            Scope::Category(name) => name,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
