//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Default bound on nested derived permissions.
pub const DEFAULT_MAX_DERIVATION_DEPTH: usize = 16;

/// Settings shared by every call made through an [`crate::Engine`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Load associations that a record doesn't carry yet instead of failing
    /// with [`crate::AuthorizationError::NotLoaded`]. Only takes effect
    /// when a loader is supplied with the call.
    pub load_associations: bool,
    /// How many derived permissions may be nested inside one another
    /// before the call fails with
    /// [`crate::AuthorizationError::DerivationDepthExceeded`].
    pub max_derivation_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            load_associations: false,
            max_derivation_depth: DEFAULT_MAX_DERIVATION_DEPTH,
        }
    }
}

impl Config {
    /// Sets [`Config::load_associations`].
    pub fn load_associations(mut self, enabled: bool) -> Self {
        self.load_associations = enabled;
        self
    }

    /// Sets [`Config::max_derivation_depth`].
    pub fn max_derivation_depth(mut self, depth: usize) -> Self {
        self.max_derivation_depth = depth;
        self
    }
}
