use serde::{Deserialize, Serialize};

/// Per-leaf knobs consulted by the applier.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeafOptions {
    /// Upper bound on versions a leaf may hold. `None` means unbounded.
    pub max_versions: Option<usize>,
    /// Whether the applier prunes a key's history right after mutating it.
    pub prune_on_apply: bool,
}

impl LeafOptions {
    /// Caps the number of versions a leaf may retain.
    pub fn max_versions(mut self, limit: usize) -> Self {
        self.max_versions = Some(limit);
        self
    }

    /// Enables or disables pruning of the touched key after each mutation.
    pub fn prune_on_apply(mut self, enabled: bool) -> Self {
        self.prune_on_apply = enabled;
        self
    }
}
