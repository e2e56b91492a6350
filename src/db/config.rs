use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::storage::{BytewiseComparator, KeyComparator, LeafOptions, UpdateFn};
use crate::types::{FtError, Result};

/// Runtime options for opening a [`crate::db::Tree`].
#[derive(Clone)]
pub struct TreeOptions {
    /// Key order shared by every leaf of the tree.
    pub comparator: Arc<dyn KeyComparator>,
    /// Function run by update messages. Trees without one must never receive them.
    pub update_fn: Option<Arc<dyn UpdateFn>>,
    /// Per-leaf knobs.
    pub leaf: LeafOptions,
    /// Whether [`crate::db::Tree::close`] checkpoints before returning.
    pub checkpoint_on_close: bool,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            comparator: Arc::new(BytewiseComparator),
            update_fn: None,
            leaf: LeafOptions::default(),
            checkpoint_on_close: true,
        }
    }
}

impl fmt::Debug for TreeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeOptions")
            .field("update_fn", &self.update_fn.is_some())
            .field("leaf", &self.leaf)
            .field("checkpoint_on_close", &self.checkpoint_on_close)
            .finish_non_exhaustive()
    }
}

impl TreeOptions {
    /// Replaces the key comparator.
    pub fn comparator(mut self, comparator: Arc<dyn KeyComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// Installs the update function.
    pub fn update_fn(mut self, update: Arc<dyn UpdateFn>) -> Self {
        self.update_fn = Some(update);
        self
    }

    /// Replaces the leaf options.
    pub fn leaf_options(mut self, leaf: LeafOptions) -> Self {
        self.leaf = leaf;
        self
    }

    /// Controls the checkpoint performed by close.
    pub fn checkpoint_on_close(mut self, enabled: bool) -> Self {
        self.checkpoint_on_close = enabled;
        self
    }
}

/// Serializable subset of [`TreeOptions`], read from TOML.
///
/// ```toml
/// checkpoint_on_close = true
///
/// [leaf]
/// max_versions = 4096
/// prune_on_apply = false
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TreeConfig {
    /// Checkpoint on close.
    pub checkpoint_on_close: bool,
    /// Per-leaf knobs.
    pub leaf: LeafOptions,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            checkpoint_on_close: true,
            leaf: LeafOptions::default(),
        }
    }
}

impl TreeConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|err| FtError::Config(err.to_string()))
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|err| FtError::Config(format!("{}: {err}", path.display())))
    }

    /// Renders the config back to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|err| FtError::Config(err.to_string()))
    }

    /// Default runtime options with this config's knobs applied.
    pub fn into_options(self) -> TreeOptions {
        TreeOptions::default()
            .leaf_options(self.leaf)
            .checkpoint_on_close(self.checkpoint_on_close)
    }
}
