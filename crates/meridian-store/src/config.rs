//! Store configuration.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use meridian_skiplist::{GlobalNodeAlloc, NodeAlloc};

use crate::item::{
    new_exist_compare, new_insert_compare, new_iter_compare, ItemCmpFn, KeyComparator,
};

/// On-disk shard encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileFormat {
    /// Length-prefixed raw item streams.
    #[default]
    Raw,
    /// ForestDB-backed shards. Recognized for compatibility, but this build
    /// carries no forestdb backend and rejects it at the persistence
    /// boundary.
    Forestdb,
}

/// Configuration for a [`crate::Store`].
#[derive(Clone)]
pub struct Config {
    pub(crate) key_cmp: KeyComparator,
    pub(crate) ins_cmp: ItemCmpFn,
    pub(crate) iter_cmp: ItemCmpFn,
    pub(crate) exist_cmp: ItemCmpFn,
    pub(crate) snapshots_enabled: bool,
    pub(crate) ignore_item_size: bool,
    pub(crate) file_format: FileFormat,
    pub(crate) allocator: Arc<dyn NodeAlloc>,
}

fn default_key_cmp() -> KeyComparator {
    Arc::new(|a: &[u8], b: &[u8]| a.cmp(b))
}

impl Default for Config {
    fn default() -> Self {
        let mut cfg = Self {
            key_cmp: default_key_cmp(),
            ins_cmp: new_iter_compare(default_key_cmp()),
            iter_cmp: new_iter_compare(default_key_cmp()),
            exist_cmp: new_exist_compare(default_key_cmp()),
            snapshots_enabled: true,
            ignore_item_size: false,
            file_format: FileFormat::Raw,
            allocator: Arc::new(GlobalNodeAlloc),
        };
        cfg.set_key_comparator(default_key_cmp());
        cfg
    }
}

impl Config {
    /// Creates the default configuration: lexicographic keys, snapshots
    /// enabled, raw file format, global allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the ordering over user keys and derives the insert,
    /// iteration, and existence comparators from it.
    pub fn set_key_comparator(&mut self, key_cmp: KeyComparator) {
        self.ins_cmp = if self.snapshots_enabled {
            new_insert_compare(Arc::clone(&key_cmp))
        } else {
            new_iter_compare(Arc::clone(&key_cmp))
        };
        self.iter_cmp = new_iter_compare(Arc::clone(&key_cmp));
        self.exist_cmp = new_exist_compare(Arc::clone(&key_cmp));
        self.key_cmp = key_cmp;
    }

    /// Builder form of [`Config::set_key_comparator`].
    #[must_use]
    pub fn with_key_comparator(mut self, key_cmp: KeyComparator) -> Self {
        self.set_key_comparator(key_cmp);
        self
    }

    /// Convenience: key comparator from a plain function.
    #[must_use]
    pub fn with_key_comparator_fn(
        self,
        f: impl Fn(&[u8], &[u8]) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        self.with_key_comparator(Arc::new(f))
    }

    /// Disables snapshots. Without sequence-number tiebreaks the index
    /// keeps exactly one node per key, and [`crate::Writer::upsert`]
    /// becomes available.
    pub fn disable_snapshots(&mut self) {
        self.snapshots_enabled = false;
        self.ins_cmp = Arc::clone(&self.iter_cmp);
    }

    /// Builder form of [`Config::disable_snapshots`].
    #[must_use]
    pub fn with_snapshots_disabled(mut self) -> Self {
        self.disable_snapshots();
        self
    }

    /// Excludes item payload bytes from memory accounting.
    #[must_use]
    pub fn with_ignored_item_size(mut self) -> Self {
        self.ignore_item_size = true;
        self
    }

    /// Selects the on-disk shard encoding.
    #[must_use]
    pub fn with_file_format(mut self, format: FileFormat) -> Self {
        self.file_format = format;
        self
    }

    /// Substitutes the node allocator (e.g. an instrumented allocator in
    /// tests).
    #[must_use]
    pub fn with_allocator(mut self, allocator: Arc<dyn NodeAlloc>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Whether snapshots are enabled.
    pub fn snapshots_enabled(&self) -> bool {
        self.snapshots_enabled
    }

    /// The configured shard encoding.
    pub fn file_format(&self) -> FileFormat {
        self.file_format
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("snapshots_enabled", &self.snapshots_enabled)
            .field("ignore_item_size", &self.ignore_item_size)
            .field("file_format", &self.file_format)
            .finish()
    }
}
