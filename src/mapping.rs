//! Filename mapping hook
//!
//! The engine calls [`FilenameMapping::map`] synchronously for every path the
//! sandboxed program touches. The installed function lives in an `ArcSwap`
//! slot: replacing it swaps the whole handle, so a caller on the engine side
//! sees either the old function or the new one, never a half-written one.

use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;

/// A filename mapping function. Must be total and side-effect free.
pub type MappingFn = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Shared, atomically replaceable filename mapping
#[derive(Clone)]
pub struct FilenameMapping {
    slot: Arc<ArcSwap<MappingFn>>,
}

impl FilenameMapping {
    /// Mapping that returns every path unchanged
    pub fn identity() -> Self {
        Self {
            slot: Arc::new(ArcSwap::from_pointee(identity_fn())),
        }
    }

    pub fn new(f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        let mapping = Self::identity();
        mapping.replace(f);
        mapping
    }

    /// Map a path through the currently installed function
    pub fn map(&self, path: &str) -> String {
        let current = self.slot.load();
        (**current)(path)
    }

    /// Install a new function; takes effect for the next `map` call
    pub fn replace(&self, f: impl Fn(&str) -> String + Send + Sync + 'static) {
        let f: MappingFn = Box::new(f);
        self.slot.store(Arc::new(f));
    }

    /// Restore the identity mapping
    pub fn reset(&self) {
        self.slot.store(Arc::new(identity_fn()));
    }
}

impl Default for FilenameMapping {
    fn default() -> Self {
        Self::identity()
    }
}

impl fmt::Debug for FilenameMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilenameMapping").finish_non_exhaustive()
    }
}

fn identity_fn() -> MappingFn {
    Box::new(|path: &str| path.to_string())
}

/// Mapping that re-roots absolute paths under `root`, leaving relative
/// paths alone
pub fn rooted(root: impl Into<String>) -> impl Fn(&str) -> String + Send + Sync + 'static {
    let root = root.into().trim_end_matches('/').to_string();
    move |path: &str| {
        if path.starts_with('/') {
            format!("{}{}", root, path)
        } else {
            path.to_string()
        }
    }
}
