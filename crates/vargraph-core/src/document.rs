//! Shared handle to the document being resolved
//!
//! Resolvers read the document (the `self` and `param` providers) while the
//! scheduler writes resolved values back into it, so the tree lives behind a
//! lock and every handle is a cheap clone of the same `Arc`.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::Result;
use crate::value::{ConfigPath, Value};

#[derive(Debug, Clone, Default)]
pub struct Document {
    root: Arc<RwLock<Value>>,
}

impl Document {
    pub fn new(root: Value) -> Self {
        Self {
            root: Arc::new(RwLock::new(root)),
        }
    }

    // A poisoned lock still holds a structurally valid tree; writers never
    // leave it half-updated.
    fn read(&self) -> RwLockReadGuard<'_, Value> {
        self.root.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Value> {
        self.root.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clone of the whole tree
    pub fn snapshot(&self) -> Value {
        self.read().clone()
    }

    /// Replace the whole tree
    pub fn restore(&self, root: Value) {
        *self.write() = root;
    }

    /// Clone of the value at `path`
    pub fn get(&self, path: &ConfigPath) -> Option<Value> {
        self.read().get(path).cloned()
    }

    /// String at `path`, if the value there is a string
    pub fn get_str(&self, path: &ConfigPath) -> Option<String> {
        self.read().get(path).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn contains(&self, path: &ConfigPath) -> bool {
        self.read().get(path).is_some()
    }

    pub fn set(&self, path: &ConfigPath, value: Value) -> Result<()> {
        self.write().set(path, value)
    }

    pub fn remove(&self, path: &ConfigPath) -> Option<Value> {
        self.write().remove(path)
    }

    /// Run `f` against the tree under the read lock
    pub fn with<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        f(&self.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(text: &str) -> ConfigPath {
        ConfigPath::parse(text).unwrap()
    }

    #[test]
    fn test_clones_share_the_tree() {
        let doc = Document::new(serde_yaml::from_str("a: 1").unwrap());
        let other = doc.clone();
        other.set(&path("b"), "two".into()).unwrap();

        assert_eq!(doc.get_str(&path("b")), Some("two".into()));
        assert!(doc.contains(&path("a")));
    }

    #[test]
    fn test_snapshot_restore() {
        let doc = Document::new(serde_yaml::from_str("a: 1").unwrap());
        let snap = doc.snapshot();
        doc.set(&path("a"), Value::Integer(2)).unwrap();
        doc.restore(snap);
        assert_eq!(doc.get(&path("a")), Some(Value::Integer(1)));
    }
}
