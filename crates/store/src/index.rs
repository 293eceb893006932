use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kwatch_core::{Object, ObjectKey};
use rustc_hash::{FxHashMap, FxHashSet};

/// Read access to the last-known state, as needed by the resync diff.
pub trait KnownObjects: Send + Sync {
    fn get(&self, key: &ObjectKey) -> Option<Arc<Object>>;
    fn list_keys(&self) -> Vec<ObjectKey>;
}

#[derive(Default)]
struct StoreState {
    objects: FxHashMap<ObjectKey, Arc<Object>>,
    by_namespace: FxHashMap<String, FxHashSet<ObjectKey>>,
}

impl StoreState {
    fn insert(&mut self, key: &ObjectKey, obj: Arc<Object>) {
        if let Some(ns) = &key.namespace {
            self.by_namespace.entry(ns.clone()).or_default().insert(key.clone());
        }
        self.objects.insert(key.clone(), obj);
    }

    fn remove(&mut self, key: &ObjectKey) -> Option<Arc<Object>> {
        let prev = self.objects.remove(key);
        if let Some(ns) = &key.namespace {
            if let Some(keys) = self.by_namespace.get_mut(ns) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_namespace.remove(ns);
                }
            }
        }
        prev
    }
}

/// Writer half of a pipeline's object store. Not `Clone`: the dispatch loop is the only
/// writer; everyone else reads through [`StoreReader`].
pub struct IndexedStore {
    state: Arc<RwLock<StoreState>>,
}

/// Cheap, cloneable read-only view. Values are `Arc`s, so a reader never sees a partially
/// applied object.
#[derive(Clone)]
pub struct StoreReader {
    state: Arc<RwLock<StoreState>>,
}

impl IndexedStore {
    pub fn new() -> Self { Self { state: Arc::new(RwLock::new(StoreState::default())) } }

    pub fn reader(&self) -> StoreReader { StoreReader { state: Arc::clone(&self.state) } }

    /// Replace (`Some`) or remove (`None`) the entry for `key`; returns the previous value.
    pub fn apply(&mut self, key: &ObjectKey, obj: Option<Arc<Object>>) -> Option<Arc<Object>> {
        let mut st = self.write();
        match obj {
            Some(o) => {
                let prev = st.objects.get(key).cloned();
                st.insert(key, o);
                prev
            }
            None => st.remove(key),
        }
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<Object>> { self.reader().get(key) }

    pub fn len(&self) -> usize { self.reader().len() }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for IndexedStore {
    fn default() -> Self { Self::new() }
}

impl StoreReader {
    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<Object>> { self.read().objects.get(key).cloned() }


    pub fn len(&self) -> usize { self.read().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// All current objects, sorted by key.
    pub fn list(&self) -> Vec<Arc<Object>> {
        let mut out: Vec<Arc<Object>> = self.read().objects.values().cloned().collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn list_keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.read().objects.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Objects in one namespace, via the secondary index.
    pub fn by_namespace(&self, namespace: &str) -> Vec<Arc<Object>> {
        let st = self.read();
        let mut out: Vec<Arc<Object>> = match st.by_namespace.get(namespace) {
            Some(keys) => keys.iter().filter_map(|k| st.objects.get(k).cloned()).collect(),
            None => Vec::new(),
        };
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut ns: Vec<String> = self.read().by_namespace.keys().cloned().collect();
        ns.sort_unstable();
        ns
    }
}

impl KnownObjects for StoreReader {
    fn get(&self, key: &ObjectKey) -> Option<Arc<Object>> { StoreReader::get(self, key) }
    fn list_keys(&self) -> Vec<ObjectKey> { StoreReader::list_keys(self) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kwatch_core::ResourceKind;

    fn obj(ns: Option<&str>, name: &str, rv: &str) -> Arc<Object> {
        Arc::new(Object::new(ResourceKind::Pod, ObjectKey::new(ns, name), rv, serde_json::json!({})))
    }

    #[test]
    fn apply_maintains_namespace_index() {
        let mut store = IndexedStore::new();
        let reader = store.reader();
        let a = obj(Some("ns1"), "a", "1");
        let b = obj(Some("ns1"), "b", "1");
        let c = obj(None, "c", "1");
        store.apply(&a.key, Some(a.clone()));
        store.apply(&b.key, Some(b.clone()));
        store.apply(&c.key, Some(c.clone()));
        assert_eq!(reader.len(), 3);
        assert_eq!(reader.by_namespace("ns1").len(), 2);
        assert_eq!(reader.namespaces(), vec!["ns1".to_string()]);

        let prev = store.apply(&a.key, None);
        assert_eq!(prev.map(|p| p.resource_version.to_string()), Some("1".to_string()));
        assert_eq!(reader.by_namespace("ns1").len(), 1);
        store.apply(&b.key, None);
        assert!(reader.by_namespace("ns1").is_empty());
        assert!(reader.namespaces().is_empty());
        assert_eq!(reader.list_keys(), vec![c.key.clone()]);
    }

    #[test]
    fn apply_replaces_and_returns_previous() {
        let mut store = IndexedStore::new();
        let v1 = obj(Some("ns"), "a", "1");
        let v2 = obj(Some("ns"), "a", "2");
        assert!(store.apply(&v1.key, Some(v1.clone())).is_none());
        let prev = store.apply(&v2.key, Some(v2.clone()));
        assert_eq!(prev.unwrap().resource_version.as_str(), "1");
        assert_eq!(store.get(&v1.key).unwrap().resource_version.as_str(), "2");
        assert_eq!(store.len(), 1);
        assert!(store.apply(&ObjectKey::namespaced("ns", "missing"), None).is_none());
    }
}
