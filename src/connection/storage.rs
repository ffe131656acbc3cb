use std::sync::{Arc, Mutex};
use rustc_hash::FxHashMap;
use tracing::debug;

struct Bucket<C> {
    by_name: FxHashMap<String, Arc<C>>,
    default_name: String,
}

/// Persistent connections by (remote URI, connection name). Each URI has a default connection
///  that is returned for unnamed lookups.
pub struct PersistentConnectionStorage<C> {
    buckets: Mutex<FxHashMap<String, Bucket<C>>>,
}

impl<C> Default for PersistentConnectionStorage<C> {
    fn default() -> Self {
        PersistentConnectionStorage {
            buckets: Default::default(),
        }
    }
}

impl<C> PersistentConnectionStorage<C> {
    pub fn new() -> PersistentConnectionStorage<C> {
        Default::default()
    }

    /// `None` as a name looks up the URI's default connection
    pub fn get(&self, uri: &str, name: Option<&str>) -> Option<Arc<C>> {
        let buckets = self.buckets.lock().unwrap();
        let bucket = buckets.get(uri)?;
        bucket.by_name.get(name.unwrap_or(&bucket.default_name)).cloned()
    }

    /// Stores a connection, returning the one previously stored under the same name. The first
    ///  connection for a URI becomes its default.
    pub fn insert(&self, uri: &str, name: &str, connection: Arc<C>) -> Option<Arc<C>> {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(uri.to_string())
            .or_insert_with(|| Bucket {
                by_name: Default::default(),
                default_name: name.to_string(),
            });
        bucket.by_name.insert(name.to_string(), connection)
    }

    /// Returns the existing connection, or stores the one produced by `create` - both under one
    ///  lock, so concurrent callers end up with the same connection.
    pub fn get_or_insert_with(&self, uri: &str, name: &str, create: impl FnOnce() -> Arc<C>) -> Arc<C> {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(uri.to_string())
            .or_insert_with(|| Bucket {
                by_name: Default::default(),
                default_name: name.to_string(),
            });
        bucket.by_name.entry(name.to_string())
            .or_insert_with(create)
            .clone()
    }

    /// Removes a connection. If it was the URI's default, an arbitrary remaining connection
    ///  becomes the new default; if it was the last one, the URI is forgotten.
    pub fn remove(&self, uri: &str, name: &str) -> Option<Arc<C>> {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.get_mut(uri)?;
        let removed = bucket.by_name.remove(name)?;

        match bucket.by_name.keys().next().cloned() {
            Some(new_default) => {
                if bucket.default_name == name {
                    debug!("connection '{}' to {} was the default - switching to '{}'", name, uri, new_default);
                    bucket.default_name = new_default;
                }
            }
            None => {
                buckets.remove(uri);
            }
        }
        Some(removed)
    }

    /// removes only if the stored connection is `connection` itself
    pub fn remove_if_same(&self, uri: &str, name: &str, connection: &Arc<C>) -> bool {
        match self.get(uri, Some(name)) {
            Some(existing) if Arc::ptr_eq(&existing, connection) => self.remove(uri, name).is_some(),
            _ => false,
        }
    }

    pub fn remove_all(&self, uri: &str) -> Vec<Arc<C>> {
        self.buckets.lock().unwrap()
            .remove(uri)
            .map(|bucket| bucket.by_name.into_values().collect())
            .unwrap_or_default()
    }

    pub fn default_name(&self, uri: &str) -> Option<String> {
        self.buckets.lock().unwrap()
            .get(uri)
            .map(|b| b.default_name.clone())
    }

    /// all connections as (uri, name, connection)
    pub fn all(&self) -> Vec<(String, String, Arc<C>)> {
        self.buckets.lock().unwrap()
            .iter()
            .flat_map(|(uri, bucket)| bucket.by_name.iter()
                .map(move |(name, c)| (uri.clone(), name.clone(), c.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().unwrap()
            .values()
            .map(|b| b.by_name.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.lock().unwrap().is_empty()
    }

    pub fn num_uris(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}
