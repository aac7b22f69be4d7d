use std::sync::Arc;

use dashmap::DashMap;

/// Shadow object table keyed by the application-visible raw handle.
///
/// Lookups hand out strong references, so a caller that resolved a handle
/// keeps the object alive even if it is removed from the table concurrently.
pub struct HandleTable<T> {
    kind: &'static str,
    objects: DashMap<u64, Arc<T>>,
}

impl<T> HandleTable<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            objects: DashMap::new(),
        }
    }

    /// Human-readable object kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Register an object under `raw`. Returns the object previously stored
    /// under that handle, which only happens when the driver recycles a
    /// handle value after its destroy call was intercepted.
    pub fn insert(&self, raw: u64, object: Arc<T>) -> Option<Arc<T>> {
        self.objects.insert(raw, object)
    }

    pub fn get(&self, raw: u64) -> Option<Arc<T>> {
        self.objects.get(&raw).map(|v| Arc::clone(v.value()))
    }

    /// Like [`HandleTable::get`], but with a typed error for unknown handles.
    pub fn try_get(&self, raw: u64) -> Result<Arc<T>, crate::LayerError> {
        self.get(raw).ok_or(crate::LayerError::UnknownHandle {
            kind: self.kind,
            raw,
        })
    }

    pub fn remove(&self, raw: u64) -> Option<Arc<T>> {
        self.objects.remove(&raw).map(|(_, v)| v)
    }

    pub fn contains(&self, raw: u64) -> bool {
        self.objects.contains_key(&raw)
    }

    /// Snapshot of all registered objects.
    pub fn values(&self) -> Vec<Arc<T>> {
        self.objects.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
