use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::RwLock;

/// Receives power-save transitions.
pub trait PowerSaveListener: Send + Sync + 'static {
    /// The port entered power-save.
    fn on_enter(&self);

    /// The port left power-save.
    fn on_exit(&self);
}

/// Identifies a registered [`PowerSaveListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// The listeners of a port.
///
/// Notifications iterate over a snapshot taken under a read lock, so listeners may register
/// or deregister from inside a callback.
#[derive(Default)]
pub struct Listeners {
    entries: RwLock<Vec<(ListenerId, Arc<dyn PowerSaveListener>)>>,
    next_id: AtomicU64,
}

impl Listeners {
    /// Creates an empty listener list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener. It is notified of every later transition.
    pub fn register(&self, listener: Arc<dyn PowerSaveListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, listener));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn deregister(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn notify_enter(&self) {
        for listener in self.snapshot() {
            listener.on_enter();
        }
    }

    pub(crate) fn notify_exit(&self) {
        for listener in self.snapshot() {
            listener.on_exit();
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn PowerSaveListener>> {
        self.entries.read().iter().map(|(_, listener)| Arc::clone(listener)).collect()
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners").field("len", &self.len()).finish()
    }
}
