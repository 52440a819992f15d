use std::collections::HashMap;
use std::sync::Mutex;

/// First handle value ever issued. 0 is reserved as the "no handle"
/// sentinel (non-expandable variables), so issued handles never collide
/// with it.
const START_HANDLE: i32 = 1000;

/// Bidirectional int-handle registry with reset-on-continue semantics.
///
/// Handles are unique and monotonically increasing within one stopped
/// epoch; `reset` drops every entry and starts a fresh epoch (numbering
/// restarts, so handles must not be held across a resume). `create`,
/// `try_get` and `reset` can race across the engine callback thread and
/// the client request thread; a single interior mutex serializes them.
pub struct HandleTable<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    next: i32,
    entries: HashMap<i32, T>,
}

impl<T: Clone> HandleTable<T> {
    pub fn new() -> Self {
        HandleTable {
            inner: Mutex::new(Inner {
                next: START_HANDLE,
                entries: HashMap::new(),
            }),
        }
    }

    pub fn create(&self, value: T) -> i32 {
        let mut inner = self.inner.lock().unwrap();
        let handle = inner.next;
        inner.next += 1;
        inner.entries.insert(handle, value);
        handle
    }

    pub fn try_get(&self, handle: i32) -> Option<T> {
        self.inner.lock().unwrap().entries.get(&handle).cloned()
    }

    /// The entry with the smallest handle, if any. Used to evaluate
    /// console commands against the top stack frame.
    pub fn try_get_first(&self) -> Option<T> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .keys()
            .min()
            .copied()
            .and_then(|handle| inner.entries.get(&handle).cloned())
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.next = START_HANDLE;
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().entries.is_empty()
    }
}

impl<T: Clone> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
