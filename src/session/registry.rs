use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::engine::{Module, ThreadRef};

/// Stable integer ids for native module objects across load/unload events.
/// Ids are assigned monotonically on first load and are the only module
/// identity ever surfaced to the client.
pub struct ModuleRegistry {
    next_id: i64,
    ids: HashMap<usize, i64>,
    modules: IndexMap<i64, Arc<dyn Module>>,
}

fn identity(module: &Arc<dyn Module>) -> usize {
    Arc::as_ptr(module) as *const () as usize
}

impl ModuleRegistry {
    pub fn new() -> Self {
        ModuleRegistry {
            next_id: 0,
            ids: HashMap::new(),
            modules: IndexMap::new(),
        }
    }

    /// Register a loaded module, assigning a fresh id. Re-registering the
    /// same object returns the existing id.
    pub fn register(&mut self, module: Arc<dyn Module>) -> i64 {
        let key = identity(&module);
        if let Some(id) = self.ids.get(&key) {
            return *id;
        }
        self.next_id += 1;
        let id = self.next_id;
        self.ids.insert(key, id);
        self.modules.insert(id, module);
        id
    }

    /// Remove an unloaded module. `None` means the object was never
    /// registered, which callers report as a logic error.
    pub fn deregister(&mut self, module: &Arc<dyn Module>) -> Option<i64> {
        let id = self.ids.remove(&identity(module))?;
        self.modules.shift_remove(&id);
        Some(id)
    }

    /// All registered modules in load order.
    pub fn snapshot(&self) -> Vec<(i64, Arc<dyn Module>)> {
        self.modules
            .iter()
            .map(|(id, module)| (*id, module.clone()))
            .collect()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Live thread objects keyed by native thread id.
pub struct ThreadRegistry {
    threads: HashMap<i64, Arc<dyn ThreadRef>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        ThreadRegistry {
            threads: HashMap::new(),
        }
    }

    pub fn register(&mut self, thread: Arc<dyn ThreadRef>) {
        self.threads.insert(thread.id(), thread);
    }

    pub fn remove(&mut self, id: i64) -> Option<Arc<dyn ThreadRef>> {
        self.threads.remove(&id)
    }

    pub fn get(&self, id: i64) -> Option<Arc<dyn ThreadRef>> {
        self.threads.get(&id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn ThreadRef>> {
        self.threads.values().cloned().collect()
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}
