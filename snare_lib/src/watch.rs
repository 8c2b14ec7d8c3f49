use std::hash::Hash;

use dashmap::DashMap;

/// Side table of resources that should show up by name in diagnostics,
/// e.g. file descriptors opened while a hook was watching.
///
/// A handle that is not in the table is simply not watched. Handles are
/// expected not to be reused while still watched, so the last `watch` wins.
#[derive(Debug)]
pub struct WatchRegistry<H: Eq + Hash = u64> {
    entries: DashMap<H, String>,
}

impl<H: Eq + Hash> Default for WatchRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Eq + Hash> WatchRegistry<H> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn watch(&self, handle: H, name: impl Into<String>) {
        self.entries.insert(handle, name.into());
    }

    /// Forgets `handle`. Returns the name it was watched under, if any.
    pub fn unwatch(&self, handle: &H) -> Option<String> {
        self.entries.remove(handle).map(|(_, name)| name)
    }

    pub fn is_watched(&self, handle: &H) -> bool {
        self.entries.contains_key(handle)
    }

    /// The name `handle` is watched under. Check [`is_watched`](Self::is_watched)
    /// first; an unwatched handle has no name.
    pub fn name_of(&self, handle: &H) -> Option<String> {
        self.entries.get(handle).map(|name| name.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn round_trip() {
        let registry = WatchRegistry::new();
        registry.watch(3u64, "foo");
        assert!(registry.is_watched(&3));
        assert_eq!(registry.name_of(&3).as_deref(), Some("foo"));

        assert_eq!(registry.unwatch(&3).as_deref(), Some("foo"));
        assert!(!registry.is_watched(&3));
        assert_eq!(registry.name_of(&3), None);
    }

    #[test]
    fn unwatching_unknown_handles_is_fine() {
        let registry: WatchRegistry = WatchRegistry::new();
        assert_eq!(registry.unwatch(&42), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn last_watch_wins() {
        let registry = WatchRegistry::new();
        registry.watch(7i32, "old.bin");
        registry.watch(7i32, "new.bin");
        assert_eq!(registry.name_of(&7).as_deref(), Some("new.bin"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn threads_share_the_table() {
        let registry = Arc::new(WatchRegistry::new());
        let workers = (0..8u64)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..100 {
                        let handle = worker * 1000 + i;
                        registry.watch(handle, format!("file-{}", handle));
                        if i % 2 == 0 {
                            registry.unwatch(&handle);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(registry.len(), 8 * 50);
        assert_eq!(registry.name_of(&1001).as_deref(), Some("file-1001"));
    }
}
