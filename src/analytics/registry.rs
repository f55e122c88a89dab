use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::analytics::error::{invalid_reference, AnalyticsResult};
use crate::analytics::tracker::Tracker;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Issues a process-unique tracker handle.
pub(crate) fn next_tracker_handle() -> u64 {
    NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

/// Tracker id → tracker map owned by one engine, plus its default-tracker pointer.
#[derive(Debug, Default)]
pub(crate) struct TrackerRegistry {
    state: RwLock<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    trackers: HashMap<String, Tracker>,
    default: Option<DefaultTracker>,
}

/// Points at a registry entry without owning it. Resolves only while the entry it was taken
/// from is still registered.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DefaultTracker {
    tracker_id: String,
    handle: u64,
}

impl RegistryState {
    fn resolve(&self, token: &DefaultTracker) -> Option<&Tracker> {
        self.trackers
            .get(&token.tracker_id)
            .filter(|tracker| tracker.handle() == token.handle)
    }
}

impl TrackerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the tracker registered under `tracker_id`, creating it with `make` if absent.
    /// `make` receives a freshly issued handle and runs under the write lock.
    pub(crate) fn get_or_create<F>(&self, tracker_id: &str, make: F) -> Tracker
    where
        F: FnOnce(u64) -> Tracker,
    {
        if let Some(existing) = self.read().trackers.get(tracker_id) {
            return existing.clone();
        }
        self.write()
            .trackers
            .entry(tracker_id.to_string())
            .or_insert_with(|| make(next_tracker_handle()))
            .clone()
    }

    pub(crate) fn get(&self, tracker_id: &str) -> Option<Tracker> {
        self.read().trackers.get(tracker_id).cloned()
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().trackers.keys().cloned().collect();
        ids.sort();
        ids
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.read().trackers.len()
    }

    /// Unregisters and detaches the tracker. Clears the default pointer when it aliased the
    /// removed entry.
    pub(crate) fn remove(&self, tracker_id: &str) -> Option<Tracker> {
        let mut state = self.write();
        let removed = state.trackers.remove(tracker_id)?;
        if state
            .default
            .as_ref()
            .is_some_and(|token| token.tracker_id == tracker_id)
        {
            state.default = None;
        }
        drop(state);
        removed.detach();
        Some(removed)
    }

    /// Makes `tracker` the default. Fails without touching state unless `tracker` is the exact
    /// instance currently registered under its id.
    pub(crate) fn set_default(&self, tracker: &Tracker) -> AnalyticsResult<()> {
        let mut state = self.write();
        let owned = state
            .trackers
            .get(tracker.tracker_id())
            .is_some_and(|registered| registered == tracker);
        if !owned {
            return Err(invalid_reference(format!(
                "tracker '{}' (handle {}) was not issued by this registry",
                tracker.tracker_id(),
                tracker.handle()
            )));
        }
        state.default = Some(DefaultTracker {
            tracker_id: tracker.tracker_id().to_string(),
            handle: tracker.handle(),
        });
        Ok(())
    }

    pub(crate) fn default_tracker(&self) -> Option<Tracker> {
        let state = self.read();
        let token = state.default.as_ref()?;
        state.resolve(token).cloned()
    }

    /// Detaches and drops every tracker.
    pub(crate) fn clear(&self) {
        let drained: Vec<Tracker> = {
            let mut state = self.write();
            state.default = None;
            state.trackers.drain().map(|(_, tracker)| tracker).collect()
        };
        for tracker in drained {
            tracker.detach();
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state
            .write()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Weak};
    use std::thread;

    fn create(registry: &TrackerRegistry, id: &str) -> Tracker {
        registry.get_or_create(id, |handle| Tracker::new(handle, id, "cid", Weak::new()))
    }

    #[test]
    fn same_id_returns_same_tracker() {
        let registry = TrackerRegistry::new();
        let first = create(&registry, "UA-1");
        let second = create(&registry, "UA-1");
        let other = create(&registry, "UA-2");
        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_ne!(first.handle(), other.handle());
        assert_eq!(registry.ids(), vec!["UA-1".to_string(), "UA-2".to_string()]);
    }

    #[test]
    fn recreated_tracker_gets_fresh_handle() {
        let registry = TrackerRegistry::new();
        let original = create(&registry, "UA-1");
        let removed = registry.remove("UA-1").unwrap();
        assert_eq!(removed, original);
        assert!(!original.is_attached());

        let recreated = create(&registry, "UA-1");
        assert_ne!(recreated, original);
        assert_ne!(recreated.handle(), original.handle());
        assert!(registry.remove("UA-missing").is_none());
    }

    #[test]
    fn default_rejects_foreign_and_stale_trackers() {
        let registry = TrackerRegistry::new();
        let other_registry = TrackerRegistry::new();
        let ours = create(&registry, "UA-1");
        let foreign = create(&other_registry, "UA-1");

        registry.set_default(&ours).unwrap();
        let err = registry.set_default(&foreign).unwrap_err();
        assert_eq!(err.code_str(), "analytics/invalid-reference");
        assert_eq!(registry.default_tracker(), Some(ours.clone()));

        let impostor = Tracker::new(ours.handle(), "UA-1", "cid", Weak::new());
        assert!(registry.set_default(&impostor).is_err());
        assert_eq!(registry.default_tracker(), Some(ours.clone()));

        registry.remove("UA-1");
        assert_eq!(registry.default_tracker(), None);
        assert!(registry.set_default(&ours).is_err());
        create(&registry, "UA-1");
        assert_eq!(registry.default_tracker(), None);
    }

    #[test]
    fn removing_other_tracker_keeps_default() {
        let registry = TrackerRegistry::new();
        let keep = create(&registry, "UA-keep");
        create(&registry, "UA-drop");
        registry.set_default(&keep).unwrap();
        registry.remove("UA-drop");
        assert_eq!(registry.default_tracker(), Some(keep));
    }

    #[test]
    fn concurrent_creation_yields_one_instance() {
        let registry = Arc::new(TrackerRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || create(&registry, "UA-race").handle())
            })
            .collect();
        let issued: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(issued.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn clear_detaches_everything() {
        let registry = TrackerRegistry::new();
        let tracker = create(&registry, "UA-1");
        registry.set_default(&tracker).unwrap();
        registry.clear();
        assert!(!tracker.is_attached());
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.default_tracker(), None);
    }
}
