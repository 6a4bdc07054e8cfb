//! Lazy capability registry.
//!
//! Capability sets can be large and most entries are invoked rarely, so the
//! registry separates knowing about a capability from holding it in memory.
//! Registration installs a descriptor and a factory; discovery enumerates
//! descriptors without touching any factory; `load` instantiates on first
//! use and caches exactly one instance per name until `unload`.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

use super::capability::{infer_category, Capability, CapabilityDescriptor};

/// Factory resolving a capability implementation.
///
/// Returning `None` signals a resolution failure; the registry reports it to
/// the caller without caching anything, so the next `load` retries.
pub type CapabilityFactory = Arc<dyn Fn() -> Option<Arc<dyn Capability>> + Send + Sync>;

struct RegistryEntry {
    descriptor: CapabilityDescriptor,
    factory: CapabilityFactory,
}

/// Observability snapshot of the registry.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub discovered: usize,
    pub loaded: usize,
    /// `(discovered - loaded) / discovered`; 1.0 when nothing is loaded.
    pub memory_efficiency: f64,
}

/// Name-keyed registry with on-demand instantiation.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
    loaded: DashMap<String, Arc<dyn Capability>>,
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("discovered", &self.entries.read().len())
            .field("loaded", &self.loaded.len())
            .finish()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a capability's descriptor and factory.
    ///
    /// The category is inferred from the name's leading segment. Registering
    /// the same name again replaces the entry; a previously loaded instance
    /// stays cached until `unload`.
    pub fn register(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        factory: CapabilityFactory,
    ) {
        let name = name.into();
        let descriptor = CapabilityDescriptor {
            category: infer_category(&name),
            description: description.into(),
            name: name.clone(),
        };
        self.entries
            .write()
            .insert(name, RegistryEntry { descriptor, factory });
    }

    /// Whether a capability name is known (loaded or not).
    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Enumerate descriptors for every known capability, sorted by name.
    ///
    /// O(number of capabilities); never instantiates anything.
    pub fn discover(&self) -> Vec<CapabilityDescriptor> {
        let mut descriptors: Vec<_> = self
            .entries
            .read()
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Resolve and cache an instance for `name`.
    ///
    /// A cached instance is returned as-is; otherwise the factory runs and a
    /// successful result is cached. A racing `unload` is serialized through
    /// the cache's entry lock, so the caller either gets a fresh instance or
    /// the one removal has not yet acknowledged, never an instance whose
    /// removal was already observed elsewhere.
    pub fn load(&self, name: &str) -> Option<Arc<dyn Capability>> {
        if let Some(existing) = self.loaded.get(name) {
            return Some(Arc::clone(existing.value()));
        }
        let factory = {
            let entries = self.entries.read();
            Arc::clone(&entries.get(name)?.factory)
        };
        match self.loaded.entry(name.to_string()) {
            Entry::Occupied(occupied) => Some(Arc::clone(occupied.get())),
            Entry::Vacant(vacant) => {
                let instance = factory()?;
                vacant.insert(Arc::clone(&instance));
                Some(instance)
            }
        }
    }

    /// Drop the cached instance for `name`, reporting whether one existed.
    pub fn unload(&self, name: &str) -> bool {
        self.loaded.remove(name).is_some()
    }

    pub fn discovered_count(&self) -> usize {
        self.entries.read().len()
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    pub fn stats(&self) -> RegistryStats {
        let discovered = self.discovered_count();
        let loaded = self.loaded_count();
        let memory_efficiency = if discovered == 0 {
            1.0
        } else {
            (discovered.saturating_sub(loaded)) as f64 / discovered as f64
        };
        RegistryStats {
            discovered,
            loaded,
            memory_efficiency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CapabilityError;
    use crate::registry::capability::InvocationContext;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct EchoCapability {
        name: String,
    }

    #[async_trait]
    impl Capability for EchoCapability {
        fn name(&self) -> &str {
            &self.name
        }

        async fn invoke(
            &self,
            payload: Value,
            _ctx: &InvocationContext,
        ) -> Result<Value, CapabilityError> {
            Ok(payload)
        }
    }

    fn echo_factory(name: &str) -> CapabilityFactory {
        let name = name.to_string();
        Arc::new(move || {
            Some(Arc::new(EchoCapability { name: name.clone() }) as Arc<dyn Capability>)
        })
    }

    #[test]
    fn test_discover_never_loads() {
        let registry = CapabilityRegistry::new();
        for i in 0..50 {
            let name = format!("group_{}_tool", i);
            registry.register(name.as_str(), "a capability", echo_factory(&name));
        }
        let descriptors = registry.discover();
        assert_eq!(descriptors.len(), 50);
        assert_eq!(registry.loaded_count(), 0);
    }

    #[test]
    fn test_descriptor_category_inferred() {
        let registry = CapabilityRegistry::new();
        registry.register("document_extract", "extracts text", echo_factory("document_extract"));
        let descriptors = registry.discover();
        assert_eq!(descriptors[0].category, "document");
    }

    #[test]
    fn test_load_caches_single_instance() {
        let registry = CapabilityRegistry::new();
        let resolutions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&resolutions);
        registry.register(
            "tool_a",
            "test",
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Some(Arc::new(EchoCapability {
                    name: "tool_a".into(),
                }) as Arc<dyn Capability>)
            }),
        );

        let first = registry.load("tool_a").expect("loads");
        let second = registry.load("tool_a").expect("loads");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(resolutions.load(Ordering::SeqCst), 1);
        assert_eq!(registry.loaded_count(), 1);
    }

    #[test]
    fn test_resolution_failure_does_not_poison_cache() {
        let registry = CapabilityRegistry::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        registry.register(
            "flaky",
            "fails first",
            Arc::new(move || {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    None
                } else {
                    Some(Arc::new(EchoCapability {
                        name: "flaky".into(),
                    }) as Arc<dyn Capability>)
                }
            }),
        );

        assert!(registry.load("flaky").is_none());
        assert_eq!(registry.loaded_count(), 0);
        assert!(registry.load("flaky").is_some());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unload_reports_existence() {
        let registry = CapabilityRegistry::new();
        registry.register("tool_a", "test", echo_factory("tool_a"));
        assert!(!registry.unload("tool_a"));
        registry.load("tool_a");
        assert!(registry.unload("tool_a"));
        assert_eq!(registry.loaded_count(), 0);
    }

    #[test]
    fn test_unknown_name_load_is_none() {
        let registry = CapabilityRegistry::new();
        assert!(registry.load("missing").is_none());
    }

    #[test]
    fn test_stats_memory_efficiency() {
        let registry = CapabilityRegistry::new();
        for i in 0..4 {
            let name = format!("cat_{}", i);
            registry.register(name.as_str(), "test", echo_factory(&name));
        }
        registry.load("cat_0");
        let stats = registry.stats();
        assert_eq!(stats.discovered, 4);
        assert_eq!(stats.loaded, 1);
        assert!((stats.memory_efficiency - 0.75).abs() < f64::EPSILON);
    }
}
