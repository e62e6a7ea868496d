use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Deserialize;
use tracing::{info, warn};

use crate::service::{ServiceDefinition, builtin_services};

/// Hardened service lookup table.
///
/// Merges the compiled-in built-ins with optional user entries from a YAML
/// file. Built-in names are protected: while the process runs, `get` on a
/// built-in name always returns the built-in definition, whatever the user
/// file says.
///
/// Lookups read an immutable snapshot swapped atomically on [`reload`], so
/// in-flight requests holding an old definition complete against it.
///
/// [`reload`]: ServiceRegistry::reload
pub struct ServiceRegistry {
    snapshot: ArcSwap<HashMap<String, Arc<ServiceDefinition>>>,
    builtin_names: HashSet<String>,
    user_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct UserServicesFile {
    #[serde(default)]
    services: Vec<ServiceDefinition>,
}

impl ServiceRegistry {
    /// Build a registry from built-ins plus an optional user services file.
    pub fn load(user_file: Option<PathBuf>) -> Self {
        let builtin_names = builtin_services().iter().map(|s| s.name.clone()).collect();
        let registry = Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
            builtin_names,
            user_file,
        };
        registry.reload();
        registry
    }

    /// Rebuild the snapshot: built-ins first, then user entries.
    ///
    /// An absent user file is silent; a malformed one is logged and the
    /// built-ins stand alone.
    pub fn reload(&self) {
        let mut map: HashMap<String, Arc<ServiceDefinition>> = builtin_services()
            .into_iter()
            .map(|s| (s.name.clone(), Arc::new(s)))
            .collect();

        if let Some(path) = &self.user_file {
            match Self::read_user_file(path) {
                Ok(entries) => {
                    for svc in entries {
                        if self.builtin_names.contains(&svc.name) {
                            warn!(
                                service = %svc.name,
                                "user config tried to override a built-in service; keeping the built-in"
                            );
                            continue;
                        }
                        map.insert(svc.name.clone(), Arc::new(svc));
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load user services; using built-ins only");
                }
            }
        }

        info!(services = map.len(), "service registry loaded");
        self.snapshot.store(Arc::new(map));
    }

    fn read_user_file(path: &Path) -> anyhow::Result<Vec<ServiceDefinition>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(path)?;
        let parsed: UserServicesFile = serde_yaml::from_str(&raw)?;

        let mut seen = HashSet::new();
        for svc in &parsed.services {
            if !seen.insert(svc.name.clone()) {
                anyhow::bail!("duplicate service name {:?} in user file", svc.name);
            }
        }

        // Invalid entries are skipped, valid siblings survive.
        let mut valid = Vec::with_capacity(parsed.services.len());
        for svc in parsed.services {
            match svc.validate() {
                Ok(()) => valid.push(svc),
                Err(e) => warn!(service = %svc.name, error = %e, "skipping invalid service entry"),
            }
        }
        Ok(valid)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServiceDefinition>> {
        self.snapshot.load().get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.snapshot.load().contains_key(name)
    }

    /// All active definitions, sorted by name.
    pub fn list(&self) -> Vec<Arc<ServiceDefinition>> {
        let mut all: Vec<_> = self.snapshot.load().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.snapshot.load().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.builtin_names.contains(name)
    }

    /// Register a definition at runtime. Built-in names are refused.
    pub fn register(&self, definition: ServiceDefinition) -> Result<(), crate::AquamanError> {
        definition.validate()?;
        if self.builtin_names.contains(&definition.name) {
            return Err(crate::AquamanError::InvalidInput(format!(
                "cannot register over built-in service {:?}",
                definition.name
            )));
        }
        self.insert(definition);
        Ok(())
    }

    /// Register without built-in protection. Not reachable from any config
    /// path; tests use it to point well-known services at local doubles.
    #[doc(hidden)]
    pub fn register_unchecked(&self, definition: ServiceDefinition) {
        self.insert(definition);
    }

    fn insert(&self, definition: ServiceDefinition) {
        let current = self.snapshot.load_full();
        let mut next: HashMap<String, Arc<ServiceDefinition>> = (*current).clone();
        next.insert(definition.name.clone(), Arc::new(definition));
        self.snapshot.store(Arc::new(next));
    }

    /// Hostname (or `*.domain` wildcard) → service name, for external
    /// interceptors that redirect host-based traffic through the proxy.
    pub fn build_host_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for svc in self.snapshot.load().values() {
            for pattern in &svc.host_patterns {
                map.insert(pattern.clone(), svc.name.clone());
            }
        }
        map
    }
}
