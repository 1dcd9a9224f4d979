//! Copy-on-write routing table.

use std::collections::hash_map::DefaultHasher;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cluster::Overview;

/// Immutable domain -> endpoints map, least-loaded endpoint first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routes {
    entries: HashMap<String, Vec<String>>,
    fingerprint: u64,
}

impl Routes {
    /// Builds routes from an explicit domain -> endpoints map.
    ///
    /// Domains are lowercased. When two names lowercase to the same domain
    /// the first one is kept.
    pub fn new(entries: impl IntoIterator<Item = (String, Vec<String>)>) -> Self {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for (name, endpoints) in entries {
            match map.entry(name.to_lowercase()) {
                Entry::Vacant(slot) => {
                    slot.insert(endpoints);
                }
                Entry::Occupied(slot) => {
                    tracing::warn!(
                        service = %name,
                        domain = %slot.key(),
                        "service name collides with an existing domain, ignoring it"
                    );
                }
            }
        }
        let entries = map;
        let fingerprint = fingerprint(&entries);
        Self {
            entries,
            fingerprint,
        }
    }

    /// Projects every service of the overview onto `host:port` endpoints.
    ///
    /// Services without a published port produce no entry.
    pub fn from_overview(overview: &Overview) -> Self {
        Self::new(
            overview
                .services
                .iter()
                .filter(|service| !service.external_port.is_empty())
                .map(|service| {
                    let endpoints = service
                        .host_stats
                        .iter()
                        .map(|stat| format!("{}:{}", stat.host, service.external_port))
                        .collect();
                    (service.name.clone(), endpoints)
                }),
        )
    }

    /// Endpoints for a lowercased domain.
    pub fn get(&self, domain: &str) -> Option<&[String]> {
        self.entries.get(domain).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Structural hash over domain, endpoint order and ports.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Every endpoint of every domain.
    pub fn endpoints(&self) -> HashSet<&str> {
        self.entries
            .values()
            .flatten()
            .map(String::as_str)
            .collect()
    }

    /// Domains in sorted order.
    pub fn domains(&self) -> Vec<&str> {
        let mut domains: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        domains.sort_unstable();
        domains
    }
}

impl Default for Routes {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

fn fingerprint(entries: &HashMap<String, Vec<String>>) -> u64 {
    let sorted: BTreeMap<&String, &Vec<String>> = entries.iter().collect();
    let mut hasher = DefaultHasher::new();
    sorted.hash(&mut hasher);
    hasher.finish()
}

/// Shared routing table read by every proxied request.
///
/// Readers clone an `Arc` to the current [`Routes`] and never observe a
/// partially rebuilt table. Writers swap in a complete replacement.
pub struct RouteTable {
    current: RwLock<Arc<Routes>>,
    version: AtomicU64,
}

impl RouteTable {
    /// Creates a new empty routing table.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Routes::default())),
            version: AtomicU64::new(0),
        }
    }

    /// Current immutable routes.
    pub fn snapshot(&self) -> Arc<Routes> {
        Arc::clone(&self.current.read())
    }

    /// Replaces the table unless `routes` is structurally identical to it.
    ///
    /// Returns `true` when a swap happened.
    pub fn replace(&self, routes: Routes) -> bool {
        let mut current = self.current.write();
        if current.fingerprint == routes.fingerprint && **current == routes {
            return false;
        }
        *current = Arc::new(routes);
        self.version.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Rebuilds the table from an overview. See [`RouteTable::replace`].
    pub fn apply_overview(&self, overview: &Overview) -> bool {
        self.replace(Routes::from_overview(overview))
    }

    /// Number of swaps applied so far.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn route_count(&self) -> usize {
        self.current.read().len()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
