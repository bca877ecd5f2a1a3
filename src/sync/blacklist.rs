use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

/// Peers that failed for a given resource (a store, root, or data path).
/// Lives for one sync or propagation run.
#[derive(Debug, Default)]
pub struct Blacklist {
    entries: HashMap<String, HashSet<IpAddr>>,
}

impl Blacklist {
    pub fn add(&mut self, resource: &str, peer: IpAddr) -> bool {
        self.entries
            .entry(resource.to_string())
            .or_default()
            .insert(peer)
    }

    pub fn contains(&self, resource: &str, peer: &IpAddr) -> bool {
        self.entries
            .get(resource)
            .is_some_and(|peers| peers.contains(peer))
    }

    /// Blacklisted peers for `resource`.
    pub fn peers(&self, resource: &str) -> HashSet<IpAddr> {
        self.entries.get(resource).cloned().unwrap_or_default()
    }
}
