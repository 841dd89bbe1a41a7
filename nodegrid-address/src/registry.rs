//! Node address book, grounded in
//! `examples/original_source/libs/grd/include/grd/NodeRegistry.h`
//! (`scNodeRegistry`/`scRegistryEntry`): three independent indices over
//! one pool of entries — a role multimap, an exact name/path map, and a
//! handle map used for lifetime management — sharing the same
//! "an entry not bound to role *or* name *or* path is useless"
//! expectation the teacher's registries enforce for their own lookup
//! tables.

use crate::address::Address;
use nodegrid_shared::NodegridResult;
use std::collections::HashMap;
use std::time::Instant;

/// Mirrors `scRegEntryFeature` (`refPublic = 1`, `refDirectMode = 2`) as
/// a plain bitmask; the teacher's own codebase reaches for hand-rolled
/// bitmasks rather than a flags crate wherever the set is this small.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryFeatures(u32);

impl EntryFeatures {
    pub const PUBLIC: EntryFeatures = EntryFeatures(1);
    pub const DIRECT_MODE: EntryFeatures = EntryFeatures(2);

    pub const fn empty() -> Self {
        EntryFeatures(0)
    }

    pub const fn contains(self, other: EntryFeatures) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for EntryFeatures {
    type Output = EntryFeatures;

    fn bitor(self, rhs: EntryFeatures) -> EntryFeatures {
        EntryFeatures(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub handle: u64,
    pub address: String,
    pub features: EntryFeatures,
    pub share_time: Option<Instant>,
    pub end_time: Option<Instant>,
    pub services: Vec<String>,
}

impl RegistryEntry {
    fn new(handle: u64, address: String, features: EntryFeatures) -> Self {
        RegistryEntry {
            handle,
            address,
            features,
            share_time: None,
            end_time: None,
            services: Vec::new(),
        }
    }

    /// An entry is valid while it has no end time, or its end time is
    /// still in the future — `end_time == 0` in the teacher library
    /// means "never expires".
    pub fn is_valid(&self) -> bool {
        match self.end_time {
            None => true,
            Some(end) => end > Instant::now(),
        }
    }

    pub fn matches_service(&self, name: &str) -> bool {
        self.services.iter().any(|s| wildcard_match(s, name))
    }
}

/// Glob-style match of `pattern` (may contain `*`/`?`) against `text`,
/// grounded in `examples/original_source/libs/grd/src/grd/NodeRegistry.cpp`'s
/// `wildcardMatch()`. `*` matches any run of characters (including
/// none), `?` matches exactly one character.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let (mut star_idx, mut star_ti) = (None, 0usize);

    while ti < text.len() {
        if pi < pattern.len() && (pattern[pi] == '?' || pattern[pi] == text[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < pattern.len() && pattern[pi] == '*' {
            star_idx = Some(pi);
            star_ti = ti;
            pi += 1;
        } else if let Some(si) = star_idx {
            pi = si + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }
    while pi < pattern.len() && pattern[pi] == '*' {
        pi += 1;
    }
    pi == pattern.len()
}

/// Address book mapping roles, names, and virtual paths to concrete
/// [`nodegrid_address::Address`] strings.
#[derive(Debug, Default)]
pub struct Registry {
    next_handle: u64,
    handle_map: HashMap<u64, RegistryEntry>,
    /// role name -> ordered, address-deduplicated list of handles
    role_registry: HashMap<String, Vec<u64>>,
    /// exact name or virtual path -> handle (last registration wins,
    /// same as `scNameRegistryMap`'s plain `std::map` semantics)
    exact_registry: HashMap<String, u64>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn gen_next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Register under an exact, alphanumeric name.
    pub fn register_for_name(&mut self, address: &str, name: &str, features: EntryFeatures) -> u64 {
        let handle = self.gen_next_handle();
        self.handle_map
            .insert(handle, RegistryEntry::new(handle, address.to_string(), features));
        self.exact_registry.insert(name.to_string(), handle);
        handle
    }

    /// Register under `@role`; multiple nodes may share a role, and the
    /// same address registered twice under one role is deduplicated,
    /// keeping first-registered order.
    pub fn register_for_role(&mut self, address: &str, role: &str, features: EntryFeatures) -> u64 {
        let handle = self.gen_next_handle();
        self.handle_map
            .insert(handle, RegistryEntry::new(handle, address.to_string(), features));

        let handles = self.role_registry.entry(role.to_string()).or_default();
        let already_present = handles
            .iter()
            .filter_map(|h| self.handle_map.get(h))
            .any(|e| e.address == address);
        if !already_present {
            handles.push(handle);
        }
        handle
    }

    /// Register under an exact `//virtual/path`.
    pub fn register_for_path(&mut self, address: &str, path: &str, features: EntryFeatures) -> u64 {
        self.register_for_name(address, path, features)
    }

    /// Attach a service tag to every entry matching `source_key`, which
    /// is a role name (`@role`) or a concrete address string.
    pub fn register_node_service(&mut self, source_key: &str, service_name: &str) {
        if let Some(role) = source_key.strip_prefix('@') {
            if let Some(handles) = self.role_registry.get(role).cloned() {
                for h in handles {
                    if let Some(entry) = self.handle_map.get_mut(&h) {
                        entry.services.push(service_name.to_string());
                    }
                }
            }
        } else {
            for entry in self.handle_map.values_mut() {
                if entry.address == source_key {
                    entry.services.push(service_name.to_string());
                }
            }
        }
    }

    /// Remove every entry bound to `address`, `name`, and/or `role`.
    pub fn unregister_node(&mut self, address: &str, name: &str, role: &str) {
        if !name.is_empty() {
            self.exact_registry.remove(name);
        }
        let dead: Vec<u64> = self
            .handle_map
            .iter()
            .filter(|(_, e)| e.address == address)
            .map(|(h, _)| *h)
            .collect();
        for h in &dead {
            self.handle_map.remove(h);
        }
        if !role.is_empty() {
            if let Some(handles) = self.role_registry.get_mut(role) {
                handles.retain(|h| !dead.contains(h));
            }
        } else {
            for handles in self.role_registry.values_mut() {
                handles.retain(|h| !dead.contains(h));
            }
        }
        self.exact_registry.retain(|_, h| !dead.contains(h));
    }

    pub fn set_entry_share_time(&mut self, handle: u64, at: Instant) -> NodegridResult<()> {
        self.entry_mut(handle)?.share_time = Some(at);
        Ok(())
    }

    pub fn set_entry_end_time(&mut self, handle: u64, at: Instant) -> NodegridResult<()> {
        self.entry_mut(handle)?.end_time = Some(at);
        Ok(())
    }

    fn entry_mut(&mut self, handle: u64) -> NodegridResult<&mut RegistryEntry> {
        self.handle_map
            .get_mut(&handle)
            .ok_or(nodegrid_shared::NodegridError::RegistryHandleNotFound(handle))
    }

    pub fn is_registered(&self, address: &str) -> bool {
        self.handle_map.values().any(|e| e.address == address && e.is_valid())
    }

    /// An entry's reply address is the role name itself unless the
    /// entry is marked `DIRECT_MODE`, per spec §4.1's resolve() rule
    /// ("unless the entry is marked direct_contact, the role name
    /// itself is the reply address; otherwise the stored concrete
    /// address") and the original `getAddrListForRoleAndKey`
    /// (`examples/original_source/libs/grd/src/grd/NodeRegistry.cpp:299-321`).
    fn reply_addr_for(role: &str, entry: &RegistryEntry) -> String {
        if entry.features.contains(EntryFeatures::DIRECT_MODE) {
            entry.address.clone()
        } else {
            Address::role(role).to_wire_string()
        }
    }

    pub fn get_addr_list_for_role(&self, role: &str, public_only: bool) -> Vec<String> {
        self.role_registry
            .get(role)
            .into_iter()
            .flatten()
            .filter_map(|h| self.handle_map.get(h))
            .filter(|e| e.is_valid())
            .filter(|e| !public_only || e.features.contains(EntryFeatures::PUBLIC))
            .map(|e| Self::reply_addr_for(role, e))
            .collect()
    }

    pub fn get_addr_list_for_role_and_key(
        &self,
        role: &str,
        search_key: &str,
        public_only: bool,
    ) -> Vec<String> {
        self.role_registry
            .get(role)
            .into_iter()
            .flatten()
            .filter_map(|h| self.handle_map.get(h))
            .filter(|e| e.is_valid())
            .filter(|e| !public_only || e.features.contains(EntryFeatures::PUBLIC))
            .filter(|e| e.matches_service(search_key))
            .map(|e| Self::reply_addr_for(role, e))
            .collect()
    }

    pub fn get_addr_list_for_name(&self, name: &str) -> Vec<String> {
        self.exact_registry
            .get(name)
            .and_then(|h| self.handle_map.get(h))
            .filter(|e| e.is_valid())
            .map(|e| vec![e.address.clone()])
            .unwrap_or_default()
    }

    /// Virtual paths and exact names share the same index (they did in
    /// the teacher library too), so this is an alias of
    /// [`Registry::get_addr_list_for_name`].
    pub fn get_addr_list_for_path(&self, path: &str) -> Vec<String> {
        self.get_addr_list_for_name(path)
    }

    /// Remove all entries (from every index) whose `end_time` has
    /// elapsed — one pass, run periodically by the scheduler's sweep
    /// step.
    pub fn validate_entries(&mut self) {
        let dead: Vec<u64> = self
            .handle_map
            .iter()
            .filter(|(_, e)| !e.is_valid())
            .map(|(h, _)| *h)
            .collect();
        if dead.is_empty() {
            return;
        }
        for h in &dead {
            self.handle_map.remove(h);
        }
        self.exact_registry.retain(|_, h| !dead.contains(h));
        for handles in self.role_registry.values_mut() {
            handles.retain(|h| !dead.contains(h));
        }
        self.role_registry.retain(|_, handles| !handles.is_empty());
    }

    pub fn entry(&self, handle: u64) -> Option<&RegistryEntry> {
        self.handle_map.get(&handle)
    }

    pub fn len(&self) -> usize {
        self.handle_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handle_map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_resolves_by_role() {
        let mut reg = Registry::new();
        reg.register_for_role("svc::#hostA/n1/", "worker", EntryFeatures::PUBLIC);
        reg.register_for_role("svc::#hostB/n2/", "worker", EntryFeatures::PUBLIC);
        let addrs = reg.get_addr_list_for_role("worker", false);
        assert_eq!(addrs.len(), 2);
    }

    #[test]
    fn dedups_same_address_registered_twice_under_one_role() {
        let mut reg = Registry::new();
        reg.register_for_role("svc::#hostA/n1/", "worker", EntryFeatures::empty());
        reg.register_for_role("svc::#hostA/n1/", "worker", EntryFeatures::empty());
        assert_eq!(reg.get_addr_list_for_role("worker", false).len(), 1);
    }

    #[test]
    fn public_only_filters_non_public_entries() {
        let mut reg = Registry::new();
        reg.register_for_role("svc::#hostA/n1/", "worker", EntryFeatures::PUBLIC);
        reg.register_for_role("svc::#hostB/n2/", "worker", EntryFeatures::empty());
        assert_eq!(reg.get_addr_list_for_role("worker", true).len(), 1);
    }

    #[test]
    fn resolves_by_exact_name() {
        let mut reg = Registry::new();
        reg.register_for_name("svc::#hostA/n1/", "logger", EntryFeatures::empty());
        assert_eq!(
            reg.get_addr_list_for_name("logger"),
            vec!["svc::#hostA/n1/".to_string()]
        );
    }

    #[test]
    fn name_registration_is_last_write_wins() {
        let mut reg = Registry::new();
        reg.register_for_name("svc::#hostA/n1/", "logger", EntryFeatures::empty());
        reg.register_for_name("svc::#hostB/n2/", "logger", EntryFeatures::empty());
        assert_eq!(
            reg.get_addr_list_for_name("logger"),
            vec!["svc::#hostB/n2/".to_string()]
        );
    }

    #[test]
    fn service_tag_filters_role_lookup() {
        let mut reg = Registry::new();
        reg.register_for_role("svc::#hostA/n1/", "worker", EntryFeatures::DIRECT_MODE);
        reg.register_for_role("svc::#hostB/n2/", "worker", EntryFeatures::DIRECT_MODE);
        reg.register_node_service("svc::#hostA/n1/", "image-resize");
        let addrs = reg.get_addr_list_for_role_and_key("worker", "image-resize", false);
        assert_eq!(addrs, vec!["svc::#hostA/n1/".to_string()]);
    }

    #[test]
    fn service_tag_wildcard_matches_stored_pattern() {
        let mut reg = Registry::new();
        reg.register_for_role("svc::#hostA/n1/", "worker", EntryFeatures::DIRECT_MODE);
        reg.register_node_service("svc::#hostA/n1/", "image-*");
        let addrs = reg.get_addr_list_for_role_and_key("worker", "image-resize", false);
        assert_eq!(addrs, vec!["svc::#hostA/n1/".to_string()]);
        assert!(reg.get_addr_list_for_role_and_key("worker", "video-resize", false).is_empty());
    }

    #[test]
    fn role_lookup_without_direct_mode_returns_role_address() {
        let mut reg = Registry::new();
        reg.register_for_role("svc::#hostA/n1/", "worker", EntryFeatures::empty());
        let addrs = reg.get_addr_list_for_role("worker", false);
        assert_eq!(addrs, vec!["@worker".to_string()]);
    }

    #[test]
    fn role_lookup_with_direct_mode_returns_concrete_address() {
        let mut reg = Registry::new();
        reg.register_for_role("svc::#hostA/n1/", "worker", EntryFeatures::DIRECT_MODE);
        let addrs = reg.get_addr_list_for_role("worker", false);
        assert_eq!(addrs, vec!["svc::#hostA/n1/".to_string()]);
    }

    #[test]
    fn unregister_removes_from_every_index() {
        let mut reg = Registry::new();
        let h = reg.register_for_role("svc::#hostA/n1/", "worker", EntryFeatures::empty());
        reg.register_for_name("svc::#hostA/n1/", "primary", EntryFeatures::empty());
        reg.unregister_node("svc::#hostA/n1/", "primary", "worker");
        assert!(reg.entry(h).is_none());
        assert!(reg.get_addr_list_for_role("worker", false).is_empty());
        assert!(reg.get_addr_list_for_name("primary").is_empty());
    }

    #[test]
    fn validate_entries_sweeps_expired() {
        let mut reg = Registry::new();
        let h = reg.register_for_role("svc::#hostA/n1/", "worker", EntryFeatures::empty());
        reg.set_entry_end_time(h, Instant::now() - std::time::Duration::from_secs(1))
            .unwrap();
        reg.validate_entries();
        assert!(reg.entry(h).is_none());
        assert!(reg.get_addr_list_for_role("worker", false).is_empty());
    }

    #[test]
    fn is_registered_ignores_expired_entries() {
        let mut reg = Registry::new();
        let h = reg.register_for_name("svc::#hostA/n1/", "x", EntryFeatures::empty());
        assert!(reg.is_registered("svc::#hostA/n1/"));
        reg.set_entry_end_time(h, Instant::now() - std::time::Duration::from_secs(1))
            .unwrap();
        assert!(!reg.is_registered("svc::#hostA/n1/"));
    }
}
