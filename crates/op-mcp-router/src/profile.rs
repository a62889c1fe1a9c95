//! Profile store
//!
//! Maps profile names to sets of server ids. Sets are shared as immutable
//! snapshots and replaced wholesale on mutation, so a reader always sees
//! either the old membership or the new one.

use crate::config::ProfileConfig;
use crate::error::{Result, RouterError};
use crate::namespace::ServerId;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::info;

/// Which servers a session may see.
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileScope {
    /// No profile: every currently registered server
    All,
    /// Members of a named profile
    Servers(Arc<BTreeSet<ServerId>>),
}

impl ProfileScope {
    pub fn servers<I: IntoIterator<Item = ServerId>>(ids: I) -> Self {
        Self::Servers(Arc::new(ids.into_iter().collect()))
    }

    pub fn includes(&self, server: &str) -> bool {
        match self {
            Self::All => true,
            Self::Servers(set) => set.contains(server),
        }
    }
}

/// Summary used by status tooling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileSummary {
    pub name: String,
    pub description: String,
    pub servers: BTreeSet<ServerId>,
    /// How many members are currently registered
    pub registered: usize,
}

/// One stored profile. The member set is handed out by reference count,
/// never copied, and replaced rather than edited.
#[derive(Debug, Clone, PartialEq)]
struct StoredProfile {
    description: String,
    servers: Arc<BTreeSet<ServerId>>,
}

impl StoredProfile {
    fn new(profile: ProfileConfig) -> Self {
        Self {
            description: profile.description,
            servers: Arc::new(profile.servers),
        }
    }

    fn matches(&self, profile: &ProfileConfig) -> bool {
        self.description == profile.description && *self.servers == profile.servers
    }
}

/// Named profiles.
#[derive(Default)]
pub struct ProfileStore {
    profiles: RwLock<HashMap<String, StoredProfile>>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(profiles: &BTreeMap<String, ProfileConfig>) -> Self {
        let profiles = profiles
            .iter()
            .map(|(name, profile)| (name.clone(), StoredProfile::new(profile.clone())))
            .collect();
        Self {
            profiles: RwLock::new(profiles),
        }
    }

    /// Resolve a profile name to a scope. Absent or empty means unrestricted.
    pub fn resolve(&self, name: Option<&str>) -> Result<ProfileScope> {
        let name = match name {
            None => return Ok(ProfileScope::All),
            Some(name) if name.trim().is_empty() => return Ok(ProfileScope::All),
            Some(name) => name,
        };

        self.profiles
            .read()
            .get(name)
            .map(|profile| ProfileScope::Servers(profile.servers.clone()))
            .ok_or_else(|| RouterError::ProfileNotFound { name: name.to_string() })
    }

    pub fn get(&self, name: &str) -> Option<ProfileConfig> {
        self.profiles.read().get(name).map(|p| ProfileConfig {
            description: p.description.clone(),
            servers: p.servers.as_ref().clone(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profiles.read().contains_key(name)
    }

    /// Profile names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Create a profile, or replace its membership if it exists.
    /// Returns true when the stored membership changed.
    pub fn create_profile<I>(&self, name: &str, servers: I) -> bool
    where
        I: IntoIterator<Item = ServerId>,
    {
        let servers: BTreeSet<ServerId> = servers.into_iter().collect();
        let mut profiles = self.profiles.write();
        let description = match profiles.get(name) {
            Some(existing) if *existing.servers == servers => return false,
            Some(existing) => existing.description.clone(),
            None => String::new(),
        };
        profiles.insert(name.to_string(), StoredProfile::new(ProfileConfig { description, servers }));
        info!("Updated profile: {}", name);
        true
    }

    /// Replace a profile wholesale. Returns true when anything changed.
    pub fn put(&self, name: &str, profile: ProfileConfig) -> bool {
        let mut profiles = self.profiles.write();
        if profiles.get(name).map(|p| p.matches(&profile)).unwrap_or(false) {
            return false;
        }
        profiles.insert(name.to_string(), StoredProfile::new(profile));
        info!("Updated profile: {}", name);
        true
    }

    pub fn add_server(&self, name: &str, server: ServerId) -> Result<bool> {
        self.modify(name, |servers| servers.insert(server))
    }

    pub fn remove_server(&self, name: &str, server: &str) -> Result<bool> {
        self.modify(name, |servers| servers.remove(server))
    }

    /// Returns false if the profile did not exist.
    pub fn delete_profile(&self, name: &str) -> bool {
        let removed = self.profiles.write().remove(name).is_some();
        if removed {
            info!("Deleted profile: {}", name);
        }
        removed
    }

    fn modify<F>(&self, name: &str, change: F) -> Result<bool>
    where
        F: FnOnce(&mut BTreeSet<ServerId>) -> bool,
    {
        let mut profiles = self.profiles.write();
        let current = profiles
            .get_mut(name)
            .ok_or_else(|| RouterError::ProfileNotFound { name: name.to_string() })?;

        let mut servers = current.servers.as_ref().clone();
        if !change(&mut servers) {
            return Ok(false);
        }
        current.servers = Arc::new(servers);
        Ok(true)
    }

    /// Per-profile membership counts against the registered server set.
    pub fn summaries(&self, registered: &BTreeSet<ServerId>) -> Vec<ProfileSummary> {
        let profiles = self.profiles.read();
        let mut summaries: Vec<ProfileSummary> = profiles
            .iter()
            .map(|(name, profile)| ProfileSummary {
                name: name.clone(),
                description: profile.description.clone(),
                servers: profile.servers.as_ref().clone(),
                registered: profile.servers.intersection(registered).count(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ServerId {
        ServerId::new(s).unwrap()
    }

    #[test]
    fn test_resolve_absent_and_unknown() {
        let store = ProfileStore::new();
        assert_eq!(store.resolve(None).unwrap(), ProfileScope::All);
        assert_eq!(store.resolve(Some("")).unwrap(), ProfileScope::All);
        assert!(matches!(
            store.resolve(Some("nope")),
            Err(RouterError::ProfileNotFound { ref name }) if name == "nope"
        ));
    }

    #[test]
    fn test_profile_may_reference_unregistered_server() {
        let store = ProfileStore::new();
        assert!(store.create_profile("dev", [id("fs"), id("later")]));

        let scope = store.resolve(Some("dev")).unwrap();
        assert!(scope.includes("later"));
        assert!(!scope.includes("git"));

        let registered: BTreeSet<_> = [id("fs"), id("git")].into_iter().collect();
        let summary = &store.summaries(&registered)[0];
        assert_eq!(summary.servers.len(), 2);
        assert_eq!(summary.registered, 1);
    }

    #[test]
    fn test_mutations() {
        let store = ProfileStore::new();
        assert!(store.add_server("dev", id("fs")).is_err());

        store.create_profile("dev", [id("fs")]);
        assert!(!store.create_profile("dev", [id("fs")]));
        assert!(store.add_server("dev", id("git")).unwrap());
        assert!(!store.add_server("dev", id("git")).unwrap());
        assert!(store.remove_server("dev", "fs").unwrap());
        assert!(!store.remove_server("dev", "fs").unwrap());

        assert_eq!(store.get("dev").unwrap().servers.into_iter().collect::<Vec<_>>(), vec![id("git")]);

        assert!(store.delete_profile("dev"));
        assert!(!store.delete_profile("dev"));
        assert!(store.resolve(Some("dev")).is_err());
    }

    #[test]
    fn test_resolve_shares_the_stored_set() {
        let store = ProfileStore::new();
        store.create_profile("dev", [id("fs"), id("git")]);

        let (ProfileScope::Servers(first), ProfileScope::Servers(second)) =
            (store.resolve(Some("dev")).unwrap(), store.resolve(Some("dev")).unwrap())
        else {
            panic!("named profile resolved to an unrestricted scope");
        };
        assert!(Arc::ptr_eq(&first, &second));

        store.add_server("dev", id("web")).unwrap();
        let ProfileScope::Servers(third) = store.resolve(Some("dev")).unwrap() else {
            panic!("named profile resolved to an unrestricted scope");
        };
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(first.len(), 2);
        assert_eq!(third.len(), 3);
    }

    #[test]
    fn test_snapshot_is_unaffected_by_later_mutation() {
        let store = ProfileStore::new();
        store.create_profile("dev", [id("fs")]);
        let before = store.resolve(Some("dev")).unwrap();

        store.add_server("dev", id("git")).unwrap();
        assert!(!before.includes("git"));
        assert!(store.resolve(Some("dev")).unwrap().includes("git"));
    }

    #[test]
    fn test_concurrent_readers_see_whole_sets() {
        let store = Arc::new(ProfileStore::new());
        store.create_profile("p", [id("a"), id("b")]);

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for _ in 0..500 {
                    store.create_profile("p", [id("c"), id("d")]);
                    store.create_profile("p", [id("a"), id("b")]);
                }
            })
        };
        for _ in 0..500 {
            if let ProfileScope::Servers(set) = store.resolve(Some("p")).unwrap() {
                let pair = (set.contains("a") && set.contains("b")) || (set.contains("c") && set.contains("d"));
                assert!(pair && set.len() == 2);
            }
        }
        writer.join().unwrap();
    }
}
