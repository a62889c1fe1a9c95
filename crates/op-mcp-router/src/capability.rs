//! Namespaced capability catalog
//!
//! Each serving connection publishes its whole [`CapabilitySet`]; the
//! registry keeps one contribution per server and never touches another
//! server's entries when one changes.
//!
//! Besides the always-valid namespaced id, every capability may be reachable
//! under its original name (its friendly alias). The first server to publish
//! a name owns that alias. Later publishers either fall back to namespaced
//! ids (default) or are rejected outright (strict mode).

use crate::error::{Result, RouterError};
use crate::namespace::{self, CapabilityKind, ServerId};
use crate::profile::ProfileScope;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Capabilities reported by one server, keyed by original id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilitySet {
    pub tools: BTreeMap<String, Value>,
    pub prompts: BTreeMap<String, Value>,
    pub resources: BTreeMap<String, Value>,
    pub resource_templates: BTreeMap<String, Value>,
    /// Kinds the server answered a listing for
    pub reported: BTreeSet<CapabilityKind>,
}

impl CapabilitySet {
    pub fn entries(&self, kind: CapabilityKind) -> &BTreeMap<String, Value> {
        match kind {
            CapabilityKind::Tool => &self.tools,
            CapabilityKind::Prompt => &self.prompts,
            CapabilityKind::Resource => &self.resources,
            CapabilityKind::ResourceTemplate => &self.resource_templates,
        }
    }

    fn entries_mut(&mut self, kind: CapabilityKind) -> &mut BTreeMap<String, Value> {
        match kind {
            CapabilityKind::Tool => &mut self.tools,
            CapabilityKind::Prompt => &mut self.prompts,
            CapabilityKind::Resource => &mut self.resources,
            CapabilityKind::ResourceTemplate => &mut self.resource_templates,
        }
    }

    /// Record a successful listing.
    pub fn set(&mut self, kind: CapabilityKind, entries: BTreeMap<String, Value>) {
        *self.entries_mut(kind) = entries;
        self.reported.insert(kind);
    }

    pub fn with(mut self, kind: CapabilityKind, ids: &[&str]) -> Self {
        let key = kind.id_field();
        let entries = ids
            .iter()
            .map(|id| (id.to_string(), serde_json::json!({ key: id })))
            .collect();
        self.set(kind, entries);
        self
    }

    pub fn contains(&self, kind: CapabilityKind, id: &str) -> bool {
        self.entries(kind).contains_key(id)
    }

    /// A URI is readable if listed or matched by a listed template.
    pub fn can_read(&self, uri: &str) -> bool {
        self.resources.contains_key(uri)
            || self
                .resource_templates
                .keys()
                .any(|template| namespace::template_matches(template, uri))
    }

    pub fn count(&self, kind: CapabilityKind) -> usize {
        self.entries(kind).len()
    }

    pub fn is_empty(&self) -> bool {
        CapabilityKind::ALL.iter().all(|kind| self.entries(*kind).is_empty())
    }

    /// Kinds whose entries differ between two sets.
    fn changed_kinds(&self, other: &CapabilitySet) -> BTreeSet<CapabilityKind> {
        CapabilityKind::ALL
            .into_iter()
            .filter(|kind| self.entries(*kind) != other.entries(*kind))
            .collect()
    }
}

/// One capability as exposed to clients.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub server: ServerId,
    pub kind: CapabilityKind,
    pub original_id: String,
    pub namespaced_id: String,
    /// Friendly alias when owned, otherwise the namespaced id
    pub exposed_id: String,
    pub definition: Value,
}

impl CatalogEntry {
    /// The downstream definition with its id replaced by the exposed id.
    pub fn to_listing(&self) -> Value {
        let mut listing = self.definition.clone();
        if let Some(object) = listing.as_object_mut() {
            object.insert(self.kind.id_field().to_string(), Value::String(self.exposed_id.clone()));
        }
        listing
    }
}

/// Emitted whenever a server's contribution changes.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogChange {
    pub server: ServerId,
    pub kinds: BTreeSet<CapabilityKind>,
}

#[derive(Default)]
struct CatalogState {
    contributions: HashMap<ServerId, CapabilitySet>,
    aliases: HashMap<CapabilityKind, HashMap<String, ServerId>>,
}

impl CatalogState {
    fn alias_owner(&self, kind: CapabilityKind, alias: &str) -> Option<&ServerId> {
        self.aliases.get(&kind).and_then(|table| table.get(alias))
    }

    fn release_aliases(&mut self, server: &ServerId) {
        for table in self.aliases.values_mut() {
            table.retain(|_, owner| owner != server);
        }
    }
}

/// Global catalog derived from every serving connection.
pub struct CapabilityRegistry {
    strict: bool,
    state: RwLock<CatalogState>,
    changes: broadcast::Sender<CatalogChange>,
}

impl CapabilityRegistry {
    pub fn new(strict: bool) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            strict,
            state: RwLock::new(CatalogState::default()),
            changes,
        }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Replace a server's contribution.
    ///
    /// In strict mode a single alias collision rejects the whole set and
    /// leaves the catalog untouched.
    pub fn publish(&self, server: &ServerId, capabilities: CapabilitySet) -> Result<()> {
        let change = {
            let mut state = self.state.write();

            if self.strict {
                for kind in CapabilityKind::ALL {
                    for alias in capabilities.entries(kind).keys() {
                        if let Some(existing) = state.alias_owner(kind, alias) {
                            if existing != server {
                                return Err(RouterError::CapabilityConflict {
                                    kind,
                                    alias: alias.clone(),
                                    existing: existing.to_string(),
                                    server: server.to_string(),
                                });
                            }
                        }
                    }
                }
            }

            state.release_aliases(server);
            for kind in CapabilityKind::ALL {
                let table = state.aliases.entry(kind).or_default();
                for alias in capabilities.entries(kind).keys() {
                    table.entry(alias.clone()).or_insert_with(|| server.clone());
                }
            }

            let previous = state
                .contributions
                .insert(server.clone(), capabilities.clone())
                .unwrap_or_default();
            previous.changed_kinds(&capabilities)
        };

        info!(
            server = %server,
            "Published capabilities: {} tools, {} prompts, {} resources, {} templates",
            capabilities.tools.len(),
            capabilities.prompts.len(),
            capabilities.resources.len(),
            capabilities.resource_templates.len()
        );
        self.notify(server, change);
        Ok(())
    }

    /// Remove a server's contribution and release its aliases.
    pub fn withdraw(&self, server: &ServerId) {
        let removed = {
            let mut state = self.state.write();
            state.release_aliases(server);
            state.contributions.remove(server)
        };

        if let Some(removed) = removed {
            debug!(server = %server, "Withdrew capabilities");
            self.notify(server, removed.changed_kinds(&CapabilitySet::default()));
        }
    }

    fn notify(&self, server: &ServerId, kinds: BTreeSet<CapabilityKind>) {
        if kinds.is_empty() {
            return;
        }
        // No subscribers is fine: nobody needs telling.
        let _ = self.changes.send(CatalogChange {
            server: server.clone(),
            kinds,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogChange> {
        self.changes.subscribe()
    }

    /// Server owning a friendly alias.
    pub fn alias_owner(&self, kind: CapabilityKind, alias: &str) -> Option<ServerId> {
        self.state.read().alias_owner(kind, alias).cloned()
    }

    /// Copy of a server's current contribution.
    pub fn contribution(&self, server: &str) -> Option<CapabilitySet> {
        self.state.read().contributions.get(server).cloned()
    }

    pub fn contains(&self, server: &str, kind: CapabilityKind, original: &str) -> bool {
        self.state
            .read()
            .contributions
            .get(server)
            .map(|set| set.contains(kind, original))
            .unwrap_or(false)
    }

    pub fn is_published(&self, server: &str) -> bool {
        self.state.read().contributions.contains_key(server)
    }

    /// All entries of one kind visible under a profile scope.
    pub fn list(&self, kind: CapabilityKind, scope: &ProfileScope) -> Vec<CatalogEntry> {
        let state = self.state.read();
        let mut servers: Vec<&ServerId> = state
            .contributions
            .keys()
            .filter(|server| scope.includes(server.as_str()))
            .collect();
        servers.sort();

        let mut entries = Vec::new();
        for server in servers {
            let Some(set) = state.contributions.get(server) else {
                continue;
            };
            for (original, definition) in set.entries(kind) {
                let namespaced_id = namespace::namespace(server, kind, original);
                let exposed_id = match state.alias_owner(kind, original) {
                    Some(owner) if owner == server => original.clone(),
                    _ => namespaced_id.clone(),
                };
                entries.push(CatalogEntry {
                    server: server.clone(),
                    kind,
                    original_id: original.clone(),
                    namespaced_id,
                    exposed_id,
                    definition: definition.clone(),
                });
            }
        }
        entries
    }
}
