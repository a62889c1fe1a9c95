//! Configuration watcher
//!
//! Turns configuration edits into registry and profile operations without
//! restarting the router. Every change is idempotent: applying the same
//! change twice leaves the router exactly as applying it once.

use crate::config::{is_yaml, ProfileConfig, RouterConfig, ServerDefinition};
use crate::error::{Result, RouterError};
use crate::namespace::ServerId;
use crate::router::Router;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// One edit to the running configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigChange {
    /// Add a server or replace its definition. A disabled definition
    /// removes the server.
    UpsertServer(ServerDefinition),
    RemoveServer(ServerId),
    UpsertProfile { name: String, profile: ProfileConfig },
    RemoveProfile(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The router already matched the change
    Unchanged,
}

pub struct ConfigWatcher {
    router: Arc<Router>,
    reload_lock: tokio::sync::Mutex<()>,
}

impl ConfigWatcher {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            reload_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn apply(&self, change: ConfigChange) -> Result<ApplyOutcome> {
        let _guard = self.reload_lock.lock().await;
        self.apply_locked(change).await
    }

    async fn apply_locked(&self, change: ConfigChange) -> Result<ApplyOutcome> {
        match change {
            ConfigChange::UpsertServer(definition) => self.upsert_server(definition).await,
            ConfigChange::RemoveServer(id) => match self.router.unregister_server(id.as_str()).await {
                Ok(()) => Ok(ApplyOutcome::Applied),
                Err(RouterError::ServerNotFound { .. }) => Ok(ApplyOutcome::Unchanged),
                Err(e) => Err(e),
            },
            ConfigChange::UpsertProfile { name, profile } => Ok(outcome(self.router.put_profile(&name, profile))),
            ConfigChange::RemoveProfile(name) => Ok(outcome(self.router.remove_profile(&name))),
        }
    }

    async fn upsert_server(&self, definition: ServerDefinition) -> Result<ApplyOutcome> {
        let id = definition.id.clone();
        match self.router.connection(id.as_str()) {
            Some(current) if current.definition() == &definition => return Ok(ApplyOutcome::Unchanged),
            Some(_) => {
                info!(server = %id, "Definition changed, replacing connection");
                self.router.unregister_server(id.as_str()).await?;
            }
            None if !definition.enabled => return Ok(ApplyOutcome::Unchanged),
            None => {}
        }

        if !definition.enabled {
            return Ok(ApplyOutcome::Applied);
        }
        match self.router.register_server(definition).await {
            Ok(()) => Ok(ApplyOutcome::Applied),
            Err(e @ RouterError::CapabilityConflict { .. }) => Err(e),
            // Registered and retrying in the background
            Err(e) => {
                debug!(server = %id, "Registered but not yet connected: {}", e);
                Ok(ApplyOutcome::Applied)
            }
        }
    }

    /// Bring the router in line with a whole configuration. Servers and
    /// profiles absent from it are removed. Returns how many changes were
    /// applied; failures are logged and skipped.
    pub async fn apply_snapshot(&self, config: &RouterConfig) -> usize {
        let _guard = self.reload_lock.lock().await;

        if config.strict != self.router.is_strict() {
            warn!("Conflict policy changes take effect only after a restart");
        }

        let wanted_servers: BTreeSet<&str> = config.servers.iter().map(|s| s.id.as_str()).collect();
        let wanted_profiles: BTreeSet<&str> = config.profiles.keys().map(String::as_str).collect();

        let mut changes: Vec<ConfigChange> = self
            .router
            .server_ids()
            .into_iter()
            .filter(|id| !wanted_servers.contains(id.as_str()))
            .map(ConfigChange::RemoveServer)
            .collect();
        changes.extend(
            self.router
                .profile_names()
                .into_iter()
                .filter(|name| !wanted_profiles.contains(name.as_str()))
                .map(ConfigChange::RemoveProfile),
        );
        changes.extend(config.profiles.iter().map(|(name, profile)| ConfigChange::UpsertProfile {
            name: name.clone(),
            profile: profile.clone(),
        }));

        let mut applied = 0;
        for change in changes {
            applied += self.count(change).await;
        }

        // Servers connect concurrently; each waits for its first attempt.
        let upserts = config
            .servers
            .iter()
            .cloned()
            .map(|server| self.count(ConfigChange::UpsertServer(server)));
        applied += join_all(upserts).await.into_iter().sum::<usize>();

        if applied > 0 {
            info!("Configuration reloaded, {} changes applied", applied);
        }
        applied
    }

    async fn count(&self, change: ConfigChange) -> usize {
        let description = format!("{:?}", change);
        match self.apply_locked(change).await {
            Ok(ApplyOutcome::Applied) => 1,
            Ok(ApplyOutcome::Unchanged) => 0,
            Err(e) => {
                warn!("Failed to apply {}: {}", description, e);
                0
            }
        }
    }

    /// Poll a configuration file and apply it whenever its content changes.
    /// A file that fails to parse is reported and the last good
    /// configuration stays in force. Never returns.
    pub async fn watch_file(&self, path: PathBuf, interval: Duration) {
        let yaml = is_yaml(&path);
        let mut last = tokio::fs::read_to_string(&path).await.ok();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        info!("Watching {} for changes", path.display());
        loop {
            ticker.tick().await;
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    debug!("Cannot read {}: {}", path.display(), e);
                    continue;
                }
            };
            if last.as_deref() == Some(content.as_str()) {
                continue;
            }

            match RouterConfig::parse(&content, yaml) {
                Ok(config) => {
                    self.apply_snapshot(&config).await;
                }
                Err(e) => warn!("Ignoring invalid config in {}: {:#}", path.display(), e),
            }
            last = Some(content);
        }
    }
}

fn outcome(changed: bool) -> ApplyOutcome {
    if changed {
        ApplyOutcome::Applied
    } else {
        ApplyOutcome::Unchanged
    }
}
