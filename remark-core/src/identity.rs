//! Actor identity resolution
//!
//! The identity signal may not be present when a document first loads, so
//! resolution is eventually consistent: cached value first, then a
//! prioritized chain of detection probes, with a background re-poll while
//! nothing resolves. Callers must treat the empty identity as "unknown".

use crate::config::IdentityConfig;
use crate::error::Result;
use crate::store::Store;
use crate::types::{differs_from_cached, normalize_actor_key, ActorIdentity};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// One identity detection strategy. Probes are pure reads; only the
/// resolver writes the cache.
pub trait IdentityProbe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Yields an identity or `None`; empty identities count as `None`.
    fn probe(&self) -> Option<ActorIdentity>;
}

/// Shape of an `actor.json` profile file placed beside a watch root.
#[derive(Debug, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    name: String,
    #[serde(default)]
    profile_url: String,
}

/// Reads the viewer profile a document view publishes beside its logs.
pub struct ProfileFileProbe {
    path: PathBuf,
}

impl ProfileFileProbe {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join("actor.json"),
        }
    }
}

impl IdentityProbe for ProfileFileProbe {
    fn name(&self) -> &'static str {
        "profile-file"
    }

    fn probe(&self) -> Option<ActorIdentity> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        let profile: ProfileFile = serde_json::from_str(&content).ok()?;
        let identity = ActorIdentity {
            name: profile.name.trim().to_string(),
            key: normalize_actor_key(&profile.profile_url),
        };
        (!identity.is_empty()).then_some(identity)
    }
}

/// Final fallback: an identity pinned in the configuration file.
pub struct ConfigProbe {
    identity: ActorIdentity,
}

impl ConfigProbe {
    pub fn new(config: &IdentityConfig) -> Self {
        Self {
            identity: ActorIdentity {
                name: config.name.clone().unwrap_or_default().trim().to_string(),
                key: normalize_actor_key(config.profile_url.as_deref().unwrap_or("")),
            },
        }
    }
}

impl IdentityProbe for ConfigProbe {
    fn name(&self) -> &'static str {
        "config"
    }

    fn probe(&self) -> Option<ActorIdentity> {
        (!self.identity.is_empty()).then(|| self.identity.clone())
    }
}

/// Resolves and caches the current actor's identity.
pub struct IdentityResolver {
    store: Arc<Store>,
    probes: Vec<Box<dyn IdentityProbe>>,
}

impl IdentityResolver {
    pub fn new(store: Arc<Store>, probes: Vec<Box<dyn IdentityProbe>>) -> Self {
        Self { store, probes }
    }

    /// Resolver with the default probe chain: one profile-file probe per
    /// watch root, then the pinned config identity.
    pub fn with_default_probes(
        store: Arc<Store>,
        config: &IdentityConfig,
        roots: &[PathBuf],
    ) -> Self {
        let mut probes: Vec<Box<dyn IdentityProbe>> = roots
            .iter()
            .map(|r| Box::new(ProfileFileProbe::new(r)) as Box<dyn IdentityProbe>)
            .collect();
        probes.push(Box::new(ConfigProbe::new(config)));
        Self::new(store, probes)
    }

    /// Resolve the current actor identity.
    ///
    /// Chain: cached value → probes in order (first non-empty wins, persisted
    /// when it differs from the cache) → the empty identity.
    pub fn resolve(&self) -> Result<ActorIdentity> {
        if let Some(cached) = self.store.get_identity()? {
            if !cached.is_empty() {
                return Ok(cached);
            }
        }

        for probe in &self.probes {
            let Some(found) = probe.probe() else { continue };
            if found.is_empty() {
                continue;
            }
            let cached = self.store.get_identity()?.unwrap_or_default();
            if differs_from_cached(&cached, &found) {
                self.store.set_identity(&found)?;
                tracing::info!(
                    probe = probe.name(),
                    actor = %found.key,
                    "Actor identity resolved"
                );
            }
            return Ok(found);
        }

        Ok(ActorIdentity::default())
    }

    /// Background re-poll at a fixed interval until the identity resolves.
    ///
    /// Returns the task handle; abort it to cancel.
    pub fn spawn_repoll(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let resolver = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match resolver.resolve() {
                    Ok(identity) if !identity.is_empty() => {
                        tracing::debug!(actor = %identity.key, "Identity re-poll resolved");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Identity re-poll failed");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(Option<ActorIdentity>);

    impl IdentityProbe for FixedProbe {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn probe(&self) -> Option<ActorIdentity> {
            self.0.clone()
        }
    }

    fn store() -> Arc<Store> {
        let s = Store::open_in_memory().unwrap();
        s.migrate().unwrap();
        Arc::new(s)
    }

    #[test]
    fn test_cache_wins_over_probes() {
        let store = store();
        store
            .set_identity(&ActorIdentity::new("Cached", "/in/cached"))
            .unwrap();

        let resolver = IdentityResolver::new(
            Arc::clone(&store),
            vec![Box::new(FixedProbe(Some(ActorIdentity::new(
                "Fresh",
                "/in/fresh",
            ))))],
        );

        let resolved = resolver.resolve().unwrap();
        assert_eq!(resolved.key, "/in/cached");
    }

    #[test]
    fn test_first_probe_wins_and_is_cached() {
        let store = store();
        let resolver = IdentityResolver::new(
            Arc::clone(&store),
            vec![
                Box::new(FixedProbe(None)),
                Box::new(FixedProbe(Some(ActorIdentity::new("Jane", "/in/jane")))),
                Box::new(FixedProbe(Some(ActorIdentity::new("Late", "/in/late")))),
            ],
        );

        let resolved = resolver.resolve().unwrap();
        assert_eq!(resolved.key, "/in/jane");

        let cached = store.get_identity().unwrap().unwrap();
        assert_eq!(cached.key, "/in/jane");
    }

    #[test]
    fn test_unresolved_returns_empty() {
        let store = store();
        let resolver =
            IdentityResolver::new(Arc::clone(&store), vec![Box::new(FixedProbe(None))]);

        let resolved = resolver.resolve().unwrap();
        assert!(resolved.is_empty());
        assert!(store.get_identity().unwrap().is_none());
    }

    #[test]
    fn test_profile_file_probe_reads_and_normalizes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("actor.json"),
            r#"{"name": "Jane Doe", "profile_url": "https://example.com/in/jane/"}"#,
        )
        .unwrap();

        let probe = ProfileFileProbe::new(dir.path());
        let identity = probe.probe().unwrap();
        assert_eq!(identity.name, "Jane Doe");
        assert_eq!(identity.key, "/in/jane");
    }

    #[test]
    fn test_profile_file_probe_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let probe = ProfileFileProbe::new(dir.path());
        assert!(probe.probe().is_none());
    }

    #[test]
    fn test_config_probe() {
        let config = IdentityConfig {
            name: Some("Jane".to_string()),
            profile_url: Some("https://example.com/in/jane".to_string()),
            ..Default::default()
        };
        let probe = ConfigProbe::new(&config);
        let identity = probe.probe().unwrap();
        assert_eq!(identity.key, "/in/jane");

        let empty = ConfigProbe::new(&IdentityConfig::default());
        assert!(empty.probe().is_none());
    }
}
