use super::source::{LimitsFile, TierSources};
use super::types::{TierLimits, TierName, TierSource, TierTable, UnmappedPolicy};
use crate::error::Result;
use crate::metrics;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Immutable view of the whole tier configuration
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub loaded_at: DateTime<Utc>,
    identities: HashMap<String, TierName>,
    tiers: TierTable,
    unmapped_policy: UnmappedPolicy,
    test_prefix: Option<String>,
}

/// Result of resolving an identity against one snapshot
#[derive(Debug, Clone, Copy)]
pub struct Resolution<'a> {
    pub tier: TierName,
    pub limits: &'a TierLimits,
    pub source: TierSource,
}

impl ConfigSnapshot {
    pub fn new(
        version: u64,
        identities: HashMap<String, TierName>,
        limits: LimitsFile,
        test_prefix: Option<String>,
    ) -> Self {
        let unmapped_policy = limits.unmapped_policy;
        Self {
            version,
            loaded_at: Utc::now(),
            identities,
            tiers: limits.into_table(),
            unmapped_policy,
            test_prefix: test_prefix.filter(|p| !p.is_empty()),
        }
    }

    /// Snapshot used before any source has been loaded
    pub fn builtin(test_prefix: Option<String>) -> Self {
        Self::new(0, HashMap::new(), LimitsFile::default(), test_prefix)
    }

    /// Map an identity to its tier and limits
    pub fn resolve(&self, identity: &str) -> Resolution<'_> {
        let (tier, source) = match self.identities.get(identity) {
            Some(&tier) => (tier, TierSource::Mapped),
            None => match &self.test_prefix {
                Some(prefix) if identity.starts_with(prefix.as_str()) => {
                    (TierName::Basic, TierSource::TestPrefix)
                }
                _ => (TierName::Default, TierSource::Fallback),
            },
        };

        Resolution {
            tier,
            limits: self.limits(tier),
            source,
        }
    }

    pub fn limits(&self, tier: TierName) -> &TierLimits {
        self.tiers.get(tier)
    }

    pub fn unmapped_policy(&self) -> UnmappedPolicy {
        self.unmapped_policy
    }

    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }
}

/// Holder of the current snapshot.
///
/// Readers do a single atomic load; reloads build a complete snapshot off to
/// the side and publish it with one pointer swap.
pub struct TierStore {
    current: ArcSwap<ConfigSnapshot>,
    sources: Option<TierSources>,
    test_prefix: Option<String>,
    next_version: AtomicU64,
    reload_lock: Mutex<()>,
}

impl TierStore {
    /// Store backed by files, starting from the built-in snapshot
    pub fn new(sources: TierSources, test_prefix: Option<String>) -> Self {
        Self::build(Some(sources), test_prefix)
    }

    /// Store fed only through [`TierStore::publish`]
    pub fn in_memory(test_prefix: Option<String>) -> Self {
        Self::build(None, test_prefix)
    }

    fn build(sources: Option<TierSources>, test_prefix: Option<String>) -> Self {
        Self {
            current: ArcSwap::from_pointee(ConfigSnapshot::builtin(test_prefix.clone())),
            sources,
            test_prefix,
            next_version: AtomicU64::new(1),
            reload_lock: Mutex::new(()),
        }
    }

    /// The current snapshot; hold on to it for the whole request
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Resolve against the current snapshot
    pub fn resolve(&self, identity: &str) -> (TierName, TierLimits) {
        let snapshot = self.current.load();
        let resolution = snapshot.resolve(identity);
        (resolution.tier, resolution.limits.clone())
    }

    pub fn sources(&self) -> Option<&TierSources> {
        self.sources.as_ref()
    }

    /// Re-read the sources and publish a new snapshot.
    ///
    /// On any error the current snapshot stays in place untouched.
    pub fn reload(&self) -> Result<u64> {
        let _guard = self.reload_lock.lock().unwrap_or_else(|e| e.into_inner());

        let Some(sources) = &self.sources else {
            return Ok(self.current.load().version);
        };

        match sources.read() {
            Ok((identities, limits)) => {
                let version = self.swap_in(identities, limits);
                metrics::record_config_reload(true, version);
                Ok(version)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    version = self.current.load().version,
                    "Rejected tier configuration, keeping previous snapshot"
                );
                metrics::record_config_reload(false, self.current.load().version);
                Err(e)
            }
        }
    }

    /// Publish an already parsed configuration
    pub fn publish(&self, identities: HashMap<String, TierName>, limits: LimitsFile) -> u64 {
        let _guard = self.reload_lock.lock().unwrap_or_else(|e| e.into_inner());
        let version = self.swap_in(identities, limits);
        metrics::record_config_reload(true, version);
        version
    }

    fn swap_in(&self, identities: HashMap<String, TierName>, limits: LimitsFile) -> u64 {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let snapshot = ConfigSnapshot::new(version, identities, limits, self.test_prefix.clone());
        let identity_count = snapshot.identity_count();

        self.current.store(Arc::new(snapshot));

        info!(version, identities = identity_count, "Tier configuration published");
        version
    }
}
