use crate::context::BpfContainerContext;
use crate::error::{Error, Result};
use crate::loader::Loaded;
use crate::maps::{KernelMaps, MapId, MapStore};
use crate::metrics::{ContainerMetrics, Metrics, micros};
use crate::paths;
use crate::populate::Populator;
use policy_core::Policy;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

const HOSTNAME_MAX: usize = 64;

/// Checks that `name` is usable both as a hostname and as a single cgroup
/// directory component.
pub fn validate_hostname(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= HOSTNAME_MAX
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidHostname(name.to_string()))
    }
}

/// Entries found in each map for one cgroup, in [`MapId::ALL`] order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EntryCounts {
    pub per_map: [usize; MapId::COUNT],
}

impl EntryCounts {
    pub fn total(&self) -> usize {
        self.per_map.iter().sum()
    }

    pub fn get(&self, map: MapId) -> usize {
        self.per_map[map as usize]
    }
}

/// Owns the policy maps and every container's tracked entries.
pub struct Manager {
    store: Box<dyn MapStore>,
    cgroup_root: PathBuf,
    contexts: HashMap<String, BpfContainerContext>,
    metrics: Metrics,
    kernel: Option<Loaded>,
}

impl Manager {
    /// A manager over an arbitrary store, with no programs attached.
    pub fn new(store: impl MapStore + 'static, cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            store: Box::new(store),
            cgroup_root: cgroup_root.into(),
            contexts: HashMap::new(),
            metrics: Metrics::default(),
            kernel: None,
        }
    }

    /// Loads and attaches the LSM programs, then opens their pinned maps.
    pub fn load() -> Result<Self> {
        let loaded = Loaded::load(&paths::pin_dir(), &paths::object_dir(), paths::events_path())?;
        let store = KernelMaps::open(loaded.pin_dir())?;
        let mut manager = Self::new(store, paths::cgroup_root());
        manager.kernel = Some(loaded);
        Ok(manager)
    }

    pub fn cgroup_root(&self) -> &Path {
        &self.cgroup_root
    }

    /// Resolves the cgroup id of a container's cgroup directory.
    pub fn cgroup_id(&self, hostname: &str) -> Result<u64> {
        validate_hostname(hostname)?;
        let path = self.cgroup_root.join(hostname);
        let meta = fs::metadata(&path)
            .map_err(|err| Error::io(format!("cgroup {}", path.display()), err))?;
        Ok(meta.ino())
    }

    /// Inserts map entries granting `policy` to the container whose
    /// hostname is `container_id`. Entries that cannot be applied are
    /// logged and skipped.
    pub fn admit(&mut self, container_id: &str, rootfs: &Path, policy: &Policy) -> Result<()> {
        let started = Instant::now();
        let result = self.populate(container_id, rootfs, policy, started);
        match &result {
            Ok(()) => self.metrics.populate_ops += 1,
            Err(err) => {
                self.metrics.failed_populate_ops += 1;
                log::warn!(target: "cvd", "admit of {container_id} failed: {err}");
            }
        }
        result
    }

    fn populate(
        &mut self,
        container_id: &str,
        rootfs: &Path,
        policy: &Policy,
        started: Instant,
    ) -> Result<()> {
        let cgroup_id = self.cgroup_id(container_id)?;
        let ctx = self
            .contexts
            .entry(container_id.to_string())
            .or_insert_with(|| BpfContainerContext::new(container_id, cgroup_id));
        let populator = match Populator::new(self.store.as_mut(), ctx, rootfs) {
            Ok(populator) => populator,
            Err(err) => {
                if ctx.key_counts().iter().all(|&count| count == 0) {
                    self.contexts.remove(container_id);
                }
                return Err(err);
            }
        };
        let outcome = populator.populate(policy);
        ctx.last_populate = Some(started.elapsed());
        self.metrics.failed_entries += outcome.failed;
        log::info!(
            target: "cvd",
            "admitted {container_id} (cgroup {cgroup_id}): {} entries, {} failed, {} skipped in {}us",
            outcome.inserted,
            outcome.failed,
            outcome.skipped,
            micros(started.elapsed())
        );
        Ok(())
    }

    /// Deletes every entry recorded for the container and drops its
    /// context. The final timings are returned.
    pub fn cleanup(&mut self, container_id: &str) -> Result<ContainerMetrics> {
        let Some(ctx) = self.contexts.remove(container_id) else {
            return Err(Error::UnknownContainer(container_id.to_string()));
        };
        let started = Instant::now();
        let mut first_error = None;
        for map in MapId::ALL {
            let keys = ctx.keys(map);
            if keys.is_empty() {
                continue;
            }
            match self.store.delete_batch(map, keys) {
                Ok(deleted) => log::debug!(
                    target: "cvd",
                    "{container_id}: removed {deleted}/{} entries from {}",
                    keys.len(),
                    map.name()
                ),
                Err(err) => {
                    log::warn!(target: "cvd", "{container_id}: cleanup of {} failed: {err}", map.name());
                    first_error.get_or_insert(err);
                }
            }
        }
        let timings = ContainerMetrics {
            last_populate_us: ctx.last_populate.map(micros).unwrap_or(0),
            last_cleanup_us: micros(started.elapsed()),
            entries: ctx.key_counts(),
        };
        match first_error {
            Some(err) => {
                self.metrics.failed_cleanup_ops += 1;
                Err(err)
            }
            None => {
                self.metrics.cleanup_ops += 1;
                Ok(timings)
            }
        }
    }

    /// Counts entries currently present in the maps for `cgroup_id`.
    pub fn entries_for_cgroup(&self, cgroup_id: u64) -> Result<EntryCounts> {
        let prefix = cgroup_id.to_ne_bytes();
        let mut counts = EntryCounts::default();
        for map in MapId::ALL {
            counts.per_map[map as usize] = self
                .store
                .keys(map)?
                .iter()
                .filter(|key| key.starts_with(&prefix))
                .count();
        }
        Ok(counts)
    }

    pub fn metrics(&self) -> Metrics {
        Metrics {
            containers: self.contexts.len(),
            ..self.metrics
        }
    }

    pub fn container_metrics(&self, container_id: &str) -> Option<ContainerMetrics> {
        self.contexts.get(container_id).map(|ctx| ContainerMetrics {
            last_populate_us: ctx.last_populate.map(micros).unwrap_or(0),
            last_cleanup_us: 0,
            entries: ctx.key_counts(),
        })
    }

    pub fn context(&self, container_id: &str) -> Option<&BpfContainerContext> {
        self.contexts.get(container_id)
    }

    /// Cleans up remaining containers, then detaches the programs and
    /// removes the pins.
    pub fn shutdown(mut self) -> Result<()> {
        let remaining: Vec<String> = self.contexts.keys().cloned().collect();
        for container_id in remaining {
            if let Err(err) = self.cleanup(&container_id) {
                log::warn!(target: "cvd", "cleanup of {container_id} at shutdown failed: {err}");
            }
        }
        let Manager { store, kernel, .. } = self;
        drop(store);
        match kernel {
            Some(loaded) => loaded.shutdown(),
            None => Ok(()),
        }
    }
}
