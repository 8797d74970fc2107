use crate::maps::MapId;
use std::collections::HashSet;
use std::time::Duration;

/// Map keys inserted on behalf of one container.
#[derive(Debug, Clone, Default)]
pub(crate) struct TrackedKeys {
    keys: Vec<Vec<u8>>,
    seen: HashSet<Vec<u8>>,
}

impl TrackedKeys {
    fn record(&mut self, key: &[u8]) {
        if self.seen.insert(key.to_vec()) {
            self.keys.push(key.to_vec());
        }
    }
}

/// Per-container bookkeeping kept by the manager between admit and cleanup.
#[derive(Debug, Clone)]
pub struct BpfContainerContext {
    container_id: String,
    cgroup_id: u64,
    tracked: [TrackedKeys; MapId::COUNT],
    pub(crate) last_populate: Option<Duration>,
}

impl BpfContainerContext {
    pub(crate) fn new(container_id: &str, cgroup_id: u64) -> Self {
        Self {
            container_id: container_id.to_string(),
            cgroup_id,
            tracked: Default::default(),
            last_populate: None,
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn cgroup_id(&self) -> u64 {
        self.cgroup_id
    }

    pub(crate) fn record(&mut self, map: MapId, key: &[u8]) {
        self.tracked[map as usize].record(key);
    }

    pub(crate) fn keys(&self, map: MapId) -> &[Vec<u8>] {
        &self.tracked[map as usize].keys
    }

    /// Tracked key count per map, in [`MapId::ALL`] order.
    pub fn key_counts(&self) -> [usize; MapId::COUNT] {
        MapId::ALL.map(|map| self.keys(map).len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_tracked_once() {
        let mut ctx = BpfContainerContext::new("c1", 42);
        ctx.record(MapId::Policy, &[1; 24]);
        ctx.record(MapId::Policy, &[1; 24]);
        ctx.record(MapId::Policy, &[2; 24]);
        ctx.record(MapId::NetCreate, &[3; 16]);
        assert_eq!(ctx.key_counts(), [2, 0, 0, 1, 0, 0]);
        assert_eq!(ctx.cgroup_id(), 42);
    }
}
