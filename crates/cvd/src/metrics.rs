use std::time::Duration;

/// Cumulative counters since the manager was initialized.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Metrics {
    pub populate_ops: u64,
    pub cleanup_ops: u64,
    pub failed_populate_ops: u64,
    pub failed_cleanup_ops: u64,
    /// Policy entries that could not be inserted during otherwise
    /// successful admits.
    pub failed_entries: u64,
    /// Containers with a live context.
    pub containers: usize,
}

/// Timings of the most recent admit and cleanup for one container.
/// `last_cleanup_us` stays zero while the container is admitted; the
/// final value is returned by cleanup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ContainerMetrics {
    pub last_populate_us: u64,
    pub last_cleanup_us: u64,
    /// Tracked entries per map, in pin order.
    pub entries: [usize; crate::maps::MapId::COUNT],
}

pub(crate) fn micros(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}
