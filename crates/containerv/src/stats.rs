//! Resource usage read from cgroup v2 knobs, the host veth and procfs.
//!
//! Every read is best effort: a missing or unparsable file counts as zero.

use std::fs;
use std::path::Path;
use std::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_ops: u64,
    pub write_ops: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContainerStats {
    pub cpu_time_ns: u64,
    /// Usage since the previous sample, in percent of one CPU.
    pub cpu_percent: f64,
    pub memory_current: u64,
    pub memory_peak: u64,
    pub io: IoStats,
    pub active_pids: u32,
    pub network: NetworkStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: i32,
    pub name: String,
    /// Resident set size in bytes.
    pub rss: u64,
}

fn read_u64(path: &Path) -> u64 {
    fs::read_to_string(path)
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .unwrap_or(0)
}

pub(crate) fn cpu_time_ns(cpu_stat: &str) -> u64 {
    let mut usec = None;
    let mut nsec = None;
    for line in cpu_stat.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next().and_then(|v| v.parse::<u64>().ok())) {
            (Some("usage_usec"), Some(value)) => usec = Some(value),
            (Some("usage_nsec"), Some(value)) => nsec = Some(value),
            _ => {}
        }
    }
    nsec.or(usec.map(|value| value.saturating_mul(1000)))
        .unwrap_or(0)
}

pub(crate) fn io_totals(io_stat: &str) -> IoStats {
    let mut total = IoStats::default();
    for field in io_stat.split_whitespace() {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        let Ok(value) = value.parse::<u64>() else {
            continue;
        };
        let slot = match key {
            "rbytes" => &mut total.read_bytes,
            "wbytes" => &mut total.write_bytes,
            "rios" => &mut total.read_ops,
            "wios" => &mut total.write_ops,
            _ => continue,
        };
        *slot = slot.saturating_add(value);
    }
    total
}

fn network(net_class: &Path, veth: &str) -> NetworkStats {
    let dir = net_class.join(veth).join("statistics");
    NetworkStats {
        rx_bytes: read_u64(&dir.join("rx_bytes")),
        tx_bytes: read_u64(&dir.join("tx_bytes")),
        rx_packets: read_u64(&dir.join("rx_packets")),
        tx_packets: read_u64(&dir.join("tx_packets")),
    }
}

/// Reads a snapshot; `cpu_percent` is left at zero.
pub(crate) fn read(cgroup: &Path, net_class: &Path, veth: Option<&str>) -> ContainerStats {
    let cpu_stat = fs::read_to_string(cgroup.join("cpu.stat")).unwrap_or_default();
    let io_stat = fs::read_to_string(cgroup.join("io.stat")).unwrap_or_default();
    ContainerStats {
        cpu_time_ns: cpu_time_ns(&cpu_stat),
        cpu_percent: 0.0,
        memory_current: read_u64(&cgroup.join("memory.current")),
        memory_peak: read_u64(&cgroup.join("memory.peak")),
        io: io_totals(&io_stat),
        active_pids: u32::try_from(read_u64(&cgroup.join("pids.current"))).unwrap_or(u32::MAX),
        network: veth.map(|name| network(net_class, name)).unwrap_or_default(),
    }
}

/// Previous CPU sample used to turn cumulative time into a percentage.
#[derive(Debug, Default)]
pub(crate) struct CpuSampler {
    last: Option<(Instant, u64)>,
}

impl CpuSampler {
    pub(crate) fn sample(&mut self, now: Instant, cpu_time_ns: u64) -> f64 {
        let percent = match self.last {
            Some((at, previous)) => {
                let elapsed = now.saturating_duration_since(at).as_nanos() as f64;
                if elapsed > 0.0 {
                    cpu_time_ns.saturating_sub(previous) as f64 * 100.0 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last = Some((now, cpu_time_ns));
        percent
    }
}

fn vm_rss(status: &str) -> u64 {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

/// Members of the cgroup with their command name and resident memory.
pub(crate) fn processes(cgroup: &Path, proc_root: &Path) -> Vec<ProcessInfo> {
    crate::cgroup::read_procs(cgroup)
        .into_iter()
        .map(|pid| {
            let dir = proc_root.join(pid.to_string());
            let name = fs::read_to_string(dir.join("comm"))
                .map(|comm| comm.trim_end().to_string())
                .unwrap_or_default();
            let rss = fs::read_to_string(dir.join("status"))
                .map(|status| vm_rss(&status))
                .unwrap_or(0);
            ProcessInfo { pid, name, rss }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn cpu_time_prefers_nanoseconds() {
        assert_eq!(cpu_time_ns("usage_usec 1500\nuser_usec 1000\n"), 1_500_000);
        assert_eq!(cpu_time_ns("usage_usec 1500\nusage_nsec 1500123\n"), 1_500_123);
        assert_eq!(cpu_time_ns("garbage"), 0);
    }

    #[test]
    fn io_stat_sums_devices() {
        let text = "8:0 rbytes=100 wbytes=200 rios=1 wios=2 dbytes=0 dios=0\n\
                    8:16 rbytes=1 wbytes=2 rios=3 wios=4\n";
        assert_eq!(
            io_totals(text),
            IoStats {
                read_bytes: 101,
                write_bytes: 202,
                read_ops: 4,
                write_ops: 6,
            }
        );
    }

    #[test]
    fn snapshot_from_fake_trees() {
        let cgroup = tempdir().unwrap();
        let net = tempdir().unwrap();
        fs::write(cgroup.path().join("cpu.stat"), "usage_usec 42\n").unwrap();
        fs::write(cgroup.path().join("memory.current"), "4096\n").unwrap();
        fs::write(cgroup.path().join("pids.current"), "99999999999\n").unwrap();
        let stats_dir = net.path().join("vethbox/statistics");
        fs::create_dir_all(&stats_dir).unwrap();
        fs::write(stats_dir.join("rx_bytes"), "10\n").unwrap();
        fs::write(stats_dir.join("tx_packets"), "3\n").unwrap();

        let stats = read(cgroup.path(), net.path(), Some("vethbox"));
        assert_eq!(stats.cpu_time_ns, 42_000);
        assert_eq!(stats.memory_current, 4096);
        assert_eq!(stats.memory_peak, 0);
        assert_eq!(stats.active_pids, u32::MAX);
        assert_eq!(stats.network.rx_bytes, 10);
        assert_eq!(stats.network.tx_packets, 3);
        assert_eq!(stats.io, IoStats::default());

        let no_net = read(cgroup.path(), net.path(), None);
        assert_eq!(no_net.network, NetworkStats::default());
    }

    #[test]
    fn cpu_percent_uses_the_previous_sample() {
        let mut sampler = CpuSampler::default();
        let start = Instant::now();
        assert_eq!(sampler.sample(start, 0), 0.0);
        let later = start + Duration::from_secs(1);
        let percent = sampler.sample(later, 500_000_000);
        assert!((percent - 50.0).abs() < 1e-9);
        assert_eq!(sampler.sample(later, 600_000_000), 0.0);
    }

    #[test]
    fn processes_read_comm_and_rss() {
        let cgroup = tempdir().unwrap();
        let proc = tempdir().unwrap();
        fs::write(cgroup.path().join("cgroup.procs"), "7\n8\n").unwrap();
        let seven = proc.path().join("7");
        fs::create_dir(&seven).unwrap();
        fs::write(seven.join("comm"), "sh\n").unwrap();
        fs::write(seven.join("status"), "Name:\tsh\nVmRSS:\t   1200 kB\n").unwrap();

        let list = processes(cgroup.path(), proc.path());
        assert_eq!(
            list,
            vec![
                ProcessInfo {
                    pid: 7,
                    name: "sh".into(),
                    rss: 1200 * 1024,
                },
                ProcessInfo {
                    pid: 8,
                    name: String::new(),
                    rss: 0,
                },
            ]
        );
    }
}
