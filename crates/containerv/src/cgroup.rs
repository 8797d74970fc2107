use crate::error::{Error, Result};
use crate::options::CgroupLimits;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const CONTROLLERS: &str = "+memory +cpu +pids";
const REMOVE_ATTEMPTS: u32 = 50;

/// A cgroup v2 directory owned by one container; removed on drop.
pub(crate) struct Cgroup {
    path: PathBuf,
    removed: bool,
}

impl Cgroup {
    /// Creates `<root>/<hostname>` and writes the resource limits.
    pub(crate) fn create(root: &Path, hostname: &str, limits: &CgroupLimits) -> Result<Self> {
        // Not fatal: a missing controller surfaces as a failed limit write.
        if let Err(err) = fs::write(root.join("cgroup.subtree_control"), CONTROLLERS) {
            log::debug!(target: "containerv", "enabling controllers under {}: {err}", root.display());
        }
        let path = root.join(hostname);
        fs::create_dir(&path)
            .map_err(|err| Error::io(format!("create cgroup {}", path.display()), err))?;
        let cgroup = Self {
            path,
            removed: false,
        };
        cgroup.write("memory.max", &limits.memory_max)?;
        cgroup.write("cpu.weight", &limits.cpu_weight.to_string())?;
        cgroup.write("pids.max", &limits.pids_max.to_string())?;
        Ok(cgroup)
    }

    fn write(&self, knob: &str, value: &str) -> Result<()> {
        let path = self.path.join(knob);
        fs::write(&path, value).map_err(|err| Error::io(format!("write {}", path.display()), err))
    }

    pub(crate) fn add_process(&self, pid: i32) -> Result<()> {
        self.write("cgroup.procs", &pid.to_string())
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Pids currently in the cgroup.
    pub(crate) fn procs(&self) -> Vec<i32> {
        read_procs(&self.path)
    }

    /// Removes the directory, killing leftover members first if the
    /// kernel reports it busy.
    pub(crate) fn remove(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }
        let mut attempt = 0;
        loop {
            match fs::remove_dir(&self.path) {
                Ok(()) => break,
                Err(err) if err.kind() == io::ErrorKind::NotFound => break,
                Err(err) if err.raw_os_error() == Some(libc::EBUSY) && attempt < REMOVE_ATTEMPTS => {
                    if attempt == 0 {
                        log::debug!(target: "containerv", "cgroup {} busy, killing members", self.path.display());
                        if let Err(err) = fs::write(self.path.join("cgroup.kill"), "1") {
                            log::warn!(
                                target: "containerv",
                                "cannot kill members of {}: {err}",
                                self.path.display()
                            );
                        }
                    }
                    attempt += 1;
                    thread::sleep(Duration::from_millis(20));
                }
                Err(err) => {
                    return Err(Error::io(format!("remove cgroup {}", self.path.display()), err));
                }
            }
        }
        self.removed = true;
        Ok(())
    }
}

impl Drop for Cgroup {
    fn drop(&mut self) {
        if let Err(err) = self.remove() {
            log::warn!(target: "containerv", "{err}");
        }
    }
}

pub(crate) fn read_procs(dir: &Path) -> Vec<i32> {
    fs::read_to_string(dir.join("cgroup.procs"))
        .map(|text| {
            text.lines()
                .filter_map(|line| line.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_writes_limits_and_drop_removes() {
        let root = tempdir().unwrap();
        let limits = CgroupLimits {
            memory_max: "512M".into(),
            cpu_weight: 50,
            pids_max: 64,
        };
        let cgroup = Cgroup::create(root.path(), "box-1", &limits).unwrap();
        let dir = cgroup.path().to_path_buf();
        assert_eq!(fs::read_to_string(dir.join("memory.max")).unwrap(), "512M");
        assert_eq!(fs::read_to_string(dir.join("cpu.weight")).unwrap(), "50");
        assert_eq!(fs::read_to_string(dir.join("pids.max")).unwrap(), "64");
        cgroup.add_process(4242).unwrap();
        assert_eq!(cgroup.procs(), vec![4242]);

        // A real cgroupfs has no regular files to delete first.
        for knob in ["memory.max", "cpu.weight", "pids.max", "cgroup.procs"] {
            fs::remove_file(dir.join(knob)).unwrap();
        }
        drop(cgroup);
        assert!(!dir.exists());
    }

    #[test]
    fn existing_cgroup_is_an_error() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("box-1")).unwrap();
        let err = Cgroup::create(root.path(), "box-1", &CgroupLimits::default())
            .err()
            .unwrap();
        assert_eq!(err.errno(), libc::EEXIST);
    }

    #[test]
    fn procs_of_missing_cgroup_are_empty() {
        let root = tempdir().unwrap();
        assert!(read_procs(&root.path().join("gone")).is_empty());
    }
}
