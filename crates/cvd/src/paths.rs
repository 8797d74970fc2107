//! Well-known locations, each overridable through the environment.

use std::env;
use std::path::PathBuf;

pub const PIN_DIR_ENV: &str = "CVD_PIN_DIR";
pub const OBJECT_DIR_ENV: &str = "CVD_BPF_OBJECT_DIR";
pub const LSM_FILE_ENV: &str = "CVD_LSM_FILE";
pub const EVENTS_PATH_ENV: &str = "CVD_EVENTS_PATH";
pub const CGROUP_ROOT_ENV: &str = "CONTAINERV_CGROUP_ROOT";

const DEFAULT_OBJECT_DIR: &str = "/usr/lib/containerv/bpf";
const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

fn env_path(key: &str, default: &str) -> PathBuf {
    env::var_os(key)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

pub fn pin_dir() -> PathBuf {
    env_path(PIN_DIR_ENV, bpf_api::PIN_DIR)
}

pub fn object_dir() -> PathBuf {
    env_path(OBJECT_DIR_ENV, DEFAULT_OBJECT_DIR)
}

pub fn lsm_file() -> PathBuf {
    env_path(LSM_FILE_ENV, bpf_api::LSM_PROBE_FILE)
}

pub fn cgroup_root() -> PathBuf {
    env_path(CGROUP_ROOT_ENV, DEFAULT_CGROUP_ROOT)
}

/// JSON-lines denial sink; unset means log output only.
pub fn events_path() -> Option<PathBuf> {
    env::var_os(EVENTS_PATH_ENV).map(PathBuf::from)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serial_test::serial;
    use std::ffi::{OsStr, OsString};

    pub(crate) struct EnvGuard {
        key: String,
        original: Option<OsString>,
    }

    impl EnvGuard {
        pub(crate) fn set(key: &str, value: impl AsRef<OsStr>) -> Self {
            let original = env::var_os(key);
            unsafe { env::set_var(key, value) };
            Self {
                key: key.to_string(),
                original,
            }
        }

        pub(crate) fn unset(key: &str) -> Self {
            let original = env::var_os(key);
            unsafe { env::remove_var(key) };
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = &self.original {
                unsafe { env::set_var(&self.key, value) };
            } else {
                unsafe { env::remove_var(&self.key) };
            }
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_without_overrides() {
        let _pin = EnvGuard::unset(PIN_DIR_ENV);
        let _cg = EnvGuard::unset(CGROUP_ROOT_ENV);
        let _events = EnvGuard::unset(EVENTS_PATH_ENV);
        assert_eq!(pin_dir(), PathBuf::from("/sys/fs/bpf/cvd"));
        assert_eq!(cgroup_root(), PathBuf::from("/sys/fs/cgroup"));
        assert!(events_path().is_none());
    }

    #[test]
    #[serial]
    fn overrides_win() {
        let _pin = EnvGuard::set(PIN_DIR_ENV, "/tmp/pins");
        let _lsm = EnvGuard::set(LSM_FILE_ENV, "/tmp/lsm");
        assert_eq!(pin_dir(), PathBuf::from("/tmp/pins"));
        assert_eq!(lsm_file(), PathBuf::from("/tmp/lsm"));
    }
}
