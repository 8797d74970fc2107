use std::env;
use std::path::PathBuf;

pub const RUNTIME_DIR_ENV: &str = "CONTAINERV_RUNTIME_DIR";
const DEFAULT_RUNTIME_DIR: &str = "/run/containerv";

/// Base directory holding one runtime directory per container.
pub fn runtime_base() -> PathBuf {
    env::var_os(RUNTIME_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNTIME_DIR))
}

pub use cvd::paths::cgroup_root;

pub(crate) const CONTROL_SOCKET: &str = "control";
pub(crate) const PROC_ROOT: &str = "/proc";
pub(crate) const NET_CLASS_ROOT: &str = "/sys/class/net";

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn runtime_base_honours_the_environment() {
        let original = env::var_os(RUNTIME_DIR_ENV);
        unsafe { env::remove_var(RUNTIME_DIR_ENV) };
        assert_eq!(runtime_base(), PathBuf::from("/run/containerv"));
        unsafe { env::set_var(RUNTIME_DIR_ENV, "/tmp/cv-runtime") };
        assert_eq!(runtime_base(), PathBuf::from("/tmp/cv-runtime"));
        match original {
            Some(value) => unsafe { env::set_var(RUNTIME_DIR_ENV, value) },
            None => unsafe { env::remove_var(RUNTIME_DIR_ENV) },
        }
    }
}
