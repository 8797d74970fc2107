use std::fmt;
use std::str::FromStr;

/// Named syscall allow-lists that a policy can be assembled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyscallProfile {
    Minimal,
    Build,
    Network,
}

impl SyscallProfile {
    pub const ALL: [SyscallProfile; 3] = [Self::Minimal, Self::Build, Self::Network];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Build => "build",
            Self::Network => "network",
        }
    }

    /// Syscall names in this profile. Lists may repeat names and carry
    /// architecture specific variants; resolution happens at install time.
    pub fn syscalls(self) -> &'static [&'static str] {
        match self {
            Self::Minimal => MINIMAL,
            Self::Build => BUILD,
            Self::Network => NETWORK,
        }
    }
}

impl fmt::Display for SyscallProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyscallProfile {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minimal" => Ok(Self::Minimal),
            "build" => Ok(Self::Build),
            "network" => Ok(Self::Network),
            _ => Err(()),
        }
    }
}

const MINIMAL: &[&str] = &[
    "_llseek",
    "access",
    "arch_prctl",
    "brk",
    "capget",
    "capset",
    "chdir",
    "clock_getres",
    "clock_gettime",
    "clock_nanosleep",
    "close",
    "close_range",
    "dup",
    "dup2",
    "dup3",
    "epoll_create",
    "epoll_create1",
    "epoll_ctl",
    "epoll_pwait",
    "epoll_wait",
    "eventfd2",
    "execve",
    "execveat",
    "exit",
    "exit_group",
    "faccessat",
    "faccessat2",
    "fadvise64",
    "fchdir",
    "fcntl",
    "fcntl64",
    "fstat",
    "fstat64",
    "fstatat64",
    "fstatfs",
    "futex",
    "getcwd",
    "getdents",
    "getdents64",
    "getegid",
    "geteuid",
    "getgid",
    "getgroups",
    "getpgid",
    "getpgrp",
    "getpid",
    "getppid",
    "getpriority",
    "getrandom",
    "getresgid",
    "getresuid",
    "getrlimit",
    "getrusage",
    "getsid",
    "gettid",
    "gettimeofday",
    "getuid",
    "ioctl",
    "kill",
    "lseek",
    "lstat",
    "madvise",
    "membarrier",
    "mmap",
    "mmap2",
    "mprotect",
    "mremap",
    "munmap",
    "nanosleep",
    "newfstatat",
    "open",
    "openat",
    "openat2",
    "pipe",
    "pipe2",
    "poll",
    "ppoll",
    "prctl",
    "pread64",
    "prlimit64",
    "pselect6",
    "read",
    "readlink",
    "readlinkat",
    "readv",
    "restart_syscall",
    "rseq",
    "rt_sigaction",
    "rt_sigprocmask",
    "rt_sigreturn",
    "rt_sigsuspend",
    "sched_getaffinity",
    "sched_yield",
    "select",
    "set_robust_list",
    "set_tid_address",
    "setpgid",
    "setsid",
    "sigaltstack",
    "stat",
    "stat64",
    "statfs",
    "statx",
    "sysinfo",
    "tgkill",
    "time",
    "umask",
    "uname",
    "wait4",
    "waitid",
    "write",
    "writev",
];

const BUILD: &[&str] = &[
    "chmod",
    "chown",
    "clone",
    "clone3",
    "copy_file_range",
    "creat",
    "fallocate",
    "fchmod",
    "fchmodat",
    "fchown",
    "fchownat",
    "fdatasync",
    "flock",
    "fork",
    "fsync",
    "ftruncate",
    "getxattr",
    "inotify_add_watch",
    "inotify_init1",
    "inotify_rm_watch",
    "lchown",
    "lgetxattr",
    "link",
    "linkat",
    "listxattr",
    "llistxattr",
    "mkdir",
    "mkdirat",
    "mknodat",
    "msync",
    "pwrite64",
    "pwritev",
    "readahead",
    "rename",
    "renameat",
    "renameat2",
    "rmdir",
    "sched_setaffinity",
    "sendfile",
    "sendfile64",
    "setxattr",
    "splice",
    "symlink",
    "symlinkat",
    "sync_file_range",
    "tee",
    "truncate",
    "unlink",
    "unlinkat",
    "utime",
    "utimensat",
    "utimes",
    "vfork",
    "wait4",
];

const NETWORK: &[&str] = &[
    "accept",
    "accept4",
    "bind",
    "connect",
    "getpeername",
    "getsockname",
    "getsockopt",
    "listen",
    "recvfrom",
    "recvmmsg",
    "recvmsg",
    "sendmmsg",
    "sendmsg",
    "sendto",
    "setsockopt",
    "shutdown",
    "socket",
    "socketpair",
    "connect",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        for profile in SyscallProfile::ALL {
            assert_eq!(profile.as_str().parse::<SyscallProfile>(), Ok(profile));
        }
        assert!("desktop".parse::<SyscallProfile>().is_err());
    }

    #[test]
    fn minimal_covers_process_bootstrap() {
        for name in ["execve", "exit_group", "brk", "mmap", "read", "write"] {
            assert!(SyscallProfile::Minimal.syscalls().contains(&name), "{name}");
        }
    }

    #[test]
    fn arch_variants_are_kept() {
        assert!(SyscallProfile::Minimal.syscalls().contains(&"_llseek"));
        assert!(SyscallProfile::Build.syscalls().contains(&"clone3"));
    }
}
