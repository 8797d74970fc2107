//! Container policy: which paths, sockets and syscalls a sandbox may use.
//!
//! Policies are assembled from named syscall profiles, TOML files or a
//! compiled protecc profile, and are consumed by the enforcement manager
//! and the seccomp layer.

mod error;
mod policy;
mod raw;
mod rules;
mod syscalls;
mod validation;

pub use error::{PolicyError, Result};
pub use policy::Policy;
pub use protecc::{ErrorKind, Permission};
pub use rules::{NetAccess, NetRule, PathRule, SocketFamily, SocketType, UnixRule};
pub use syscalls::SyscallProfile;
pub use validation::{ValidationError, ValidationReport, ValidationWarning};

/// Size of `sockaddr_un.sun_path`.
pub const UNIX_PATH_MAX: usize = 108;
