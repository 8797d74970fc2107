use crate::error::{Error, Result};
use libseccomp::{ScmpAction, ScmpFilterContext, ScmpSyscall};

/// Calls the control server makes after the filter is installed; always
/// allowed so PID1 keeps serving whatever the allow-list says.
const SERVER_SYSCALLS: &[&str] = &[
    "poll",
    "ppoll",
    "recvmsg",
    "sendmsg",
    "sendto",
    "recvfrom",
    "read",
    "write",
    "close",
    "openat",
    "fstat",
    "newfstatat",
    "statx",
    "fchmod",
    "fork",
    "clone",
    "clone3",
    "execve",
    "wait4",
    "waitid",
    "kill",
    "exit",
    "exit_group",
    "rt_sigaction",
    "rt_sigprocmask",
    "rt_sigreturn",
    "brk",
    "mmap",
    "munmap",
    "mremap",
    "futex",
    "getpid",
];

pub(crate) struct Filter {
    ctx: ScmpFilterContext,
    allowed: usize,
}

impl Filter {
    pub(crate) fn allowed(&self) -> usize {
        self.allowed
    }

    pub(crate) fn install(self) -> Result<()> {
        self.ctx
            .load()
            .map_err(|err| Error::Seccomp(format!("load filter: {err}")))
    }
}

/// Allow-list filter: everything not named fails with EPERM. Names the
/// running architecture does not know are skipped.
pub(crate) fn build_filter(allow: &[&str]) -> Result<Filter> {
    let mut ctx = ScmpFilterContext::new_filter(ScmpAction::Errno(libc::EPERM))
        .map_err(|err| Error::Seccomp(format!("create filter: {err}")))?;
    let mut allowed = 0;
    let mut seen = std::collections::HashSet::new();
    for name in allow.iter().chain(SERVER_SYSCALLS) {
        if !seen.insert(*name) {
            continue;
        }
        let Ok(sys) = ScmpSyscall::from_name(name) else {
            log::debug!(target: "containerv", "seccomp: unknown syscall {name}");
            continue;
        };
        ctx.add_rule(ScmpAction::Allow, sys)
            .map_err(|err| Error::Seccomp(format!("allow {name}: {err}")))?;
        allowed += 1;
    }
    Ok(Filter { ctx, allowed })
}
