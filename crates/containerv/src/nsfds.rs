use crate::error::{Error, Result};
use nix::sched::{CloneFlags, setns};
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::Path;

/// Namespace kinds exposed through `/proc/<pid>/ns`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NamespaceType {
    Cgroup = 0,
    Ipc = 1,
    Mnt = 2,
    Net = 3,
    Pid = 4,
    Time = 5,
    User = 6,
    Uts = 7,
}

impl NamespaceType {
    pub const ALL: [NamespaceType; 8] = [
        Self::Cgroup,
        Self::Ipc,
        Self::Mnt,
        Self::Net,
        Self::Pid,
        Self::Time,
        Self::User,
        Self::Uts,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Cgroup => "cgroup",
            Self::Ipc => "ipc",
            Self::Mnt => "mnt",
            Self::Net => "net",
            Self::Pid => "pid",
            Self::Time => "time",
            Self::User => "user",
            Self::Uts => "uts",
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    pub fn tag(self) -> u32 {
        self as u32
    }

    fn clone_flag(self) -> CloneFlags {
        match self {
            Self::Cgroup => CloneFlags::CLONE_NEWCGROUP,
            Self::Ipc => CloneFlags::CLONE_NEWIPC,
            Self::Mnt => CloneFlags::CLONE_NEWNS,
            Self::Net => CloneFlags::CLONE_NEWNET,
            Self::Pid => CloneFlags::CLONE_NEWPID,
            Self::Time => CloneFlags::from_bits_retain(libc::CLONE_NEWTIME),
            Self::User => CloneFlags::CLONE_NEWUSER,
            Self::Uts => CloneFlags::CLONE_NEWUTS,
        }
    }
}

/// Open namespace handles of a container, one per kind at most.
#[derive(Debug, Default)]
pub struct NamespaceFds {
    fds: Vec<(NamespaceType, OwnedFd)>,
}

impl NamespaceFds {
    /// Opens every namespace of the calling process; kinds the kernel
    /// does not provide are left out.
    pub(crate) fn open_self(proc_root: &Path) -> Result<Self> {
        let dir = proc_root.join("self/ns");
        let mut fds = Vec::new();
        for kind in NamespaceType::ALL {
            let path = dir.join(kind.name());
            match File::open(&path) {
                Ok(file) => fds.push((kind, OwnedFd::from(file))),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(Error::io(format!("open {}", path.display()), err)),
            }
        }
        Ok(Self { fds })
    }

    /// Pairs fds received over the control socket with their tags.
    pub(crate) fn from_parts(tags: &[u32], fds: Vec<OwnedFd>) -> Result<Self> {
        if tags.len() != fds.len() {
            return Err(Error::Protocol(format!(
                "{} namespace tags for {} descriptors",
                tags.len(),
                fds.len()
            )));
        }
        let mut out = Self::default();
        for (tag, fd) in tags.iter().zip(fds) {
            let kind = NamespaceType::from_tag(*tag)
                .ok_or_else(|| Error::Protocol(format!("unknown namespace tag {tag}")))?;
            if out.get(kind).is_some() {
                return Err(Error::Protocol(format!("duplicate {} namespace", kind.name())));
            }
            out.fds.push((kind, fd));
        }
        Ok(out)
    }

    pub fn get(&self, kind: NamespaceType) -> Option<BorrowedFd<'_>> {
        self.fds
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, fd)| fd.as_fd())
    }

    pub fn kinds(&self) -> impl Iterator<Item = NamespaceType> + '_ {
        self.fds.iter().map(|(kind, _)| *kind)
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (NamespaceType, BorrowedFd<'_>)> {
        self.fds.iter().map(|(kind, fd)| (*kind, fd.as_fd()))
    }

    /// Moves the calling thread into every held namespace. The user
    /// namespace goes first so the others can be joined with its
    /// privileges; the mount namespace goes last. Joining a user
    /// namespace requires a single-threaded caller.
    pub fn enter(&self) -> Result<()> {
        for kind in join_order(self.kinds()) {
            let Some(fd) = self.get(kind) else { continue };
            setns(fd, kind.clone_flag())
                .map_err(|errno| Error::sys(format!("setns {}", kind.name()), errno))?;
        }
        Ok(())
    }
}

fn join_order(kinds: impl Iterator<Item = NamespaceType>) -> Vec<NamespaceType> {
    let mut order: Vec<_> = kinds.collect();
    order.sort_by_key(|kind| match kind {
        NamespaceType::User => 0,
        NamespaceType::Mnt => 2,
        _ => 1,
    });
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn tags_round_trip() {
        for kind in NamespaceType::ALL {
            assert_eq!(NamespaceType::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(NamespaceType::from_tag(8), None);
    }

    #[test]
    fn missing_entries_are_skipped() {
        let proc = tempfile::tempdir().unwrap();
        let ns = proc.path().join("self/ns");
        fs::create_dir_all(&ns).unwrap();
        fs::write(ns.join("net"), "").unwrap();
        fs::write(ns.join("uts"), "").unwrap();

        let fds = NamespaceFds::open_self(proc.path()).unwrap();
        assert_eq!(fds.len(), 2);
        assert!(fds.get(NamespaceType::Net).is_some());
        assert!(fds.get(NamespaceType::Pid).is_none());
    }

    #[test]
    fn from_parts_checks_tags() {
        let file = tempfile::tempfile().unwrap();
        let fds = NamespaceFds::from_parts(&[NamespaceType::Ipc.tag()], vec![file.into()]).unwrap();
        assert!(fds.get(NamespaceType::Ipc).is_some());

        let a = tempfile::tempfile().unwrap();
        let b = tempfile::tempfile().unwrap();
        assert!(NamespaceFds::from_parts(&[3, 3], vec![a.into(), b.into()]).is_err());
        assert!(NamespaceFds::from_parts(&[1, 2], Vec::new()).is_err());
        let c = tempfile::tempfile().unwrap();
        assert!(NamespaceFds::from_parts(&[42], vec![c.into()]).is_err());
    }

    #[test]
    fn user_first_mount_last() {
        let order = join_order(
            [
                NamespaceType::Mnt,
                NamespaceType::Net,
                NamespaceType::User,
                NamespaceType::Uts,
            ]
            .into_iter(),
        );
        assert_eq!(order.first(), Some(&NamespaceType::User));
        assert_eq!(order.last(), Some(&NamespaceType::Mnt));
        assert_eq!(order.len(), 4);
    }
}
