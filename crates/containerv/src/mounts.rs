//! Root filesystem assembly inside the child's mount namespace.

use crate::error::{Error, Result};
use crate::options::Layer;
use nix::mount::{MsFlags, mount};
use nix::sys::stat::{Mode, SFlag, makedev, mknod, umask};
use nix::unistd::{chdir, chroot};
use std::fs;
use std::path::{Component, Path, PathBuf};

struct Device {
    name: &'static str,
    major: u64,
    minor: u64,
}

const DEVICES: [Device; 4] = [
    Device { name: "null", major: 1, minor: 3 },
    Device { name: "zero", major: 1, minor: 5 },
    Device { name: "random", major: 1, minor: 8 },
    Device { name: "urandom", major: 1, minor: 9 },
];

const NONE: Option<&str> = None;

fn sys_mount(
    source: Option<&Path>,
    target: &Path,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    mount(source, target, fstype, flags, data)
        .map_err(|errno| Error::sys(format!("mount {}", target.display()), errno))
}

/// Stops mount events from propagating back to the host.
pub(crate) fn make_private() -> Result<()> {
    mount(NONE, "/", NONE, MsFlags::MS_REC | MsFlags::MS_PRIVATE, NONE)
        .map_err(|errno| Error::sys("make / private", errno))
}

/// `target` re-rooted under `root`; `..` components are rejected.
pub(crate) fn inside(root: &Path, target: &Path) -> Result<PathBuf> {
    let mut out = root.to_path_buf();
    for component in target.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(Error::InvalidArgument(format!(
                    "mount target {} escapes the root",
                    target.display()
                )));
            }
        }
    }
    Ok(out)
}

/// Mount data for an overlay; `lower` is ordered topmost first.
pub(crate) fn overlay_options(lower: &[PathBuf], upper: &Path, work: &Path) -> Result<String> {
    let mut dirs = Vec::with_capacity(lower.len());
    for dir in lower.iter().map(PathBuf::as_path).chain([upper, work]) {
        let text = dir.to_str().ok_or_else(|| {
            Error::InvalidArgument(format!("overlay path {} is not UTF-8", dir.display()))
        })?;
        if text.contains([',', ':']) {
            return Err(Error::InvalidArgument(format!(
                "overlay path {text} contains a separator"
            )));
        }
        dirs.push(text);
    }
    let (lower_dirs, rw) = dirs.split_at(lower.len());
    Ok(format!(
        "lowerdir={},upperdir={},workdir={}",
        lower_dirs.join(":"),
        rw[0],
        rw[1]
    ))
}

fn bind(source: &Path, target: &Path, readonly: bool) -> Result<()> {
    sys_mount(
        Some(source),
        target,
        None,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None,
    )?;
    if readonly {
        sys_mount(
            None,
            target,
            None,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None,
        )?;
    }
    Ok(())
}

/// Creates a mount point matching the kind of `source`.
fn mount_point(source: &Path, target: &Path) -> Result<()> {
    if target.exists() {
        return Ok(());
    }
    let created = if source.is_dir() {
        fs::create_dir_all(target)
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| Error::io(format!("create {}", parent.display()), err))?;
        }
        fs::File::create(target).map(|_| ())
    };
    created.map_err(|err| Error::io(format!("create mount point {}", target.display()), err))
}

fn apply_layer(rootfs: &Path, layer: &Layer) -> Result<()> {
    match layer {
        Layer::Base(dir) => bind(dir, rootfs, false),
        Layer::Overlay { lower, upper, work } => {
            let data = overlay_options(lower, upper, work)?;
            sys_mount(None, rootfs, Some("overlay"), MsFlags::empty(), Some(data.as_str()))
        }
        Layer::HostBind {
            source,
            target,
            readonly,
        } => {
            let target = inside(rootfs, target)?;
            mount_point(source, &target)?;
            bind(source, &target, *readonly)
        }
    }
}

fn populate_dev(dev: &Path) -> Result<()> {
    let previous = umask(Mode::empty());
    let result = DEVICES.iter().try_for_each(|device| {
        let path = dev.join(device.name);
        let mode = Mode::from_bits_truncate(0o666);
        match mknod(&path, SFlag::S_IFCHR, mode, makedev(device.major, device.minor)) {
            Ok(()) => Ok(()),
            // Device nodes cannot be created inside a user namespace.
            Err(nix::errno::Errno::EPERM) => {
                fs::File::create(&path)
                    .map_err(|err| Error::io(format!("create {}", path.display()), err))?;
                bind(&Path::new("/dev").join(device.name), &path, false)
            }
            Err(errno) => Err(Error::sys(format!("mknod {}", path.display()), errno)),
        }
    });
    umask(previous);
    result
}

fn mount_virtual(rootfs: &Path) -> Result<()> {
    let sys = inside(rootfs, Path::new("/sys"))?;
    fs::create_dir_all(&sys).map_err(|err| Error::io(format!("create {}", sys.display()), err))?;
    if let Err(err) = sys_mount(
        Some(Path::new("sysfs")),
        &sys,
        Some("sysfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RDONLY,
        None,
    ) {
        log::warn!(target: "containerv", "{err}");
    }
    for (dir, data) in [("/tmp", "mode=1777"), ("/dev", "mode=755")] {
        let target = inside(rootfs, Path::new(dir))?;
        fs::create_dir_all(&target)
            .map_err(|err| Error::io(format!("create {}", target.display()), err))?;
        sys_mount(
            Some(Path::new("tmpfs")),
            &target,
            Some("tmpfs"),
            MsFlags::MS_NOSUID,
            Some(data),
        )?;
    }
    populate_dev(&inside(rootfs, Path::new("/dev"))?)
}

/// One step of root filesystem assembly.
#[derive(Debug, PartialEq)]
enum Step<'a> {
    Layer(&'a Layer),
    Virtual,
    /// Bind of the runtime directory onto `target`, its path inside the root.
    RuntimeDir { target: PathBuf },
}

/// Layers first, then the virtual filesystems, then the runtime directory,
/// so a tmpfs on `/tmp` cannot cover a runtime directory below it.
fn assembly<'a>(rootfs: &Path, layers: &'a [Layer], runtime_dir: &Path) -> Result<Vec<Step<'a>>> {
    let mut steps: Vec<Step<'a>> = layers.iter().map(Step::Layer).collect();
    steps.push(Step::Virtual);
    steps.push(Step::RuntimeDir {
        target: inside(rootfs, runtime_dir)?,
    });
    Ok(steps)
}

/// Applies the layers, mounts the virtual filesystems, exposes the runtime
/// directory at its host path and makes `rootfs` the new root.
pub(crate) fn enter_rootfs(rootfs: &Path, layers: &[Layer], runtime_dir: &Path) -> Result<()> {
    for step in assembly(rootfs, layers, runtime_dir)? {
        match step {
            Step::Layer(layer) => apply_layer(rootfs, layer)?,
            Step::Virtual => mount_virtual(rootfs)?,
            Step::RuntimeDir { target } => {
                fs::create_dir_all(&target)
                    .map_err(|err| Error::io(format!("create {}", target.display()), err))?;
                bind(runtime_dir, &target, false)?;
            }
        }
    }

    chdir(rootfs).map_err(|errno| Error::sys(format!("chdir {}", rootfs.display()), errno))?;
    chroot(rootfs).map_err(|errno| Error::sys(format!("chroot {}", rootfs.display()), errno))?;
    chdir("/").map_err(|errno| Error::sys("chdir /", errno))?;
    log::debug!(target: "containerv", "entered root {}", rootfs.display());
    Ok(())
}

/// Mounts a fresh procfs; must run inside the container's pid namespace.
pub(crate) fn mount_proc() -> Result<()> {
    let proc = Path::new(crate::paths::PROC_ROOT);
    fs::create_dir_all(proc).map_err(|err| Error::io("create /proc", err))?;
    sys_mount(
        Some(Path::new("proc")),
        proc,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None,
    )
}
