use cvd::{EntryCounts, Manager, MapId, MemoryMaps, Status};
use policy_core::{NetAccess, NetRule, Permission, Policy, SocketFamily, SocketType, UnixRule};
use serial_test::serial;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Fixture {
    cgroups: TempDir,
    rootfs: TempDir,
}

impl Fixture {
    fn new(containers: &[&str]) -> Self {
        let cgroups = tempfile::tempdir().expect("cgroup root");
        for name in containers {
            fs::create_dir(cgroups.path().join(name)).expect("cgroup dir");
        }
        let rootfs = tempfile::tempdir().expect("rootfs");
        for dir in ["usr/bin", "usr/lib", "etc", "var/log", "tmp"] {
            fs::create_dir_all(rootfs.path().join(dir)).expect("rootfs dir");
        }
        for file in ["usr/bin/sh", "usr/lib/libc.so.6", "etc/hosts", "etc/resolv.conf"] {
            fs::write(rootfs.path().join(file), b"").expect("rootfs file");
        }
        Self { cgroups, rootfs }
    }

    fn cgroup_id(&self, name: &str) -> u64 {
        fs::metadata(self.cgroups.path().join(name))
            .expect("cgroup metadata")
            .ino()
    }

    fn rootfs(&self) -> &Path {
        self.rootfs.path()
    }
}

fn sample_policy() -> Policy {
    let mut policy = Policy::from_profiles("build");
    policy
        .add_path("/usr/bin/*", Permission::READ | Permission::EXEC)
        .unwrap()
        .add_path("/usr/lib/**", Permission::READ)
        .unwrap()
        .add_path("/etc/hosts", Permission::READ)
        .unwrap()
        .add_path("/var/log/app-[0-9]+.log", Permission::READ | Permission::WRITE)
        .unwrap()
        .add_path("/tmp", Permission::all())
        .unwrap();
    policy
        .add_net(
            NetRule::new(
                SocketFamily::Any,
                SocketType::Stream,
                NetAccess::CREATE | NetAccess::CONNECT,
            )
            .with_port(443),
        )
        .unwrap();
    policy
        .add_unix(
            UnixRule::new("containerv-log", SocketType::Dgram, NetAccess::all()).abstract_socket(),
        )
        .unwrap();
    policy
}

#[test]
fn cleanup_removes_everything_admit_added() {
    init_logging();
    let fixture = Fixture::new(&["box-a"]);
    let mut manager = Manager::new(MemoryMaps::new(), fixture.cgroups.path());
    let cgroup_id = fixture.cgroup_id("box-a");

    manager
        .admit("box-a", fixture.rootfs(), &sample_policy())
        .expect("admit");
    let admitted = manager.entries_for_cgroup(cgroup_id).expect("entries");
    assert_eq!(admitted.get(MapId::Policy), 1);
    assert_eq!(admitted.get(MapId::DirPolicy), 3);
    assert_eq!(admitted.get(MapId::BasenamePolicy), 1);
    assert_eq!(admitted.get(MapId::NetCreate), 3);
    assert_eq!(admitted.get(MapId::NetTuple), 2);
    assert_eq!(admitted.get(MapId::NetUnix), 1);

    let timings = manager.cleanup("box-a").expect("cleanup");
    assert_eq!(timings.entries.iter().sum::<usize>(), admitted.total());
    assert_eq!(
        manager.entries_for_cgroup(cgroup_id).expect("entries"),
        EntryCounts::default()
    );
    let metrics = manager.metrics();
    assert_eq!(metrics.populate_ops, 1);
    assert_eq!(metrics.cleanup_ops, 1);
    assert_eq!(metrics.containers, 0);
}

#[test]
fn cleanup_leaves_other_containers_alone() {
    init_logging();
    let fixture = Fixture::new(&["box-a", "box-b"]);
    let mut manager = Manager::new(MemoryMaps::new(), fixture.cgroups.path());
    let policy = sample_policy();
    manager.admit("box-a", fixture.rootfs(), &policy).unwrap();
    manager.admit("box-b", fixture.rootfs(), &policy).unwrap();

    let before = manager.entries_for_cgroup(fixture.cgroup_id("box-b")).unwrap();
    manager.cleanup("box-a").unwrap();
    assert_eq!(
        manager.entries_for_cgroup(fixture.cgroup_id("box-a")).unwrap().total(),
        0
    );
    assert_eq!(
        manager.entries_for_cgroup(fixture.cgroup_id("box-b")).unwrap(),
        before
    );
}

#[test]
fn invalid_hostname_is_rejected_before_touching_maps() {
    let fixture = Fixture::new(&[]);
    let mut manager = Manager::new(MemoryMaps::new(), fixture.cgroups.path());
    let err = manager
        .admit("../escape", fixture.rootfs(), &sample_policy())
        .unwrap_err();
    assert_eq!(err.kind(), policy_core::ErrorKind::InvalidArgument);
    assert_eq!(manager.metrics().failed_populate_ops, 1);
}

#[test]
#[serial]
fn singleton_routes_calls_to_the_installed_manager() {
    init_logging();
    cvd::shutdown().unwrap();
    let fixture = Fixture::new(&["box-s"]);
    let cgroup_id = fixture.cgroup_id("box-s");

    assert_eq!(cvd::status(), Status::Uninitialized);
    cvd::admit("box-s", fixture.rootfs(), &sample_policy()).unwrap();
    assert!(cvd::metrics().is_none());

    cvd::init_with(Manager::new(MemoryMaps::new(), fixture.cgroups.path())).unwrap();
    assert_eq!(cvd::status(), Status::Active);
    let err = cvd::init_with(Manager::new(MemoryMaps::new(), fixture.cgroups.path())).unwrap_err();
    assert_eq!(err.kind(), policy_core::ErrorKind::Busy);

    cvd::admit("box-s", fixture.rootfs(), &sample_policy()).unwrap();
    assert!(cvd::entries_for_cgroup(cgroup_id).unwrap().total() > 0);
    assert!(cvd::container_metrics("box-s").is_some());
    let admitted = cvd::container_metrics("box-s").unwrap().entries;
    let timings = cvd::cleanup("box-s").unwrap().expect("final timings");
    assert_eq!(timings.entries, admitted);
    assert!(cvd::container_metrics("box-s").is_none());
    assert_eq!(cvd::entries_for_cgroup(cgroup_id).unwrap().total(), 0);
    assert_eq!(cvd::metrics().unwrap().cleanup_ops, 1);

    cvd::shutdown().unwrap();
    assert_eq!(cvd::status(), Status::Uninitialized);
}

#[test]
#[serial]
fn missing_bpf_lsm_leaves_the_manager_dormant() {
    init_logging();
    cvd::shutdown().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let lsm = dir.path().join("lsm");
    fs::write(&lsm, "lockdown,capability,yama").unwrap();
    // SAFETY: serialized with every other test touching the environment.
    unsafe { std::env::set_var(cvd::paths::LSM_FILE_ENV, &lsm) };

    let status = cvd::init().unwrap();
    unsafe { std::env::remove_var(cvd::paths::LSM_FILE_ENV) };
    assert_eq!(status, Status::Unavailable);
    assert_eq!(cvd::init().unwrap(), Status::Unavailable);
    cvd::admit("box-x", dir.path(), &Policy::new()).unwrap();
    assert_eq!(cvd::cleanup("box-x").unwrap(), None);
    assert_eq!(cvd::entries_for_cgroup(1).unwrap(), EntryCounts::default());

    cvd::shutdown().unwrap();
    assert_eq!(cvd::status(), Status::Uninitialized);
}

#[test]
#[serial]
fn failed_program_load_leaves_enforcement_disabled() {
    init_logging();
    cvd::shutdown().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let lsm = dir.path().join("lsm");
    fs::write(&lsm, "lockdown,capability,bpf").unwrap();
    let objects = dir.path().join("objs");
    fs::create_dir(&objects).unwrap();
    // SAFETY: serialized with every other test touching the environment.
    unsafe {
        std::env::set_var(cvd::paths::LSM_FILE_ENV, &lsm);
        std::env::set_var(cvd::paths::OBJECT_DIR_ENV, &objects);
        std::env::set_var(cvd::paths::PIN_DIR_ENV, dir.path().join("pins"));
    }

    let status = cvd::init();
    unsafe {
        std::env::remove_var(cvd::paths::LSM_FILE_ENV);
        std::env::remove_var(cvd::paths::OBJECT_DIR_ENV);
        std::env::remove_var(cvd::paths::PIN_DIR_ENV);
    }
    assert_eq!(status.unwrap(), Status::Unavailable);
    assert_eq!(cvd::status(), Status::Unavailable);
    cvd::admit("box-l", dir.path(), &sample_policy()).unwrap();
    assert_eq!(cvd::cleanup("box-l").unwrap(), None);

    cvd::shutdown().unwrap();
}

#[test]
fn entry_failures_are_counted_without_failing_admit() {
    init_logging();
    let fixture = Fixture::new(&["box-f"]);
    let mut manager = Manager::new(MemoryMaps::new(), fixture.cgroups.path());
    let mut policy = Policy::new();
    policy
        .add_path("/etc/hosts", Permission::READ)
        .unwrap()
        .add_path("/etc/hosts/app-[0-9]+.log", Permission::READ)
        .unwrap();

    manager.admit("box-f", fixture.rootfs(), &policy).expect("admit");
    let metrics = manager.metrics();
    assert_eq!(metrics.populate_ops, 1);
    assert_eq!(metrics.failed_populate_ops, 0);
    assert_eq!(metrics.failed_entries, 1);
    let live = manager.container_metrics("box-f").unwrap();
    assert_eq!(live.last_cleanup_us, 0);
    assert_eq!(live.entries[MapId::Policy as usize], 1);
}
