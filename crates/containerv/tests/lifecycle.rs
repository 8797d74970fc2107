use containerv::{
    CgroupLimits, Container, ContainerOptions, ErrorKind, Layer, NamespaceType, SpawnOptions,
};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn relative_rootfs_is_rejected_before_anything_is_created() {
    init_logging();
    let runtime = tempfile::tempdir().expect("runtime base");
    let err = Container::create(
        ContainerOptions::new("relative/root")
            .with_id("box-rel")
            .with_runtime_base(runtime.path()),
    )
    .err()
    .expect("relative rootfs");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(!runtime.path().join("box-rel").exists());
}

#[test]
fn runtime_dir_collisions_fail() {
    init_logging();
    let runtime = tempfile::tempdir().expect("runtime base");
    fs::create_dir(runtime.path().join("box-dup")).expect("existing runtime dir");
    fs::write(runtime.path().join("box-dup/marker"), "keep").expect("marker");
    let result = Container::create(
        ContainerOptions::new("/")
            .with_id("box-dup")
            .with_runtime_base(runtime.path()),
    );
    assert!(result.is_err());
    assert_eq!(
        fs::read_to_string(runtime.path().join("box-dup/marker")).expect("marker survives"),
        "keep"
    );
}

fn host_bind(dir: &str) -> Option<Layer> {
    Path::new(dir).exists().then(|| Layer::HostBind {
        source: PathBuf::from(dir),
        target: PathBuf::from(dir),
        readonly: true,
    })
}

#[test]
#[ignore = "needs root, cgroup v2 and namespace support"]
fn full_lifecycle() {
    init_logging();
    let rootfs = tempfile::tempdir().expect("rootfs");
    let runtime = tempfile::tempdir().expect("runtime base");
    let mut options = ContainerOptions::new(rootfs.path())
        .with_id("cv-lifecycle")
        .with_runtime_base(runtime.path())
        .with_limits(CgroupLimits {
            memory_max: "256M".into(),
            cpu_weight: 50,
            pids_max: 32,
        });
    for dir in ["/bin", "/lib", "/lib64", "/usr"] {
        if let Some(layer) = host_bind(dir) {
            options = options.with_layer(layer);
        }
    }

    let container = Container::create(options).expect("create");
    let cgroup = container.cgroup_path().expect("cgroup").to_path_buf();
    assert_eq!(fs::read_to_string(cgroup.join("pids.max")).unwrap().trim(), "32");
    assert_eq!(container.root().unwrap(), rootfs.path());

    let done = container
        .spawn(
            &SpawnOptions::new("/bin/sh")
                .args(["sh", "-c", "test $(hostname) = cv-lifecycle && exit 7"])
                .wait(true),
        )
        .expect("spawn");
    assert_eq!(done.exit_code, Some(7));

    let mut script = tempfile::NamedTempFile::new().unwrap();
    script.write_all(b"hello inside").unwrap();
    let source = fs::File::open(script.path()).unwrap();
    container.send_files(&[("/tmp/greeting", &source)]).expect("send");
    let mut files = container.recv_files(&["/tmp/greeting", "/tmp/missing"]).expect("recv");
    let mut text = String::new();
    files.remove(0).unwrap().read_to_string(&mut text).unwrap();
    assert_eq!(text, "hello inside");
    assert!(files.remove(0).is_err());

    let namespaces = container.namespace_fds().expect("namespace fds");
    assert!(namespaces.get(NamespaceType::Pid).is_some());
    assert!(container.stats().memory_current > 0);
    assert!(!container.processes().is_empty());

    let runtime_dir = container.runtime_dir().to_path_buf();
    container.destroy().expect("destroy");
    assert!(!cgroup.exists());
    assert!(!runtime_dir.exists());
}
