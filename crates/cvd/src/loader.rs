use crate::error::{Error, Result};
use agent_lite::{Agent, Config as AgentConfig, EventKind, Source};
use aya::maps::{MapData, MapInfo, ring_buf::RingBuf};
use aya::programs::Lsm;
use aya::programs::lsm::LsmLink;
use aya::{Btf, Ebpf, EbpfLoader};
use bpf_api::{
    FS_EVENTS_RING, FS_OBJECT, FS_PROGRAMS, MAP_SPECS, MapSpec, NET_EVENTS_RING, NET_OBJECT,
    NET_PROGRAMS,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Returns whether `bpf` is one of the active LSMs listed in `file`.
pub(crate) fn lsm_enabled(file: &Path) -> io::Result<bool> {
    let content = fs::read_to_string(file)?;
    Ok(content.trim().split(',').any(|name| name.trim() == "bpf"))
}

fn pin_matches(path: &Path, spec: &MapSpec) -> bool {
    let info = match MapInfo::from_pin(path) {
        Ok(info) => info,
        Err(err) => {
            log::debug!(target: "cvd", "cannot query pin {}: {err}", path.display());
            return false;
        }
    };
    let map_type = info.map_type().map(|kind| kind as u32);
    map_type.is_ok_and(|kind| kind == spec.map_type)
        && info.key_size() == spec.key_size
        && info.value_size() == spec.value_size
}

/// Removes pins whose map no longer has the expected layout so the next
/// load creates fresh maps in their place.
pub(crate) fn reconcile_pins(pin_dir: &Path) -> Result<()> {
    fs::create_dir_all(pin_dir)
        .map_err(|err| Error::io(format!("create {}", pin_dir.display()), err))?;
    for spec in &MAP_SPECS {
        let path = pin_dir.join(spec.name);
        if !path.exists() {
            continue;
        }
        if pin_matches(&path, spec) {
            log::debug!(target: "cvd", "reusing pinned map {}", spec.name);
            continue;
        }
        log::warn!(target: "cvd", "removing stale pinned map {}", path.display());
        fs::remove_file(&path)
            .map_err(|err| Error::io(format!("remove {}", path.display()), err))?;
    }
    Ok(())
}

fn load_object(path: &Path, pin_dir: &Path) -> Result<Ebpf> {
    let data = fs::read(path).map_err(|err| Error::io(format!("read {}", path.display()), err))?;
    EbpfLoader::new()
        .map_pin_path(pin_dir)
        .load(&data)
        .map_err(|err| Error::Bpf(format!("failed to load BPF object {}: {err}", path.display())))
}

fn attach_lsm(ebpf: &mut Ebpf, hooks: &[&str], btf: &Btf, links: &mut Vec<LsmLink>) -> Result<()> {
    for &hook in hooks {
        let program = ebpf
            .program_mut(hook)
            .ok_or_else(|| Error::Bpf(format!("program {hook} not found")))?;
        let program: &mut Lsm = program
            .try_into()
            .map_err(|err| Error::Bpf(format!("program {hook} type mismatch: {err}")))?;
        program
            .load(hook, btf)
            .map_err(|err| Error::Bpf(format!("load {hook}: {err}")))?;
        let link_id = program
            .attach()
            .map_err(|err| Error::Bpf(format!("attach {hook}: {err}")))?;
        let link = program
            .take_link(link_id)
            .map_err(|err| Error::Bpf(format!("link {hook}: {err}")))?;
        links.push(link);
    }
    Ok(())
}

fn take_ring(ebpf: &mut Ebpf, name: &str) -> Result<RingBuf<MapData>> {
    let map = ebpf
        .take_map(name)
        .ok_or_else(|| Error::Bpf(format!("ring buffer {name} not found")))?;
    RingBuf::try_from(map).map_err(|err| Error::Bpf(format!("ring buffer {name}: {err}")))
}

/// Programs, links and the event thread owned by an active manager.
pub(crate) struct Loaded {
    pin_dir: PathBuf,
    agent: Option<Agent>,
    links: Vec<LsmLink>,
    objects: Vec<Ebpf>,
}

impl Loaded {
    pub(crate) fn load(pin_dir: &Path, object_dir: &Path, events_path: Option<PathBuf>) -> Result<Self> {
        reconcile_pins(pin_dir)?;
        let btf = Btf::from_sys_fs().map_err(|err| Error::Bpf(format!("kernel BTF: {err}")))?;
        let mut loaded = Loaded {
            pin_dir: pin_dir.to_path_buf(),
            agent: None,
            links: Vec::new(),
            objects: Vec::new(),
        };
        let mut sources = Vec::new();
        for (object, hooks, ring, kind) in [
            (FS_OBJECT, FS_PROGRAMS, FS_EVENTS_RING, EventKind::Fs),
            (NET_OBJECT, NET_PROGRAMS, NET_EVENTS_RING, EventKind::Net),
        ] {
            let mut ebpf = load_object(&object_dir.join(object), pin_dir)?;
            attach_lsm(&mut ebpf, hooks, &btf, &mut loaded.links)?;
            sources.push(Source::new(kind, take_ring(&mut ebpf, ring)?));
            loaded.objects.push(ebpf);
        }
        for spec in &MAP_SPECS {
            if !pin_dir.join(spec.name).exists() {
                return Err(Error::Bpf(format!(
                    "map {} was not pinned under {}",
                    spec.name,
                    pin_dir.display()
                )));
            }
        }
        let cfg = AgentConfig {
            events_path,
            ..AgentConfig::default()
        };
        let agent = agent_lite::spawn(sources, cfg)
            .map_err(|err| Error::io("denial event thread", err))?;
        loaded.agent = Some(agent);
        log::info!(
            target: "cvd",
            "attached {} LSM programs, maps pinned under {}",
            loaded.links.len(),
            pin_dir.display()
        );
        Ok(loaded)
    }

    pub(crate) fn pin_dir(&self) -> &Path {
        &self.pin_dir
    }

    /// Stops the event thread, detaches every program and removes the pins.
    pub(crate) fn shutdown(mut self) -> Result<()> {
        let stopped = match self.agent.take() {
            Some(agent) => agent.stop().map_err(|err| Error::io("denial event thread", err)),
            None => Ok(()),
        };
        self.links.clear();
        self.objects.clear();
        remove_pins(&self.pin_dir);
        stopped
    }
}

pub(crate) fn remove_pins(pin_dir: &Path) {
    for spec in &MAP_SPECS {
        let path = pin_dir.join(spec.name);
        if let Err(err) = fs::remove_file(&path)
            && err.kind() != io::ErrorKind::NotFound
        {
            log::warn!(target: "cvd", "failed to remove pin {}: {err}", path.display());
        }
    }
    if let Err(err) = fs::remove_dir(pin_dir)
        && err.kind() != io::ErrorKind::NotFound
    {
        log::debug!(target: "cvd", "keeping pin directory {}: {err}", pin_dir.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lsm_detection_needs_a_whole_token() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("lsm");
        fs::write(&file, "lockdown,capability,landlock,yama,apparmor,bpf\n").unwrap();
        assert!(lsm_enabled(&file).unwrap());
        fs::write(&file, "lockdown,capability,bpfilter").unwrap();
        assert!(!lsm_enabled(&file).unwrap());
        fs::write(&file, "bpf").unwrap();
        assert!(lsm_enabled(&file).unwrap());
        assert!(lsm_enabled(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn unreadable_pins_are_removed() {
        let dir = tempdir().unwrap();
        let stale = dir.path().join(bpf_api::POLICY_MAP);
        fs::write(&stale, b"not a map").unwrap();
        reconcile_pins(dir.path()).unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn remove_pins_tolerates_missing_files() {
        let dir = tempdir().unwrap();
        let pins = dir.path().join("cvd");
        fs::create_dir(&pins).unwrap();
        fs::write(pins.join(bpf_api::NET_UNIX_MAP), b"").unwrap();
        remove_pins(&pins);
        assert!(!pins.exists());
    }
}
