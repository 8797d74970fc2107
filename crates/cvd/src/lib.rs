//! BPF LSM enforcement manager.
//!
//! A process-wide singleton owns the pinned policy maps, the attached LSM
//! programs and the denial-event thread. Containers are admitted by
//! inserting map entries keyed by their cgroup id; every inserted key is
//! tracked so cleanup can remove exactly what admit added.
//!
//! When the running kernel does not list `bpf` among its active LSMs the
//! manager stays dormant and every call succeeds without doing anything.

mod context;
mod error;
mod loader;
mod manager;
mod maps;
mod metrics;
pub mod paths;
mod populate;
mod sys;

pub use context::BpfContainerContext;
pub use error::{Error, Result};
pub use manager::{EntryCounts, Manager, validate_hostname};
pub use maps::{KernelMaps, MapId, MapStore, MemoryMaps};
pub use metrics::{ContainerMetrics, Metrics};

use policy_core::Policy;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Uninitialized,
    /// The kernel lacks BPF LSM; calls are accepted and ignored.
    Unavailable,
    Active,
}

enum State {
    Uninitialized,
    Unavailable,
    Active(Manager),
}

impl State {
    fn status(&self) -> Status {
        match self {
            State::Uninitialized => Status::Uninitialized,
            State::Unavailable => Status::Unavailable,
            State::Active(_) => Status::Active,
        }
    }
}

static STATE: Mutex<State> = Mutex::new(State::Uninitialized);

fn state() -> MutexGuard<'static, State> {
    STATE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Probes for BPF LSM and, when present, loads the programs and maps.
/// Calling it again after a successful init reports the current status.
pub fn init() -> Result<Status> {
    let mut state = state();
    if !matches!(*state, State::Uninitialized) {
        return Ok(state.status());
    }
    let lsm_file = paths::lsm_file();
    match loader::lsm_enabled(&lsm_file) {
        Ok(true) => {}
        Ok(false) => {
            log::info!(target: "cvd", "BPF LSM is not active, enforcement disabled");
            *state = State::Unavailable;
            return Ok(Status::Unavailable);
        }
        Err(err) => {
            log::info!(
                target: "cvd",
                "cannot read {}: {err}, enforcement disabled",
                lsm_file.display()
            );
            *state = State::Unavailable;
            return Ok(Status::Unavailable);
        }
    }
    match Manager::load() {
        Ok(manager) => {
            *state = State::Active(manager);
            Ok(Status::Active)
        }
        Err(err) => {
            log::warn!(target: "cvd", "loading BPF LSM programs failed: {err}, enforcement disabled");
            *state = State::Unavailable;
            Ok(Status::Unavailable)
        }
    }
}

/// Installs a prepared manager as the active singleton.
pub fn init_with(manager: Manager) -> Result<()> {
    let mut state = state();
    if !matches!(*state, State::Uninitialized) {
        return Err(Error::AlreadyInitialized);
    }
    *state = State::Active(manager);
    Ok(())
}

/// Releases everything the singleton owns and returns it to the
/// uninitialized state.
pub fn shutdown() -> Result<()> {
    let previous = std::mem::replace(&mut *state(), State::Uninitialized);
    match previous {
        State::Active(manager) => manager.shutdown(),
        State::Uninitialized | State::Unavailable => Ok(()),
    }
}

pub fn status() -> Status {
    state().status()
}

pub fn admit(container_id: &str, rootfs: &Path, policy: &Policy) -> Result<()> {
    match &mut *state() {
        State::Active(manager) => manager.admit(container_id, rootfs, policy),
        _ => Ok(()),
    }
}

/// Removes a container's entries. Returns its final timings, or `None`
/// when enforcement is off.
pub fn cleanup(container_id: &str) -> Result<Option<ContainerMetrics>> {
    match &mut *state() {
        State::Active(manager) => manager.cleanup(container_id).map(Some),
        _ => Ok(None),
    }
}

pub fn metrics() -> Option<Metrics> {
    match &*state() {
        State::Active(manager) => Some(manager.metrics()),
        _ => None,
    }
}

pub fn container_metrics(container_id: &str) -> Option<ContainerMetrics> {
    match &*state() {
        State::Active(manager) => manager.container_metrics(container_id),
        _ => None,
    }
}

/// Live map entries for `cgroup_id`; all zero when enforcement is off.
pub fn entries_for_cgroup(cgroup_id: u64) -> Result<EntryCounts> {
    match &*state() {
        State::Active(manager) => manager.entries_for_cgroup(cgroup_id),
        _ => Ok(EntryCounts::default()),
    }
}
