//! Capability trimming for the container's init process.

use crate::error::{Error, Result};
use std::fs;
use std::io;

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;
const CAP_LAST_CAP_FILE: &str = "/proc/sys/kernel/cap_last_cap";
const FALLBACK_LAST_CAP: u32 = 40;

/// Capabilities a typical unprivileged workload still needs.
pub(crate) const KEEP: &[u32] = &[
    0,  // CAP_CHOWN
    1,  // CAP_DAC_OVERRIDE
    3,  // CAP_FOWNER
    4,  // CAP_FSETID
    5,  // CAP_KILL
    6,  // CAP_SETGID
    7,  // CAP_SETUID
    8,  // CAP_SETPCAP
    10, // CAP_NET_BIND_SERVICE
    18, // CAP_SYS_CHROOT
    27, // CAP_MKNOD
    29, // CAP_AUDIT_WRITE
    31, // CAP_SETFCAP
];

#[repr(C)]
struct CapHeader {
    version: u32,
    pid: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

pub(crate) fn keep_mask() -> u64 {
    KEEP.iter().fold(0u64, |mask, cap| mask | (1u64 << cap))
}

fn last_cap() -> u32 {
    fs::read_to_string(CAP_LAST_CAP_FILE)
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .unwrap_or(FALLBACK_LAST_CAP)
}

/// Drops every capability outside [`KEEP`] from the bounding set and
/// from the effective, permitted and inheritable sets of this process.
pub(crate) fn drop_nonessential() -> Result<()> {
    let keep = keep_mask();
    for cap in 0..=last_cap() {
        if keep & (1u64 << cap) != 0 {
            continue;
        }
        // SAFETY: prctl with integer arguments only.
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) };
        // EINVAL: the kernel does not know this capability.
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINVAL) {
                return Err(Error::io(format!("drop capability {cap} from bounding set"), err));
            }
        }
    }

    let mut header = CapHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let mut data = [CapData::default(); 2];
    // SAFETY: v3 capget expects a header and two data records.
    let rc = unsafe { libc::syscall(libc::SYS_capget, &mut header, data.as_mut_ptr()) };
    if rc < 0 {
        return Err(Error::io("capget", io::Error::last_os_error()));
    }
    for (index, slot) in data.iter_mut().enumerate() {
        let word = (keep >> (32 * index)) as u32;
        slot.effective &= word;
        slot.permitted &= word;
        slot.inheritable &= word;
    }
    // SAFETY: same layout as above.
    let rc = unsafe { libc::syscall(libc::SYS_capset, &mut header, data.as_ptr()) };
    if rc < 0 {
        return Err(Error::io("capset", io::Error::last_os_error()));
    }
    log::debug!(target: "containerv", "capabilities trimmed to {keep:#x}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_mask_matches_the_list() {
        let mask = keep_mask();
        assert_eq!(mask.count_ones() as usize, KEEP.len());
        assert_ne!(mask & (1 << 0), 0);
        assert_ne!(mask & (1 << 10), 0);
        // CAP_NET_RAW and CAP_SYS_ADMIN are gone.
        assert_eq!(mask & (1 << 13), 0);
        assert_eq!(mask & (1 << 21), 0);
        assert_eq!(mask >> 32, 0);
    }

    #[test]
    fn last_cap_is_sane() {
        assert!(last_cap() >= 31);
    }
}
