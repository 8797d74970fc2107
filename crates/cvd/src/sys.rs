//! `BPF_MAP_DELETE_BATCH`, the one map command aya does not wrap.
//! Everything else goes through `aya::maps`.

use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, BorrowedFd};

const BPF_MAP_DELETE_BATCH: libc::c_long = 27;

/// Kernel-internal `ENOTSUPP`, leaked to userspace by some map types.
const ENOTSUPP: i32 = 524;

/// Batch prefix of `union bpf_attr`.
#[repr(C)]
#[derive(Default)]
struct BatchAttr {
    in_batch: u64,
    out_batch: u64,
    keys: u64,
    values: u64,
    count: u32,
    map_fd: u32,
    elem_flags: u64,
    flags: u64,
}

fn delete_batch_call(attr: &mut BatchAttr) -> io::Result<()> {
    // SAFETY: `attr` is a properly laid out bpf_attr prefix and outlives the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            BPF_MAP_DELETE_BATCH,
            attr as *mut BatchAttr as *mut libc::c_void,
            size_of::<BatchAttr>() as libc::c_uint,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub(crate) enum BatchOutcome {
    Deleted(usize),
    /// The kernel rejected the batch command; nothing was deleted.
    Unsupported,
}

/// Deletes `keys` (packed, `key_size` bytes each) with `BPF_MAP_DELETE_BATCH`.
/// Keys that are already gone are skipped.
pub(crate) fn delete_batch(fd: BorrowedFd<'_>, keys: &[u8], key_size: usize) -> io::Result<BatchOutcome> {
    let total = keys.len() / key_size;
    let mut offset = 0;
    let mut deleted = 0;
    while offset < total {
        let remaining = &keys[offset * key_size..];
        let mut attr = BatchAttr {
            keys: remaining.as_ptr() as u64,
            count: (total - offset) as u32,
            map_fd: fd.as_raw_fd() as u32,
            ..Default::default()
        };
        match delete_batch_call(&mut attr) {
            Ok(_) => {
                deleted += attr.count as usize;
                break;
            }
            Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {
                // `count` holds the number processed before the missing key.
                deleted += attr.count as usize;
                offset += attr.count as usize + 1;
            }
            Err(err)
                if offset == 0
                    && matches!(
                        err.raw_os_error(),
                        Some(libc::EINVAL) | Some(libc::EOPNOTSUPP) | Some(ENOTSUPP)
                    ) =>
            {
                return Ok(BatchOutcome::Unsupported);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(BatchOutcome::Deleted(deleted))
}
