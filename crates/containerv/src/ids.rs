//! Container ids and the interface names derived from them.

use crate::error::{Error, Result};

const ID_LEN: usize = 12;
const IFNAME_MAX: usize = 15;
const VETH_PREFIX: &str = "veth";

/// Random 12-digit hex id, valid as a hostname and a cgroup name.
pub fn generate_id() -> String {
    let value: u64 = rand::random();
    format!("{:0width$x}", value & 0xffff_ffff_ffff, width = ID_LEN)
}

pub(crate) fn check_id(id: &str) -> Result<()> {
    cvd::validate_hostname(id)
        .map_err(|_| Error::InvalidArgument(format!("container id '{id}' is not a valid hostname")))
}

/// Host-side veth name: `veth<id>`, cut to the interface name limit.
pub fn host_veth(id: &str) -> String {
    let mut name = format!("{VETH_PREFIX}{id}");
    name.truncate(IFNAME_MAX);
    name
}

/// Container-side veth name: `veth<tail of id>c`.
pub fn container_veth(id: &str) -> String {
    let room = IFNAME_MAX - VETH_PREFIX.len() - 1;
    let tail = &id[id.len().saturating_sub(room)..];
    format!("{VETH_PREFIX}{tail}c")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_usable_hostnames() {
        for _ in 0..32 {
            let id = generate_id();
            assert_eq!(id.len(), ID_LEN);
            check_id(&id).unwrap();
        }
    }

    #[test]
    fn veth_names_fit_ifnamsiz() {
        assert_eq!(host_veth("abc"), "vethabc");
        assert_eq!(container_veth("abc"), "vethabcc");

        let id = "0123456789ab";
        assert_eq!(host_veth(id), "veth0123456789a");
        assert_eq!(container_veth(id), "veth23456789abc");
        assert!(host_veth(id).len() <= IFNAME_MAX);
        assert!(container_veth(id).len() <= IFNAME_MAX);
        assert_ne!(host_veth(id), container_veth(id));
    }

    #[test]
    fn ids_must_be_hostnames() {
        assert!(check_id("box-1").is_ok());
        assert!(check_id(".box").is_err());
        assert!(check_id("a/b").is_err());
    }
}
