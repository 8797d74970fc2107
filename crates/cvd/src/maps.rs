use crate::error::{Error, Result};
use crate::sys::{self, BatchOutcome};
use aya::maps::{HashMap, Map, MapData, MapError};
use aya::sys::SyscallError;
use bpf_api::{
    BasenamePolicy, MAP_SPECS, MapSpec, NetCreateKey, NetPolicyValue, NetTupleKey, NetUnixKey,
    PolicyKey, PolicyValue,
};
use bytemuck::Pod as BytemuckPod;
use std::collections::BTreeMap;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;

/// The six per-container policy maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MapId {
    Policy = 0,
    DirPolicy = 1,
    BasenamePolicy = 2,
    NetCreate = 3,
    NetTuple = 4,
    NetUnix = 5,
}

impl MapId {
    pub const COUNT: usize = 6;
    pub const ALL: [MapId; Self::COUNT] = [
        MapId::Policy,
        MapId::DirPolicy,
        MapId::BasenamePolicy,
        MapId::NetCreate,
        MapId::NetTuple,
        MapId::NetUnix,
    ];

    pub fn spec(self) -> &'static MapSpec {
        &MAP_SPECS[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.spec().name
    }

    pub fn key_size(self) -> usize {
        self.spec().key_size as usize
    }

    pub fn value_size(self) -> usize {
        self.spec().value_size as usize
    }
}

/// Byte-level access to the policy maps. Keys and values are the
/// `bpf_api` structs viewed as bytes.
pub trait MapStore: Send {
    fn update(&mut self, map: MapId, key: &[u8], value: &[u8]) -> Result<()>;

    fn lookup(&self, map: MapId, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Returns `false` when the key was already absent.
    fn delete(&mut self, map: MapId, key: &[u8]) -> Result<bool>;

    /// Removes every key, ignoring ones already gone. Returns how many
    /// entries were actually deleted.
    fn delete_batch(&mut self, map: MapId, keys: &[Vec<u8>]) -> Result<usize> {
        let mut deleted = 0;
        for key in keys {
            if self.delete(map, key)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn keys(&self, map: MapId) -> Result<Vec<Vec<u8>>>;
}

fn check_len(map: MapId, what: &str, got: usize, want: usize) -> Result<()> {
    if got != want {
        return Err(Error::InvalidArgument(format!(
            "{}: {what} is {got} bytes, expected {want}",
            map.name()
        )));
    }
    Ok(())
}

/// In-process map store used when no kernel is involved.
#[derive(Debug, Default)]
pub struct MemoryMaps {
    maps: [BTreeMap<Vec<u8>, Vec<u8>>; MapId::COUNT],
    batch_calls: usize,
}

impl MemoryMaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, map: MapId) -> usize {
        self.maps[map as usize].len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.iter().all(BTreeMap::is_empty)
    }

    /// Number of `delete_batch` calls served.
    pub fn batch_calls(&self) -> usize {
        self.batch_calls
    }
}

impl MapStore for MemoryMaps {
    fn update(&mut self, map: MapId, key: &[u8], value: &[u8]) -> Result<()> {
        check_len(map, "key", key.len(), map.key_size())?;
        check_len(map, "value", value.len(), map.value_size())?;
        self.maps[map as usize].insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn lookup(&self, map: MapId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        check_len(map, "key", key.len(), map.key_size())?;
        Ok(self.maps[map as usize].get(key).cloned())
    }

    fn delete(&mut self, map: MapId, key: &[u8]) -> Result<bool> {
        check_len(map, "key", key.len(), map.key_size())?;
        Ok(self.maps[map as usize].remove(key).is_some())
    }

    fn delete_batch(&mut self, map: MapId, keys: &[Vec<u8>]) -> Result<usize> {
        self.batch_calls += 1;
        let entries = &mut self.maps[map as usize];
        Ok(keys.iter().filter(|key| entries.remove(*key).is_some()).count())
    }

    fn keys(&self, map: MapId) -> Result<Vec<Vec<u8>>> {
        Ok(self.maps[map as usize].keys().cloned().collect())
    }
}

/// Map key or value handed to aya's typed maps.
#[repr(transparent)]
#[derive(Clone, Copy)]
struct Raw<T>(T);

unsafe impl<T: BytemuckPod> aya::Pod for Raw<T> {}

fn read_raw<T: BytemuckPod>(bytes: &[u8]) -> Raw<T> {
    Raw(bytemuck::pod_read_unaligned(bytes))
}

fn is_enoent(err: &MapError) -> bool {
    match err {
        MapError::KeyNotFound => true,
        MapError::SyscallError(SyscallError { io_error, .. }) => {
            io_error.raw_os_error() == Some(libc::ENOENT)
        }
        _ => false,
    }
}

fn typed_update<K: BytemuckPod, V: BytemuckPod>(
    map: &mut Map,
    key: &[u8],
    value: &[u8],
) -> Result<(), MapError> {
    let mut hash = HashMap::<&mut MapData, Raw<K>, Raw<V>>::try_from(map)?;
    hash.insert(read_raw::<K>(key), read_raw::<V>(value), 0)
}

fn typed_lookup<K: BytemuckPod, V: BytemuckPod>(
    map: &Map,
    key: &[u8],
) -> Result<Option<Vec<u8>>, MapError> {
    let hash = HashMap::<&MapData, Raw<K>, Raw<V>>::try_from(map)?;
    match hash.get(&read_raw::<K>(key), 0) {
        Ok(value) => Ok(Some(bytemuck::bytes_of(&value.0).to_vec())),
        Err(err) if is_enoent(&err) => Ok(None),
        Err(err) => Err(err),
    }
}

fn typed_delete<K: BytemuckPod, V: BytemuckPod>(
    map: &mut Map,
    key: &[u8],
) -> Result<bool, MapError> {
    let mut hash = HashMap::<&mut MapData, Raw<K>, Raw<V>>::try_from(map)?;
    match hash.remove(&read_raw::<K>(key)) {
        Ok(()) => Ok(true),
        Err(err) if is_enoent(&err) => Ok(false),
        Err(err) => Err(err),
    }
}

fn typed_keys<K: BytemuckPod, V: BytemuckPod>(map: &Map) -> Result<Vec<Vec<u8>>, MapError> {
    let hash = HashMap::<&MapData, Raw<K>, Raw<V>>::try_from(map)?;
    hash.keys()
        .map(|key| key.map(|key| bytemuck::bytes_of(&key.0).to_vec()))
        .collect()
}

/// Calls `$f::<Key, Value>($args)` with the layout of `$id`.
macro_rules! with_layout {
    ($id:expr, $f:ident($($arg:expr),* $(,)?)) => {
        match $id {
            MapId::Policy | MapId::DirPolicy => $f::<PolicyKey, PolicyValue>($($arg),*),
            MapId::BasenamePolicy => $f::<PolicyKey, BasenamePolicy>($($arg),*),
            MapId::NetCreate => $f::<NetCreateKey, NetPolicyValue>($($arg),*),
            MapId::NetTuple => $f::<NetTupleKey, NetPolicyValue>($($arg),*),
            MapId::NetUnix => $f::<NetUnixKey, NetPolicyValue>($($arg),*),
        }
    };
}

/// Pinned kernel maps, opened from the pin directory.
pub struct KernelMaps {
    maps: Vec<Map>,
    batch_supported: bool,
}

impl KernelMaps {
    pub fn open(pin_dir: &Path) -> Result<Self> {
        let mut maps = Vec::with_capacity(MapId::COUNT);
        for id in MapId::ALL {
            let path = pin_dir.join(id.name());
            let data = MapData::from_pin(&path).map_err(|err| {
                Error::Bpf(format!("failed to open pinned map {}: {err}", path.display()))
            })?;
            maps.push(Map::HashMap(data));
        }
        Ok(Self {
            maps,
            batch_supported: true,
        })
    }

    fn map(&self, map: MapId) -> &Map {
        &self.maps[map as usize]
    }

    fn map_mut(&mut self, map: MapId) -> &mut Map {
        &mut self.maps[map as usize]
    }

    fn fd(&self, map: MapId) -> Result<BorrowedFd<'_>> {
        match self.map(map) {
            Map::HashMap(data) => Ok(data.fd().as_fd()),
            _ => Err(Error::Bpf(format!("{} is not a hash map", map.name()))),
        }
    }

    fn map_err(map: MapId) -> impl FnOnce(MapError) -> Error {
        move |err| Error::Map {
            map: map.name(),
            source: match err {
                MapError::SyscallError(SyscallError { io_error, .. }) => io_error,
                other => io::Error::other(other.to_string()),
            },
        }
    }
}

impl MapStore for KernelMaps {
    fn update(&mut self, map: MapId, key: &[u8], value: &[u8]) -> Result<()> {
        check_len(map, "key", key.len(), map.key_size())?;
        check_len(map, "value", value.len(), map.value_size())?;
        with_layout!(map, typed_update(self.map_mut(map), key, value)).map_err(Self::map_err(map))
    }

    fn lookup(&self, map: MapId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        check_len(map, "key", key.len(), map.key_size())?;
        with_layout!(map, typed_lookup(self.map(map), key)).map_err(Self::map_err(map))
    }

    fn delete(&mut self, map: MapId, key: &[u8]) -> Result<bool> {
        check_len(map, "key", key.len(), map.key_size())?;
        with_layout!(map, typed_delete(self.map_mut(map), key)).map_err(Self::map_err(map))
    }

    fn delete_batch(&mut self, map: MapId, keys: &[Vec<u8>]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        if self.batch_supported {
            let size = map.key_size();
            let mut packed = Vec::with_capacity(keys.len() * size);
            for key in keys {
                check_len(map, "key", key.len(), size)?;
                packed.extend_from_slice(key);
            }
            let outcome = sys::delete_batch(self.fd(map)?, &packed, size).map_err(|source| {
                Error::Map {
                    map: map.name(),
                    source,
                }
            })?;
            match outcome {
                BatchOutcome::Deleted(count) => return Ok(count),
                BatchOutcome::Unsupported => {
                    log::info!(target: "cvd", "batch delete unavailable, deleting keys one by one");
                    self.batch_supported = false;
                }
            }
        }
        let mut deleted = 0;
        for key in keys {
            if self.delete(map, key)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn keys(&self, map: MapId) -> Result<Vec<Vec<u8>>> {
        with_layout!(map, typed_keys(self.map(map))).map_err(Self::map_err(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpf_api::{PolicyKey, PolicyValue};

    #[test]
    fn map_ids_follow_pinned_names() {
        assert_eq!(MapId::Policy.name(), "policy_map");
        assert_eq!(MapId::NetUnix.name(), "net_unix_map");
        assert_eq!(MapId::Policy.key_size(), 24);
        assert_eq!(MapId::NetTuple.key_size(), 32);
    }

    #[test]
    fn memory_maps_check_sizes() {
        let mut maps = MemoryMaps::new();
        let key = PolicyKey {
            cgroup_id: 1,
            dev: 2,
            ino: 3,
        };
        let value = PolicyValue {
            allow_mask: 1,
            flags: 0,
        };
        maps.update(MapId::Policy, bytemuck::bytes_of(&key), bytemuck::bytes_of(&value))
            .unwrap();
        assert_eq!(maps.len(MapId::Policy), 1);
        let err = maps.update(MapId::NetTuple, bytemuck::bytes_of(&key), bytemuck::bytes_of(&value));
        assert_eq!(err.unwrap_err().kind(), protecc::ErrorKind::InvalidArgument);
    }

    #[test]
    fn batch_delete_ignores_missing_keys() {
        let mut maps = MemoryMaps::new();
        let present = PolicyKey {
            cgroup_id: 9,
            dev: 1,
            ino: 1,
        };
        let missing = PolicyKey {
            cgroup_id: 9,
            dev: 1,
            ino: 2,
        };
        maps.update(
            MapId::Policy,
            bytemuck::bytes_of(&present),
            bytemuck::bytes_of(&PolicyValue::default()),
        )
        .unwrap();
        let keys = vec![
            bytemuck::bytes_of(&missing).to_vec(),
            bytemuck::bytes_of(&present).to_vec(),
        ];
        assert_eq!(maps.delete_batch(MapId::Policy, &keys).unwrap(), 1);
        assert!(maps.is_empty());
        assert_eq!(maps.batch_calls(), 1);
    }

    struct PerKeyOnly(MemoryMaps);

    impl MapStore for PerKeyOnly {
        fn update(&mut self, map: MapId, key: &[u8], value: &[u8]) -> Result<()> {
            self.0.update(map, key, value)
        }
        fn lookup(&self, map: MapId, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.0.lookup(map, key)
        }
        fn delete(&mut self, map: MapId, key: &[u8]) -> Result<bool> {
            self.0.delete(map, key)
        }
        fn keys(&self, map: MapId) -> Result<Vec<Vec<u8>>> {
            self.0.keys(map)
        }
    }

    #[test]
    fn default_batch_falls_back_to_single_deletes() {
        let mut store = PerKeyOnly(MemoryMaps::new());
        let key = PolicyKey {
            cgroup_id: 5,
            dev: 0,
            ino: 7,
        };
        store
            .update(
                MapId::DirPolicy,
                bytemuck::bytes_of(&key),
                bytemuck::bytes_of(&PolicyValue::default()),
            )
            .unwrap();
        let keys = vec![bytemuck::bytes_of(&key).to_vec(); 2];
        assert_eq!(store.delete_batch(MapId::DirPolicy, &keys).unwrap(), 1);
        assert_eq!(store.0.batch_calls(), 0);
        assert!(store.0.is_empty());
    }
}
