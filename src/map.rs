//! Map handles and element operations.

use std::ffi::CString;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tracing::{debug, warn};

use crate::sys;
use crate::{ConfigError, MapError, Result};

/// Conventional mount point of the BPF virtual filesystem. Pins must live
/// beneath it (possibly in a namespace directory further down); the kernel
/// rejects pin paths on any other filesystem.
pub const BPF_FS_ROOT: &str = "/sys/fs/bpf";

/// The `BPF_MAP_TYPE_*` map kinds supported by this crate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum MapType {
    /// `BPF_MAP_TYPE_UNSPEC`, reserving 0 as an invalid map type.
    #[default]
    Unspec = 0,
    /// `BPF_MAP_TYPE_HASH`: a hash table with arbitrary fixed key and
    /// value sizes.
    Hash = 1,
    /// `BPF_MAP_TYPE_ARRAY`: a dense array with all of its `max_entries`
    /// elements initialized by the kernel.
    ///
    /// The key is an index and must be exactly 4 bytes; elements cannot
    /// be deleted.
    Array = 2,
}

impl MapType {
    /// Convert a kernel-reported map type id back into the enum.
    ///
    /// Returns `None` for types this crate does not model (a pinned map
    /// can have been created by any program, with any type).
    pub fn from_raw(raw: u32) -> Option<MapType> {
        match raw {
            1 => Some(MapType::Hash),
            2 => Some(MapType::Array),
            _ => None,
        }
    }
}

/// Configuration used by [`Map::create`] to allocate a new kernel map.
///
/// Consumed once at creation; afterwards the kernel object identified by
/// the returned [`Map`] is the artifact of record.
#[derive(Clone, Debug, Default)]
pub struct MapConfig {
    /// Type of the map to be created. The default, [`MapType::Unspec`],
    /// never validates.
    pub map_type: MapType,
    /// Kernel-visible name, at most 15 bytes (the kernel stores it in a
    /// NUL-terminated 16-byte field).
    pub name: String,
    /// Size in bytes of every key. Must be 4 for [`MapType::Array`].
    pub key_size: u32,
    /// Size in bytes of every value.
    pub value_size: u32,
    /// Maximum number of entries the map can hold.
    pub max_entries: u32,
}

impl MapConfig {
    /// Check the structural invariants the kernel would reject anyway,
    /// before issuing any syscall. The kernel is the final authority; this
    /// only turns the common mistakes into domain errors.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.map_type == MapType::Unspec {
            return Err(ConfigError::UnspecifiedType);
        }
        if self.name.len() >= sys::BPF_OBJ_NAME_LEN {
            return Err(ConfigError::NameTooLong { len: self.name.len() });
        }
        if self.key_size == 0 || (self.map_type == MapType::Array && self.key_size != 4) {
            return Err(ConfigError::InvalidKeySize {
                map_type: self.map_type,
                key_size: self.key_size,
            });
        }
        if self.value_size == 0 {
            return Err(ConfigError::InvalidValueSize);
        }
        if self.max_entries == 0 {
            return Err(ConfigError::InvalidMaxEntries);
        }
        Ok(())
    }
}

/// An owned handle to a kernel-resident BPF map.
///
/// The handle is a process-local file descriptor; the map object itself is
/// kernel-resident and survives until its last referencing fd and pin are
/// gone. Dropping a `Map` closes the fd (a failed close is logged, never
/// fatal) but does not remove any pin, so a pinned map outlives the
/// process that created it.
///
/// Element operations are each a single blocking syscall with no
/// serialization added on top: concurrent access from other handles or
/// processes is the kernel's to arbitrate, and any check-then-act sequence
/// such as `lookup` followed by `upsert` is racy by construction.
#[derive(Debug)]
pub struct Map {
    fd: RawFd,
    /// `None` when the kernel reported a type this crate does not model.
    map_type: Option<MapType>,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    name: String,
}

impl Map {
    /// Create a new kernel map from `cfg`.
    ///
    /// The map has no filesystem presence until [`Map::pin`] is called:
    /// once the last handle to an unpinned map is closed, the kernel
    /// destroys it.
    pub fn create(cfg: &MapConfig) -> Result<Map> {
        cfg.validate()?;

        let fd = sys::map_create(
            cfg.map_type as u32,
            cfg.name.as_bytes(),
            cfg.key_size,
            cfg.value_size,
            cfg.max_entries,
        )
        .map_err(|source| MapError::CreateFailed { name: cfg.name.clone(), source })?;

        debug!(fd, name = %cfg.name, map_type = ?cfg.map_type, "map created");

        Ok(Map {
            fd,
            map_type: Some(cfg.map_type),
            key_size: cfg.key_size,
            value_size: cfg.value_size,
            max_entries: cfg.max_entries,
            name: cfg.name.clone(),
        })
    }

    /// Pin this map at `path`, which must live beneath [`BPF_FS_ROOT`].
    ///
    /// Pinning gives the map a name outside any process's lifetime: any
    /// process that can reach `path` can re-open it with
    /// [`Map::open_pinned`]. Fails if a pin already exists at `path` or if
    /// the path is not on the BPF filesystem; a pin is never removed by
    /// this crate (unlinking it is a plain filesystem operation).
    pub fn pin<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let pathname = path_to_cstring(path)?;

        sys::obj_pin(self.fd, &pathname).map_err(|source| MapError::PinFailed {
            name: self.name.clone(),
            path: path.to_path_buf(),
            source,
        })?;

        debug!(fd = self.fd, name = %self.name, path = %path.display(), "map pinned");
        Ok(())
    }

    /// Open the map pinned at `path`, typically created (and pinned) by
    /// another program such as `tc`.
    ///
    /// The returned handle is a fresh, independently owned reference:
    /// closing it affects neither the pin nor other handles to the same
    /// object. The map's type, sizes and name are recovered from the
    /// kernel so that element operations on the discovered map validate
    /// buffer lengths the same way as on a freshly created one.
    pub fn open_pinned<P: AsRef<Path>>(path: P) -> Result<Map> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(MapError::InvalidArgument(
                "cannot open a pinned map from an empty path".into(),
            ));
        }

        let pathname = path_to_cstring(path)?;
        let fd = sys::obj_get(&pathname).map_err(|source| MapError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;

        let info = match sys::obj_get_info(fd) {
            Ok(info) => info,
            Err(source) => {
                // Do not leak the fd when the info call fails.
                if let Err(err) = sys::close(fd) {
                    warn!(fd, error = %err, "failed to close map file descriptor");
                }
                return Err(MapError::OpenFailed { path: path.to_path_buf(), source });
            }
        };

        let map = Map {
            fd,
            map_type: MapType::from_raw(info.map_type),
            key_size: info.key_size,
            value_size: info.value_size,
            max_entries: info.max_entries,
            name: name_from_kernel(&info.name),
        };

        debug!(
            fd,
            name = %map.name,
            map_type = ?map.map_type,
            path = %path.display(),
            "pinned map opened"
        );
        Ok(map)
    }

    /// Insert `value` under `key`, overwriting any existing value.
    ///
    /// Create-or-update semantics (`BPF_ANY`): whether the key was already
    /// present is not observable through this call.
    pub fn upsert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_key(key)?;
        self.check_value(value.len())?;

        sys::map_update_elem(self.fd, key, value, sys::BPF_ANY).map_err(|source| {
            MapError::UpsertFailed { name: self.name.clone(), source }
        })
    }

    /// Copy the value bound to `key` into `value`.
    ///
    /// Returns `Ok(true)` with `value` filled when the key exists and
    /// `Ok(false)` when it does not — absence is an expected outcome, not
    /// a failure. On `Ok(false)` the contents of `value` are unspecified.
    pub fn lookup(&self, key: &[u8], value: &mut [u8]) -> Result<bool> {
        self.check_key(key)?;
        self.check_value(value.len())?;

        match sys::map_lookup_elem(self.fd, key, value) {
            Ok(()) => Ok(true),
            Err(err) if sys::is_not_found(&err) => Ok(false),
            Err(source) => Err(MapError::LookupFailed { name: self.name.clone(), source }),
        }
    }

    /// Remove the entry bound to `key`.
    ///
    /// Idempotent: deleting a key that is not in the map succeeds. Array
    /// maps have a fixed element set, so calling this on a handle known to
    /// be [`MapType::Array`] is rejected before any syscall.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        if self.map_type == Some(MapType::Array) {
            return Err(MapError::InvalidArgument(
                "array map elements are fixed and cannot be deleted".into(),
            ));
        }
        self.check_key(key)?;

        match sys::map_delete_elem(self.fd, key) {
            Ok(()) => Ok(()),
            Err(err) if sys::is_not_found(&err) => Ok(()),
            Err(source) => Err(MapError::DeleteFailed { name: self.name.clone(), source }),
        }
    }

    /// Write the key following `key` into `next`, or the first key when
    /// `key` is `None`. Returns `Ok(false)` when the map is exhausted.
    ///
    /// Building block for [`Map::iter`]; exposed for callers that manage
    /// their own cursor.
    pub fn next_key(&self, key: Option<&[u8]>, next: &mut [u8]) -> Result<bool> {
        if let Some(key) = key {
            self.check_key(key)?;
        }
        self.check_key(next)?;

        match sys::map_get_next_key(self.fd, key, next) {
            Ok(()) => Ok(true),
            Err(err) if sys::is_not_found(&err) => Ok(false),
            Err(source) => Err(MapError::NextKeyFailed { name: self.name.clone(), source }),
        }
    }

    /// Iterate over all entries as `(key, value)` byte pairs.
    ///
    /// Single pass; calling `iter` again restarts from the beginning. Keys
    /// removed between the next-key and lookup steps are skipped. A failed
    /// step yields one `Err` and the iterator then fuses — the sequence is
    /// terminated by the error, never silently truncated.
    pub fn iter(&self) -> Entries<'_> {
        Entries { map: self, cursor: None, done: false }
    }

    /// Kernel-visible name of the map (possibly empty for maps pinned by
    /// programs that did not set one).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Map type, or `None` when the pinned object's type is not one this
    /// crate models.
    pub fn map_type(&self) -> Option<MapType> {
        self.map_type
    }

    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    pub fn value_size(&self) -> u32 {
        self.value_size
    }

    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_size as usize {
            return Err(MapError::InvalidArgument(format!(
                "key buffer is {} bytes but map `{}` declares a key size of {}",
                key.len(),
                self.name,
                self.key_size
            )));
        }
        Ok(())
    }

    fn check_value(&self, len: usize) -> Result<()> {
        if len != self.value_size as usize {
            return Err(MapError::InvalidArgument(format!(
                "value buffer is {} bytes but map `{}` declares a value size of {}",
                len, self.name, self.value_size
            )));
        }
        Ok(())
    }
}

impl AsRawFd for Map {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        if let Err(err) = sys::close(self.fd) {
            warn!(fd = self.fd, name = %self.name, error = %err, "failed to close map file descriptor");
        }
    }
}

/// Lazy iterator over a map's entries, returned by [`Map::iter`].
#[derive(Debug)]
pub struct Entries<'a> {
    map: &'a Map,
    cursor: Option<Vec<u8>>,
    done: bool,
}

impl Iterator for Entries<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let mut key = vec![0u8; self.map.key_size() as usize];
            match self.map.next_key(self.cursor.as_deref(), &mut key) {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
            self.cursor = Some(key.clone());

            let mut value = vec![0u8; self.map.value_size() as usize];
            match self.map.lookup(&key, &mut value) {
                Ok(true) => return Some(Ok((key, value))),
                // Deleted between the next-key and lookup steps; skip it.
                Ok(false) => continue,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        MapError::InvalidArgument(format!(
            "path {} contains an interior NUL byte",
            path.display()
        ))
    })
}

fn name_from_kernel(raw: &[u8; sys::BPF_OBJ_NAME_LEN]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
