//! Typed, process-safe handles to kernel eBPF maps.
//!
//! Compilation of BPF bytecode and its attachment to interfaces is left to
//! an external toolchain (`clang` + `tc` object-file mode); this crate only
//! deals with the maps such programs read from and write to. A map is
//! created with [`Map::create`], made discoverable by other processes with
//! [`Map::pin`], and re-opened from its pinned path with
//! [`Map::open_pinned`]. Element access is byte-buffer based: the kernel
//! reads and writes exactly the key/value sizes the map was created with,
//! and the structure of those bytes is a convention shared with the BPF
//! program, not something the map carries.

// BPF maps are Linux-only. This crate does not compile for other targets.
#![cfg(target_os = "linux")]
// Unsafe is required in one narrow, documented site: sys.rs, which issues
// the bpf(2) and close(2) syscalls. All other unsafe is denied.
#![deny(unsafe_code)]

pub mod map;
#[allow(unsafe_code)]
mod sys;

pub use map::{Entries, Map, MapConfig, MapType, BPF_FS_ROOT};

use std::io;
use std::path::PathBuf;

/// A caller-supplied [`MapConfig`] violates a structural invariant.
///
/// These are rejected before any syscall is issued, so a failed validation
/// never leaves partial kernel state behind. The kernel enforces its own
/// (stricter) invariants independently and remains the final authority.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("map type must be specified (`Unspec` is reserved as invalid)")]
    UnspecifiedType,

    #[error("map name is {len} bytes; the kernel allows at most 15 plus a trailing NUL")]
    NameTooLong { len: usize },

    #[error("invalid key size {key_size} for a {map_type:?} map")]
    InvalidKeySize { map_type: MapType, key_size: u32 },

    #[error("value size must be greater than zero")]
    InvalidValueSize,

    #[error("max_entries must be greater than zero")]
    InvalidMaxEntries,
}

/// Errors surfaced by map lifecycle and element operations.
///
/// Kernel-boundary variants carry the raw OS error as their source so the
/// original errno stays available for diagnostics. Absence of a key is not
/// an error and never appears here: `lookup` reports it as `Ok(false)` and
/// `delete` treats it as success.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("invalid map configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to create map `{name}`: {source}")]
    CreateFailed {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to pin map `{name}` at {}: {source}", .path.display())]
    PinFailed {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to open pinned map at {}: {source}", .path.display())]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to update element in map `{name}`: {source}")]
    UpsertFailed {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to look up element in map `{name}`: {source}")]
    LookupFailed {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to delete element from map `{name}`: {source}")]
    DeleteFailed {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to fetch next key from map `{name}`: {source}")]
    NextKeyFailed {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    InvalidArgument(String),
}

impl MapError {
    /// The raw `errno` reported by the kernel, when this error wraps one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            MapError::CreateFailed { source, .. }
            | MapError::PinFailed { source, .. }
            | MapError::OpenFailed { source, .. }
            | MapError::UpsertFailed { source, .. }
            | MapError::LookupFailed { source, .. }
            | MapError::DeleteFailed { source, .. }
            | MapError::NextKeyFailed { source, .. } => source.raw_os_error(),
            MapError::Config(_) | MapError::InvalidArgument(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, MapError>;
