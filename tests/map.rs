//! Integration tests against a live kernel.
//!
//! Creating BPF maps needs CAP_BPF (or CAP_SYS_ADMIN) and the pinning
//! tests additionally need a writable bpffs mount. Environments without
//! those privileges skip the affected tests instead of failing them.

use std::collections::HashSet;
use std::sync::Once;

use serial_test::serial;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use bpfmap::{Map, MapConfig, MapError, MapType, BPF_FS_ROOT};

/// Install a subscriber once so the crate's lifecycle `debug!`/`warn!`
/// events show up under `RUST_LOG=debug`.
fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn hash_config(key_size: u32, value_size: u32) -> MapConfig {
    MapConfig {
        map_type: MapType::Hash,
        name: "test_map".to_string(),
        key_size,
        value_size,
        max_entries: 10,
    }
}

/// Create a map, or skip the calling test when the environment does not
/// permit the bpf(2) syscall at all.
fn create_or_skip(cfg: &MapConfig) -> Option<Map> {
    init_tracing();
    match Map::create(cfg) {
        Ok(map) => Some(map),
        Err(err) => match err.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) | Some(libc::ENOSYS) => {
                eprintln!("skipping: bpf(2) not permitted in this environment ({err})");
                None
            }
            _ => panic!("map creation failed unexpectedly: {err}"),
        },
    }
}

/// A scratch directory under the bpffs mount, or skip when bpffs is not
/// available for writing.
fn bpffs_dir_or_skip() -> Option<TempDir> {
    init_tracing();
    match TempDir::new_in(BPF_FS_ROOT) {
        Ok(dir) => Some(dir),
        Err(err) => {
            eprintln!("skipping: no writable bpffs mount at {BPF_FS_ROOT} ({err})");
            None
        }
    }
}

#[test]
fn test_create_array_map() {
    let cfg = MapConfig {
        map_type: MapType::Array,
        name: "test_map".to_string(),
        key_size: 4,
        value_size: 4,
        max_entries: 10,
    };
    let Some(map) = create_or_skip(&cfg) else { return };
    assert_eq!(map.map_type(), Some(MapType::Array));
    assert_eq!(map.key_size(), 4);
    assert_eq!(map.max_entries(), 10);
}

#[test]
fn test_lookup_missing_key_is_not_an_error() {
    let Some(map) = create_or_skip(&hash_config(2, 2)) else { return };

    let mut value = [0u8; 2];
    let found = map.lookup(&[1, 2], &mut value).expect("lookup failed");
    assert!(!found);
}

#[test]
fn test_upsert_then_lookup() {
    let Some(map) = create_or_skip(&hash_config(8, 8)) else { return };

    let key = [1u8; 8];
    map.upsert(&key, &[7u8; 8]).expect("upsert failed");

    // A second, distinct key must not perturb the first.
    map.upsert(&[2u8; 8], &[9u8; 8]).expect("upsert failed");

    let mut value = [0u8; 8];
    assert!(map.lookup(&key, &mut value).expect("lookup failed"));
    assert_eq!(value, [7u8; 8]);
}

#[test]
fn test_upsert_overwrites_existing_value() {
    let Some(map) = create_or_skip(&hash_config(4, 4)) else { return };

    let key = [5u8; 4];
    map.upsert(&key, &[1u8; 4]).expect("upsert failed");
    map.upsert(&key, &[2u8; 4]).expect("upsert failed");

    let mut value = [0u8; 4];
    assert!(map.lookup(&key, &mut value).expect("lookup failed"));
    assert_eq!(value, [2u8; 4]);
}

#[test]
fn test_delete_absent_key_succeeds() {
    let Some(map) = create_or_skip(&hash_config(4, 4)) else { return };
    map.delete(&[9u8; 4]).expect("idempotent delete failed");
}

#[test]
fn test_delete_rejected_for_array_maps() {
    let cfg = MapConfig {
        map_type: MapType::Array,
        name: "test_map".to_string(),
        key_size: 4,
        value_size: 4,
        max_entries: 10,
    };
    let Some(map) = create_or_skip(&cfg) else { return };
    assert!(map.delete(&0u32.to_ne_bytes()).is_err());
}

#[test]
fn test_mismatched_key_length_rejected_before_syscall() {
    let Some(map) = create_or_skip(&hash_config(8, 8)) else { return };

    let mut value = [0u8; 8];
    assert!(map.lookup(&[0u8; 4], &mut value).is_err());
    assert!(map.upsert(&[0u8; 8], &[0u8; 4]).is_err());
    assert!(map.delete(&[0u8; 2]).is_err());
}

// The full insert/delete scenario: two entries, one removed, the other
// untouched.
#[test]
fn test_hash_map_scenario() {
    let Some(map) = create_or_skip(&hash_config(8, 8)) else { return };

    let key1 = [1u8, 1, 0, 0, 0, 0, 0, 0];
    let key2 = [2u8, 2, 0, 0, 0, 0, 0, 0];
    map.upsert(&key1, &key1).expect("upsert failed");
    map.upsert(&key2, &key2).expect("upsert failed");

    let mut value = [0u8; 8];
    assert!(map.lookup(&key1, &mut value).expect("lookup failed"));
    assert_eq!(value, key1);

    map.delete(&key1).expect("delete failed");
    assert!(!map.lookup(&key1, &mut value).expect("lookup failed"));

    assert!(map.lookup(&key2, &mut value).expect("lookup failed"));
    assert_eq!(value, key2);
}

#[test]
fn test_iter_visits_every_entry_once() {
    let Some(map) = create_or_skip(&hash_config(4, 4)) else { return };

    let mut expected = HashSet::new();
    for i in 1u32..=5 {
        let bytes = i.to_ne_bytes();
        map.upsert(&bytes, &bytes).expect("upsert failed");
        expected.insert(bytes.to_vec());
    }

    let mut seen = HashSet::new();
    for entry in map.iter() {
        let (key, value) = entry.expect("iteration step failed");
        assert_eq!(key, value);
        assert!(seen.insert(key), "key yielded twice");
    }
    assert_eq!(seen, expected);
}

#[test]
fn test_iter_on_empty_map_is_empty() {
    let Some(map) = create_or_skip(&hash_config(4, 4)) else { return };
    assert_eq!(map.iter().count(), 0);
}

#[test]
#[serial]
fn test_pin_outside_bpffs_fails() {
    let Some(map) = create_or_skip(&hash_config(4, 4)) else { return };

    let dir = tempfile::tempdir().expect("tempdir failed");
    let err = map.pin(dir.path().join("test_map")).unwrap_err();
    assert!(matches!(err, MapError::PinFailed { .. }), "unexpected error: {err}");
    assert!(err.raw_os_error().is_some());
}

#[test]
#[serial]
fn test_pin_then_open_round_trip() {
    let Some(map) = create_or_skip(&hash_config(4, 4)) else { return };
    let Some(dir) = bpffs_dir_or_skip() else { return };

    let path = dir.path().join("test_map");
    map.pin(&path).expect("pin failed");

    // Pinning the same path twice must fail.
    assert!(map.pin(&path).is_err());

    let reopened = Map::open_pinned(&path).expect("open failed");
    assert_eq!(reopened.map_type(), Some(MapType::Hash));
    assert_eq!(reopened.key_size(), 4);
    assert_eq!(reopened.value_size(), 4);
    assert_eq!(reopened.max_entries(), 10);
    assert_eq!(reopened.name(), "test_map");

    // Both handles address the same kernel object.
    let key = [3u8; 4];
    map.upsert(&key, &[8u8; 4]).expect("upsert failed");
    let mut value = [0u8; 4];
    assert!(reopened.lookup(&key, &mut value).expect("lookup failed"));
    assert_eq!(value, [8u8; 4]);

    reopened.upsert(&key, &[9u8; 4]).expect("upsert failed");
    assert!(map.lookup(&key, &mut value).expect("lookup failed"));
    assert_eq!(value, [9u8; 4]);
}

#[test]
#[serial]
fn test_open_with_no_pinned_object_fails() {
    let Some(dir) = bpffs_dir_or_skip() else { return };
    assert!(Map::open_pinned(dir.path().join("missing")).is_err());
}

// The record shape used by the companion classifier: a 4-byte IPv4 address
// plus a 2-byte port, keyed by a u32.
#[test]
fn test_backend_style_records() {
    let Some(map) = create_or_skip(&hash_config(4, 6)) else { return };

    let mut record = [0u8; 6];
    record[..4].copy_from_slice(&u32::from(std::net::Ipv4Addr::new(172, 17, 0, 3)).to_be_bytes());
    record[4..].copy_from_slice(&8000u16.to_be_bytes());

    map.upsert(&1u32.to_ne_bytes(), &record).expect("upsert failed");

    let mut value = [0u8; 6];
    assert!(map.lookup(&1u32.to_ne_bytes(), &mut value).expect("lookup failed"));
    assert_eq!(value, record);
}
