//! On-disk cache for the trace/event maps [`crate::tracedb::TraceDb`]
//! builds from an ELF's `.swo_trace` section.
//!
//! Ported from `examples/original_source/tools/logger/trace_db/
//! trace_db.py`'s pickle cache: an MD5 hash of the ELF bytes gates
//! reuse, alongside a JSON sidecar recording the hash and the SDK path
//! that was merged in. The original's pickle is not a portable format;
//! `bincode` plays that role here (DESIGN.md's cache-format decision).
//!
//! DWARF-backed PC resolution (`addr2line::Context`) is lazy and cheap
//! to rebuild from the ELF path alone, so only the two maps that cost a
//! full symbol-table scan to produce — the trace map and event map —
//! are persisted; `TraceDb::build` always re-derives its `addr2line`
//! contexts and ROM ranges fresh.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::swo::ElfString;

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    hash: String,
    sdk: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedMaps {
    trace: HashMap<u32, ElfString>,
    events: HashMap<String, String>,
}

/// The pair of files one ELF's cache entry lives in: a JSON sidecar
/// `{hash, sdk}` and the `bincode`-encoded maps themselves.
pub struct CachePaths {
    sidecar: PathBuf,
    maps: PathBuf,
}

/// Resolve where `elf_path`'s cache entry would live, creating the
/// user cache directory if needed. Returns `None` if no user data
/// directory can be determined on this platform (caching is then
/// silently skipped, never an error).
pub fn paths_for(elf_path: &Path) -> Option<CachePaths> {
    let dirs = directories::ProjectDirs::from("org", "embedded-rust", "swo-trace")?;
    let cache_dir = dirs.cache_dir();
    fs::create_dir_all(cache_dir).ok()?;
    let stem = elf_path.file_name()?.to_string_lossy().into_owned();
    Some(CachePaths {
        sidecar: cache_dir.join(format!("{stem}.sidecar.json")),
        maps: cache_dir.join(format!("{stem}.maps.bin")),
    })
}

/// MD5 hash of the ELF's raw bytes, hex-encoded.
pub fn hash_elf(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

fn sdk_key(sdk: Option<&Path>) -> Option<String> {
    sdk.map(|p| p.to_string_lossy().into_owned())
}

/// Load the cached trace/event maps, if the sidecar's hash and SDK
/// path both match what was asked for. Any I/O or decode failure is
/// treated as a cache miss rather than an error — caching is purely an
/// optimization, never load-bearing for correctness.
pub fn load(
    paths: &CachePaths,
    hash: &str,
    sdk: Option<&Path>,
) -> Option<(HashMap<u32, ElfString>, HashMap<String, String>)> {
    let sidecar: Sidecar = serde_json::from_slice(&fs::read(&paths.sidecar).ok()?).ok()?;
    if sidecar.hash != hash || sidecar.sdk != sdk_key(sdk) {
        return None;
    }
    let maps: CachedMaps = bincode::deserialize(&fs::read(&paths.maps).ok()?).ok()?;
    Some((maps.trace, maps.events))
}

/// Persist `trace`/`events` alongside a sidecar recording `hash`/`sdk`.
/// Failures are logged and otherwise ignored; a stale or missing cache
/// only costs a rebuild on the next run, never correctness.
pub fn store(
    paths: &CachePaths,
    hash: &str,
    sdk: Option<&Path>,
    trace: &HashMap<u32, ElfString>,
    events: &HashMap<String, String>,
) {
    let sidecar = Sidecar {
        hash: hash.to_string(),
        sdk: sdk_key(sdk),
    };
    match serde_json::to_vec(&sidecar) {
        Ok(bytes) => {
            if let Err(e) = fs::write(&paths.sidecar, bytes) {
                tracing::warn!(path = %paths.sidecar.display(), error = %e, "failed to write trace DB cache sidecar");
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to serialize trace DB cache sidecar"),
    }

    let maps = CachedMaps {
        trace: trace.clone(),
        events: events.clone(),
    };
    match bincode::serialize(&maps) {
        Ok(bytes) => {
            if let Err(e) = fs::write(&paths.maps, bytes) {
                tracing::warn!(path = %paths.maps.display(), error = %e, "failed to write trace DB cache maps");
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to serialize trace DB cache maps"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swo::SwoOpcode;

    #[test]
    fn round_trips_maps_through_sidecar_and_bincode() {
        let dir = std::env::temp_dir().join(format!("swo-trace-cache-test-{:?}", std::thread::current().id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let paths = CachePaths {
            sidecar: dir.join("sidecar.json"),
            maps: dir.join("maps.bin"),
        };

        let mut trace = HashMap::new();
        trace.insert(
            0x6000_0100,
            ElfString {
                opcode: SwoOpcode::FormattedText,
                value: "hello".to_string(),
            },
        );
        let mut events = HashMap::new();
        events.insert("netstarted".to_string(), "Net started".to_string());

        store(&paths, "abc123", Some(Path::new("/sdk")), &trace, &events);
        let (loaded_trace, loaded_events) = load(&paths, "abc123", Some(Path::new("/sdk"))).unwrap();
        assert_eq!(loaded_trace.get(&0x6000_0100).unwrap().value, "hello");
        assert_eq!(loaded_events.get("netstarted").unwrap(), "Net started");

        assert!(load(&paths, "different", Some(Path::new("/sdk"))).is_none());
        assert!(load(&paths, "abc123", None).is_none());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn hash_is_stable_for_the_same_bytes() {
        assert_eq!(hash_elf(b"same bytes"), hash_elf(b"same bytes"));
        assert_ne!(hash_elf(b"same bytes"), hash_elf(b"different bytes"));
    }
}
