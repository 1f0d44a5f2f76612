//! Per-user compilation cache.
//!
//! Each compiled source gets a directory
//! `<root>/<uid>/<absolute-source-path>/` holding:
//!
//! - `bin`  the executable blob
//! - `src`  newline-separated list of the consumed source paths
//! - `map`  three word-sized little-endian sizes: executable
//!   instructions, constant strings, global region
//! - `log`  optional human-readable compilation log
//! - `dbg`  optional debug information
//!
//! An entry is reused iff the directory exists, all three `map` fields are
//! readable, and every path listed in `src` has a modification timestamp
//! not newer than `bin`'s. Anything else deletes the directory for a
//! rebuild. A skipped rebuild never touches `bin`, so its timestamp is
//! stable.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to create {path}: {source}")]
    Create {
        path: PathBuf,
        source: io::Error,
    },
    #[error("failed to delete {path}: {source}")]
    Delete {
        path: PathBuf,
        source: io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: io::Error,
    },
}

/// The `map` file contents.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BinMap {
    pub executable_instr_size: u64,
    pub constant_strings_size: u64,
    pub global_region_size: u64,
}

impl BinMap {
    pub fn to_bytes(self, sizeof_gpr: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 * sizeof_gpr as usize);
        for v in [
            self.executable_instr_size,
            self.constant_strings_size,
            self.global_region_size,
        ] {
            if sizeof_gpr == 4 {
                out.extend_from_slice(&(v as u32).to_le_bytes());
            } else {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        out
    }

    /// `None` when fewer than three word-sized fields are present.
    pub fn from_bytes(bytes: &[u8], sizeof_gpr: u32) -> Option<Self> {
        let word = sizeof_gpr as usize;
        if bytes.len() < 3 * word {
            return None;
        }
        let read = |i: usize| -> u64 {
            let b = &bytes[i * word..(i + 1) * word];
            if word == 4 {
                u64::from(u32::from_le_bytes(b.try_into().unwrap()))
            } else {
                u64::from_le_bytes(b.try_into().unwrap())
            }
        };
        Some(Self {
            executable_instr_size: read(0),
            constant_strings_size: read(1),
            global_region_size: read(2),
        })
    }
}

/// One source file's cache directory.
#[derive(Debug)]
pub struct CacheEntry {
    dir: PathBuf,
}

impl CacheEntry {
    /// The directory for `source`, which must be an absolute path.
    pub fn for_source(root: &Path, uid: u32, source: &Path) -> Self {
        debug_assert!(source.is_absolute());
        let mut dir = root.join(uid.to_string());
        for comp in source.components() {
            use std::path::Component;
            match comp {
                Component::RootDir | Component::Prefix(_) => {}
                other => dir.push(other),
            }
        }
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn bin_path(&self) -> PathBuf {
        self.dir.join("bin")
    }

    pub fn src_path(&self) -> PathBuf {
        self.dir.join("src")
    }

    pub fn map_path(&self) -> PathBuf {
        self.dir.join("map")
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join("log")
    }

    pub fn dbg_path(&self) -> PathBuf {
        self.dir.join("dbg")
    }

    /// The cache-validity rule. Missing or malformed pieces and any
    /// source newer than `bin` invalidate the entry.
    pub fn is_valid(&self, sizeof_gpr: u32) -> bool {
        if !self.dir.is_dir() {
            return false;
        }
        let Ok(map_bytes) = fs::read(self.map_path()) else {
            return false;
        };
        if BinMap::from_bytes(&map_bytes, sizeof_gpr).is_none() {
            return false;
        }
        let Some(bin_time) = mtime(&self.bin_path()) else {
            return false;
        };
        let Ok(src_list) = fs::read_to_string(self.src_path()) else {
            return false;
        };
        for line in src_list.lines() {
            if line.is_empty() {
                continue;
            }
            match mtime(Path::new(line)) {
                Some(t) if t <= bin_time => {}
                _ => {
                    log::debug!("cache invalidated by {line}");
                    return false;
                }
            }
        }
        true
    }

    /// Delete the directory, then recreate it empty.
    pub fn recreate(&self) -> Result<(), CacheError> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir).map_err(|source| CacheError::Delete {
                path: self.dir.clone(),
                source,
            })?;
        }
        fs::create_dir_all(&self.dir).map_err(|source| CacheError::Create {
            path: self.dir.clone(),
            source,
        })
    }

    /// Write a fresh entry. `src_list` is written before `bin` so the
    /// freshness comparison holds immediately.
    pub fn store(
        &self,
        src_list: &str,
        bin: &[u8],
        map: BinMap,
        sizeof_gpr: u32,
        log_text: Option<&str>,
        dbg: Option<&[u8]>,
    ) -> Result<(), CacheError> {
        self.recreate()?;
        self.write_file(&self.src_path(), src_list.as_bytes())?;
        self.write_file(&self.map_path(), &map.to_bytes(sizeof_gpr))?;
        if let Some(text) = log_text {
            self.write_file(&self.log_path(), text.as_bytes())?;
        }
        if let Some(bytes) = dbg {
            self.write_file(&self.dbg_path(), bytes)?;
        }
        self.write_file(&self.bin_path(), bin)
    }

    fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
        fs::write(path, bytes).map_err(|source| CacheError::Write {
            path: path.to_owned(),
            source,
        })
    }

    pub fn load_bin(&self) -> Result<Vec<u8>, CacheError> {
        fs::read(self.bin_path()).map_err(|source| CacheError::Read {
            path: self.bin_path(),
            source,
        })
    }

    pub fn load_map(&self, sizeof_gpr: u32) -> Result<BinMap, CacheError> {
        let bytes = fs::read(self.map_path()).map_err(|source| CacheError::Read {
            path: self.map_path(),
            source,
        })?;
        BinMap::from_bytes(&bytes, sizeof_gpr).ok_or_else(|| CacheError::Read {
            path: self.map_path(),
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "truncated map"),
        })
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAP: BinMap = BinMap {
        executable_instr_size: 128,
        constant_strings_size: 16,
        global_region_size: 64,
    };

    fn entry_with_source(root: &Path) -> (CacheEntry, PathBuf) {
        let src = root.join("program.lyc");
        fs::write(&src, "u64 x = 1;\n").unwrap();
        let entry = CacheEntry::for_source(&root.join("cache"), 1000, &src);
        (entry, src)
    }

    #[test]
    fn binmap_round_trips_at_both_word_sizes() {
        for gpr in [4u32, 8] {
            let bytes = MAP.to_bytes(gpr);
            assert_eq!(bytes.len(), 3 * gpr as usize);
            assert_eq!(BinMap::from_bytes(&bytes, gpr), Some(MAP));
        }
        assert_eq!(BinMap::from_bytes(&[0; 7], 4), None);
    }

    #[test]
    fn directory_mirrors_the_absolute_source_path() {
        let e = CacheEntry::for_source(Path::new("/var/cache/lyrical"), 7, Path::new("/home/u/a.lyc"));
        assert_eq!(
            e.dir(),
            Path::new("/var/cache/lyrical/7/home/u/a.lyc")
        );
    }

    #[test]
    fn fresh_store_is_valid() {
        let tmp = tempfile::tempdir().unwrap();
        let (entry, src) = entry_with_source(tmp.path());
        let srcs = format!("{}\n", src.display());
        entry.store(&srcs, b"BIN", MAP, 8, None, None).unwrap();
        assert!(entry.is_valid(8));
        assert_eq!(entry.load_bin().unwrap(), b"BIN");
        assert_eq!(entry.load_map(8).unwrap(), MAP);
    }

    #[test]
    fn skipping_a_rebuild_preserves_the_bin_timestamp() {
        let tmp = tempfile::tempdir().unwrap();
        let (entry, src) = entry_with_source(tmp.path());
        let srcs = format!("{}\n", src.display());
        entry.store(&srcs, b"BIN", MAP, 8, None, None).unwrap();
        let before = fs::metadata(entry.bin_path()).unwrap().modified().unwrap();
        assert!(entry.is_valid(8));
        let after = fs::metadata(entry.bin_path()).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn touching_a_source_invalidates() {
        let tmp = tempfile::tempdir().unwrap();
        let (entry, src) = entry_with_source(tmp.path());
        let srcs = format!("{}\n", src.display());
        entry.store(&srcs, b"BIN", MAP, 8, None, None).unwrap();
        assert!(entry.is_valid(8));
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(&src, "u64 x = 2;\n").unwrap();
        assert!(!entry.is_valid(8));
    }

    #[test]
    fn missing_listed_source_invalidates() {
        let tmp = tempfile::tempdir().unwrap();
        let (entry, src) = entry_with_source(tmp.path());
        let srcs = format!("{}\n{}\n", src.display(), tmp.path().join("gone.lyh").display());
        entry.store(&srcs, b"BIN", MAP, 8, None, None).unwrap();
        assert!(!entry.is_valid(8));
    }

    #[test]
    fn truncated_map_invalidates() {
        let tmp = tempfile::tempdir().unwrap();
        let (entry, src) = entry_with_source(tmp.path());
        let srcs = format!("{}\n", src.display());
        entry.store(&srcs, b"BIN", MAP, 8, None, None).unwrap();
        fs::write(entry.map_path(), [0u8; 5]).unwrap();
        assert!(!entry.is_valid(8));
    }

    #[test]
    fn recreate_wipes_stale_files() {
        let tmp = tempfile::tempdir().unwrap();
        let (entry, src) = entry_with_source(tmp.path());
        let srcs = format!("{}\n", src.display());
        entry
            .store(&srcs, b"OLD", MAP, 8, Some("log"), Some(b"dbg"))
            .unwrap();
        assert!(entry.log_path().exists());
        entry.store(&srcs, b"NEW", MAP, 8, None, None).unwrap();
        assert!(!entry.log_path().exists());
        assert_eq!(entry.load_bin().unwrap(), b"NEW");
    }

    #[test]
    fn optional_files_are_written_when_requested() {
        let tmp = tempfile::tempdir().unwrap();
        let (entry, src) = entry_with_source(tmp.path());
        let srcs = format!("{}\n", src.display());
        entry
            .store(&srcs, b"B", MAP, 8, Some("the log"), Some(b"\x01\x02"))
            .unwrap();
        assert_eq!(fs::read_to_string(entry.log_path()).unwrap(), "the log");
        assert_eq!(fs::read(entry.dbg_path()).unwrap(), b"\x01\x02");
    }
}
