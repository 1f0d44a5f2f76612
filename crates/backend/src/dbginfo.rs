//! Debug information layout.
//!
//! Two sections. Section 1 maps binary offsets back to source lines:
//! repeating word-sized `{bin_offset, path_offset, line, line_offset}`
//! entries terminated by a sentinel whose `line` is 0 and whose
//! `bin_offset` is the upper limit. Section 2 is a pool of NUL-terminated
//! path strings referenced by `path_offset`.
//!
//! ```text
//! word  byte size of section 1
//! …     section 1 entries, sentinel last
//! word  byte size of section 2
//! …     section 2 string pool
//! ```
//!
//! Lookup locates the first entry whose `bin_offset` exceeds the query
//! and backs up one entry.

use rustc_hash::FxHashMap;

/// One source mapping, pre-pool-resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub bin_offset: u64,
    pub path: String,
    pub line: u64,
    pub line_offset: u64,
}

/// A resolved lookup result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineInfo {
    pub path: String,
    pub line: u64,
    pub line_offset: u64,
}

fn push_word(out: &mut Vec<u8>, value: u64, sizeof_gpr: u32) {
    match sizeof_gpr {
        4 => out.extend_from_slice(&(value as u32).to_le_bytes()),
        _ => out.extend_from_slice(&value.to_le_bytes()),
    }
}

fn read_word(bytes: &[u8], offset: usize, sizeof_gpr: u32) -> Option<u64> {
    match sizeof_gpr {
        4 => bytes
            .get(offset..offset + 4)
            .map(|b| u64::from(u32::from_le_bytes(b.try_into().unwrap()))),
        _ => bytes
            .get(offset..offset + 8)
            .map(|b| u64::from_le_bytes(b.try_into().unwrap())),
    }
}

/// Serialize entries (ascending by `bin_offset`) into the two-section
/// layout. `upper_limit` is the total size of the executable
/// instructions, recorded on the sentinel.
pub fn write(entries: &[Entry], upper_limit: u64, sizeof_gpr: u32) -> Vec<u8> {
    let word = if sizeof_gpr == 4 { 4usize } else { 8 };
    // Deduplicated path pool.
    let mut pool: Vec<u8> = Vec::new();
    let mut pool_offsets: FxHashMap<&str, u64> = FxHashMap::default();
    for e in entries {
        pool_offsets.entry(e.path.as_str()).or_insert_with(|| {
            let off = pool.len() as u64;
            pool.extend_from_slice(e.path.as_bytes());
            pool.push(0);
            off
        });
    }

    let section1_len = (entries.len() + 1) * 4 * word;
    let mut out = Vec::with_capacity(word + section1_len + word + pool.len());
    push_word(&mut out, section1_len as u64, sizeof_gpr);
    for e in entries {
        push_word(&mut out, e.bin_offset, sizeof_gpr);
        push_word(&mut out, pool_offsets[e.path.as_str()], sizeof_gpr);
        push_word(&mut out, e.line, sizeof_gpr);
        push_word(&mut out, e.line_offset, sizeof_gpr);
    }
    // Sentinel: line 0, upper-limit offset; not meant to be used.
    push_word(&mut out, upper_limit, sizeof_gpr);
    push_word(&mut out, 0, sizeof_gpr);
    push_word(&mut out, 0, sizeof_gpr);
    push_word(&mut out, 0, sizeof_gpr);
    push_word(&mut out, pool.len() as u64, sizeof_gpr);
    out.extend_from_slice(&pool);
    out
}

/// The source line a binary offset was generated from, or `None` when the
/// offset is out of range or the debug info is malformed.
pub fn line_for_offset(bytes: &[u8], sizeof_gpr: u32, query: u64) -> Option<LineInfo> {
    let word = if sizeof_gpr == 4 { 4usize } else { 8 };
    let section1_len = read_word(bytes, 0, sizeof_gpr)? as usize;
    let entry_size = 4 * word;
    let section2_base = word + section1_len + word;
    let section2_len = read_word(bytes, word + section1_len, sizeof_gpr)? as usize;
    let pool = bytes.get(section2_base..section2_base + section2_len)?;

    let mut previous: Option<(u64, u64, u64)> = None;
    let mut offset = word;
    let end = word + section1_len;
    while offset < end {
        let bin_offset = read_word(bytes, offset, sizeof_gpr)?;
        let path_offset = read_word(bytes, offset + word, sizeof_gpr)?;
        let line = read_word(bytes, offset + 2 * word, sizeof_gpr)?;
        let line_offset = read_word(bytes, offset + 3 * word, sizeof_gpr)?;
        if bin_offset > query {
            let (path_offset, line, line_offset) = previous?;
            if line == 0 {
                return None;
            }
            let rest = pool.get(path_offset as usize..)?;
            let nul = rest.iter().position(|&b| b == 0)?;
            let path = String::from_utf8(rest[..nul].to_vec()).ok()?;
            return Some(LineInfo {
                path,
                line,
                line_offset,
            });
        }
        previous = Some((path_offset, line, line_offset));
        offset += entry_size;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Entry> {
        vec![
            Entry {
                bin_offset: 0,
                path: "/src/a.lyc".into(),
                line: 3,
                line_offset: 20,
            },
            Entry {
                bin_offset: 16,
                path: "/src/b.lyh".into(),
                line: 7,
                line_offset: 90,
            },
            Entry {
                bin_offset: 40,
                path: "/src/a.lyc".into(),
                line: 4,
                line_offset: 31,
            },
        ]
    }

    #[test]
    fn lookup_backs_up_one_entry() {
        for gpr in [4u32, 8] {
            let bytes = write(&sample(), 64, gpr);
            let hit = line_for_offset(&bytes, gpr, 20).unwrap();
            assert_eq!(hit.path, "/src/b.lyh");
            assert_eq!(hit.line, 7);
            let hit = line_for_offset(&bytes, gpr, 0).unwrap();
            assert_eq!(hit.line, 3);
            // Exactly at a boundary resolves to the entry starting there.
            let hit = line_for_offset(&bytes, gpr, 40).unwrap();
            assert_eq!(hit.line, 4);
        }
    }

    #[test]
    fn out_of_range_offsets_miss() {
        let bytes = write(&sample(), 64, 8);
        assert!(line_for_offset(&bytes, 8, 64).is_none());
        assert!(line_for_offset(&bytes, 8, 10_000).is_none());
    }

    #[test]
    fn path_pool_deduplicates() {
        let bytes = write(&sample(), 64, 8);
        let text = String::from_utf8_lossy(&bytes);
        assert_eq!(text.matches("/src/a.lyc").count(), 1);
    }

    #[test]
    fn empty_info_has_only_the_sentinel() {
        let bytes = write(&[], 0, 8);
        assert!(line_for_offset(&bytes, 8, 0).is_none());
    }
}
