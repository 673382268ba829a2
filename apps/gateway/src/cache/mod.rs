//! Per-document on-disk cache of rendered tiles and auxiliary blobs
//! (status, command values, part-page rectangles, font renderings).
//! Serving a re-request from here avoids a round-trip to the worker.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use tracing::{debug, warn};

use docbridge_protocol::{TileRequest, Tokens};

const SOURCE_STAMP: &str = ".sourcestamp";

/// Blobs that describe document state and go stale on the first edit.
const VOLATILE_BLOBS: &[&str] = &["status.txt", "partpagerectangles.txt"];

struct CacheState {
    editing: bool,
}

/// Disk cache for one document. File operations are atomic per key
/// (write to a temp name, then rename); the editing flag is guarded by a
/// mutex so concurrent sessions see a consistent purge.
pub struct TileCache {
    dir: PathBuf,
    state: Mutex<CacheState>,
}

impl TileCache {
    /// Opens (or creates) the cache directory for a document. When the
    /// source document is newer than what the cache was built from, the
    /// whole cache is wiped.
    pub fn new(cache_root: &Path, doc_url: &str, timestamp: Option<&str>) -> Self {
        let dir = cache_root.join(encode_doc_name(doc_url));
        let stamp = source_stamp(doc_url, timestamp);
        let marker = dir.join(SOURCE_STAMP);
        let fresh = fs::read_to_string(&marker)
            .map(|stored| stored == stamp)
            .unwrap_or(false);
        if !fresh && dir.exists() {
            debug!(url = doc_url, "source changed, wiping tile cache");
            let _ = fs::remove_dir_all(&dir);
        }
        if let Err(err) = fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), "cannot create cache dir: {}", err);
        }
        let _ = fs::write(&marker, stamp);
        TileCache {
            dir,
            state: Mutex::new(CacheState { editing: false }),
        }
    }

    pub fn lookup_tile(&self, tile: &TileRequest) -> Option<Vec<u8>> {
        fs::read(self.dir.join(tile_file_name(tile))).ok()
    }

    /// Stores the rendered tile at its canonical path. Idempotent; a
    /// concurrent writer of the same key just wins the rename.
    pub fn save_tile(&self, tile: &TileRequest, data: &[u8]) {
        self.write_atomic(&tile_file_name(tile), data);
    }

    /// Removes every cached tile whose rectangle intersects the region.
    /// A negative part invalidates all parts.
    pub fn invalidate_tiles(&self, part: i32, x: i32, y: i32, width: i32, height: i32) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(tile) = parse_tile_name(&name.to_string_lossy()) else {
                continue;
            };
            if part >= 0 && tile.part != part {
                continue;
            }
            if rects_intersect(
                tile.tile_pos_x,
                tile.tile_pos_y,
                tile.tile_width,
                tile.tile_height,
                x,
                y,
                width,
                height,
            ) {
                let _ = fs::remove_file(entry.path());
            }
        }
    }

    /// Convenience for the engine-formatted invalidation line, e.g.
    /// `invalidatetiles: part=0 x=0 y=0 width=2147483647 height=2147483647`.
    /// A line without a parseable rectangle invalidates the whole part;
    /// a line without a part uses `fallback_part`.
    pub fn invalidate_from_line(&self, line: &str, fallback_part: i32) {
        let tokens = Tokens::parse(line);
        let part = tokens.find_int("part").unwrap_or(fallback_part);
        match (
            tokens.find_int("x"),
            tokens.find_int("y"),
            tokens.find_int("width"),
            tokens.find_int("height"),
        ) {
            (Some(x), Some(y), Some(width), Some(height)) => {
                self.invalidate_tiles(part, x, y, width, height)
            }
            _ => self.invalidate_tiles(part, 0, 0, i32::MAX, i32::MAX),
        }
    }

    pub fn save_text_file(&self, name: &str, text: &str) {
        self.write_atomic(name, text.as_bytes());
    }

    /// Returns the blob only when it was written after the last edit;
    /// stale blobs were purged when editing started, so presence implies
    /// freshness.
    pub fn get_text_file(&self, name: &str) -> Option<String> {
        let text = fs::read_to_string(self.dir.join(name)).ok()?;
        if text.is_empty() { None } else { Some(text) }
    }

    pub fn save_rendering(&self, key: &str, kind: &str, data: &[u8]) {
        self.write_atomic(&rendering_file_name(key, kind), data);
    }

    pub fn lookup_rendering(&self, key: &str, kind: &str) -> Option<Vec<u8>> {
        fs::read(self.dir.join(rendering_file_name(key, kind))).ok()
    }

    /// Flags the document as being edited. On the first rising edge the
    /// volatile blob set is purged, keeping invariant (b) of
    /// `get_text_file` by construction.
    pub fn set_editing(&self, editing: bool) {
        let mut state = self.state.lock().unwrap();
        if editing && !state.editing {
            debug!(dir = %self.dir.display(), "first edit, purging volatile blobs");
            for name in VOLATILE_BLOBS {
                let _ = fs::remove_file(self.dir.join(name));
            }
            if let Ok(entries) = fs::read_dir(&self.dir) {
                for entry in entries.flatten() {
                    if entry.file_name().to_string_lossy().starts_with("cmdValues") {
                        let _ = fs::remove_file(entry.path());
                    }
                }
            }
        }
        state.editing = editing;
    }

    pub fn is_editing(&self) -> bool {
        self.state.lock().unwrap().editing
    }

    /// The pending edits reached the source document; cached state is
    /// consistent again.
    pub fn document_saved(&self) {
        self.state.lock().unwrap().editing = false;
    }

    fn write_atomic(&self, name: &str, data: &[u8]) {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{}.tmp", name));
        let written = fs::write(&tmp, data).and_then(|()| fs::rename(&tmp, &path));
        if let Err(err) = written {
            warn!(file = %path.display(), "cache write failed: {}", err);
            let _ = fs::remove_file(&tmp);
        }
    }
}

fn tile_file_name(tile: &TileRequest) -> String {
    format!(
        "{}_{}_{}_{}_{}_{}_{}.png",
        tile.part,
        tile.width,
        tile.height,
        tile.tile_pos_x,
        tile.tile_pos_y,
        tile.tile_width,
        tile.tile_height
    )
}

fn parse_tile_name(name: &str) -> Option<TileRequest> {
    let stem = name.strip_suffix(".png")?;
    let fields: Vec<i32> = stem.split('_').map(str::parse).collect::<Result<_, _>>().ok()?;
    if fields.len() != 7 {
        return None;
    }
    Some(TileRequest {
        part: fields[0],
        width: fields[1],
        height: fields[2],
        tile_pos_x: fields[3],
        tile_pos_y: fields[4],
        tile_width: fields[5],
        tile_height: fields[6],
    })
}

fn rendering_file_name(key: &str, kind: &str) -> String {
    format!("{}-{}.bin", kind, sanitize(key))
}

#[allow(clippy::too_many_arguments)]
fn rects_intersect(
    ax: i32,
    ay: i32,
    aw: i32,
    ah: i32,
    bx: i32,
    by: i32,
    bw: i32,
    bh: i32,
) -> bool {
    // widen to avoid overflow on "infinite" regions
    let (ax, ay, aw, ah) = (ax as i64, ay as i64, aw as i64, ah as i64);
    let (bx, by, bw, bh) = (bx as i64, by as i64, bw as i64, bh as i64);
    ax < bx + bw && bx < ax + aw && ay < by + bh && by < ay + ah
}

fn sanitize(text: &str) -> String {
    text.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

fn encode_doc_name(doc_url: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in doc_url.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    let tail: String = doc_url
        .chars()
        .rev()
        .take(32)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("{}-{:016x}", sanitize(&tail), hash)
}

fn source_stamp(doc_url: &str, timestamp: Option<&str>) -> String {
    if let Some(timestamp) = timestamp {
        return timestamp.to_string();
    }
    doc_url
        .strip_prefix("file://")
        .and_then(|path| fs::metadata(path).ok())
        .and_then(|meta| meta.modified().ok())
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|age| age.as_secs().to_string())
        .unwrap_or_else(|| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(part: i32, x: i32, y: i32) -> TileRequest {
        TileRequest {
            part,
            width: 256,
            height: 256,
            tile_pos_x: x,
            tile_pos_y: y,
            tile_width: 3840,
            tile_height: 3840,
        }
    }

    #[test]
    fn tile_round_trip_and_idempotent_save() {
        let root = tempfile::tempdir().unwrap();
        let cache = TileCache::new(root.path(), "file:///tmp/a.odt", Some("1"));
        let key = tile(0, 0, 0);
        assert!(cache.lookup_tile(&key).is_none());
        cache.save_tile(&key, b"png-bytes");
        cache.save_tile(&key, b"png-bytes");
        assert_eq!(cache.lookup_tile(&key).unwrap(), b"png-bytes");
    }

    #[test]
    fn invalidation_removes_intersecting_tiles_only() {
        let root = tempfile::tempdir().unwrap();
        let cache = TileCache::new(root.path(), "file:///tmp/a.odt", Some("1"));
        cache.save_tile(&tile(0, 0, 0), b"a");
        cache.save_tile(&tile(0, 3840, 0), b"b");
        cache.save_tile(&tile(0, 0, 3840), b"c");
        cache.save_tile(&tile(1, 0, 0), b"d");

        cache.invalidate_tiles(0, 0, 0, 3840, 3840);
        assert!(cache.lookup_tile(&tile(0, 0, 0)).is_none());
        assert!(cache.lookup_tile(&tile(0, 3840, 0)).is_some());
        assert!(cache.lookup_tile(&tile(0, 0, 3840)).is_some());
        // other part untouched
        assert!(cache.lookup_tile(&tile(1, 0, 0)).is_some());
    }

    #[test]
    fn full_invalidation_line_clears_the_part() {
        let root = tempfile::tempdir().unwrap();
        let cache = TileCache::new(root.path(), "file:///tmp/a.odt", Some("1"));
        cache.save_tile(&tile(0, 0, 0), b"a");
        cache.save_tile(&tile(0, 7680, 7680), b"b");
        cache.invalidate_from_line(
            "invalidatetiles: part=0 x=0 y=0 width=2147483647 height=2147483647",
            0,
        );
        assert!(cache.lookup_tile(&tile(0, 0, 0)).is_none());
        assert!(cache.lookup_tile(&tile(0, 7680, 7680)).is_none());
    }

    #[test]
    fn first_edit_purges_volatile_blobs() {
        let root = tempfile::tempdir().unwrap();
        let cache = TileCache::new(root.path(), "file:///tmp/a.odt", Some("1"));
        cache.save_text_file("status.txt", "status: type=text parts=1");
        cache.save_text_file("cmdValues.uno:CharFontName.txt", "commandvalues: {}");
        assert!(cache.get_text_file("status.txt").is_some());

        cache.set_editing(true);
        assert!(cache.get_text_file("status.txt").is_none());
        assert!(cache.get_text_file("cmdValues.uno:CharFontName.txt").is_none());

        // blobs written during editing are served again
        cache.save_text_file("status.txt", "status: type=text parts=1");
        assert!(cache.get_text_file("status.txt").is_some());

        cache.document_saved();
        assert!(!cache.is_editing());
    }

    #[test]
    fn newer_source_wipes_the_cache() {
        let root = tempfile::tempdir().unwrap();
        {
            let cache = TileCache::new(root.path(), "file:///tmp/a.odt", Some("100"));
            cache.save_tile(&tile(0, 0, 0), b"stale");
        }
        let cache = TileCache::new(root.path(), "file:///tmp/a.odt", Some("200"));
        assert!(cache.lookup_tile(&tile(0, 0, 0)).is_none());

        // same stamp keeps the cache
        let cache2 = TileCache::new(root.path(), "file:///tmp/a.odt", Some("200"));
        cache.save_tile(&tile(0, 0, 0), b"kept");
        assert!(cache2.lookup_tile(&tile(0, 0, 0)).is_some());
    }

    #[test]
    fn font_renderings_are_cached_by_key() {
        let root = tempfile::tempdir().unwrap();
        let cache = TileCache::new(root.path(), "file:///tmp/a.odt", Some("1"));
        assert!(cache.lookup_rendering("Liberation Serif", "font").is_none());
        cache.save_rendering("Liberation Serif", "font", b"glyphs");
        assert_eq!(
            cache.lookup_rendering("Liberation Serif", "font").unwrap(),
            b"glyphs"
        );
    }
}
