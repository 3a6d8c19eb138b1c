//! Frame Store: the only writer of frame bytes, and the
//! source of truth other components binary-search against.
//!
//! `append` is grounded on the original's per-stream `frames[MAX_STREAMS]`
//! vectors guarded by `frame_mu` (`frame_on_disk.h`); `load_all`/
//! `clean_catalog` are grounded on `db.cpp`'s `load_frame_file`/
//! `store_frame_file`/`clean_unused_frame_files`. Splitting the module into
//! `format` (bytes on disk) and `catalog` (sqlite cache) follows the
//! original's own file split between `frame_on_disk.*` and `db.*`.

mod catalog;
mod format;

pub use catalog::Catalog;
pub use format::{frame_filename, scan_file, DecodedFrame, FrameFileWriter, FrameReader};

use crate::constants::MAX_STREAMS;
use crate::error::FutatabiResult;
use crate::types::{FrameRef, StreamIndex};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

struct StreamState {
    index: StreamIndex,
    writer: Option<FrameFileWriter>,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            index: StreamIndex::new(),
            writer: None,
        }
    }
}

/// Owns every stream's [`StreamIndex`], the catalog, and the currently-open
/// writer per stream. All mutation goes through `&self` with an internal
/// [`Mutex`], mirroring the original's single global `frame_mu`.
pub struct FrameStore {
    frames_dir: PathBuf,
    catalog: Mutex<Catalog>,
    streams: Mutex<Vec<StreamState>>,
    filenames: Mutex<Vec<String>>,
}

impl FrameStore {
    pub fn open(working_directory: impl AsRef<Path>) -> FutatabiResult<Self> {
        let working_directory = working_directory.as_ref();
        let frames_dir = working_directory.join("frames");
        std::fs::create_dir_all(&frames_dir)?;
        let catalog = Catalog::open(working_directory.join("catalog.sqlite3"))?;

        let mut store = Self {
            frames_dir,
            catalog: Mutex::new(catalog),
            streams: Mutex::new((0..MAX_STREAMS).map(|_| StreamState::default()).collect()),
            filenames: Mutex::new(Vec::new()),
        };
        store.load_all()?;
        Ok(store)
    }

    /// Appends one frame to `stream_idx`'s currently-open file, rolling
    /// over to a new file once [`crate::constants::FRAMES_PER_FILE`]
    /// records have accumulated. On rollover, the sealed file's full index
    /// is written to the catalog atomically with closing the writer.
    pub fn append(
        &self,
        stream_idx: u32,
        pts: i64,
        video: &[u8],
        audio: &[u8],
    ) -> FutatabiResult<FrameRef> {
        let mut streams = self.streams.lock().expect("frame store mutex poisoned");
        let state = &mut streams[stream_idx as usize];

        if state.writer.is_none() {
            state.writer = Some(FrameFileWriter::create(&self.frames_dir, stream_idx, pts)?);
        }
        let writer = state.writer.as_mut().expect("just ensured present");

        let file_idx = self.register_filename(writer.filename());
        let frame_ref = writer.append(file_idx, pts, video, audio)?;
        state.index.push(frame_ref);

        if writer.is_full() {
            self.seal_current_file(state, stream_idx)?;
        }
        Ok(frame_ref)
    }

    fn seal_current_file(&self, state: &mut StreamState, stream_idx: u32) -> FutatabiResult<()> {
        let Some(mut writer) = state.writer.take() else {
            return Ok(());
        };
        writer.sync()?;
        let filename = writer.filename().to_string();
        let path = writer.into_path();
        let size = std::fs::metadata(&path)?.len();

        let mut contents = catalog::FileContents::new();
        contents.insert(stream_idx, state.index.as_slice().to_vec());
        self.catalog.lock().expect("catalog mutex poisoned").store_frame_file(&filename, size, &contents)?;
        Ok(())
    }

    fn register_filename(&self, filename: &str) -> u32 {
        let mut filenames = self.filenames.lock().expect("filenames mutex poisoned");
        if let Some(idx) = filenames.iter().position(|f| f == filename) {
            return idx as u32;
        }
        filenames.push(filename.to_string());
        (filenames.len() - 1) as u32
    }

    fn filename_for(&self, file_idx: u32) -> Option<String> {
        self.filenames
            .lock()
            .expect("filenames mutex poisoned")
            .get(file_idx as usize)
            .cloned()
    }

    /// Populates every stream's index at startup: catalog hits are used
    /// verbatim, catalog misses (new files, or ones the catalog predates)
    /// are resynced from disk.
    fn load_all(&mut self) -> FutatabiResult<()> {
        let mut entries: Vec<_> = match std::fs::read_dir(&self.frames_dir) {
            Ok(rd) => rd.filter_map(|e| e.ok()).collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        entries.sort_by_key(|e| e.file_name());

        let mut streams = self.streams.lock().expect("frame store mutex poisoned");
        let mut filenames = self.filenames.lock().expect("filenames mutex poisoned");

        for entry in entries {
            let filename = entry.file_name().to_string_lossy().to_string();
            if !filename.ends_with(".frames") {
                continue;
            }
            let Some(stream_idx) = parse_stream_idx(&filename) else {
                continue;
            };
            let size = entry.metadata()?.len();
            let file_idx = filenames.len() as u32;
            filenames.push(filename.clone());

            let refs = match self.catalog.lock().expect("catalog mutex poisoned").load_frame_file(&filename, size)? {
                Some(contents) => contents
                    .get(&stream_idx)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|mut r| {
                        r.file_idx = file_idx;
                        r
                    })
                    .collect(),
                None => {
                    let refs = scan_file(entry.path(), stream_idx, file_idx)?;
                    let mut contents = catalog::FileContents::new();
                    contents.insert(stream_idx, refs.clone());
                    self.catalog.lock().expect("catalog mutex poisoned").store_frame_file(&filename, size, &contents)?;
                    refs
                }
            };

            if (stream_idx as usize) < streams.len() {
                for r in refs {
                    streams[stream_idx as usize].index.push(r);
                }
            }
        }
        Ok(())
    }

    pub fn last_before(&self, stream_idx: u32, pts: i64) -> Option<FrameRef> {
        self.streams
            .lock()
            .expect("frame store mutex poisoned")
            .get(stream_idx as usize)
            .and_then(|s| s.index.last_before(pts))
    }

    pub fn first_at_or_after(&self, stream_idx: u32, pts: i64) -> Option<FrameRef> {
        self.streams
            .lock()
            .expect("frame store mutex poisoned")
            .get(stream_idx as usize)
            .and_then(|s| s.index.first_at_or_after(pts))
    }

    pub fn surrounding(&self, stream_idx: u32, pts: i64) -> (Option<FrameRef>, Option<FrameRef>) {
        self.streams
            .lock()
            .expect("frame store mutex poisoned")
            .get(stream_idx as usize)
            .map(|s| s.index.surrounding(pts))
            .unwrap_or((None, None))
    }

    /// Index of the first frame in `stream_idx` with `pts >= query`, used by
    /// the easing-length search to probe a few frames on either side of a
    /// target pts without holding the lock for the whole search.
    pub fn index_at_or_after(&self, stream_idx: u32, pts: i64) -> usize {
        self.streams
            .lock()
            .expect("frame store mutex poisoned")
            .get(stream_idx as usize)
            .map_or(0, |s| s.index.index_at_or_after(pts))
    }

    pub fn frame_at(&self, stream_idx: u32, idx: usize) -> Option<FrameRef> {
        self.streams
            .lock()
            .expect("frame store mutex poisoned")
            .get(stream_idx as usize)
            .and_then(|s| s.index.get(idx))
    }

    pub fn len(&self, stream_idx: u32) -> usize {
        self.streams
            .lock()
            .expect("frame store mutex poisoned")
            .get(stream_idx as usize)
            .map_or(0, |s| s.index.len())
    }

    /// Reads the bytes a [`FrameRef`] points to, using a caller-owned
    /// [`FrameReader`] so sequential reads benefit from readahead.
    pub fn read(
        &self,
        reader: &mut FrameReader,
        frame: FrameRef,
        read_video: bool,
        read_audio: bool,
    ) -> FutatabiResult<DecodedFrame> {
        let filename = self
            .filename_for(frame.file_idx)
            .ok_or_else(|| crate::error::FutatabiError::catalog("unknown file_idx"))?;
        reader.read_frame(&filename, frame, read_video, read_audio)
    }

    pub fn new_reader(&self) -> FrameReader {
        FrameReader::new(&self.frames_dir)
    }

    /// Drops catalog rows for files no longer referenced by any stream's
    /// index. Sealed files currently on disk
    /// are always kept; this only prunes catalog entries for files that
    /// have themselves been deleted from disk.
    pub fn clean_catalog(&self) -> FutatabiResult<()> {
        let filenames = self.filenames.lock().expect("filenames mutex poisoned");
        let existing: Vec<String> = filenames
            .iter()
            .filter(|f| self.frames_dir.join(f).exists())
            .cloned()
            .collect();
        self.catalog.lock().expect("catalog mutex poisoned").clean_unused_frame_files(&existing)
    }

    pub fn catalog(&self) -> &Mutex<Catalog> {
        &self.catalog
    }
}

fn parse_stream_idx(filename: &str) -> Option<u32> {
    let rest = filename.strip_prefix("cam")?;
    let (idx, _) = rest.split_once('-')?;
    idx.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_surrounding_finds_bracketing_frames() {
        let dir = tempfile::tempdir().unwrap();
        let store = FrameStore::open(dir.path()).unwrap();
        for pts in [0i64, 200_000, 400_000] {
            store.append(0, pts, b"v", b"a").unwrap();
        }
        let (lower, upper) = store.surrounding(0, 300_000);
        assert_eq!(lower.unwrap().pts, 200_000);
        assert_eq!(upper.unwrap().pts, 400_000);
    }

    #[test]
    fn reopening_store_restores_index_from_catalog() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FrameStore::open(dir.path()).unwrap();
            for pts in [0i64, 200_000] {
                store.append(1, pts, b"video-bytes", b"audio-bytes").unwrap();
            }
        }
        let store = FrameStore::open(dir.path()).unwrap();
        assert_eq!(store.len(1), 2);
        let mut reader = store.new_reader();
        let frame = store.last_before(1, 200_000).unwrap();
        let decoded = store.read(&mut reader, frame, true, true).unwrap();
        assert_eq!(decoded.video, b"video-bytes");
    }

    #[test]
    fn parse_stream_idx_reads_prefix() {
        assert_eq!(parse_stream_idx("cam3-pts0.frames"), Some(3));
        assert_eq!(parse_stream_idx("not-a-frame-file.txt"), None);
    }
}
