//! Persisted catalog: caches a `FrameFile`'s parsed contents so a restart
//! doesn't need to rescan, plus the single-row `state`/`settings` tables
//! Grounded directly on the original's `futatabi/db.cpp`
//! (`DB::get_state`, `store_frame_file`, `clean_unused_frame_files`);
//! `rusqlite` stands in for the hand-rolled `sqlite3_*` calls, and `prost`
//! stands in for the original's hand-generated protobuf bindings (both
//! grounded on `other_examples/manifests/scottlamb-moonfire-nvr`, which
//! pairs `rusqlite` with a protobuf crate for the same kind of frame-index
//! catalog).

use crate::error::{FutatabiError, FutatabiResult};
use crate::types::FrameRef;
use prost::Message;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;

pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/futatabi.catalog.rs"));
}

/// One sealed file's frame index, keyed by stream_idx, ready to splice
/// into [`crate::frame_store::StreamIndex`] arrays.
pub type FileContents = HashMap<u32, Vec<FrameRef>>;

pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Opens (creating if absent) the catalog at `path`. WAL mode and an
    /// effectively-infinite busy timeout serialize contending writers
    /// instead of erroring out, matching `sqlite3_busy_timeout(db,
    /// 3600000)` in the original.
    pub fn open(path: impl AsRef<Path>) -> FutatabiResult<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| FutatabiError::fatal_init(format!("opening catalog: {e}")))?;
        conn.busy_timeout(std::time::Duration::from_secs(3600))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS state (rowid INTEGER PRIMARY KEY CHECK (rowid = 1), state BLOB);
             CREATE TABLE IF NOT EXISTS settings (rowid INTEGER PRIMARY KEY CHECK (rowid = 1), settings BLOB);
             CREATE TABLE IF NOT EXISTS filev2 (
                 file INTEGER NOT NULL PRIMARY KEY,
                 filename VARCHAR NOT NULL UNIQUE,
                 size BIGINT NOT NULL,
                 frames BLOB NOT NULL
             );
             PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;
        Ok(Self { conn })
    }

    pub fn get_state(&self) -> FutatabiResult<proto::StateProto> {
        self.conn
            .query_row("SELECT state FROM state WHERE rowid = 1", [], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .map_or_else(
                |e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(proto::StateProto::default()),
                    e => Err(e.into()),
                },
                |bytes| {
                    proto::StateProto::decode(bytes.as_slice())
                        .map_err(|e| FutatabiError::catalog(format!("state blob corrupted: {e}")))
                },
            )
    }

    pub fn store_state(&self, state: &proto::StateProto) -> FutatabiResult<()> {
        self.conn.execute(
            "REPLACE INTO state (rowid, state) VALUES (1, ?1)",
            params![state.encode_to_vec()],
        )?;
        Ok(())
    }

    pub fn get_settings(&self) -> FutatabiResult<proto::SettingsProto> {
        self.conn
            .query_row("SELECT settings FROM settings WHERE rowid = 1", [], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .map_or_else(
                |e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(proto::SettingsProto::default()),
                    e => Err(e.into()),
                },
                |bytes| {
                    proto::SettingsProto::decode(bytes.as_slice())
                        .map_err(|e| FutatabiError::catalog(format!("settings blob corrupted: {e}")))
                },
            )
    }

    pub fn store_settings(&self, settings: &proto::SettingsProto) -> FutatabiResult<()> {
        self.conn.execute(
            "REPLACE INTO settings (rowid, settings) VALUES (1, ?1)",
            params![settings.encode_to_vec()],
        )?;
        Ok(())
    }

    /// Looks up a sealed file's cached frame index by filename + size (the
    /// size guards against a stale cache row surviving a truncated
    /// rewrite). Returns `None` on a cache miss, meaning the caller must
    /// fall back to scanning the file.
    pub fn load_frame_file(&self, filename: &str, size: u64) -> FutatabiResult<Option<FileContents>> {
        let blob: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT frames FROM filev2 WHERE filename = ?1 AND size = ?2",
                params![filename, size as i64],
                |row| row.get(0),
            )
            .map_or_else(
                |e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok::<_, FutatabiError>(None),
                    e => Err(e.into()),
                },
                |b| Ok(Some(b)),
            )?;
        let Some(blob) = blob else {
            return Ok(None);
        };
        let contents = proto::FileContents::decode(blob.as_slice())
            .map_err(|e| FutatabiError::catalog(format!("frame list corrupted: {e}")))?;
        let mut out = FileContents::new();
        for (stream_idx, frames) in contents.streams {
            let mut refs = Vec::with_capacity(frames.pts.len());
            for i in 0..frames.pts.len() {
                refs.push(FrameRef {
                    pts: frames.pts[i],
                    file_idx: 0, // filled in by the caller, which knows the file's index
                    offset: frames.offset.get(i).copied().unwrap_or(0),
                    video_size: frames.file_size.get(i).copied().unwrap_or(0),
                    audio_size: frames.audio_size.get(i).copied().unwrap_or(0),
                });
            }
            out.insert(stream_idx, refs);
        }
        Ok(Some(out))
    }

    /// Persists a sealed file's frame index, replacing any prior row with
    /// the same filename.
    pub fn store_frame_file(&self, filename: &str, size: u64, contents: &FileContents) -> FutatabiResult<()> {
        let mut streams = HashMap::new();
        for (stream_idx, refs) in contents {
            let mut frames = proto::StreamFrames::default();
            for r in refs {
                frames.pts.push(r.pts);
                frames.offset.push(r.offset);
                frames.file_size.push(r.video_size);
                frames.audio_size.push(r.audio_size);
            }
            streams.insert(*stream_idx, frames);
        }
        let file_contents = proto::FileContents { streams };
        self.conn.execute(
            "REPLACE INTO filev2 (filename, size, frames) VALUES (?1, ?2, ?3)",
            params![filename, size as i64, file_contents.encode_to_vec()],
        )?;
        Ok(())
    }

    /// Drops catalog rows whose filename is not in `used_filenames`.
    pub fn clean_unused_frame_files(&self, used_filenames: &[String]) -> FutatabiResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch("CREATE TEMPORARY TABLE used_filenames (filename VARCHAR NOT NULL PRIMARY KEY)")?;
        {
            let mut stmt = tx.prepare("INSERT INTO used_filenames (filename) VALUES (?1)")?;
            for filename in used_filenames {
                stmt.execute(params![filename])?;
            }
        }
        tx.execute_batch(
            "DELETE FROM filev2 WHERE filename NOT IN (SELECT filename FROM used_filenames);
             DROP TABLE used_filenames;",
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_contents() -> FileContents {
        let mut m = FileContents::new();
        m.insert(
            0,
            vec![
                FrameRef { pts: 0, file_idx: 0, offset: 16, video_size: 1000, audio_size: 40 },
                FrameRef { pts: 200_000, file_idx: 0, offset: 1100, video_size: 900, audio_size: 40 },
            ],
        );
        m
    }

    #[test]
    fn frame_file_round_trips_through_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path().join("catalog.sqlite3")).unwrap();
        let contents = sample_contents();
        catalog.store_frame_file("cam0-pts0.frames", 4096, &contents).unwrap();

        let loaded = catalog.load_frame_file("cam0-pts0.frames", 4096).unwrap().unwrap();
        assert_eq!(loaded[&0].len(), 2);
        assert_eq!(loaded[&0][1].pts, 200_000);
        assert_eq!(loaded[&0][1].offset, 1100);
    }

    #[test]
    fn missing_frame_file_is_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path().join("catalog.sqlite3")).unwrap();
        assert!(catalog.load_frame_file("nope.frames", 0).unwrap().is_none());
    }

    #[test]
    fn clean_unused_frame_files_drops_stale_rows() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path().join("catalog.sqlite3")).unwrap();
        catalog.store_frame_file("keep.frames", 10, &sample_contents()).unwrap();
        catalog.store_frame_file("drop.frames", 10, &sample_contents()).unwrap();

        catalog.clean_unused_frame_files(&["keep.frames".to_string()]).unwrap();

        assert!(catalog.load_frame_file("keep.frames", 10).unwrap().is_some());
        assert!(catalog.load_frame_file("drop.frames", 10).unwrap().is_none());
    }

    #[test]
    fn state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path().join("catalog.sqlite3")).unwrap();
        let mut state = proto::StateProto::default();
        state.current_file_idx = 3;
        state.last_ingest_pts = 123_456;
        catalog.store_state(&state).unwrap();

        let loaded = catalog.get_state().unwrap();
        assert_eq!(loaded.current_file_idx, 3);
        assert_eq!(loaded.last_ingest_pts, 123_456);
    }
}
