//! On-disk `.frames` file layout.
//!
//! Repeating record: 8-byte magic `Ftbifrm0`, a big-endian `u32` header
//! length, a `FrameHeader` protobuf, `file_size` bytes of MJPEG, then
//! `audio_size` bytes of interleaved stereo s32le PCM. Grounded on the
//! original's `frame_on_disk.cpp` (`FrameReader::read_frame`: video bytes at
//! `offset`, audio immediately after at `offset + size`) for the read side;
//! the write side and resync-on-garbage scan are new since the original
//! writes frames inline from its capture thread rather than through a
//! dedicated writer object.

use crate::constants::{FRAMES_PER_FILE, FRAME_MAGIC};
use crate::error::{FutatabiError, FutatabiResult};
use crate::types::FrameRef;
use prost::Message;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/futatabi.catalog.rs"));
}

/// Builds the on-disk filename for a newly sealed/opened frame file
/// (`cam<stream_idx>-pts<pts>.frames`).
pub fn frame_filename(stream_idx: u32, first_pts: i64) -> String {
    format!("cam{stream_idx}-pts{first_pts}.frames")
}

/// Appends records to a single `.frames` file and rolls over to a new file
/// once [`FRAMES_PER_FILE`] records have been written.
pub struct FrameFileWriter {
    dir: PathBuf,
    stream_idx: u32,
    file: File,
    filename: String,
    records_written: usize,
}

impl FrameFileWriter {
    pub fn create(dir: impl AsRef<Path>, stream_idx: u32, first_pts: i64) -> FutatabiResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let filename = frame_filename(stream_idx, first_pts);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dir.join(&filename))?;
        Ok(Self {
            dir,
            stream_idx,
            file,
            filename,
            records_written: 0,
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Appends one record, returning the [`FrameRef`] that locates it.
    /// `file_idx` is assigned by the caller, which tracks the mapping from
    /// index to filename.
    pub fn append(
        &mut self,
        file_idx: u32,
        pts: i64,
        video: &[u8],
        audio: &[u8],
    ) -> FutatabiResult<FrameRef> {
        let header = proto::FrameHeader {
            stream_idx: self.stream_idx,
            pts,
            file_size: video.len() as u32,
            audio_size: audio.len() as u32,
        };
        let header_bytes = header.encode_to_vec();

        let offset = self.file.stream_position()?;
        self.file.write_all(FRAME_MAGIC)?;
        self.file.write_all(&(header_bytes.len() as u32).to_be_bytes())?;
        self.file.write_all(&header_bytes)?;
        let video_offset = self.file.stream_position()?;
        self.file.write_all(video)?;
        self.file.write_all(audio)?;

        self.records_written += 1;

        let _ = offset; // record start, kept for diagnostics only
        Ok(FrameRef {
            pts,
            file_idx,
            offset: video_offset,
            video_size: video.len() as u32,
            audio_size: audio.len() as u32,
        })
    }

    pub fn is_full(&self) -> bool {
        self.records_written >= FRAMES_PER_FILE
    }

    pub fn sync(&mut self) -> FutatabiResult<()> {
        self.file.flush()?;
        Ok(())
    }

    pub fn into_path(self) -> PathBuf {
        self.dir.join(&self.filename)
    }
}

/// Caches an open file handle per reader so sequential reads within a
/// `.frames` file benefit from kernel readahead, matching
/// `FrameReader::read_frame`'s `last_filename_idx` check in the original.
/// Thread-compatible, not thread-safe: each consuming thread owns one.
pub struct FrameReader {
    dir: PathBuf,
    open_filename: Option<String>,
    file: Option<File>,
}

pub struct DecodedFrame {
    pub video: Vec<u8>,
    pub audio: Vec<u8>,
}

impl FrameReader {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            open_filename: None,
            file: None,
        }
    }

    pub fn read_frame(
        &mut self,
        filename: &str,
        frame: FrameRef,
        read_video: bool,
        read_audio: bool,
    ) -> FutatabiResult<DecodedFrame> {
        if self.open_filename.as_deref() != Some(filename) {
            let file = File::open(self.dir.join(filename))?;
            self.file = Some(file);
            self.open_filename = Some(filename.to_string());
        }
        let file = self.file.as_mut().expect("just opened above");

        let video = if read_video {
            read_exact_at(file, frame.offset, frame.video_size as usize)?
        } else {
            Vec::new()
        };
        let audio = if read_audio {
            read_exact_at(
                file,
                frame.offset + frame.video_size as u64,
                frame.audio_size as usize,
            )?
        } else {
            Vec::new()
        };
        Ok(DecodedFrame { video, audio })
    }
}

fn read_exact_at(file: &mut File, offset: u64, len: usize) -> FutatabiResult<Vec<u8>> {
    let mut buf = vec![0u8; len];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Scans a `.frames` file from scratch, resyncing on the magic marker and
/// skipping garbage bytes rather than failing the whole scan.
/// Used when a file has no catalog entry (new file, or catalog behind disk).
pub fn scan_file(path: impl AsRef<Path>, stream_idx: u32, file_idx: u32) -> FutatabiResult<Vec<FrameRef>> {
    let path = path.as_ref();
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut pos: u64 = 0;
    let mut out = Vec::new();
    let mut skipped_bytes: u64 = 0;

    while pos + FRAME_MAGIC.len() as u64 <= len {
        file.seek(SeekFrom::Start(pos))?;
        let mut magic_buf = [0u8; 8];
        if file.read_exact(&mut magic_buf).is_err() {
            break;
        }
        if &magic_buf != FRAME_MAGIC {
            pos += 1;
            skipped_bytes += 1;
            continue;
        }

        let header_start = pos + FRAME_MAGIC.len() as u64;
        if header_start + 4 > len {
            break; // truncated length prefix
        }
        let mut len_buf = [0u8; 4];
        file.seek(SeekFrom::Start(header_start))?;
        if file.read_exact(&mut len_buf).is_err() {
            break;
        }
        let header_len = u32::from_be_bytes(len_buf) as u64;
        let header_data_start = header_start + 4;
        if header_data_start + header_len > len {
            break; // truncated header
        }

        let mut header_bytes = vec![0u8; header_len as usize];
        file.seek(SeekFrom::Start(header_data_start))?;
        if file.read_exact(&mut header_bytes).is_err() {
            break;
        }
        let header = match proto::FrameHeader::decode(header_bytes.as_slice()) {
            Ok(h) => h,
            Err(_) => {
                pos = header_data_start;
                skipped_bytes += 1;
                continue;
            }
        };
        if header.stream_idx != stream_idx {
            pos = header_data_start;
            skipped_bytes += 1;
            continue;
        }

        let video_offset = header_data_start + header_len;
        let payload_end = video_offset + header.file_size as u64 + header.audio_size as u64;
        if payload_end > len {
            break; // truncated payload: stop scanning, keep what's valid so far
        }

        out.push(FrameRef {
            pts: header.pts,
            file_idx,
            offset: video_offset,
            video_size: header.file_size,
            audio_size: header.audio_size,
        });
        pos = payload_end;
    }

    if skipped_bytes > 0 {
        tracing::warn!(
            path = %path.display(),
            skipped_bytes,
            "skipped garbage bytes while resyncing frame file"
        );
    }
    Ok(out)
}

impl From<std::num::TryFromIntError> for FutatabiError {
    fn from(e: std::num::TryFromIntError) -> Self {
        FutatabiError::corrupted_frame_file("<unknown>", e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = FrameFileWriter::create(dir.path(), 0, 0).unwrap();
        let video = b"fake-jpeg-bytes".to_vec();
        let audio = b"fake-pcm-bytes".to_vec();
        let frame_ref = writer.append(0, 0, &video, &audio).unwrap();
        writer.sync().unwrap();

        let mut reader = FrameReader::new(dir.path());
        let decoded = reader
            .read_frame(writer.filename(), frame_ref, true, true)
            .unwrap();
        assert_eq!(decoded.video, video);
        assert_eq!(decoded.audio, audio);
    }

    #[test]
    fn scan_file_recovers_all_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = FrameFileWriter::create(dir.path(), 2, 0).unwrap();
        for pts in [0i64, 200_000, 400_000] {
            writer.append(0, pts, b"v", b"a").unwrap();
        }
        let filename = writer.filename().to_string();
        writer.sync().unwrap();

        let refs = scan_file(dir.path().join(&filename), 2, 0).unwrap();
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[2].pts, 400_000);
    }

    #[test]
    fn scan_file_skips_leading_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = FrameFileWriter::create(dir.path(), 0, 0).unwrap();
        writer.append(0, 0, b"v", b"a").unwrap();
        let filename = writer.filename().to_string();
        writer.sync().unwrap();
        drop(writer);

        let path = dir.path().join(&filename);
        let mut existing = std::fs::read(&path).unwrap();
        let mut corrupted = vec![0xFFu8; 5];
        corrupted.append(&mut existing);
        std::fs::write(&path, corrupted).unwrap();

        let refs = scan_file(&path, 0, 0).unwrap();
        assert_eq!(refs.len(), 1);
    }

    #[test]
    fn scan_file_stops_on_truncated_payload() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = FrameFileWriter::create(dir.path(), 0, 0).unwrap();
        writer.append(0, 0, b"full-frame-bytes", b"audio").unwrap();
        let filename = writer.filename().to_string();
        writer.sync().unwrap();
        drop(writer);

        let path = dir.path().join(&filename);
        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 3]).unwrap();

        let refs = scan_file(&path, 0, 0).unwrap();
        assert!(refs.is_empty());
    }
}
