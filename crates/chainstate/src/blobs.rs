//! Append-only blob files (`blkNNNNN.dat` / `revNNNNN.dat`).
//!
//! Every record is framed as `magic(4) | len(u32 le) | payload`. Positions point at the
//! start of the frame; which file and offset a record goes to is decided by the caller
//! from the persisted per-file bookkeeping.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use vcoin_consensus::constants::MAX_BLOCK_SIZE;
use vcoin_primitives::encoding::{DecodeError, Decoder, Encoder};
use vcoin_primitives::HEADER_SIZE;

pub const FRAME_HEADER_LEN: u32 = 8;
pub const BLOB_POS_LEN: usize = 8;

/// Location of a framed record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BlobPos {
    pub file: u32,
    pub offset: u32,
}

impl BlobPos {
    pub fn new(file: u32, offset: u32) -> Self {
        Self { file, offset }
    }

    pub fn encode(&self) -> [u8; BLOB_POS_LEN] {
        let mut out = [0u8; BLOB_POS_LEN];
        out[0..4].copy_from_slice(&self.file.to_le_bytes());
        out[4..8].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != BLOB_POS_LEN {
            return None;
        }
        let file = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let offset = u32::from_le_bytes(bytes[4..8].try_into().ok()?);
        Some(Self { file, offset })
    }
}

#[derive(Debug)]
pub enum BlobError {
    Io(std::io::Error),
    BadMagic,
    LengthMismatch,
    DiskSpace { available: u64, required: u64 },
}

impl std::fmt::Display for BlobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobError::Io(err) => write!(f, "{err}"),
            BlobError::BadMagic => write!(f, "blob record has wrong network magic"),
            BlobError::LengthMismatch => write!(f, "blob record length mismatch"),
            BlobError::DiskSpace {
                available,
                required,
            } => write!(
                f,
                "disk space is low: {available} bytes available, {required} required"
            ),
        }
    }
}

impl std::error::Error for BlobError {}

impl From<std::io::Error> for BlobError {
    fn from(err: std::io::Error) -> Self {
        BlobError::Io(err)
    }
}

pub struct BlobStore {
    dir: PathBuf,
    prefix: String,
    magic: [u8; 4],
    write_lock: Mutex<()>,
}

impl BlobStore {
    pub fn open(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        magic: [u8; 4],
    ) -> Result<Self, BlobError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            prefix: prefix.into(),
            magic,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_path(&self, file: u32) -> PathBuf {
        self.dir.join(format!("{}{file:05}.dat", self.prefix))
    }

    /// Frame size of a record with `payload_len` bytes.
    pub fn framed_len(payload_len: usize) -> u32 {
        (payload_len as u32).saturating_add(FRAME_HEADER_LEN)
    }

    pub fn write(&self, pos: BlobPos, payload: &[u8]) -> Result<(), BlobError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| std::io::Error::other("blob write lock poisoned"))?;
        let path = self.file_path(pos.file);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.seek(SeekFrom::Start(u64::from(pos.offset)))?;
        let mut frame = Vec::with_capacity(payload.len() + FRAME_HEADER_LEN as usize);
        frame.extend_from_slice(&self.magic);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        file.write_all(&frame)?;
        file.flush()?;
        Ok(())
    }

    pub fn read(&self, pos: BlobPos) -> Result<Vec<u8>, BlobError> {
        let mut file = File::open(self.file_path(pos.file))?;
        file.seek(SeekFrom::Start(u64::from(pos.offset)))?;
        let mut header = [0u8; FRAME_HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        if header[0..4] != self.magic {
            return Err(BlobError::BadMagic);
        }
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload)
            .map_err(|_| BlobError::LengthMismatch)?;
        Ok(payload)
    }

    /// Syncs `file` to disk; when `finalize_len` is given the file is truncated to it.
    pub fn flush_file(&self, file: u32, finalize_len: Option<u32>) -> Result<(), BlobError> {
        let path = self.file_path(file);
        if !path.exists() {
            return Ok(());
        }
        let handle = OpenOptions::new().write(true).open(&path)?;
        if let Some(len) = finalize_len {
            handle.set_len(u64::from(len))?;
        }
        handle.sync_all()?;
        Ok(())
    }
}

/// Fails when writing `additional` bytes under `dir` would leave less than `minimum`
/// bytes free.
pub fn check_disk_space(dir: &Path, minimum: u64, additional: u64) -> Result<(), BlobError> {
    let available = fs2::available_space(dir)?;
    let required = minimum.saturating_add(additional);
    if available < required {
        return Err(BlobError::DiskSpace {
            available,
            required,
        });
    }
    Ok(())
}

/// Walks a raw block file, yielding `(frame offset, payload)` for every well-framed
/// record. Bytes that do not start with `magic` are skipped one at a time so a
/// truncated or garbled region does not stop the scan.
pub struct FrameScanner<'a> {
    bytes: &'a [u8],
    magic: [u8; 4],
    cursor: usize,
}

impl<'a> FrameScanner<'a> {
    pub fn new(bytes: &'a [u8], magic: [u8; 4]) -> Self {
        Self {
            bytes,
            magic,
            cursor: 0,
        }
    }

    pub fn with_start(bytes: &'a [u8], magic: [u8; 4], start: usize) -> Self {
        Self {
            bytes,
            magic,
            cursor: start.min(bytes.len()),
        }
    }
}

impl<'a> Iterator for FrameScanner<'a> {
    type Item = (u32, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let header_len = FRAME_HEADER_LEN as usize;
        while self.cursor + header_len <= self.bytes.len() {
            let start = self.cursor;
            if self.bytes[start..start + 4] != self.magic {
                self.cursor += 1;
                continue;
            }
            let len = u32::from_le_bytes([
                self.bytes[start + 4],
                self.bytes[start + 5],
                self.bytes[start + 6],
                self.bytes[start + 7],
            ]) as usize;
            if len < HEADER_SIZE || len > MAX_BLOCK_SIZE as usize {
                self.cursor += 1;
                continue;
            }
            let body = start + header_len;
            if body + len > self.bytes.len() {
                self.cursor += 1;
                continue;
            }
            self.cursor = body + len;
            return Some((start as u32, &self.bytes[body..body + len]));
        }
        self.cursor = self.bytes.len();
        None
    }
}

/// Bookkeeping for one blob file number, shared by its block and undo files.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockFileInfo {
    pub blocks: u32,
    pub size: u32,
    pub undo_size: u32,
    pub height_first: u32,
    pub height_last: u32,
    pub time_first: u64,
    pub time_last: u64,
}

impl BlockFileInfo {
    pub fn add_block(&mut self, height: u32, time: u64) {
        if self.blocks == 0 || self.height_first > height {
            self.height_first = height;
        }
        if self.blocks == 0 || self.time_first > time {
            self.time_first = time;
        }
        self.blocks += 1;
        self.height_last = self.height_last.max(height);
        self.time_last = self.time_last.max(time);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(36);
        encoder.write_u32_le(self.blocks);
        encoder.write_u32_le(self.size);
        encoder.write_u32_le(self.undo_size);
        encoder.write_u32_le(self.height_first);
        encoder.write_u32_le(self.height_last);
        encoder.write_u64_le(self.time_first);
        encoder.write_u64_le(self.time_last);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let info = Self {
            blocks: decoder.read_u32_le()?,
            size: decoder.read_u32_le()?,
            undo_size: decoder.read_u32_le()?,
            height_first: decoder.read_u32_le()?,
            height_last: decoder.read_u32_le()?,
            time_first: decoder.read_u64_le()?,
            time_last: decoder.read_u64_le()?,
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(info)
    }
}
