//! Block manager interface and reference implementations
//!
//! The durable image format is owned here only down to the framing handed to
//! storage: `[page_id: u64][len: u32][payload][crc32: u32]`, little-endian.
//! The checksum covers page id and payload so a misdirected read is caught
//! as corruption, not returned as a wrong page.
//!
//! `FileBlockManager` appends images to a single log file; space reclamation
//! of superseded images belongs to the real block manager and is out of
//! scope. `MemoryBlockManager` backs unit tests.

use crate::types::PageId;
use crate::{CacheError, Result};
use crc32fast::Hasher;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Address of a durable page image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockAddr {
    /// Byte offset of the frame (file impl) or slot index (memory impl)
    pub offset: u64,
    /// Total frame length in bytes
    pub len: u32,
}

/// Durable storage for page images.
///
/// Physical write serialization is owned by the implementation; callers may
/// invoke `write_image` from multiple eviction workers concurrently.
pub trait BlockManager: Send + Sync {
    fn write_image(&self, page_id: PageId, image: &[u8]) -> Result<BlockAddr>;
    fn read_image(&self, addr: BlockAddr) -> Result<Vec<u8>>;
}

const FRAME_HEADER: usize = 8 + 4; // page_id + payload length
const FRAME_TRAILER: usize = 4; // crc32

fn frame_image(page_id: PageId, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len() + FRAME_TRAILER);
    frame.extend_from_slice(&page_id.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);

    let mut hasher = Hasher::new();
    hasher.update(&frame);
    frame.extend_from_slice(&hasher.finalize().to_le_bytes());
    frame
}

fn unframe_image(frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < FRAME_HEADER + FRAME_TRAILER {
        return Err(CacheError::Corruption("image frame too short".into()));
    }
    let body_len = frame.len() - FRAME_TRAILER;
    let payload_len = u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]) as usize;
    if FRAME_HEADER + payload_len != body_len {
        return Err(CacheError::Corruption(format!(
            "image frame length mismatch: header says {}, frame holds {}",
            payload_len,
            body_len - FRAME_HEADER
        )));
    }

    let mut hasher = Hasher::new();
    hasher.update(&frame[..body_len]);
    let actual = hasher.finalize();
    let expected = u32::from_le_bytes([
        frame[body_len],
        frame[body_len + 1],
        frame[body_len + 2],
        frame[body_len + 3],
    ]);
    if actual != expected {
        return Err(CacheError::Corruption(format!(
            "image checksum mismatch: expected {:#010x}, got {:#010x}",
            expected, actual
        )));
    }

    Ok(frame[FRAME_HEADER..body_len].to_vec())
}

struct LogFile {
    file: File,
    tail: u64,
}

/// Append-only image log backed by a single file
pub struct FileBlockManager {
    log: Mutex<LogFile>,
}

impl FileBlockManager {
    /// Create or open the image log at `path`. New images always append.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let tail = file.metadata()?.len();
        Ok(Self {
            log: Mutex::new(LogFile { file, tail }),
        })
    }
}

impl BlockManager for FileBlockManager {
    fn write_image(&self, page_id: PageId, image: &[u8]) -> Result<BlockAddr> {
        let frame = frame_image(page_id, image);
        let mut log = self.log.lock();

        let offset = log.tail;
        log.file.seek(SeekFrom::Start(offset))?;
        log.file.write_all(&frame)?;
        log.file.sync_data()?;
        log.tail = offset + frame.len() as u64;

        Ok(BlockAddr {
            offset,
            len: frame.len() as u32,
        })
    }

    fn read_image(&self, addr: BlockAddr) -> Result<Vec<u8>> {
        let mut log = self.log.lock();
        let mut frame = vec![0u8; addr.len as usize];
        log.file.seek(SeekFrom::Start(addr.offset))?;
        log.file.read_exact(&mut frame)?;
        unframe_image(&frame)
    }
}

/// In-memory block manager for tests
pub struct MemoryBlockManager {
    blocks: Mutex<Vec<Vec<u8>>>,
}

impl MemoryBlockManager {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(Vec::new()),
        }
    }

    /// Number of images written so far
    pub fn image_count(&self) -> usize {
        self.blocks.lock().len()
    }
}

impl Default for MemoryBlockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockManager for MemoryBlockManager {
    fn write_image(&self, page_id: PageId, image: &[u8]) -> Result<BlockAddr> {
        let frame = frame_image(page_id, image);
        let len = frame.len() as u32;
        let mut blocks = self.blocks.lock();
        blocks.push(frame);
        Ok(BlockAddr {
            offset: (blocks.len() - 1) as u64,
            len,
        })
    }

    fn read_image(&self, addr: BlockAddr) -> Result<Vec<u8>> {
        let blocks = self.blocks.lock();
        let frame = blocks
            .get(addr.offset as usize)
            .ok_or_else(|| CacheError::Corruption(format!("no image at slot {}", addr.offset)))?;
        unframe_image(frame)
    }
}
