#![forbid(unsafe_code)]
//! Device and collaborator seams for the segment manager.
//!
//! Provides the `BlockDevice` trait used for software relocation copies, the
//! `TrimDevice` trait the discard manager submits to, the traits through which
//! the filesystem layer answers liveness and persistence questions, and
//! in-memory implementations of all of them for tests and simulation.

pub mod activity;
pub mod collab;
pub mod trim;
pub mod wake;

pub use activity::IoMonitor;
pub use collab::{
    CheckpointImage, CheckpointReason, HeadCursor, MemMetaStore, MemResolver, MetaStore,
    PersistedState, ReferenceResolver, RelocationOffload, SegmentSummary, SitRecord,
};
pub use trim::{MemTrimDevice, TrimCompletion, TrimDevice, TrimMode};
pub use wake::WakeSignal;

use lfs_error::{LfsError, Result};
use lfs_types::BlockAddr;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by address.
    fn read_block(&self, addr: BlockAddr) -> Result<BlockBuf>;

    /// Write a block by address. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, addr: BlockAddr, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(addr: BlockAddr, block_count: u64) -> Result<()> {
    if addr.0 >= block_count {
        return Err(LfsError::Io(std::io::Error::other(format!(
            "block out of range: block={} block_count={block_count}",
            addr.0
        ))));
    }
    Ok(())
}

fn block_len(block_size: u32) -> Result<usize> {
    usize::try_from(block_size)
        .map_err(|_| LfsError::InvalidGeometry("block_size does not fit usize".to_owned()))
}

// ── File-backed device ──────────────────────────────────────────────────────

/// File-backed block device using positioned reads and writes.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileBlockDevice {
    file: Arc<File>,
    block_size: u32,
    block_count: u64,
}

impl FileBlockDevice {
    /// Open `path` read-write. The file length must be block-aligned.
    pub fn open(path: impl AsRef<Path>, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(LfsError::InvalidGeometry(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        let remainder = len % u64::from(block_size);
        if remainder != 0 {
            return Err(LfsError::InvalidGeometry(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        let block_count = len / u64::from(block_size);
        tracing::debug!(
            target: "lfs::block",
            path = %path.as_ref().display(),
            block_size,
            block_count,
            "file_device_opened"
        );
        Ok(Self {
            file: Arc::new(file),
            block_size,
            block_count,
        })
    }

    fn offset_of(&self, addr: BlockAddr) -> Result<u64> {
        addr.0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| LfsError::Io(std::io::Error::other("block offset overflow")))
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, addr: BlockAddr) -> Result<BlockBuf> {
        check_range(addr, self.block_count)?;
        let mut buf = vec![0_u8; block_len(self.block_size)?];
        self.file
            .read_exact_at(&mut buf, self.offset_of(addr)?)
            .map_err(|err| {
                tracing::warn!(target: "lfs::block", block = addr.0, error = %err, "file_device_read_failed");
                LfsError::Io(err)
            })?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, addr: BlockAddr, data: &[u8]) -> Result<()> {
        let expected = block_len(self.block_size)?;
        if data.len() != expected {
            return Err(LfsError::Io(std::io::Error::other(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            ))));
        }
        check_range(addr, self.block_count)?;
        self.file
            .write_all_at(data, self.offset_of(addr)?)
            .map_err(|err| {
                tracing::warn!(target: "lfs::block", block = addr.0, error = %err, "file_device_write_failed");
                LfsError::Io(err)
            })
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

// ── In-memory device ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemState {
    blocks: HashMap<u64, Vec<u8>>,
    fail_reads: HashSet<u64>,
    fail_writes: HashSet<u64>,
    reads: u64,
    writes: u64,
}

/// Sparse in-memory block device with fault injection.
///
/// Unwritten blocks read back as zeros.
#[derive(Debug)]
pub struct MemBlockDevice {
    block_size: u32,
    block_count: u64,
    state: Mutex<MemState>,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
            state: Mutex::new(MemState::default()),
        }
    }

    /// Fail every subsequent read of `addr` with `EIO`.
    pub fn inject_read_failure(&self, addr: BlockAddr) {
        self.state.lock().fail_reads.insert(addr.0);
    }

    /// Fail every subsequent write to `addr` with `EIO`.
    pub fn inject_write_failure(&self, addr: BlockAddr) {
        self.state.lock().fail_writes.insert(addr.0);
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.fail_reads.clear();
        state.fail_writes.clear();
    }

    /// `(reads, writes)` served so far.
    #[must_use]
    pub fn io_counts(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.reads, state.writes)
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, addr: BlockAddr) -> Result<BlockBuf> {
        check_range(addr, self.block_count)?;
        let mut state = self.state.lock();
        if state.fail_reads.contains(&addr.0) {
            tracing::debug!(target: "lfs::block", block = addr.0, "mem_device_injected_read_failure");
            return Err(LfsError::Io(std::io::Error::from_raw_os_error(libc::EIO)));
        }
        state.reads += 1;
        let bytes = match state.blocks.get(&addr.0) {
            Some(bytes) => bytes.clone(),
            None => vec![0_u8; block_len(self.block_size)?],
        };
        drop(state);
        Ok(BlockBuf::new(bytes))
    }

    fn write_block(&self, addr: BlockAddr, data: &[u8]) -> Result<()> {
        check_range(addr, self.block_count)?;
        let expected = block_len(self.block_size)?;
        if data.len() != expected {
            return Err(LfsError::Io(std::io::Error::other(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            ))));
        }
        let mut state = self.state.lock();
        if state.fail_writes.contains(&addr.0) {
            tracing::debug!(target: "lfs::block", block = addr.0, "mem_device_injected_write_failure");
            return Err(LfsError::Io(std::io::Error::from_raw_os_error(libc::EIO)));
        }
        state.writes += 1;
        state.blocks.insert(addr.0, data.to_vec());
        drop(state);
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
