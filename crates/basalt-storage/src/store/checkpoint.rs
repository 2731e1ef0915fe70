//! Checkpoints.
//!
//! A checkpoint writes every page modified since the previous checkpoint to
//! the partition files. The set of dirty pages and their contents are
//! captured under the exclusive checkpoint lock; all I/O happens after the
//! lock is released.
//!
//! Pages first go to a double-write file, which protects the partition
//! files against torn writes:
//!
//! ```text
//! +-------------------------------+
//! | magic (4) | version (4)       |
//! | page size (4) | count (4)     |
//! +-------------------------------+
//! | page id (8) | page bytes      |  x count
//! +-------------------------------+
//! | crc32 of everything above (4) |
//! +-------------------------------+
//! ```
//!
//! A complete double-write file found at startup is re-applied. An
//! incomplete one never reached the partition files and is discarded.

use super::PageStore;
use crate::disk::{stamp_checksum, DiskManager};
use basalt_buffer::FrameId;
use basalt_common::page::PageId;
use basalt_common::{BasaltError, Result};
use parking_lot::{Condvar, Mutex};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Name of the double-write file inside the data directory.
pub const DOUBLE_WRITE_FILE: &str = "checkpoint.dwb";

const DWB_MAGIC: u32 = 0x4244_5742;
const DWB_VERSION: u32 = 1;
const DWB_HEADER_SIZE: usize = 16;

/// Outcome of one checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    /// Pages written to partition files.
    pub pages_written: usize,
    /// Bytes written to partition files.
    pub bytes_written: u64,
    /// Wall time of the checkpoint.
    pub duration: Duration,
}

/// One page captured for a checkpoint.
struct SnapshotPage {
    page_id: PageId,
    frame_id: FrameId,
    generation: u64,
    data: Vec<u8>,
}

impl PageStore {
    /// Writes all dirty pages to the partition files.
    ///
    /// A volatile store has nothing to write and returns empty stats. On an
    /// I/O failure the captured pages stay dirty and the next checkpoint
    /// retries them; the error surfaces as `StorageIo`.
    pub fn checkpoint(&self) -> Result<CheckpointStats> {
        let Some(disk) = &self.disk else {
            return Ok(CheckpointStats::default());
        };
        let _io = self.io_lock.lock();
        let start = Instant::now();

        let mut snapshot = self.capture_dirty_pages();
        if snapshot.is_empty() {
            return Ok(CheckpointStats::default());
        }
        snapshot.sort_by_key(|page| page.page_id);
        for page in &mut snapshot {
            stamp_checksum(&mut page.data);
        }

        if let Err(e) = self.write_snapshot(disk, &snapshot) {
            let mut dirty = self.dirty.lock();
            dirty.extend(snapshot.iter().map(|page| page.page_id));
            drop(dirty);
            tracing::error!(pages = snapshot.len(), error = %e, "checkpoint failed");
            return Err(match e {
                BasaltError::Io(io) => BasaltError::StorageIo(io.to_string()),
                other => other,
            });
        }

        for page in &snapshot {
            self.pool.clear_dirty(page.frame_id, page.generation);
        }

        let stats = CheckpointStats {
            pages_written: snapshot.len(),
            bytes_written: (snapshot.len() * self.page_size()) as u64,
            duration: start.elapsed(),
        };
        tracing::debug!(
            pages = stats.pages_written,
            bytes = stats.bytes_written,
            elapsed_us = stats.duration.as_micros() as u64,
            "checkpoint complete"
        );
        Ok(stats)
    }

    /// Swaps out the dirty set and copies the pages it names.
    ///
    /// Holds the exclusive checkpoint lock, so no page is under a write
    /// latch while the copies are taken.
    fn capture_dirty_pages(&self) -> Vec<SnapshotPage> {
        let _exclusive = self.checkpoint_lock.write();
        let page_ids = std::mem::take(&mut *self.dirty.lock());

        page_ids
            .into_iter()
            .filter_map(|page_id| {
                // Dirty frames cannot be evicted, so a miss means the page
                // was discarded together with its partition
                let frame_id = self.pool.fetch_page(page_id)?;
                let frame = self.pool.frame(frame_id);
                let page = {
                    let data = frame.read();
                    SnapshotPage {
                        page_id,
                        frame_id,
                        generation: frame.dirty_generation(),
                        data: data.to_vec(),
                    }
                };
                self.pool.unpin(frame_id);
                Some(page)
            })
            .collect()
    }

    fn write_snapshot(&self, disk: &DiskManager, snapshot: &[SnapshotPage]) -> Result<()> {
        let dwb_path = disk.data_dir().join(DOUBLE_WRITE_FILE);
        write_double_write(
            &dwb_path,
            self.page_size(),
            snapshot.iter().map(|page| (page.page_id, page.data.as_slice())),
            snapshot.len(),
            self.config.write_buffer_size,
            self.config.fsync_enabled,
        )?;

        for page in snapshot {
            disk.write_page(page.page_id, &page.data)?;
        }
        disk.sync_all()?;
        std::fs::remove_file(&dwb_path)?;
        Ok(())
    }
}

/// Writes a complete double-write file.
fn write_double_write<'a>(
    path: &Path,
    page_size: usize,
    pages: impl Iterator<Item = (PageId, &'a [u8])>,
    count: usize,
    buffer_size: usize,
    fsync: bool,
) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::with_capacity(buffer_size, file);
    let mut hasher = crc32fast::Hasher::new();

    let mut header = [0u8; DWB_HEADER_SIZE];
    header[0..4].copy_from_slice(&DWB_MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&DWB_VERSION.to_le_bytes());
    header[8..12].copy_from_slice(&(page_size as u32).to_le_bytes());
    header[12..16].copy_from_slice(&(count as u32).to_le_bytes());
    hasher.update(&header);
    writer.write_all(&header)?;

    for (page_id, data) in pages {
        let id = page_id.as_u64().to_le_bytes();
        hasher.update(&id);
        hasher.update(data);
        writer.write_all(&id)?;
        writer.write_all(data)?;
    }

    writer.write_all(&hasher.finalize().to_le_bytes())?;
    let file = writer
        .into_inner()
        .map_err(|e| BasaltError::StorageIo(e.error().to_string()))?;
    if fsync {
        file.sync_all()?;
    }
    Ok(())
}

/// Applies a complete double-write file left by an interrupted checkpoint.
///
/// Returns the number of pages re-applied.
pub(super) fn recover_double_write(disk: &DiskManager) -> Result<usize> {
    let path = disk.data_dir().join(DOUBLE_WRITE_FILE);
    if !path.exists() {
        return Ok(0);
    }
    let bytes = std::fs::read(&path)?;
    let page_size = disk.page_size();

    let Some(pages) = parse_double_write(&bytes, page_size)? else {
        tracing::warn!(
            path = %path.display(),
            len = bytes.len(),
            "discarding incomplete double-write file"
        );
        std::fs::remove_file(&path)?;
        return Ok(0);
    };

    for (page_id, data) in &pages {
        disk.write_page(*page_id, data)?;
    }
    disk.sync_all()?;
    std::fs::remove_file(&path)?;
    Ok(pages.len())
}

/// Decodes a double-write file. Returns None when it is torn.
fn parse_double_write(bytes: &[u8], page_size: usize) -> Result<Option<Vec<(PageId, &[u8])>>> {
    if bytes.len() < DWB_HEADER_SIZE + 4 {
        return Ok(None);
    }
    let read_u32 = |off: usize| u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]]);
    if read_u32(0) != DWB_MAGIC {
        return Ok(None);
    }
    if read_u32(4) != DWB_VERSION {
        return Err(BasaltError::UnsupportedFormat {
            found: read_u32(4),
            supported: DWB_VERSION,
        });
    }
    let written_page_size = read_u32(8) as usize;
    if written_page_size != page_size {
        return Err(BasaltError::PageSizeMismatch {
            expected: page_size,
            actual: written_page_size,
        });
    }

    let count = read_u32(12) as usize;
    let entry_size = 8 + page_size;
    let body_end = DWB_HEADER_SIZE + count * entry_size;
    if bytes.len() != body_end + 4 {
        return Ok(None);
    }
    if crc32fast::hash(&bytes[..body_end]) != read_u32(body_end) {
        return Ok(None);
    }

    let pages = bytes[DWB_HEADER_SIZE..body_end]
        .chunks_exact(entry_size)
        .map(|entry| {
            let mut id = [0u8; 8];
            id.copy_from_slice(&entry[..8]);
            (PageId::from_u64(u64::from_le_bytes(id)), &entry[8..])
        })
        .collect();
    Ok(Some(pages))
}

/// Wakeup signal shared with the checkpointer thread.
struct StopSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

/// Background thread that checkpoints a store periodically.
///
/// A checkpoint runs when the configured interval has elapsed or when the
/// share of dirty frames reaches the configured ratio. Failures are logged
/// and retried on the next round.
pub struct Checkpointer {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Checkpointer {
    /// Longest sleep between two dirty-ratio checks.
    const POLL: Duration = Duration::from_millis(100);

    /// Starts the checkpointer thread for a store.
    pub fn start(store: Arc<PageStore>) -> Result<Self> {
        let signal = Arc::new(StopSignal {
            stopped: Mutex::new(false),
            condvar: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);
        let interval = Duration::from_millis(store.config().checkpoint.interval_ms);
        let dirty_ratio = store.config().checkpoint.dirty_ratio;

        let handle = std::thread::Builder::new()
            .name("basalt-checkpoint".into())
            .spawn(move || {
                tracing::info!(interval_ms = interval.as_millis() as u64, dirty_ratio, "checkpointer started");
                let poll = interval.min(Self::POLL);
                let mut last = Instant::now();
                loop {
                    {
                        let mut stopped = thread_signal.stopped.lock();
                        if !*stopped {
                            thread_signal.condvar.wait_for(&mut stopped, poll);
                        }
                        if *stopped {
                            break;
                        }
                    }

                    let pool = store.pool();
                    let ratio = pool.dirty_count() as f64 / pool.num_frames().max(1) as f64;
                    if last.elapsed() < interval && ratio < dirty_ratio {
                        continue;
                    }
                    last = Instant::now();
                    if let Err(e) = store.checkpoint() {
                        tracing::error!(error = %e, "background checkpoint failed, will retry");
                    }
                }
                tracing::info!("checkpointer stopped");
            })?;

        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Stops the thread and waits for it to exit.
    pub fn stop(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.condvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.stop();
    }
}
