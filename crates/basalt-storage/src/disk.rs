//! Disk manager for partition files.
//!
//! Each partition lives in its own file named `part-NNNNN.db`. Page `i` of a
//! partition sits at byte offset `i * page_size`. Pages carry a CRC32 in
//! their header, stamped before a write and verified after a read.

use basalt_common::page::{PageHeader, PageId};
use basalt_common::{BasaltError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Base directory for partition files.
    pub data_dir: PathBuf,
    /// Page size in bytes.
    pub page_size: usize,
    /// Enable fsync in `sync_all`.
    pub fsync_enabled: bool,
}

/// Computes the checksum of a page, treating the checksum field as zero.
pub fn page_checksum(data: &[u8]) -> u32 {
    let off = PageHeader::CHECKSUM_OFFSET;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data[..off]);
    hasher.update(&[0u8; 4]);
    hasher.update(&data[off + 4..]);
    hasher.finalize()
}

/// Stamps the checksum into a page buffer.
pub fn stamp_checksum(data: &mut [u8]) {
    let crc = page_checksum(data);
    let off = PageHeader::CHECKSUM_OFFSET;
    data[off..off + 4].copy_from_slice(&crc.to_le_bytes());
}

/// Verifies the checksum of a page read from disk.
pub fn verify_checksum(page_id: PageId, data: &[u8]) -> Result<()> {
    let off = PageHeader::CHECKSUM_OFFSET;
    let stored = u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]);
    let actual = page_checksum(data);
    if stored != actual {
        return Err(BasaltError::PageCorrupted {
            page_id: page_id.as_u64(),
            reason: format!("checksum mismatch: stored {stored:#010x}, computed {actual:#010x}"),
        });
    }
    Ok(())
}

/// Manages reading and writing pages to partition files.
pub struct DiskManager {
    /// Configuration.
    config: DiskManagerConfig,
    /// Open file handles keyed by partition.
    files: Mutex<HashMap<u32, FileHandle>>,
}

/// Handle for an open partition file.
struct FileHandle {
    /// The file handle.
    file: File,
    /// Number of pages in the file.
    num_pages: u32,
}

impl DiskManager {
    /// Creates a new disk manager, creating the data directory if needed.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(Self {
            config,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Returns the page size.
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Generates the file path for a partition.
    fn file_path(&self, partition: u32) -> PathBuf {
        self.config.data_dir.join(format!("part-{:05}.db", partition))
    }

    /// Returns true if the partition has a file on disk.
    pub fn partition_exists(&self, partition: u32) -> bool {
        self.files.lock().contains_key(&partition) || self.file_path(partition).exists()
    }

    /// Lists the partitions that have files on disk.
    pub fn list_partitions(&self) -> Result<Vec<u32>> {
        let mut partitions = Vec::new();
        for entry in std::fs::read_dir(&self.config.data_dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name
                .strip_prefix("part-")
                .and_then(|rest| rest.strip_suffix(".db"))
                .and_then(|id| id.parse::<u32>().ok())
            {
                partitions.push(id);
            }
        }
        partitions.sort_unstable();
        Ok(partitions)
    }

    /// Runs `f` against the open handle of a partition, opening it first.
    fn with_file<T>(&self, partition: u32, f: impl FnOnce(&mut FileHandle) -> Result<T>) -> Result<T> {
        let mut files = self.files.lock();
        if !files.contains_key(&partition) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(self.file_path(partition))?;
            let num_pages = (file.metadata()?.len() / self.config.page_size as u64) as u32;
            files.insert(partition, FileHandle { file, num_pages });
        }
        let handle = files
            .get_mut(&partition)
            .ok_or_else(|| BasaltError::StorageIo(format!("partition {} not open", partition)))?;
        f(handle)
    }

    /// Reads a page from disk and verifies its checksum.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        let page_size = self.config.page_size;
        self.with_file(page_id.partition, |handle| {
            if page_id.page_idx >= handle.num_pages {
                return Err(BasaltError::PageNotFound {
                    page_id: page_id.as_u64(),
                });
            }
            let offset = page_id.page_idx as u64 * page_size as u64;
            handle.file.seek(SeekFrom::Start(offset))?;
            handle.file.read_exact(&mut buf[..page_size])?;
            Ok(())
        })?;
        verify_checksum(page_id, buf)
    }

    /// Reads the first `len` bytes of a partition file without any checksum
    /// verification. Returns None if the file is shorter than that.
    ///
    /// Used to inspect the partition header before the page size is trusted.
    pub fn read_prefix(&self, partition: u32, len: usize) -> Result<Option<Vec<u8>>> {
        self.with_file(partition, |handle| {
            if handle.file.metadata()?.len() < len as u64 {
                return Ok(None);
            }
            let mut buf = vec![0u8; len];
            handle.file.seek(SeekFrom::Start(0))?;
            handle.file.read_exact(&mut buf)?;
            Ok(Some(buf))
        })
    }

    /// Writes a page to disk. The checksum must already be stamped.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        let page_size = self.config.page_size;
        self.with_file(page_id.partition, |handle| {
            let offset = page_id.page_idx as u64 * page_size as u64;
            handle.file.seek(SeekFrom::Start(offset))?;
            handle.file.write_all(&data[..page_size])?;

            // Update page count if we extended the file
            if page_id.page_idx >= handle.num_pages {
                handle.num_pages = page_id.page_idx + 1;
            }
            Ok(())
        })
    }

    /// Returns the number of pages in a partition file.
    pub fn num_pages(&self, partition: u32) -> Result<u32> {
        self.with_file(partition, |handle| Ok(handle.num_pages))
    }

    /// Flushes all open files to stable storage.
    pub fn sync_all(&self) -> Result<()> {
        if !self.config.fsync_enabled {
            return Ok(());
        }
        let files = self.files.lock();
        for handle in files.values() {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Closes a partition file.
    pub fn close_file(&self, partition: u32) -> Result<()> {
        let mut files = self.files.lock();
        if let Some(handle) = files.remove(&partition) {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Closes all open files.
    pub fn close_all(&self) -> Result<()> {
        let mut files = self.files.lock();
        for (_, handle) in files.drain() {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Deletes a partition file.
    pub fn delete_file(&self, partition: u32) -> Result<()> {
        self.files.lock().remove(&partition);
        let path = self.file_path(partition);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_common::page::PageType;
    use tempfile::tempdir;

    const PAGE: usize = 4096;

    fn create_test_disk_manager() -> (DiskManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = DiskManagerConfig {
            data_dir: dir.path().to_path_buf(),
            page_size: PAGE,
            fsync_enabled: false,
        };
        let dm = DiskManager::new(config).unwrap();
        (dm, dir)
    }

    fn page(page_id: PageId, fill: u8) -> Vec<u8> {
        let mut data = vec![fill; PAGE];
        PageHeader::init(&mut data, page_id, PageType::Data);
        stamp_checksum(&mut data);
        data
    }

    #[test]
    fn test_write_read() {
        let (dm, _dir) = create_test_disk_manager();
        let page_id = PageId::new(1, 0);
        dm.write_page(page_id, &page(page_id, 0xAB)).unwrap();

        let mut buf = vec![0u8; PAGE];
        dm.read_page(page_id, &mut buf).unwrap();
        assert_eq!(buf[100], 0xAB);
        assert_eq!(buf[PAGE - 1], 0xAB);
        assert_eq!(dm.num_pages(1).unwrap(), 1);
    }

    #[test]
    fn test_read_nonexistent_page() {
        let (dm, _dir) = create_test_disk_manager();
        let mut buf = vec![0u8; PAGE];
        let result = dm.read_page(PageId::new(0, 99), &mut buf);
        assert!(matches!(result, Err(BasaltError::PageNotFound { .. })));
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let (dm, _dir) = create_test_disk_manager();
        let page_id = PageId::new(2, 0);
        let mut data = page(page_id, 0x11);
        data[500] ^= 0xFF;
        dm.write_page(page_id, &data).unwrap();

        let mut buf = vec![0u8; PAGE];
        let result = dm.read_page(page_id, &mut buf);
        assert!(matches!(result, Err(BasaltError::PageCorrupted { .. })));
    }

    #[test]
    fn test_checksum_ignores_its_own_field() {
        let page_id = PageId::new(0, 3);
        let data = page(page_id, 0x42);
        assert!(verify_checksum(page_id, &data).is_ok());
        let mut copy = data.clone();
        stamp_checksum(&mut copy);
        assert_eq!(copy, data);
    }

    #[test]
    fn test_sparse_write_extends_file() {
        let (dm, _dir) = create_test_disk_manager();
        let page_id = PageId::new(0, 5);
        dm.write_page(page_id, &page(page_id, 1)).unwrap();
        assert_eq!(dm.num_pages(0).unwrap(), 6);
    }

    #[test]
    fn test_persistence_across_managers() {
        let dir = tempdir().unwrap();
        let config = DiskManagerConfig {
            data_dir: dir.path().to_path_buf(),
            page_size: PAGE,
            fsync_enabled: true,
        };
        let page_id = PageId::new(7, 1);
        {
            let dm = DiskManager::new(config.clone()).unwrap();
            dm.write_page(page_id, &page(page_id, 0xFF)).unwrap();
            dm.sync_all().unwrap();
        }
        let dm = DiskManager::new(config).unwrap();
        let mut buf = vec![0u8; PAGE];
        dm.read_page(page_id, &mut buf).unwrap();
        assert_eq!(buf[64], 0xFF);
        assert_eq!(dm.list_partitions().unwrap(), vec![7]);
    }

    #[test]
    fn test_delete_file() {
        let (dm, dir) = create_test_disk_manager();
        let page_id = PageId::new(3, 0);
        dm.write_page(page_id, &page(page_id, 0)).unwrap();
        let file_path = dir.path().join("part-00003.db");
        assert!(file_path.exists());
        assert!(dm.partition_exists(3));

        dm.delete_file(3).unwrap();
        assert!(!file_path.exists());
        assert!(!dm.partition_exists(3));
    }
}
