//! FileManager: page allocation and storage for a single database file.
//!
//! Invariants:
//! - The metadata block occupies [0, METADATA_SIZE) and holds the table
//!   count, the head of the free-page list and the total page count.
//! - Page n lives at METADATA_SIZE + n * PAGE_SIZE; writes cover exactly
//!   one page so a torn write damages at most one page body.
//! - Freed pages stay at their offset with a zeroed body; their ids chain
//!   through the metadata head via each page's next_page header field.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::page::{Page, PageType, PAGE_SIZE};
use crate::{PageId, StorageError, StorageResult, INVALID_PAGE_ID};

/// Size of the metadata block at the start of the file.
pub const METADATA_SIZE: usize = PAGE_SIZE;

/// File-level metadata persisted at offset 0.
#[derive(Debug, Clone, Copy)]
pub struct FileMetadata {
    pub table_count: u32,
    pub free_page_head: PageId,
    pub total_pages: u64,
}

impl FileMetadata {
    fn to_bytes(self) -> [u8; METADATA_SIZE] {
        let mut buf = [0u8; METADATA_SIZE];
        buf[..4].copy_from_slice(&self.table_count.to_le_bytes());
        buf[4..12].copy_from_slice(&self.free_page_head.to_le_bytes());
        buf[12..20].copy_from_slice(&self.total_pages.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let mut table_count = [0u8; 4];
        table_count.copy_from_slice(&buf[..4]);
        let mut free_page_head = [0u8; 8];
        free_page_head.copy_from_slice(&buf[4..12]);
        let mut total_pages = [0u8; 8];
        total_pages.copy_from_slice(&buf[12..20]);
        Self {
            table_count: u32::from_le_bytes(table_count),
            free_page_head: i64::from_le_bytes(free_page_head),
            total_pages: u64::from_le_bytes(total_pages),
        }
    }
}

/// Owns the backing file: reads, writes, allocates and recycles pages.
pub struct FileManager {
    file: File,
    path: PathBuf,
    metadata: FileMetadata,
}

impl FileManager {
    /// Creates a new database file. Fails if the file already exists.
    pub fn create<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let path_ref = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path_ref)
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    StorageError::FileExists(path_ref.display().to_string())
                } else {
                    StorageError::Io(err)
                }
            })?;
        let metadata = FileMetadata {
            table_count: 0,
            free_page_head: INVALID_PAGE_ID,
            total_pages: 0,
        };
        file.write_all_at(&metadata.to_bytes(), 0)?;
        file.sync_data()?;
        Ok(Self {
            file,
            path: path_ref.to_path_buf(),
            metadata,
        })
    }

    /// Opens an existing database file and loads its metadata.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let path_ref = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path_ref)?;
        let mut manager = Self {
            file,
            path: path_ref.to_path_buf(),
            metadata: FileMetadata {
                table_count: 0,
                free_page_head: INVALID_PAGE_ID,
                total_pages: 0,
            },
        };
        manager.load_metadata()?;
        Ok(manager)
    }

    pub fn open_or_create<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        if path.as_ref().exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> FileMetadata {
        self.metadata
    }

    pub fn total_pages(&self) -> u64 {
        self.metadata.total_pages
    }

    pub fn free_page_head(&self) -> PageId {
        self.metadata.free_page_head
    }

    pub fn table_count(&self) -> u32 {
        self.metadata.table_count
    }

    pub fn set_table_count(&mut self, count: u32) -> StorageResult<()> {
        self.metadata.table_count = count;
        self.update_metadata()
    }

    /// Reads one page into memory. Fails when the id is outside the file.
    pub fn read_page(&self, page_id: PageId) -> StorageResult<Page> {
        self.check_bounds(page_id)?;
        let mut buf = [0u8; PAGE_SIZE];
        self.file.read_exact_at(&mut buf, Self::offset(page_id))?;
        Ok(Page::from_bytes(buf))
    }

    /// Writes exactly one page at its offset.
    pub fn write_page(&self, page_id: PageId, page: &Page) -> StorageResult<()> {
        self.check_bounds(page_id)?;
        self.file.write_all_at(page.data(), Self::offset(page_id))?;
        Ok(())
    }

    /// Returns a recycled page id when the free list is non-empty, otherwise
    /// extends the file by one zeroed page.
    pub fn allocate_page(&mut self) -> StorageResult<PageId> {
        if self.metadata.free_page_head != INVALID_PAGE_ID {
            let page_id = self.metadata.free_page_head;
            let freed = self.read_page(page_id)?;
            self.metadata.free_page_head = freed.next_page();
            // The recycled page keeps no trace of its free-list linkage.
            self.file
                .write_all_at(&[0u8; PAGE_SIZE], Self::offset(page_id))?;
            self.update_metadata()?;
            return Ok(page_id);
        }

        let page_id = self.metadata.total_pages as PageId;
        self.file
            .write_all_at(&[0u8; PAGE_SIZE], Self::offset(page_id))?;
        self.metadata.total_pages += 1;
        self.update_metadata()?;
        Ok(page_id)
    }

    /// Zeroes the page body on disk and prepends the id to the free list.
    pub fn free_page(&mut self, page_id: PageId) -> StorageResult<()> {
        self.check_bounds(page_id)?;
        let mut page = Page::new();
        page.init(page_id, PageType::Free);
        page.set_next_page(self.metadata.free_page_head);
        page.update_checksum();
        self.write_page(page_id, &page)?;
        self.metadata.free_page_head = page_id;
        self.update_metadata()
    }

    /// Persists the metadata block and syncs it to disk.
    pub fn update_metadata(&mut self) -> StorageResult<()> {
        self.file.write_all_at(&self.metadata.to_bytes(), 0)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Reloads the metadata block from offset 0.
    pub fn load_metadata(&mut self) -> StorageResult<()> {
        let mut buf = [0u8; METADATA_SIZE];
        self.file.read_exact_at(&mut buf, 0)?;
        self.metadata = FileMetadata::from_bytes(&buf);
        Ok(())
    }

    /// Forces buffered file data to disk.
    pub fn sync(&self) -> StorageResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn offset(page_id: PageId) -> u64 {
        METADATA_SIZE as u64 + page_id as u64 * PAGE_SIZE as u64
    }

    fn check_bounds(&self, page_id: PageId) -> StorageResult<()> {
        if page_id < 0 || page_id as u64 >= self.metadata.total_pages {
            return Err(StorageError::PageOutOfBounds(page_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PAGE_HEADER_SIZE;
    use crate::Record;
    use tempfile::TempDir;

    fn scratch() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("test.db");
        (dir, path)
    }

    #[test]
    fn create_fails_on_existing_file() {
        let (_dir, path) = scratch();
        let _first = FileManager::create(&path).unwrap();
        assert!(matches!(
            FileManager::create(&path),
            Err(StorageError::FileExists(_))
        ));
    }

    #[test]
    fn metadata_survives_reopen() {
        let (_dir, path) = scratch();
        {
            let mut manager = FileManager::create(&path).unwrap();
            for expected in 0..5 {
                assert_eq!(manager.allocate_page().unwrap(), expected);
            }
            manager.set_table_count(1).unwrap();
        }
        let manager = FileManager::open(&path).unwrap();
        assert_eq!(manager.total_pages(), 5);
        assert_eq!(manager.table_count(), 1);
        assert_eq!(manager.free_page_head(), INVALID_PAGE_ID);
    }

    #[test]
    fn page_round_trip() {
        let (_dir, path) = scratch();
        let mut manager = FileManager::create(&path).unwrap();
        let page_id = manager.allocate_page().unwrap();
        let mut page = Page::new();
        page.init(page_id, PageType::Data);
        let slot = page
            .add_record(&Record::new(1, vec!["persisted".into()]))
            .unwrap();
        manager.write_page(page_id, &page).unwrap();

        let loaded = manager.read_page(page_id).unwrap();
        assert!(!loaded.is_corrupted());
        assert_eq!(loaded.get_record(slot).unwrap().attrs, vec!["persisted"]);
    }

    #[test]
    fn read_out_of_bounds_fails() {
        let (_dir, path) = scratch();
        let mut manager = FileManager::create(&path).unwrap();
        manager.allocate_page().unwrap();
        assert!(matches!(
            manager.read_page(3),
            Err(StorageError::PageOutOfBounds(3))
        ));
        assert!(matches!(
            manager.read_page(-1),
            Err(StorageError::PageOutOfBounds(-1))
        ));
    }

    #[test]
    fn free_list_recycles_lifo() {
        let (_dir, path) = scratch();
        let mut manager = FileManager::create(&path).unwrap();
        for _ in 0..4 {
            manager.allocate_page().unwrap();
        }
        manager.free_page(1).unwrap();
        manager.free_page(3).unwrap();
        assert_eq!(manager.free_page_head(), 3);

        assert_eq!(manager.allocate_page().unwrap(), 3);
        assert_eq!(manager.allocate_page().unwrap(), 1);
        assert_eq!(manager.free_page_head(), INVALID_PAGE_ID);
        // With the list drained, allocation extends the file again.
        assert_eq!(manager.allocate_page().unwrap(), 4);
    }

    #[test]
    fn freed_page_is_zeroed_and_chained() {
        let (_dir, path) = scratch();
        let mut manager = FileManager::create(&path).unwrap();
        let page_id = manager.allocate_page().unwrap();
        let mut page = Page::new();
        page.init(page_id, PageType::Data);
        page.add_record(&Record::new(1, vec!["secret".into()]))
            .unwrap();
        manager.write_page(page_id, &page).unwrap();

        manager.free_page(page_id).unwrap();
        let freed = manager.read_page(page_id).unwrap();
        assert_eq!(freed.page_type(), PageType::Free);
        assert_eq!(freed.record_count(), 0);
        assert_eq!(freed.next_page(), INVALID_PAGE_ID);
        assert!(freed.data()[PAGE_HEADER_SIZE..].iter().all(|&b| b == 0));
    }

    #[test]
    fn free_list_persists_across_reopen() {
        let (_dir, path) = scratch();
        {
            let mut manager = FileManager::create(&path).unwrap();
            for _ in 0..3 {
                manager.allocate_page().unwrap();
            }
            manager.free_page(0).unwrap();
        }
        let mut manager = FileManager::open(&path).unwrap();
        assert_eq!(manager.free_page_head(), 0);
        assert_eq!(manager.allocate_page().unwrap(), 0);
    }
}
