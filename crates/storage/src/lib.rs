mod buffer;
mod disk;
mod page;
mod record;
mod replacer;

pub use buffer::{BufferPoolManager, PageGuard};
pub use disk::{FileManager, FileMetadata, METADATA_SIZE};
pub use page::{Page, PageType, PAGE_BODY_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE};
pub use record::{Record, RecordPtr, RECORD_DELIMITER};
pub use replacer::{FrameId, LruReplacer, Replacer};

use thiserror::Error;

/// Identifies a page within the database file. Negative ids are sentinels.
pub type PageId = i64;

/// Sentinel id meaning "no page".
pub const INVALID_PAGE_ID: PageId = -1;

/// Errors raised by the file, page and buffer layers.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database file already exists: {0}")]
    FileExists(String),
    #[error("page {0} is out of bounds")]
    PageOutOfBounds(PageId),
    #[error("page {0} failed checksum verification")]
    Corrupted(PageId),
    #[error("slot {slot} of page {page_id} is invalid or freed")]
    InvalidSlot { page_id: PageId, slot: u16 },
    #[error("page out of space")]
    PageOutOfSpace,
    #[error("buffer pool exhausted: all resident pages are pinned")]
    BufferExhausted,
    #[error("page {0} is pinned and cannot be freed")]
    PagePinned(PageId),
    #[error("wal error: {0}")]
    Wal(#[from] wal::WalError),
}

/// Convenience alias for storage results.
pub type StorageResult<T> = Result<T, StorageError>;
