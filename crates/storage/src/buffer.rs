use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::disk::FileManager;
use crate::page::Page;
use crate::replacer::{FrameId, LruReplacer, Replacer};
use crate::{PageId, StorageError, StorageResult};
use wal::LogManager;

/// Guard over a pinned resident page. Holds the pool lock, so callers drop
/// the guard before invoking any other pool method, then unpin.
pub struct PageGuard<'a> {
    state: MutexGuard<'a, PoolState>,
    frame_id: FrameId,
}

impl PageGuard<'_> {
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }
}

impl Deref for PageGuard<'_> {
    type Target = Page;

    fn deref(&self) -> &Self::Target {
        &self.state.frames[self.frame_id]
    }
}

impl DerefMut for PageGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state.frames[self.frame_id]
    }
}

struct PoolState {
    file_manager: FileManager,
    replacer: LruReplacer,
    frames: Vec<Page>,
    page_table: HashMap<PageId, FrameId>,
    free_frames: Vec<FrameId>,
    log_manager: Option<Arc<LogManager>>,
}

#[derive(Default)]
struct PoolMetrics {
    fetch_count: AtomicUsize,
}

/// Bounded cache of pages with pin counts and LRU eviction of unpinned
/// frames. All page traffic between the indexes and the file goes through
/// here; the file manager's free list is only touched under the pool lock.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<Mutex<PoolState>>,
    metrics: Arc<PoolMetrics>,
}

impl BufferPoolManager {
    pub fn new(file_manager: FileManager, pool_size: usize) -> Self {
        Self::new_with_log(file_manager, pool_size, None)
    }

    pub fn new_with_log(
        file_manager: FileManager,
        pool_size: usize,
        log_manager: Option<Arc<LogManager>>,
    ) -> Self {
        let frames = (0..pool_size).map(|_| Page::new()).collect();
        let free_frames = (0..pool_size).rev().collect();
        let state = PoolState {
            file_manager,
            replacer: LruReplacer::new(pool_size),
            frames,
            page_table: HashMap::new(),
            free_frames,
            log_manager,
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
            metrics: Arc::new(PoolMetrics::default()),
        }
    }

    /// Page fetches since the last counter reset.
    pub fn fetch_count(&self) -> usize {
        self.metrics.fetch_count.load(Ordering::Relaxed)
    }

    pub fn reset_fetch_count(&self) {
        self.metrics.fetch_count.store(0, Ordering::Relaxed);
    }

    /// Number of resident pages; never exceeds the pool size.
    pub fn resident_count(&self) -> usize {
        self.inner.lock().page_table.len()
    }

    pub fn pool_size(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// True when a new page could be admitted without failing.
    pub fn has_space_for_new_page(&self) -> bool {
        let state = self.inner.lock();
        !state.free_frames.is_empty() || state.replacer.size() > 0
    }

    /// Fetches a page into the pool, pinning it. The caller must drop the
    /// guard and then call `unpin_page` on every exit path.
    pub fn fetch_page(&self, page_id: PageId) -> StorageResult<PageGuard<'_>> {
        self.metrics.fetch_count.fetch_add(1, Ordering::Relaxed);
        let mut state = self.inner.lock();
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let page = &mut state.frames[frame_id];
            page.pin_count += 1;
            state.replacer.pin(frame_id);
            return Ok(PageGuard { state, frame_id });
        }

        let frame_id = Self::take_frame(&mut state)?;
        let loaded = state.file_manager.read_page(page_id);
        match loaded {
            Ok(page) if page.is_corrupted() => {
                state.free_frames.push(frame_id);
                Err(StorageError::Corrupted(page_id))
            }
            Ok(mut page) => {
                page.frame_page_id = Some(page_id);
                page.pin_count = 1;
                state.frames[frame_id] = page;
                state.page_table.insert(page_id, frame_id);
                state.replacer.pin(frame_id);
                Ok(PageGuard { state, frame_id })
            }
            Err(err) => {
                state.free_frames.push(frame_id);
                Err(err)
            }
        }
    }

    /// Allocates a page on disk (recycling the free list when possible) and
    /// pins it in an empty frame. Returns the new page id.
    pub fn new_page(&self) -> StorageResult<PageId> {
        let mut state = self.inner.lock();
        let frame_id = Self::take_frame(&mut state)?;
        let page_id = match state.file_manager.allocate_page() {
            Ok(page_id) => page_id,
            Err(err) => {
                state.free_frames.push(frame_id);
                return Err(err);
            }
        };
        let page = &mut state.frames[frame_id];
        page.reset_memory();
        page.set_id(page_id);
        page.frame_page_id = Some(page_id);
        page.pin_count = 1;
        page.is_dirty = true;
        state.page_table.insert(page_id, frame_id);
        state.replacer.pin(frame_id);
        Ok(page_id)
    }

    /// Adds one pin to an already-resident page.
    pub fn pin_page(&self, page_id: PageId) -> StorageResult<()> {
        let mut state = self.inner.lock();
        let frame_id = *state
            .page_table
            .get(&page_id)
            .ok_or(StorageError::PageOutOfBounds(page_id))?;
        state.frames[frame_id].pin_count += 1;
        state.replacer.pin(frame_id);
        Ok(())
    }

    /// Releases one pin; the decrement saturates at zero. Marks the page
    /// dirty when requested.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> StorageResult<bool> {
        let mut state = self.inner.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(false);
        };
        let page = &mut state.frames[frame_id];
        if is_dirty {
            page.is_dirty = true;
        }
        if page.pin_count == 0 {
            return Ok(false);
        }
        page.pin_count -= 1;
        if page.pin_count == 0 {
            state.replacer.unpin(frame_id);
        }
        Ok(true)
    }

    /// Force-writes a resident page; the page stays resident.
    pub fn flush_page(&self, page_id: PageId) -> StorageResult<bool> {
        let mut state = self.inner.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(false);
        };
        Self::write_back(&mut state, frame_id)?;
        Ok(true)
    }

    /// Force-writes every dirty resident page and syncs the file.
    pub fn flush_all_pages(&self) -> StorageResult<()> {
        let mut state = self.inner.lock();
        for frame_id in 0..state.frames.len() {
            if state.frames[frame_id].frame_page_id.is_some() && state.frames[frame_id].is_dirty {
                Self::write_back(&mut state, frame_id)?;
            }
        }
        state.file_manager.sync()?;
        Ok(())
    }

    /// Drops the page from the pool (it must be unpinned) and returns it to
    /// the disk free list.
    pub fn free_page(&self, page_id: PageId) -> StorageResult<()> {
        let mut state = self.inner.lock();
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            if state.frames[frame_id].pin_count > 0 {
                return Err(StorageError::PagePinned(page_id));
            }
            state.page_table.remove(&page_id);
            state.replacer.pin(frame_id);
            state.frames[frame_id].reset_memory();
            state.free_frames.push(frame_id);
        }
        state.file_manager.free_page(page_id)
    }

    /// Runs `f` with mutable access to the file manager, under the pool lock.
    pub fn with_file_manager<R>(&self, f: impl FnOnce(&mut FileManager) -> R) -> R {
        let mut state = self.inner.lock();
        f(&mut state.file_manager)
    }

    fn take_frame(state: &mut PoolState) -> StorageResult<FrameId> {
        if let Some(frame_id) = state.free_frames.pop() {
            return Ok(frame_id);
        }
        let frame_id = state
            .replacer
            .victim()
            .ok_or(StorageError::BufferExhausted)?;
        Self::evict(state, frame_id)?;
        Ok(frame_id)
    }

    fn evict(state: &mut PoolState, frame_id: FrameId) -> StorageResult<()> {
        if let Some(old_page_id) = state.frames[frame_id].frame_page_id {
            if state.frames[frame_id].is_dirty {
                Self::write_back(state, frame_id)?;
            }
            state.page_table.remove(&old_page_id);
            state.frames[frame_id].reset_memory();
        }
        Ok(())
    }

    fn write_back(state: &mut PoolState, frame_id: FrameId) -> StorageResult<()> {
        let Some(page_id) = state.frames[frame_id].frame_page_id else {
            return Ok(());
        };
        state.frames[frame_id].update_checksum();
        let lsn = state.frames[frame_id].lsn();
        if let Some(log_manager) = &state.log_manager {
            log_manager.flush(lsn)?;
        }
        state.file_manager.write_page(page_id, &state.frames[frame_id])?;
        state.frames[frame_id].is_dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{PageType, PAGE_SIZE};
    use crate::Record;
    use tempfile::TempDir;

    fn setup(pool_size: usize) -> (TempDir, BufferPoolManager) {
        let dir = TempDir::new().expect("temp dir");
        let file_manager = FileManager::create(dir.path().join("pool.db")).unwrap();
        (dir, BufferPoolManager::new(file_manager, pool_size))
    }

    #[test]
    fn new_page_starts_pinned() {
        let (_dir, pool) = setup(2);
        let page_id = pool.new_page().unwrap();
        {
            let guard = pool.fetch_page(page_id).unwrap();
            assert_eq!(guard.pin_count(), 2);
        }
        assert!(pool.unpin_page(page_id, false).unwrap());
        assert!(pool.unpin_page(page_id, false).unwrap());
        assert!(!pool.unpin_page(page_id, false).unwrap());
    }

    #[test]
    fn eviction_writes_back_dirty_pages() {
        let (_dir, pool) = setup(2);
        let mut ids = Vec::new();
        for value in 0u8..6 {
            let page_id = pool.new_page().unwrap();
            {
                let mut guard = pool.fetch_page(page_id).unwrap();
                guard.init(page_id, PageType::Data);
                guard
                    .add_record(&Record::new(value as i64, vec![format!("v{value}")]))
                    .unwrap();
            }
            pool.unpin_page(page_id, true).unwrap();
            pool.unpin_page(page_id, true).unwrap();
            ids.push(page_id);
            assert!(pool.resident_count() <= 2);
        }
        // Early pages were evicted; their contents must have survived.
        for (value, page_id) in ids.iter().enumerate() {
            let guard = pool.fetch_page(*page_id).unwrap();
            assert_eq!(
                guard.get_record(0).unwrap().attrs,
                vec![format!("v{value}")]
            );
            drop(guard);
            pool.unpin_page(*page_id, false).unwrap();
        }
    }

    #[test]
    fn exhaustion_when_all_pages_pinned() {
        let (_dir, pool) = setup(2);
        let first = pool.new_page().unwrap();
        let second = pool.new_page().unwrap();
        assert!(!pool.has_space_for_new_page());
        assert!(matches!(pool.new_page(), Err(StorageError::BufferExhausted)));

        pool.unpin_page(first, false).unwrap();
        assert!(pool.has_space_for_new_page());
        let third = pool.new_page().unwrap();
        assert_ne!(third, second);
        assert_eq!(pool.resident_count(), 2);
    }

    #[test]
    fn pin_is_reentrant() {
        let (_dir, pool) = setup(2);
        let page_id = pool.new_page().unwrap();
        pool.pin_page(page_id).unwrap();
        pool.unpin_page(page_id, false).unwrap();
        // Still pinned once: not evictable.
        assert!(!pool.has_space_for_new_page() || pool.resident_count() < 2);
        pool.unpin_page(page_id, false).unwrap();
        assert!(pool.has_space_for_new_page());
    }

    #[test]
    fn free_page_rejects_pinned_and_recycles() {
        let (_dir, pool) = setup(4);
        let page_id = pool.new_page().unwrap();
        assert!(matches!(
            pool.free_page(page_id),
            Err(StorageError::PagePinned(_))
        ));
        pool.unpin_page(page_id, false).unwrap();
        pool.free_page(page_id).unwrap();
        // The freed id comes back from the disk free list.
        let next = pool.new_page().unwrap();
        assert_eq!(next, page_id);
    }

    #[test]
    fn corrupted_page_is_rejected_on_fetch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corrupt.db");
        let page_id;
        {
            let file_manager = FileManager::create(&path).unwrap();
            let pool = BufferPoolManager::new(file_manager, 2);
            page_id = pool.new_page().unwrap();
            {
                let mut guard = pool.fetch_page(page_id).unwrap();
                guard.init(page_id, PageType::Data);
                guard
                    .add_record(&Record::new(1, vec!["x".into()]))
                    .unwrap();
            }
            pool.unpin_page(page_id, true).unwrap();
            pool.unpin_page(page_id, true).unwrap();
            pool.flush_all_pages().unwrap();
        }
        // Flip one byte of the stored body behind the pool's back.
        {
            use std::os::unix::fs::FileExt;
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .unwrap();
            let offset = (PAGE_SIZE + PAGE_SIZE / 2) as u64;
            let mut byte = [0u8; 1];
            file.read_exact_at(&mut byte, offset).unwrap();
            byte[0] ^= 0xFF;
            file.write_all_at(&byte, offset).unwrap();
        }
        let file_manager = FileManager::open(&path).unwrap();
        let pool = BufferPoolManager::new(file_manager, 2);
        assert!(matches!(
            pool.fetch_page(page_id),
            Err(StorageError::Corrupted(_))
        ));
    }
}
