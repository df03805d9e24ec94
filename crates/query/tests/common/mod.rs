#![allow(dead_code)]

use storage::{BufferPoolManager, FileManager, PageId, RecordPtr};
use tempfile::TempDir;

/// Buffer pool over a scratch database file. The directory must stay alive
/// for as long as the pool is used.
pub fn temp_buffer_pool() -> (TempDir, BufferPoolManager) {
    temp_buffer_pool_sized(64)
}

pub fn temp_buffer_pool_sized(frames: usize) -> (TempDir, BufferPoolManager) {
    let dir = TempDir::new().expect("temp dir create failed");
    let file_manager = FileManager::create(dir.path().join("db")).expect("create database file");
    (dir, BufferPoolManager::new(file_manager, frames))
}

pub fn ptr(page_id: PageId, slot: u16) -> RecordPtr {
    RecordPtr::new(page_id, slot)
}

pub fn ptr_for(key: i64) -> RecordPtr {
    RecordPtr::new(1, (key % 1000) as u16)
}
