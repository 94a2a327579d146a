pub mod database;
#[cfg(test)]
pub mod memory;
pub mod models;
pub mod redis_store;
pub mod storage;

pub use storage::{open_storage, Storage, StorageError};
