pub mod memory;
pub mod sqlite;

pub use memory::MemoryHistoryStore;
pub use sqlite::SqliteHistoryStore;
