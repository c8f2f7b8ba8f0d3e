//! Concrete state storage backends.

pub mod file;
pub mod memory;
pub mod sqlite;

pub use file::FileStateBackend;
pub use memory::MemoryStateBackend;
pub use sqlite::SqliteStateBackend;
