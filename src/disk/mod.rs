//! Persistent backend for the tree: node records in a primary byte stream
//! plus a sharded identifier catalogue spread over auxiliary page files.
//!
//! All edits are buffered in memory until [`Tree::flush`](crate::Tree::flush)
//! commits them: tree header first, then dirty node records, then the dirty
//! catalogue shards. There is no crash-atomic commit; a flush interrupted
//! mid-write can leave the store unreadable.

mod mapper;
mod options;
mod storage;
mod store;

pub use options::Options;
pub use storage::{MemoryStorage, Storage};
pub use store::{initialize, load, DiskStore, DiskTree, FileTree};

// One codec everywhere: varint bincode is compact and self-delimiting, so a
// decoder consumes exactly one record from the stream and shorter in-place
// rewrites never expose stale trailing bytes.
pub(crate) fn codec() -> bincode::DefaultOptions {
	bincode::DefaultOptions::new()
}
