pub mod cursor;
pub mod engine;
pub mod index;
pub mod indexer;
pub mod schema;

pub use cursor::{query_fingerprint, CursorCodec, CursorParts};
pub use engine::{SearchEngine, SearchHit};
pub use index::{MemoryIndex, SearchIndex};
pub use indexer::Indexer;
pub use schema::{DefaultSortablePolicy, Schema, SortablePolicy};
