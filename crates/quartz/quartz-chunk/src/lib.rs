#![forbid(unsafe_code)]

pub mod chunk;
pub mod role;

pub use chunk::{Chunk, DEFAULT_CHUNK_SIZE, DEFAULT_TOTAL_SIZE, MIB, SENTINEL, is_sentinel};
pub use role::Role;
