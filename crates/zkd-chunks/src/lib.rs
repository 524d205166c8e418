//! zkd-chunks: turning plaintext into encrypted, integrity-checked chunks
//!
//! # Overview
//! - `plan`: size-tiered chunk boundaries for an object
//! - `compress`: once-per-object compressibility check and zstd codec
//! - `hash`: BLAKE3 integrity digests and SHA-256 storage digests
//! - `processor`: compress → encrypt → hash for one chunk, and the inverse
//! - `pool`: CPU-bound worker pool serving processor requests by request id

pub mod compress;
pub mod hash;
pub mod plan;
pub mod pool;
pub mod processor;

pub use compress::{assess_compression, CompressionDecision};
pub use hash::{content_digest, hash_bytes, hash_file_streaming, hash_to_hex, integrity_digest};
pub use plan::{chunk_size_for, plan_chunks, ChunkSpan};
pub use pool::ProcessorPool;
pub use processor::{ChunkProcessor, ProcessedChunk};
