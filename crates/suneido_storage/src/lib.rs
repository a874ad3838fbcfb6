//! # Suneido Storage
//!
//! Storage backend trait and implementations for the Suneido database engine.
//!
//! This crate provides the lowest-level storage abstraction. Backends are
//! **opaque byte stores** - they do not interpret the data they hold. The
//! engine in `suneido_core` owns the block format, checksums and recovery.
//!
//! ## Design Principles
//!
//! - Backends are growable byte arenas (read, append, fill, flush)
//! - No knowledge of blocks, commits, B-trees or schemas
//! - Must be `Send + Sync` so readers on any thread can share them
//! - Every backend produces byte-identical content for the same appends
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - Heap-backed, for tests and transient databases
//! - [`FileBackend`] - OS file APIs, also used for read-only access
//! - [`MmapBackend`] - Memory-mapped file that grows in fixed chunks
//!
//! ## Example
//!
//! ```rust
//! use suneido_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! let data = backend.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod mmap;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use mmap::{MmapBackend, DEFAULT_CHUNK_SIZE};
