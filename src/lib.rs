//! # bankai - Embedded Copy-on-Write Key-Value Store
//!
//! bankai is a single-writer, persistent key-value store backed by a
//! copy-on-write B+tree over a memory-mapped file. Every update rewrites
//! the tree spine onto fresh pages and flips one master page to commit,
//! so the store is atomic across crashes without a write-ahead log.
//!
//! ## Quick Start
//!
//! ```ignore
//! use bankai::Database;
//!
//! let mut db = Database::open("./data.db")?;
//! db.set(b"hello", b"world")?;
//! assert_eq!(db.get(b"hello")?, Some(b"world".to_vec()));
//! db.del(b"hello")?;
//! ```
//!
//! `set` and `del` return after the change is durable on disk.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │          Public API (Database)        │
//! ├───────────────────────────────────────┤
//! │   B+Tree (copy-on-write insert/       │
//! │   delete/lookup, split and merge)     │
//! ├───────────────────────────────────────┤
//! │   Free List (persistent LIFO of       │
//! │   reusable page pointers)             │
//! ├───────────────────────────────────────┤
//! │   Pager (staging, two-phase commit,   │
//! │   master page)                        │
//! ├───────────────────────────────────────┤
//! │   Chunked mmap over one file          │
//! └───────────────────────────────────────┘
//! ```
//!
//! The three subsystems share one page-addressed file format: the tree
//! produces freed pointers that feed the free list, the free list hands
//! pointers back as page identifiers, and the pager decides when the new
//! root becomes visible.
//!
//! ## Limits
//!
//! - Keys: 1 to 1000 bytes, compared as unsigned byte strings
//! - Values: 0 to 3000 bytes
//! - Pages: fixed 4096 bytes
//! - One writer at a time; readers between mutations
//!
//! ## Module Overview
//!
//! - [`database`]: public API and mutation orchestration
//! - [`btree`]: node format and tree algorithms
//! - [`storage`]: pager, chunked mmap, free list, master page

pub mod btree;
pub mod database;
pub mod storage;

pub use database::{Database, DatabaseBuilder};
