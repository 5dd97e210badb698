//! # Master Page
//!
//! Page 0 of the database file. Rewriting it is the single atomic step that
//! commits a transaction: until the new image lands, a crash recovers the
//! previous root, page count, and free-list head.
//!
//! ## Layout (40 bytes, little-endian)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ------------------------------------------
//! 0       16    magic signature
//! 16      8     tree root pointer (0 = empty tree)
//! 24      8     used pages, including the master page
//! 32      8     free-list head pointer (0 = empty list)
//! ```
//!
//! The remaining bytes of page 0 are zero and reserved.
//!
//! Validation at open is deliberately shallow: the magic must match and the
//! three pointers must be mutually consistent with the file size. A torn
//! master write fails one of these checks and the file refuses to open
//! rather than serving a half-committed state.

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const MASTER_MAGIC: &[u8; 16] = b"BANKAI\0\0\0\0\0\0\0\0\0\0";
pub const MASTER_SIZE: usize = 40;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MasterPage {
    magic: [u8; 16],
    root: U64,
    used: U64,
    freelist_head: U64,
}

const _: () = assert!(std::mem::size_of::<MasterPage>() == MASTER_SIZE);

impl MasterPage {
    pub fn new(root: u64, used: u64, freelist_head: u64) -> Self {
        Self {
            magic: *MASTER_MAGIC,
            root: U64::new(root),
            used: U64::new(used),
            freelist_head: U64::new(freelist_head),
        }
    }

    /// Parses and verifies a master page image against the file's page count.
    pub fn from_bytes(bytes: &[u8], file_pages: u64) -> Result<&Self> {
        ensure!(
            bytes.len() >= MASTER_SIZE,
            "buffer too small for MasterPage: {} < {}",
            bytes.len(),
            MASTER_SIZE
        );

        let master = Self::ref_from_bytes(&bytes[..MASTER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse MasterPage: {:?}", e))?;

        ensure!(&master.magic == MASTER_MAGIC, "bad master page signature");

        let used = master.used.get();
        ensure!(
            used >= 1 && used <= file_pages,
            "master page out of bounds: used {} not in 1..={}",
            used,
            file_pages
        );
        ensure!(
            master.root.get() < used,
            "master page out of bounds: root {} >= used {}",
            master.root.get(),
            used
        );
        ensure!(
            master.freelist_head.get() < used,
            "master page out of bounds: free-list head {} >= used {}",
            master.freelist_head.get(),
            used
        );

        Ok(master)
    }

    pub fn root(&self) -> u64 {
        self.root.get()
    }

    pub fn used(&self) -> u64 {
        self.used.get()
    }

    pub fn freelist_head(&self) -> u64 {
        self.freelist_head.get()
    }
}
