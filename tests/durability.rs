//! # Durability Tests
//!
//! End-to-end checks of the commit protocol across close/reopen cycles
//! and simulated crashes. The crash simulation relies on the copy-on-write
//! contract: a mutation only writes to appended pages and to pages that
//! were free in the previous durable state, so restoring the previous
//! master page image is equivalent to crashing before the master write.

use bankai::Database;
use tempfile::tempdir;

const RESERVE: usize = 1 << 20;
const PAGE_SIZE: usize = 4096;

fn open_db(path: &std::path::Path) -> Database {
    Database::builder()
        .path(path)
        .mmap_reserve(RESERVE)
        .open()
        .unwrap()
}

mod reopen_tests {
    use super::*;

    #[test]
    fn single_key_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut db = open_db(&path);
        db.set(b"a", b"1").unwrap();
        db.close();

        let db = open_db(&path);
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
        db.check().unwrap();
    }

    #[test]
    fn overwrite_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut db = open_db(&path);
        db.set(b"a", b"1").unwrap();
        db.set(b"a", b"2").unwrap();
        assert_eq!(db.get(b"a").unwrap(), Some(b"2".to_vec()));
        db.close();

        let db = open_db(&path);
        assert_eq!(db.get(b"a").unwrap(), Some(b"2".to_vec()));
        db.check().unwrap();
    }

    #[test]
    fn deletions_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut db = open_db(&path);
        for i in 0..30u32 {
            let key = format!("key{:03}", i);
            db.set(key.as_bytes(), &[b'x'; 100]).unwrap();
        }
        for i in (0..30u32).step_by(2) {
            let key = format!("key{:03}", i);
            assert!(db.del(key.as_bytes()).unwrap());
        }
        db.close();

        let db = open_db(&path);
        for i in 0..30u32 {
            let key = format!("key{:03}", i);
            let value = db.get(key.as_bytes()).unwrap();
            if i % 2 == 0 {
                assert_eq!(value, None, "{} should be deleted", key);
            } else {
                assert_eq!(value, Some(vec![b'x'; 100]), "{} should remain", key);
            }
        }
        db.check().unwrap();
    }

    #[test]
    fn empty_store_reopens_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let db = open_db(&path);
        assert_eq!(db.get(b"anything").unwrap(), None);
        db.close();

        let mut db = open_db(&path);
        assert_eq!(db.get(b"anything").unwrap(), None);
        assert!(!db.del(b"anything").unwrap());
    }
}

mod bulk_tests {
    use super::*;

    #[test]
    fn bulk_insert_then_delete_all_recycles_everything() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut db = open_db(&path);

        let count = 2000u32;
        let mut last_used = db.used_pages();
        for i in 0..count {
            let key = format!("key_{:05}", i);
            db.set(key.as_bytes(), &[b'v'; 100]).unwrap();
            assert!(db.used_pages() >= last_used, "used pages shrank");
            last_used = db.used_pages();
        }
        db.check().unwrap();

        for i in 0..count {
            let key = format!("key_{:05}", i);
            assert_eq!(
                db.get(key.as_bytes()).unwrap(),
                Some(vec![b'v'; 100]),
                "missing {}",
                key
            );
        }

        for i in (0..count).rev() {
            let key = format!("key_{:05}", i);
            assert!(db.del(key.as_bytes()).unwrap(), "failed to delete {}", key);
        }
        db.check().unwrap();

        // Only the master page and the root leaf remain in use; everything
        // else is on the free list, either as a stored pointer or as a
        // page hosting the list itself.
        assert!(db.free_pages().unwrap() > 0);
        for i in 0..count {
            let key = format!("key_{:05}", i);
            assert_eq!(db.get(key.as_bytes()).unwrap(), None);
        }

        // Reinserting reuses recycled pages instead of growing the file.
        let peak = db.used_pages();
        for i in 0..count / 2 {
            let key = format!("key_{:05}", i);
            db.set(key.as_bytes(), &[b'v'; 100]).unwrap();
        }
        assert_eq!(db.used_pages(), peak, "reinsertions should not grow the file");
        db.check().unwrap();
    }

    #[test]
    fn bulk_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let mut db = open_db(&path);
            for i in 0..500u32 {
                let key = format!("key_{:05}", i);
                let val = format!("val_{:05}", i);
                db.set(key.as_bytes(), val.as_bytes()).unwrap();
            }
            db.close();
        }

        let db = open_db(&path);
        db.check().unwrap();
        for i in 0..500u32 {
            let key = format!("key_{:05}", i);
            let val = format!("val_{:05}", i);
            assert_eq!(db.get(key.as_bytes()).unwrap(), Some(val.into_bytes()));
        }
    }
}

mod crash_tests {
    use super::*;

    fn read_master(path: &std::path::Path) -> Vec<u8> {
        let bytes = std::fs::read(path).unwrap();
        bytes[..PAGE_SIZE].to_vec()
    }

    fn write_master(path: &std::path::Path, master: &[u8]) {
        use std::os::unix::fs::FileExt;
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.write_all_at(master, 0).unwrap();
        file.sync_all().unwrap();
    }

    /// Restoring the pre-mutation master page is equivalent to a crash
    /// after the data fsync but before the master write: the lost
    /// mutation's pages are on disk but unreachable, and every page the
    /// old master can reach is untouched, because a mutation only writes
    /// to appended pages and to pages free in its own pre-state.
    #[test]
    fn losing_the_master_write_recovers_the_old_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut db = open_db(&path);
        for i in 0..40u32 {
            let key = format!("key{:03}", i);
            db.set(key.as_bytes(), &[b'a'; 120]).unwrap();
        }
        db.close();

        let before = read_master(&path);

        let mut db = open_db(&path);
        db.set(b"key005", &[b'b'; 120]).unwrap();
        db.close();

        write_master(&path, &before);

        let db = open_db(&path);
        db.check().unwrap();
        assert_eq!(db.get(b"key005").unwrap(), Some(vec![b'a'; 120]));
        for i in 0..40u32 {
            let key = format!("key{:03}", i);
            assert_eq!(db.get(key.as_bytes()).unwrap(), Some(vec![b'a'; 120]));
        }
    }

    /// For every prefix of a mutation history, crashing out of the next
    /// mutation yields exactly that prefix. Each prefix gets a fresh
    /// store: rolling a single file back more than one commit is not a
    /// crash any schedule can produce.
    #[test]
    fn every_commit_is_a_consistent_recovery_point() {
        for crash_after in 0..8u32 {
            let dir = tempdir().unwrap();
            let path = dir.path().join("test.db");

            let mut db = open_db(&path);
            for i in 0..=crash_after {
                let key = format!("key{:02}", i);
                db.set(key.as_bytes(), &[b'x'; 500]).unwrap();
            }
            db.close();
            let before = read_master(&path);

            let mut db = open_db(&path);
            if crash_after % 2 == 0 {
                let key = format!("key{:02}", crash_after + 1);
                db.set(key.as_bytes(), &[b'x'; 500]).unwrap();
            } else {
                db.del(b"key00").unwrap();
            }
            db.close();
            write_master(&path, &before);

            let db = open_db(&path);
            db.check().unwrap();
            for i in 0..=crash_after {
                let key = format!("key{:02}", i);
                assert_eq!(
                    db.get(key.as_bytes()).unwrap(),
                    Some(vec![b'x'; 500]),
                    "prefix {} lost {}",
                    crash_after,
                    key
                );
            }
            let next = format!("key{:02}", crash_after + 1);
            assert_eq!(db.get(next.as_bytes()).unwrap(), None);
        }
    }

    #[test]
    fn corrupted_master_signature_refuses_to_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut db = open_db(&path);
        db.set(b"a", b"1").unwrap();
        db.close();

        let mut master = read_master(&path);
        master[3] ^= 0x55;
        write_master(&path, &master);

        let result = Database::builder()
            .path(&path)
            .mmap_reserve(RESERVE)
            .open();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("signature"));
    }

    #[test]
    fn out_of_bounds_master_fields_refuse_to_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut db = open_db(&path);
        db.set(b"a", b"1").unwrap();
        db.close();

        // A root pointer past the used-page count: a torn write tail.
        let mut master = read_master(&path);
        master[16..24].copy_from_slice(&u64::MAX.to_le_bytes());
        write_master(&path, &master);

        let result = Database::builder()
            .path(&path)
            .mmap_reserve(RESERVE)
            .open();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("out of bounds"));
    }
}
