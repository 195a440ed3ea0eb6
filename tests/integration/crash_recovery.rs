#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Once;

use atomic_store::{AtomicStoreLoader, BincodeCodec, BytesCodec, Result, StoreError};
use tempfile::tempdir;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).expect("metadata").len()
}

#[test]
fn crash_before_root_swap_keeps_previous_version() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    {
        let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
        let ledger = loader.append_log("ledger", BytesCodec)?;
        let index = loader.fixed_append_log("index", BytesCodec, 32)?;
        let store = loader.open()?;
        let mut txn = store.begin()?;
        txn.append(&ledger, &b"tx1".to_vec())?;
        txn.append(&index, &vec![0xAB; 32])?;
        // Crash: log data is on disk, the root metadata never moved.
        std::mem::forget(txn);
        fs::write(dir.path().join(".bank.root.tmp"), b"half-written root").expect("write");
    }
    assert_eq!(file_len(&dir.path().join("ledger.log")), 8 + 3);
    assert_eq!(file_len(&dir.path().join("index.dat")), 32);

    let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
    assert!(!dir.path().join(".bank.root.tmp").exists());
    let ledger = loader.append_log("ledger", BytesCodec)?;
    let index = loader.fixed_append_log("index", BytesCodec, 32)?;
    let store = loader.open()?;
    assert_eq!(store.current_version(), 0);
    assert_eq!(store.iter(&ledger)?.count(), 0);
    assert_eq!(store.iter(&index)?.count(), 0);
    assert_eq!(file_len(&dir.path().join("ledger.log")), 8 + 3);
    assert_eq!(file_len(&dir.path().join("index.dat")), 32);

    let mut txn = store.begin()?;
    txn.append(&ledger, &b"replacement".to_vec())?;
    txn.append(&index, &vec![0xCD; 32])?;
    assert_eq!(txn.commit()?, 1);
    assert_eq!(file_len(&dir.path().join("ledger.log")), 8 + 11);
    assert_eq!(store.load_latest(&ledger)?, b"replacement".to_vec());
    assert_eq!(store.read(&index, 0)?, vec![0xCD; 32]);
    Ok(())
}

#[test]
fn crash_between_renames_recovers_last_swapped_root() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    {
        let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
        let ledger = loader.append_log("ledger", BincodeCodec::<u32>::default())?;
        let store = loader.open()?;
        for n in 0..2u32 {
            let mut txn = store.begin()?;
            txn.append(&ledger, &n)?;
            txn.commit()?;
        }
        let mut txn = store.begin()?;
        txn.append(&ledger, &99)?;
        std::mem::forget(txn);
    }
    // Latest was archived, the working file never got renamed into place.
    fs::rename(dir.path().join("bank.root"), dir.path().join("bank.root.2")).expect("rename");
    fs::write(dir.path().join(".bank.root.tmp"), b"v3").expect("write");

    let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
    assert_eq!(loader.version(), 2);
    let ledger = loader.append_log("ledger", BincodeCodec::<u32>::default())?;
    let store = loader.open()?;
    let values = store.iter(&ledger)?.collect::<Result<Vec<_>>>()?;
    assert_eq!(values, vec![0, 1]);

    let mut txn = store.begin()?;
    txn.append(&ledger, &2)?;
    assert_eq!(txn.commit()?, 3);
    assert!(dir.path().join("bank.root").is_file());
    Ok(())
}

#[test]
fn corrupt_latest_root_is_reported() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    {
        let loader = AtomicStoreLoader::load(dir.path(), "bank")?;
        let store = loader.open()?;
        store.begin()?.commit()?;
        store.begin()?.commit()?;
    }
    let latest = dir.path().join("bank.root");
    let mut bytes = fs::read(&latest).expect("read");
    let last = bytes.len() - 1;
    bytes[last] ^= 0x5A;
    fs::write(&latest, &bytes).expect("write");

    let err = AtomicStoreLoader::load(dir.path(), "bank").err().expect("corrupt root");
    assert!(matches!(err, StoreError::InvalidFileContents { .. }), "{err}");
    Ok(())
}

#[test]
fn truncated_committed_log_is_out_of_date() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    {
        let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
        let ledger = loader.append_log("ledger", BytesCodec)?;
        let store = loader.open()?;
        let mut txn = store.begin()?;
        txn.append(&ledger, &b"durable".to_vec())?;
        txn.commit()?;
    }
    let path = dir.path().join("ledger.log");
    let file = OpenOptions::new().write(true).open(&path).expect("open");
    file.set_len(file_len(&path) - 1).expect("truncate");
    drop(file);

    let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
    loader.append_log("ledger", BytesCodec)?;
    let err = loader.open().err().expect("short log");
    assert!(matches!(err, StoreError::LocationOutOfDate { .. }), "{err}");
    Ok(())
}

#[test]
fn missing_committed_log_fails_to_resolve() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    {
        let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
        let ledger = loader.append_log("ledger", BytesCodec)?;
        let store = loader.open()?;
        let mut txn = store.begin()?;
        txn.append(&ledger, &b"gone soon".to_vec())?;
        txn.commit()?;
    }
    fs::remove_file(dir.path().join("ledger.log")).expect("remove");

    let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
    let err = loader.append_log("ledger", BytesCodec).unwrap_err();
    assert!(matches!(err, StoreError::FailedToResolvePath { .. }), "{err}");
    Ok(())
}

#[test]
fn torn_tail_after_commit_is_discarded() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    {
        let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
        let ledger = loader.append_log("ledger", BytesCodec)?;
        let store = loader.open()?;
        let mut txn = store.begin()?;
        txn.append(&ledger, &b"kept".to_vec())?;
        txn.commit()?;
    }
    let path = dir.path().join("ledger.log");
    let committed_len = file_len(&path);
    let mut file = OpenOptions::new().append(true).open(&path).expect("open");
    file.write_all(&[0x00, 0x00, 0x01, 0x00, 0xFF]).expect("write");
    drop(file);

    let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
    let ledger = loader.append_log("ledger", BytesCodec)?;
    let store = loader.open()?;
    assert_eq!(store.iter(&ledger)?.collect::<Result<Vec<_>>>()?, vec![b"kept".to_vec()]);

    let mut txn = store.begin()?;
    txn.append(&ledger, &b"next".to_vec())?;
    txn.commit()?;
    assert_eq!(file_len(&path), committed_len + 8 + 4);
    let values = store.iter(&ledger)?.collect::<Result<Vec<_>>>()?;
    assert_eq!(values, vec![b"kept".to_vec(), b"next".to_vec()]);
    Ok(())
}

#[test]
fn fixed_index_ahead_of_data_is_trimmed() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    {
        let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
        let index = loader.fixed_append_log("index", BytesCodec, 4)?;
        let store = loader.open()?;
        let mut txn = store.begin()?;
        txn.append(&index, &vec![1, 2, 3, 4])?;
        txn.commit()?;
    }
    let idx = dir.path().join("index.idx");
    let mut file = OpenOptions::new().append(true).open(&idx).expect("open");
    file.write_all(&[0xEE; 24]).expect("write");
    drop(file);

    let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
    let index = loader.fixed_append_log("index", BytesCodec, 4)?;
    let store = loader.open()?;
    assert_eq!(file_len(&idx), 24);
    let mut txn = store.begin()?;
    txn.append(&index, &vec![5, 6, 7, 8])?;
    txn.commit()?;
    assert_eq!(store.read(&index, 1)?, vec![5, 6, 7, 8]);
    Ok(())
}

#[test]
fn failed_root_write_reverts_without_poisoning() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
    let ledger = loader.append_log("ledger", BytesCodec)?;
    let store = loader.open()?;
    let mut txn = store.begin()?;
    txn.append(&ledger, &b"a".to_vec())?;
    txn.commit()?;

    // A directory squatting on the working path makes the root write fail.
    let working = dir.path().join(".bank.root.tmp");
    fs::create_dir(&working).expect("create_dir");
    let mut txn = store.begin()?;
    let reverted = txn.append(&ledger, &b"b".to_vec())?;
    let err = txn.commit().unwrap_err();
    assert!(err.is_io(), "unexpected error: {err}");
    assert!(matches!(err, StoreError::StdIoOpen { .. }));
    assert_eq!(store.current_version(), 1);
    assert!(!store.is_poisoned());
    assert_eq!(store.iter(&ledger)?.count(), 1);
    assert!(working.is_dir());

    fs::remove_dir(&working).expect("remove_dir");
    let mut txn = store.begin()?;
    let reused = txn.append(&ledger, &b"c".to_vec())?;
    assert_eq!(txn.commit()?, 2);
    assert_eq!(reused, reverted);
    let all = store.iter(&ledger)?.collect::<Result<Vec<_>>>()?;
    assert_eq!(all, vec![b"a".to_vec(), b"c".to_vec()]);
    Ok(())
}
