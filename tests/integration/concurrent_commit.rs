#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use atomic_store::{
    AtomicStoreLoader, BincodeCodec, CommitPhase, Result, StoreError, StoreOptions, Synchronous,
};
use rand::Rng;
use tempfile::tempdir;

const WRITERS: u32 = 4;
const COMMITS_PER_WRITER: u32 = 25;

fn options() -> StoreOptions {
    StoreOptions {
        commit_timeout: Duration::MAX,
        synchronous: Synchronous::Normal,
        ..StoreOptions::default()
    }
}

#[test]
fn concurrent_writers_serialize_commits() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let mut loader = AtomicStoreLoader::load_with_options(dir.path(), "bank", options())?;
    let ledger = loader.append_log("ledger", BincodeCodec::<(u32, u32)>::default())?;
    let index = loader.fixed_append_log("index", BincodeCodec::<u64>::default(), 8)?;
    let store = Arc::new(loader.open()?);
    let start = Arc::new(Barrier::new(WRITERS as usize + 1));
    let stop = Arc::new(AtomicBool::new(false));

    let reader = {
        let store = Arc::clone(&store);
        let ledger = ledger.clone();
        let index = index.clone();
        let start = Arc::clone(&start);
        let stop = Arc::clone(&stop);
        thread::spawn(move || -> Result<()> {
            start.wait();
            let mut last_seen = 0u64;
            while !stop.load(Ordering::Acquire) {
                let published = store.snapshot().version;
                let version = store.current_version();
                assert!(published <= version, "snapshot {published} ahead of {version}");
                let ledger_len = store.iter(&ledger)?.count() as u64;
                let index_len = store.iter(&index)?.count() as u64;
                // One record per resource per commit, and versions never go backwards.
                assert!(ledger_len >= version);
                assert!(index_len >= version);
                assert!(version >= last_seen);
                last_seen = version;
            }
            Ok(())
        })
    };

    let writers: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let store = Arc::clone(&store);
            let ledger = ledger.clone();
            let index = index.clone();
            let start = Arc::clone(&start);
            thread::spawn(move || -> Result<Vec<u64>> {
                let mut rng = rand::thread_rng();
                let mut versions = Vec::new();
                start.wait();
                for seq in 0..COMMITS_PER_WRITER {
                    let mut txn = store.begin()?;
                    assert_eq!(txn.phase(), CommitPhase::Preparing);
                    txn.append(&ledger, &(writer, seq))?;
                    txn.append(&index, &u64::from(writer * 1000 + seq))?;
                    if rng.gen_bool(0.2) {
                        thread::sleep(Duration::from_micros(rng.gen_range(10..200)));
                    }
                    versions.push(txn.commit()?);
                }
                Ok(versions)
            })
        })
        .collect();

    let mut all_versions = Vec::new();
    for handle in writers {
        all_versions.extend(handle.join().expect("writer panicked")?);
    }
    stop.store(true, Ordering::Release);
    reader.join().expect("reader panicked")?;

    all_versions.sort_unstable();
    let total = u64::from(WRITERS * COMMITS_PER_WRITER);
    assert_eq!(all_versions, (1..=total).collect::<Vec<_>>());
    assert_eq!(store.current_version(), total);

    let records = store.iter(&ledger)?.collect::<Result<Vec<_>>>()?;
    assert_eq!(records.len() as u64, total);
    for writer in 0..WRITERS {
        let sequence: Vec<u32> = records
            .iter()
            .filter(|(w, _)| *w == writer)
            .map(|(_, seq)| *seq)
            .collect();
        assert_eq!(sequence, (0..COMMITS_PER_WRITER).collect::<Vec<_>>());
    }
    let index_values = store.iter(&index)?.collect::<Result<Vec<_>>>()?;
    let paired: Vec<u64> = records
        .iter()
        .map(|(w, seq)| u64::from(w * 1000 + seq))
        .collect();
    assert_eq!(index_values, paired);
    Ok(())
}

#[test]
fn begin_times_out_while_another_commit_is_open() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let loader = AtomicStoreLoader::load(dir.path(), "bank")?;
    let store = loader.open()?;
    let held = store.begin()?;

    thread::scope(|scope| {
        let waiter =
            scope.spawn(|| store.begin_with_timeout(Duration::from_millis(20)).map(|_| ()));
        let outcome = waiter.join().expect("waiter panicked");
        assert!(matches!(outcome, Err(StoreError::TimedOut)));
    });

    drop(held);
    assert_eq!(store.begin_with_timeout(Duration::from_millis(20))?.commit()?, 1);
    Ok(())
}

#[test]
fn waiting_writer_proceeds_after_commit() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let mut loader = AtomicStoreLoader::load_with_options(dir.path(), "bank", options())?;
    let ledger = loader.append_log("ledger", BincodeCodec::<u8>::default())?;
    let store = loader.open()?;

    let mut first = store.begin()?;
    first.append(&ledger, &1)?;
    thread::scope(|scope| -> Result<()> {
        let waiter = scope.spawn(|| -> Result<u64> {
            let mut txn = store.begin()?;
            assert_eq!(txn.base_version(), 1);
            txn.append(&ledger, &2)?;
            txn.commit()
        });
        thread::sleep(Duration::from_millis(10));
        assert_eq!(first.commit()?, 1);
        assert_eq!(waiter.join().expect("waiter panicked")?, 2);
        Ok(())
    })?;
    let values = store.iter(&ledger)?.collect::<Result<Vec<_>>>()?;
    assert_eq!(values, vec![1, 2]);
    Ok(())
}
