#![allow(missing_docs)]

use std::path::Path;

use atomic_store::{
    AtomicStoreLoader, BytesCodec, Resource, Result, RetentionPolicy, RollingOptions,
    StoreError, StoreOptions, Synchronous,
};
use proptest::prelude::*;
use tempfile::tempdir;

fn fast_options() -> StoreOptions {
    StoreOptions {
        synchronous: Synchronous::Off,
        ..StoreOptions::default()
    }
}

fn generation_files(dir: &Path) -> Vec<u64> {
    let mut generations: Vec<u64> = std::fs::read_dir(dir)
        .expect("read_dir")
        .filter_map(|entry| {
            let name = entry.ok()?.file_name().into_string().ok()?;
            name.strip_prefix("history.gen.")?.parse().ok()
        })
        .collect();
    generations.sort_unstable();
    generations
}

fn open_history(
    dir: &Path,
    rolling: RollingOptions,
) -> Result<(atomic_store::AtomicStore, Resource<BytesCodec>)> {
    let mut loader = AtomicStoreLoader::load_with_options(dir, "journal", fast_options())?;
    let history = loader.rolling_log("history", BytesCodec, rolling)?;
    Ok((loader.open()?, history))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn rotation_neither_loses_nor_duplicates(
        batches in prop::collection::vec(
            prop::collection::vec(prop::collection::vec(any::<u8>(), 0..48), 0..6),
            1..8,
        ),
        max_bytes in 1u64..256,
        max_records in 1u64..6,
    ) {
        let dir = tempdir().expect("tmpdir");
        let rolling = RollingOptions {
            max_generation_bytes: max_bytes,
            max_generation_records: max_records,
            retention: RetentionPolicy::KeepAll,
        };
        let expected: Vec<Vec<u8>> = batches.iter().flatten().cloned().collect();
        {
            let (store, history) = open_history(dir.path(), rolling).unwrap();
            for batch in &batches {
                let mut txn = store.begin().unwrap();
                for payload in batch {
                    txn.append(&history, payload).unwrap();
                }
                txn.commit().unwrap();
            }
            let seen = store.iter(&history).unwrap().collect::<Result<Vec<_>>>().unwrap();
            prop_assert_eq!(&seen, &expected);
        }

        let (store, history) = open_history(dir.path(), rolling).unwrap();
        let located = store
            .iter(&history)
            .unwrap()
            .located()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let seen: Vec<Vec<u8>> = located.iter().map(|(_, payload)| payload.clone()).collect();
        prop_assert_eq!(&seen, &expected);
        prop_assert_eq!(store.record_count("history").unwrap(), expected.len() as u64);
        for pair in located.windows(2) {
            prop_assert!(pair[0].0 < pair[1].0);
        }
        let mut per_generation = std::collections::BTreeMap::<u64, u64>::new();
        for (location, _) in &located {
            *per_generation.entry(location.generation).or_default() += 1;
        }
        for count in per_generation.values() {
            prop_assert!(*count <= max_records);
        }
    }
}

#[test]
fn rotation_creates_one_file_per_generation() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let rolling = RollingOptions {
        max_generation_records: 3,
        ..RollingOptions::default()
    };
    let (store, history) = open_history(dir.path(), rolling)?;
    let mut txn = store.begin()?;
    for n in 0..10u8 {
        txn.append(&history, &vec![n; 4])?;
    }
    txn.commit()?;
    assert_eq!(generation_files(dir.path()), vec![0, 1, 2, 3]);
    let last = store.committed_location("history").expect("committed");
    assert_eq!(last.generation, 3);
    assert_eq!(store.snapshot().resources["history"].state.generation_records, 1);
    Ok(())
}

#[test]
fn rolled_back_rotation_is_reused() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let rolling = RollingOptions {
        max_generation_records: 2,
        ..RollingOptions::default()
    };
    let (store, history) = open_history(dir.path(), rolling)?;
    let mut txn = store.begin()?;
    txn.append(&history, &b"a".to_vec())?;
    txn.append(&history, &b"b".to_vec())?;
    txn.commit()?;

    let mut txn = store.begin()?;
    let abandoned = txn.append(&history, &b"c".to_vec())?;
    assert_eq!(abandoned.generation, 1);
    txn.rollback();

    let mut txn = store.begin()?;
    let kept = txn.append(&history, &b"d".to_vec())?;
    txn.commit()?;
    assert_eq!(kept, abandoned);
    let all = store.iter(&history)?.collect::<Result<Vec<_>>>()?;
    assert_eq!(all, vec![b"a".to_vec(), b"b".to_vec(), b"d".to_vec()]);
    Ok(())
}

#[test]
fn keep_records_prunes_whole_generations_only() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let rolling = RollingOptions {
        max_generation_records: 4,
        retention: RetentionPolicy::KeepRecords(5),
        ..RollingOptions::default()
    };
    let (store, history) = open_history(dir.path(), rolling)?;
    let mut stale = None;
    for n in 0..14u8 {
        let mut txn = store.begin()?;
        let location = txn.append(&history, &vec![n])?;
        stale.get_or_insert(location);
        txn.commit()?;
    }
    // Generations hold 4, 4, 4 and 2 records; keeping five needs the last two.
    assert_eq!(store.prune(&history)?, 2);
    assert_eq!(generation_files(dir.path()), vec![2, 3]);
    let left = store.iter(&history)?.collect::<Result<Vec<_>>>()?;
    assert_eq!(left, (8..14u8).map(|n| vec![n]).collect::<Vec<_>>());
    assert_eq!(store.record_count("history")?, 14);

    let stale = stale.expect("first location");
    assert!(matches!(
        store.read_at(&history, stale),
        Err(StoreError::StaleLocation { .. })
    ));
    assert!(matches!(
        store.iter_from(&history, Some(stale)),
        Err(StoreError::StaleLocation { .. })
    ));
    drop(store);

    let (store, history) = open_history(dir.path(), rolling)?;
    assert_eq!(store.iter(&history)?.count(), 6);
    Ok(())
}

#[test]
fn reopen_removes_generations_left_behind_by_prune() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let rolling = RollingOptions {
        max_generation_records: 2,
        retention: RetentionPolicy::KeepGenerations(2),
        ..RollingOptions::default()
    };
    let saved = tempdir().expect("tmpdir");
    {
        let (store, history) = open_history(dir.path(), rolling)?;
        for n in 0..7u8 {
            let mut txn = store.begin()?;
            txn.append(&history, &vec![n])?;
            txn.commit()?;
        }
        assert_eq!(generation_files(dir.path()), vec![0, 1, 2, 3]);
        for generation in [0, 1] {
            let name = format!("history.gen.{generation}");
            std::fs::copy(dir.path().join(&name), saved.path().join(&name)).expect("copy");
        }
        assert_eq!(store.prune(&history)?, 2);
    }
    // Crash after the prune commit but before its files were deleted.
    for generation in [0, 1] {
        let name = format!("history.gen.{generation}");
        std::fs::copy(saved.path().join(&name), dir.path().join(&name)).expect("copy");
    }
    assert_eq!(generation_files(dir.path()), vec![0, 1, 2, 3]);

    let (store, history) = open_history(dir.path(), rolling)?;
    assert_eq!(generation_files(dir.path()), vec![2, 3]);
    let located = store
        .iter(&history)?
        .located()
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(located[0].0.generation, 2);
    let payloads: Vec<Vec<u8>> = located.into_iter().map(|(_, payload)| payload).collect();
    assert_eq!(payloads, (4..7u8).map(|n| vec![n]).collect::<Vec<_>>());
    assert_eq!(store.snapshot().resources["history"].state.first_generation, 2);
    Ok(())
}
