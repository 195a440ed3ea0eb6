#![allow(missing_docs)]

use std::sync::Once;

use atomic_store::{
    AtomicStoreLoader, BincodeCodec, BytesCodec, JsonCodec, LogKind, Result, StoreError,
    StoreOptions, Synchronous,
};
use serde::{Deserialize, Serialize};
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

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Transfer {
    from: String,
    to: String,
    amount: u64,
}

fn transfer(n: u64) -> Transfer {
    Transfer {
        from: format!("acct-{n}"),
        to: format!("acct-{}", n + 1),
        amount: n * 10,
    }
}

#[test]
fn versions_advance_by_one_and_survive_reopen() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    {
        let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
        let ledger = loader.append_log("ledger", BincodeCodec::<Transfer>::default())?;
        let audit = loader.append_log("audit", JsonCodec::<String>::default())?;
        let store = loader.open()?;
        assert_eq!(store.current_version(), 0);
        for n in 0..5 {
            let mut txn = store.begin()?;
            assert_eq!(txn.base_version(), n);
            txn.append(&ledger, &transfer(n))?;
            txn.append(&audit, &format!("transfer {n}"))?;
            assert_eq!(txn.commit()?, n + 1);
        }
    }

    let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
    assert!(!loader.is_initial_run());
    assert_eq!(loader.version(), 5);
    let entry = loader.look_up_resource("ledger").expect("ledger entry");
    assert_eq!(entry.kind, LogKind::Append);
    assert_eq!(entry.state.records, 5);

    let ledger = loader.append_log("ledger", BincodeCodec::<Transfer>::default())?;
    let audit = loader.append_log("audit", JsonCodec::<String>::default())?;
    let store = loader.open()?;
    assert_eq!(store.current_version(), 5);
    let transfers = store.iter(&ledger)?.collect::<Result<Vec<_>>>()?;
    assert_eq!(transfers, (0..5).map(transfer).collect::<Vec<_>>());
    assert_eq!(store.load_latest(&audit)?, "transfer 4");
    Ok(())
}

#[test]
fn uncommitted_appends_are_invisible_to_readers() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
    let ledger = loader.append_log("ledger", BytesCodec)?;
    let store = loader.open()?;

    let mut txn = store.begin()?;
    let committed = txn.append(&ledger, &b"first".to_vec())?;
    txn.commit()?;

    let mut txn = store.begin()?;
    let pending = txn.append(&ledger, &b"second".to_vec())?;
    assert_eq!(store.iter(&ledger)?.count(), 1);
    assert_eq!(store.committed_location("ledger"), Some(committed));
    assert!(matches!(
        store.read_at(&ledger, pending),
        Err(StoreError::StaleLocation { .. })
    ));
    txn.commit()?;
    assert_eq!(store.read_at(&ledger, pending)?, b"second".to_vec());
    Ok(())
}

#[test]
fn iteration_from_a_location_is_inclusive() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
    let ledger = loader.append_log("ledger", BincodeCodec::<u64>::default())?;
    let index = loader.fixed_append_log("index", BincodeCodec::<u64>::default(), 8)?;
    let store = loader.open()?;

    let mut txn = store.begin()?;
    let mut ledger_locations = Vec::new();
    let mut index_locations = Vec::new();
    for n in 0..6u64 {
        ledger_locations.push(txn.append(&ledger, &n)?);
        index_locations.push(txn.append(&index, &(n * 100))?);
    }
    txn.commit()?;

    let tail = store
        .iter_from(&ledger, Some(ledger_locations[3]))?
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(tail, vec![3, 4, 5]);
    let tail = store
        .iter_from(&index, Some(index_locations[4]))?
        .located()
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(tail, vec![(index_locations[4], 400), (index_locations[5], 500)]);
    assert_eq!(store.read(&index, 2)?, 200);
    assert!(matches!(
        store.read(&index, 6),
        Err(StoreError::RecordOutOfRange { record: 6, .. })
    ));
    Ok(())
}

#[test]
fn fixed_record_size_is_enforced() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
    let index = loader.fixed_append_log("index", BytesCodec, 32)?;
    let store = loader.open()?;

    let mut txn = store.begin()?;
    assert!(matches!(
        txn.append(&index, &vec![0u8; 31]),
        Err(StoreError::ResourceFormatInconsistent { .. })
    ));
    txn.append(&index, &vec![7u8; 32])?;
    txn.commit()?;
    assert_eq!(store.record_count("index")?, 1);
    Ok(())
}

#[test]
fn reopening_with_another_codec_is_rejected() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    {
        let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
        let ledger = loader.append_log("ledger", BincodeCodec::<u32>::default())?;
        let store = loader.open()?;
        let mut txn = store.begin()?;
        txn.append(&ledger, &1)?;
        txn.commit()?;
    }
    let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
    let err = loader
        .append_log("ledger", JsonCodec::<u32>::default())
        .unwrap_err();
    assert!(matches!(err, StoreError::ResourceFormatInconsistent { .. }));
    let err = loader.rolling_log("ledger", BincodeCodec::<u32>::default(), Default::default());
    assert!(matches!(
        err,
        Err(StoreError::ResourceFormatInconsistent { .. })
    ));
    Ok(())
}

#[test]
fn unregistered_resources_are_carried_forward() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    {
        let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
        let ledger = loader.append_log("ledger", BytesCodec)?;
        let notes = loader.append_log("notes", BytesCodec)?;
        let store = loader.open()?;
        let mut txn = store.begin()?;
        txn.append(&ledger, &b"l".to_vec())?;
        txn.append(&notes, &b"n".to_vec())?;
        txn.commit()?;
    }
    {
        let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
        let ledger = loader.append_log("ledger", BytesCodec)?;
        let store = loader.open()?;
        let mut txn = store.begin()?;
        txn.append(&ledger, &b"l2".to_vec())?;
        txn.commit()?;
        assert!(store.snapshot().resources.contains_key("notes"));
    }
    let mut loader = AtomicStoreLoader::load(dir.path(), "bank")?;
    let notes = loader.append_log("notes", BytesCodec)?;
    let store = loader.open()?;
    assert_eq!(store.load_latest(&notes)?, b"n".to_vec());
    Ok(())
}

#[test]
fn synchronous_modes_commit_the_same_data() -> Result<()> {
    init_tracing();
    for mode in [Synchronous::Full, Synchronous::Normal, Synchronous::Off] {
        let dir = tempdir().expect("tmpdir");
        let options = StoreOptions {
            synchronous: mode,
            ..StoreOptions::default()
        };
        {
            let mut loader =
                AtomicStoreLoader::load_with_options(dir.path(), "bank", options.clone())?;
            let ledger = loader.append_log("ledger", BincodeCodec::<u8>::default())?;
            let store = loader.open()?;
            let mut txn = store.begin()?;
            for n in 0..10u8 {
                txn.append(&ledger, &n)?;
            }
            txn.commit()?;
        }
        let mut loader = AtomicStoreLoader::load_with_options(dir.path(), "bank", options)?;
        let ledger = loader.append_log("ledger", BincodeCodec::<u8>::default())?;
        let store = loader.open()?;
        let values = store.iter(&ledger)?.collect::<Result<Vec<_>>>()?;
        assert_eq!(values, (0..10).collect::<Vec<_>>(), "mode {}", mode.as_str());
    }
    Ok(())
}
