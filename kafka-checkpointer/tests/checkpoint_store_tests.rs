use std::sync::Arc;

use futures::future::join_all;
use kafka_checkpointer::checkpoint::{
    CheckpointStore, LocalCheckpointStore, MemoryCheckpointStore,
};
use kafka_checkpointer::kafka::types::Partition;
use rstest::rstest;
use tempfile::TempDir;

#[derive(Debug, Clone, Copy)]
enum Backend {
    Memory,
    Local,
}

// the TempDir must outlive the store
fn open(backend: Backend) -> (Arc<dyn CheckpointStore>, TempDir) {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn CheckpointStore> = match backend {
        Backend::Memory => Arc::new(MemoryCheckpointStore::new()),
        Backend::Local => Arc::new(LocalCheckpointStore::new(dir.path())),
    };
    (store, dir)
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::local(Backend::Local)]
#[tokio::test]
async fn test_unknown_partition_has_no_checkpoint(#[case] backend: Backend) {
    let (store, _dir) = open(backend);

    assert_eq!(store.read(&Partition::new("events", 3)).await.unwrap(), None);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::local(Backend::Local)]
#[tokio::test]
async fn test_persist_is_idempotent(#[case] backend: Backend) {
    let (store, _dir) = open(backend);
    let partition = Partition::new("events", 0);

    store.persist(&partition, 42).await.unwrap();
    store.persist(&partition, 42).await.unwrap();

    assert_eq!(store.read(&partition).await.unwrap(), Some(42));
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::local(Backend::Local)]
#[tokio::test]
async fn test_persist_never_moves_backwards(#[case] backend: Backend) {
    let (store, _dir) = open(backend);
    let partition = Partition::new("events", 0);

    store.persist(&partition, 10).await.unwrap();
    store.persist(&partition, 25).await.unwrap();
    store.persist(&partition, 7).await.unwrap();

    assert_eq!(store.read(&partition).await.unwrap(), Some(25));
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::local(Backend::Local)]
#[tokio::test]
async fn test_partitions_are_independent(#[case] backend: Backend) {
    let (store, _dir) = open(backend);

    store.persist(&Partition::new("events", 0), 5).await.unwrap();
    store.persist(&Partition::new("events", 1), 9).await.unwrap();
    store.persist(&Partition::new("other", 0), 1).await.unwrap();

    assert_eq!(store.read(&Partition::new("events", 0)).await.unwrap(), Some(5));
    assert_eq!(store.read(&Partition::new("events", 1)).await.unwrap(), Some(9));
    assert_eq!(store.read(&Partition::new("other", 0)).await.unwrap(), Some(1));
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::local(Backend::Local)]
#[tokio::test]
async fn test_concurrent_persists_keep_highest(#[case] backend: Backend) {
    let (store, _dir) = open(backend);
    let partition = Partition::new("events", 0);

    let writes = (1..=20).map(|offset| {
        let store = store.clone();
        let partition = partition.clone();
        async move { store.persist(&partition, offset).await }
    });
    for result in join_all(writes).await {
        result.unwrap();
    }

    assert_eq!(store.read(&partition).await.unwrap(), Some(20));
}

#[tokio::test]
async fn test_local_entries_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let partition = Partition::new("events", 2);

    LocalCheckpointStore::new(dir.path())
        .persist(&partition, 300)
        .await
        .unwrap();

    let reopened = LocalCheckpointStore::new(dir.path());
    assert_eq!(reopened.read(&partition).await.unwrap(), Some(300));
    assert!(dir.path().join("events").join("2.json").exists());
}
