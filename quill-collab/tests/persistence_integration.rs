//! Sessions backed by the RocksDB document store.

use quill_collab::{
    DocumentStore, Identity, LocalHub, PersistenceStore, SessionConfig, SessionEvent,
    SyncCoordinator, SyncState, StoreConfig,
};
use quill_text::codec;
use quill_text::{ReplicaId, TextDoc};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

fn open_store(dir: &TempDir) -> Arc<DocumentStore> {
    Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap())
}

fn text_of(bytes: &[u8]) -> String {
    let mut doc = TextDoc::new(ReplicaId(999));
    doc.integrate(&codec::decode_delta(bytes).unwrap());
    doc.materialize()
}

#[tokio::test]
async fn test_session_saves_to_rocksdb() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let hub = LocalHub::new(64);
    let doc_id = Uuid::new_v4();

    let coordinator = SyncCoordinator::new(
        doc_id,
        Identity::new("a", "A"),
        Arc::new(hub.endpoint()),
        store.clone(),
        SessionConfig::for_testing(),
    );
    let mut events = coordinator.subscribe();
    let session = coordinator.start().await.unwrap();

    session.insert(0, "durable text").await.unwrap();
    timeout(WAIT, async {
        loop {
            if let Ok(SessionEvent::Saved) = events.recv().await {
                return;
            }
        }
    })
    .await
    .expect("never saved");

    let stored = store.load(doc_id).await.unwrap().unwrap();
    assert_eq!(text_of(&stored), "durable text");

    let meta = store.load_metadata(doc_id).unwrap();
    assert_eq!(meta.doc_id, doc_id);
    assert_eq!(meta.snapshot_size, stored.len() as u64);
    assert!(meta.save_count >= 1);
}

#[tokio::test]
async fn test_reopened_store_restores_document() {
    let dir = TempDir::new().unwrap();
    let doc_id = Uuid::new_v4();
    let mut config = SessionConfig::for_testing();
    config.persist_debounce = Duration::from_secs(60);

    {
        let store = open_store(&dir);
        let hub = LocalHub::new(64);
        let session =
            SyncCoordinator::open(doc_id, Identity::new("a", "A"), Arc::new(hub.endpoint()), store, config.clone())
                .await
                .unwrap();
        session.insert(0, "written before restart").await.unwrap();
        session.delete(0, 7).await.unwrap();
        // Only the close-time save can have stored this.
        session.close().await.unwrap();
    }

    let store = open_store(&dir);
    let hub = LocalHub::new(64);
    let session = SyncCoordinator::open(doc_id, Identity::new("b", "B"), Arc::new(hub.endpoint()), store, config)
        .await
        .unwrap();
    assert_eq!(session.text().await.unwrap(), " before restart");

    // The restored document keeps accepting edits from a new replica.
    session.insert(0, "Still ").await.unwrap();
    assert_eq!(session.text().await.unwrap(), "Still  before restart");
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_seed_is_stored_once() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let hub = LocalHub::new(64);
    let doc_id = Uuid::new_v4();
    let mut config = SessionConfig::for_testing();
    config.seed_text = Some("# Notes".into());

    let first = SyncCoordinator::open(doc_id, Identity::new("a", "A"), Arc::new(hub.endpoint()), store.clone(), config.clone())
        .await
        .unwrap();
    first.insert(7, "\n").await.unwrap();
    first.close().await.unwrap();

    // A later session starts from the stored copy, not a fresh seed.
    let second = SyncCoordinator::open(doc_id, Identity::new("b", "B"), Arc::new(hub.endpoint()), store.clone(), config)
        .await
        .unwrap();
    timeout(WAIT, second.wait_for_state(SyncState::Synced)).await.unwrap().unwrap();
    assert_eq!(second.text().await.unwrap(), "# Notes\n");
}

#[tokio::test]
async fn test_documents_are_isolated() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let hub = LocalHub::new(64);
    let mut config = SessionConfig::for_testing();
    config.persist_debounce = Duration::from_secs(60);

    let first_id = Uuid::new_v4();
    let second_id = Uuid::new_v4();
    for (doc_id, text) in [(first_id, "first"), (second_id, "second")] {
        let session =
            SyncCoordinator::open(doc_id, Identity::new("a", "A"), Arc::new(hub.endpoint()), store.clone(), config.clone())
                .await
                .unwrap();
        session.insert(0, text).await.unwrap();
        session.close().await.unwrap();
    }

    assert_eq!(text_of(&store.load(first_id).await.unwrap().unwrap()), "first");
    assert_eq!(text_of(&store.load(second_id).await.unwrap().unwrap()), "second");
}
