//! Stale-session ledger across controller restarts.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use lobby_controller::ledger::{FileLedger, MemoryLedger, StaleSessionLedger};
use lobby_controller::models::{CreateLobbyRequest, JoinLobbyRequest, LobbyId};
use lobby_controller::{SessionControllerBuilder, SessionControllerHandle};
use lobby_test_utils::{alice, bob, test_config, MockLobbyProvider};
use tokio::task::JoinHandle;

fn spawn_with_ledger(
    ledger: Arc<dyn StaleSessionLedger>,
) -> (SessionControllerHandle, JoinHandle<()>) {
    SessionControllerBuilder::new(test_config())
        .ledger(ledger)
        .spawn()
}

#[tokio::test]
async fn test_leftover_entry_is_flushed_on_attach() {
    let ledger = MemoryLedger::new();
    ledger
        .record("mock", &LobbyId::new("orphan"))
        .await
        .unwrap();

    let (handle, _task) = spawn_with_ledger(Arc::new(ledger.clone()));
    let provider = MockLobbyProvider::new(alice());
    handle.attach_provider(provider.clone()).await.unwrap();

    assert_eq!(provider.leaves(), vec![LobbyId::new("orphan")]);
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn test_entry_for_other_backend_is_kept() {
    let ledger = MemoryLedger::new();
    ledger
        .record("steam", &LobbyId::new("elsewhere"))
        .await
        .unwrap();

    let (handle, _task) = spawn_with_ledger(Arc::new(ledger.clone()));
    let provider = MockLobbyProvider::new(alice());
    handle.attach_provider(provider.clone()).await.unwrap();

    assert!(provider.leaves().is_empty());
    assert_eq!(ledger.get("steam"), Some(LobbyId::new("elsewhere")));
}

#[tokio::test]
async fn test_backend_can_opt_out_of_flush() {
    let ledger = MemoryLedger::new();
    ledger
        .record("mock", &LobbyId::new("orphan"))
        .await
        .unwrap();

    let (handle, _task) = spawn_with_ledger(Arc::new(ledger.clone()));
    let provider = MockLobbyProvider::builder(alice())
        .without_stale_flush()
        .build();
    handle.attach_provider(provider.clone()).await.unwrap();

    assert!(provider.leaves().is_empty());
    assert_eq!(ledger.get("mock"), Some(LobbyId::new("orphan")));
}

#[tokio::test]
async fn test_enter_records_and_leave_erases() {
    let ledger = MemoryLedger::new();
    let (handle, _task) = spawn_with_ledger(Arc::new(ledger.clone()));
    handle
        .attach_provider(MockLobbyProvider::new(alice()))
        .await
        .unwrap();

    let lobby_id = handle
        .create(CreateLobbyRequest::new(4))
        .await
        .unwrap()
        .unwrap()
        .lobby_id;
    assert_eq!(ledger.get("mock"), Some(lobby_id));

    assert!(handle.leave().await.unwrap());
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn test_failed_enter_records_nothing() {
    let ledger = MemoryLedger::new();
    let (handle, _task) = spawn_with_ledger(Arc::new(ledger.clone()));
    handle
        .attach_provider(
            MockLobbyProvider::builder(bob())
                .join_outcome(Err(lobby_controller::EnterFailure::InvalidId))
                .build(),
        )
        .await
        .unwrap();

    let result = handle
        .join(JoinLobbyRequest::new("lobby-1"))
        .await
        .unwrap();

    assert!(result.is_err());
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn test_crash_leaves_entry_for_next_run() {
    let ledger = MemoryLedger::new();

    let (first, task) = spawn_with_ledger(Arc::new(ledger.clone()));
    first
        .attach_provider(MockLobbyProvider::new(alice()))
        .await
        .unwrap();
    let lobby_id = first
        .create(CreateLobbyRequest::new(4))
        .await
        .unwrap()
        .unwrap()
        .lobby_id;

    // No clean leave
    task.abort();
    let _ = task.await;
    assert_eq!(ledger.get("mock"), Some(lobby_id.clone()));

    let (second, _task) = spawn_with_ledger(Arc::new(ledger.clone()));
    let provider = MockLobbyProvider::new(alice());
    second.attach_provider(provider.clone()).await.unwrap();

    assert_eq!(provider.leaves(), vec![lobby_id]);
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn test_file_ledger_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stale-sessions.json");

    let (first, task) = spawn_with_ledger(Arc::new(FileLedger::new(&path)));
    first
        .attach_provider(MockLobbyProvider::new(alice()))
        .await
        .unwrap();
    let lobby_id = first
        .create(CreateLobbyRequest::new(4))
        .await
        .unwrap()
        .unwrap()
        .lobby_id;
    task.abort();
    let _ = task.await;
    assert!(path.exists());

    // Fresh instance reading the same file
    let ledger = Arc::new(FileLedger::new(&path));
    let (second, _task) = spawn_with_ledger(ledger.clone());
    let provider = MockLobbyProvider::new(alice());
    second.attach_provider(provider.clone()).await.unwrap();

    assert_eq!(provider.leaves(), vec![lobby_id]);
    assert!(ledger.load("mock").await.unwrap().is_none());
}
