//! Pre-attach queueing, already-in-lobby decisions and failure hooks.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use lobby_controller::actors::{PreAttachPolicy, StayInCurrentLobby};
use lobby_controller::config::Config;
use lobby_controller::models::{CreateLobbyRequest, JoinLobbyRequest, LobbyId};
use lobby_controller::{EnterFailure, LobbyState, SessionControllerBuilder};
use lobby_test_utils::{
    alice, bob, test_config, MockLobbyProvider, PanickingPolicy, RecordingFailurePolicy,
    RecordingObserver,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use tokio::sync::mpsc;

fn counter(snapshotter: &Snapshotter, name: &str, labels: &[(&str, &str)]) -> u64 {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .find_map(|(key, _, _, value)| {
            let key = key.key();
            let hit = key.name() == name
                && labels
                    .iter()
                    .all(|(k, v)| key.labels().any(|l| l.key() == *k && l.value() == *v));
            match value {
                DebugValue::Counter(n) if hit => Some(n),
                _ => None,
            }
        })
        .unwrap_or(0)
}

// ============================================================================
// Before any backend is attached
// ============================================================================

#[tokio::test]
async fn test_enter_without_backend_is_rejected_by_default() {
    let (handle, _task) = SessionControllerBuilder::new(test_config()).spawn();

    assert_eq!(
        handle
            .join(JoinLobbyRequest::new("lobby-1"))
            .await
            .unwrap(),
        Err(EnterFailure::BackendNotInitialized)
    );
    assert_eq!(handle.state(), LobbyState::NotInLobby);
}

#[tokio::test]
async fn test_queued_enter_replays_after_attach() {
    let config = Config {
        pre_attach: PreAttachPolicy::Queue { max_pending: 1 },
        ..test_config()
    };
    let (handle, _task) = SessionControllerBuilder::new(config).spawn();

    let (results_tx, mut results) = mpsc::unbounded_channel();
    for _ in 0..2 {
        let handle = handle.clone();
        let results_tx = results_tx.clone();
        tokio::spawn(async move {
            let result = handle.create(CreateLobbyRequest::new(4)).await.unwrap();
            let _ = results_tx.send(result);
        });
    }

    // Only the overflow can be answered while nothing is attached
    let first = tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, Err(EnterFailure::BackendNotInitialized));

    let provider = MockLobbyProvider::new(alice());
    handle.attach_provider(provider.clone()).await.unwrap();

    let second = tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .unwrap()
        .unwrap();
    let entered = second.unwrap();
    assert_eq!(handle.session().lobby_id, Some(entered.lobby_id));
    assert_eq!(provider.enters_started(), 1);
}

#[tokio::test]
async fn test_shutdown_rejects_queued_enters() {
    let config = Config {
        pre_attach: PreAttachPolicy::Queue { max_pending: 1 },
        ..test_config()
    };
    let (handle, task) = SessionControllerBuilder::new(config).spawn();

    let (results_tx, mut results) = mpsc::unbounded_channel();
    for _ in 0..2 {
        let handle = handle.clone();
        let results_tx = results_tx.clone();
        tokio::spawn(async move {
            let _ = results_tx.send(handle.create(CreateLobbyRequest::new(4)).await);
        });
    }
    // The overflow answer proves the other request is queued
    let overflow = results.recv().await.unwrap();
    assert_eq!(overflow.unwrap(), Err(EnterFailure::BackendNotInitialized));

    handle.shutdown().await.unwrap();
    task.await.unwrap();

    let queued = results.recv().await.unwrap();
    assert_eq!(queued.unwrap(), Err(EnterFailure::BackendNotInitialized));
}

// ============================================================================
// Already in a lobby
// ============================================================================

#[tokio::test]
async fn test_default_policy_leaves_current_lobby_first() {
    let provider = MockLobbyProvider::new(alice());
    let (handle, _task) = SessionControllerBuilder::new(test_config()).spawn();
    let observer = RecordingObserver::new();
    handle.register_observer(observer.clone()).await.unwrap();
    handle.attach_provider(provider.clone()).await.unwrap();

    let first = handle
        .create(CreateLobbyRequest::new(4))
        .await
        .unwrap()
        .unwrap()
        .lobby_id;
    observer.clear();

    let second = handle
        .create(CreateLobbyRequest::new(4))
        .await
        .unwrap()
        .unwrap()
        .lobby_id;

    assert_ne!(first, second);
    assert_eq!(provider.leaves(), vec![first.clone()]);
    assert_eq!(handle.session().lobby_id, Some(second));
    assert_eq!(
        observer.events(),
        vec![
            format!("left:{first}:user_requested"),
            "enter_requested:create".to_string(),
            "enter_result:create:ok".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_stay_policy_keeps_current_lobby() {
    let provider = MockLobbyProvider::new(alice());
    let (handle, _task) = SessionControllerBuilder::new(test_config())
        .already_in_lobby_policy(Arc::new(StayInCurrentLobby))
        .spawn();
    handle.attach_provider(provider.clone()).await.unwrap();

    let current = handle
        .create(CreateLobbyRequest::new(4))
        .await
        .unwrap()
        .unwrap()
        .lobby_id;

    let refused = handle
        .join(JoinLobbyRequest::new(LobbyId::new("elsewhere")))
        .await
        .unwrap();

    assert_eq!(refused, Err(EnterFailure::General));
    assert_eq!(handle.state(), LobbyState::InLobby);
    assert_eq!(handle.session().lobby_id, Some(current));
    assert!(provider.leaves().is_empty());
    assert_eq!(provider.enters_started(), 1);
}

// ============================================================================
// Failure hooks
// ============================================================================

#[tokio::test]
async fn test_failure_policy_is_chosen_by_request_kind() {
    let create_policy = RecordingFailurePolicy::new();
    let join_policy = RecordingFailurePolicy::new();
    let (handle, _task) = SessionControllerBuilder::new(test_config())
        .create_failure_policy(create_policy.clone())
        .join_failure_policy(join_policy.clone())
        .spawn();
    handle
        .attach_provider(
            MockLobbyProvider::builder(bob())
                .join_outcome(Err(EnterFailure::InvalidId))
                .build(),
        )
        .await
        .unwrap();

    let result = handle
        .join(JoinLobbyRequest::new("bogus"))
        .await
        .unwrap();

    assert_eq!(result, Err(EnterFailure::InvalidId));
    assert_eq!(join_policy.failures(), vec![("join", EnterFailure::InvalidId)]);
    assert!(create_policy.failures().is_empty());
    assert_eq!(handle.state(), LobbyState::NotInLobby);
}

#[tokio::test]
async fn test_failure_policy_can_retry_through_handle() {
    let provider = MockLobbyProvider::builder(alice())
        .create_outcome(Err(EnterFailure::General))
        .build();
    let policy = RecordingFailurePolicy::new();
    let (handle, _task) = SessionControllerBuilder::new(test_config())
        .create_failure_policy(policy.clone())
        .spawn();
    handle.attach_provider(provider.clone()).await.unwrap();

    assert!(handle
        .create(CreateLobbyRequest::new(4))
        .await
        .unwrap()
        .is_err());
    assert_eq!(policy.failures(), vec![("create", EnterFailure::General)]);

    // The controller is back in a usable state for the retry
    provider.set_create_outcome(Ok(lobby_test_utils::entered_lobby(
        "retry-lobby",
        &alice(),
        &alice(),
        &[],
    )));
    let entered = handle
        .create(CreateLobbyRequest::new(4))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entered.lobby_id, LobbyId::new("retry-lobby"));
}

#[tokio::test]
async fn test_panicking_failure_policy_leaves_controller_running() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let _guard = metrics::set_default_local_recorder(&recorder);

    let (handle, _task) = SessionControllerBuilder::new(test_config())
        .join_failure_policy(Arc::new(PanickingPolicy))
        .spawn();
    handle
        .attach_provider(
            MockLobbyProvider::builder(alice())
                .join_outcome(Err(EnterFailure::InvalidId))
                .build(),
        )
        .await
        .unwrap();

    let result = handle
        .join(JoinLobbyRequest::new("bogus"))
        .await
        .unwrap();
    assert_eq!(result, Err(EnterFailure::InvalidId));
    assert_eq!(handle.state(), LobbyState::NotInLobby);
    assert_eq!(
        counter(
            &snapshotter,
            "lobby_policy_faults_total",
            &[("policy", "enter_failure")]
        ),
        1
    );

    // Still answering
    let entered = handle
        .create(CreateLobbyRequest::new(4))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(handle.session().lobby_id, Some(entered.lobby_id));
}

#[tokio::test]
async fn test_panicking_already_in_lobby_policy_rejects() {
    let provider = MockLobbyProvider::new(alice());
    let (handle, _task) = SessionControllerBuilder::new(test_config())
        .already_in_lobby_policy(Arc::new(PanickingPolicy))
        .spawn();
    handle.attach_provider(provider.clone()).await.unwrap();

    let current = handle
        .create(CreateLobbyRequest::new(4))
        .await
        .unwrap()
        .unwrap()
        .lobby_id;

    let refused = handle.create(CreateLobbyRequest::new(4)).await.unwrap();

    assert_eq!(refused, Err(EnterFailure::General));
    assert_eq!(handle.state(), LobbyState::InLobby);
    assert_eq!(handle.session().lobby_id, Some(current));
    assert!(provider.leaves().is_empty());
    assert!(handle.set_lobby_data("map", "harbor").await.unwrap());
}

// ============================================================================
// Metrics
// ============================================================================

#[tokio::test]
async fn test_rejected_enters_are_counted() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    // Current-thread runtime: the actor task records on this thread too
    let _guard = metrics::set_default_local_recorder(&recorder);

    let provider = MockLobbyProvider::builder(alice()).hold_enters().build();
    let (handle, _task) = SessionControllerBuilder::new(test_config())
        .already_in_lobby_policy(Arc::new(StayInCurrentLobby))
        .spawn();
    handle.attach_provider(provider.clone()).await.unwrap();

    let creating = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.create(CreateLobbyRequest::new(4)).await })
    };
    provider.wait_for_enters_started(1).await;

    // Second enter while the first is still Joining
    let busy = handle.create(CreateLobbyRequest::new(4)).await.unwrap();
    assert_eq!(busy, Err(EnterFailure::General));

    provider.release_enters();
    creating.await.unwrap().unwrap().unwrap();

    // Vetoed while InLobby
    let vetoed = handle.create(CreateLobbyRequest::new(4)).await.unwrap();
    assert_eq!(vetoed, Err(EnterFailure::General));

    let enters = |outcome: &str| {
        counter(
            &snapshotter,
            "lobby_enter_total",
            &[("kind", "create"), ("outcome", outcome)],
        )
    };
    assert_eq!(enters("general"), 2);
    assert_eq!(enters("success"), 1);
}
