//! Observer registration, isolation and capability resets.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::sync::Arc;
use std::time::Duration;

use lobby_controller::models::{CreateLobbyRequest, JoinLobbyRequest};
use lobby_controller::provider::ProviderEvent;
use lobby_controller::{SessionControllerBuilder, SessionControllerHandle};
use lobby_test_utils::{
    alice, bob, carol, test_config, MockLobbyProvider, PanickingObserver, RecordingObserver,
};

async fn attached(provider: Arc<MockLobbyProvider>) -> SessionControllerHandle {
    let (handle, _task) = SessionControllerBuilder::new(test_config()).spawn();
    handle.attach_provider(provider).await.unwrap();
    handle
}

#[tokio::test]
async fn test_late_registration_receives_existing_lobby() {
    let handle = attached(MockLobbyProvider::new(alice())).await;
    let lobby_id = handle
        .create(CreateLobbyRequest::new(4))
        .await
        .unwrap()
        .unwrap()
        .lobby_id;

    let late = RecordingObserver::new();
    handle.register_observer(late.clone()).await.unwrap();

    assert_eq!(late.events(), vec![format!("existing_lobby:{lobby_id}")]);
}

#[tokio::test]
async fn test_registration_outside_lobby_is_silent() {
    let handle = attached(MockLobbyProvider::new(alice())).await;

    let observer = RecordingObserver::new();
    handle.register_observer(observer.clone()).await.unwrap();

    assert!(observer.events().is_empty());
}

#[tokio::test]
async fn test_panicking_observer_does_not_block_others() {
    let provider = MockLobbyProvider::new(alice());
    let handle = attached(provider.clone()).await;
    handle
        .register_observer(Arc::new(PanickingObserver))
        .await
        .unwrap();
    let observer = RecordingObserver::new();
    handle.register_observer(observer.clone()).await.unwrap();

    let lobby_id = handle
        .create(CreateLobbyRequest::new(4))
        .await
        .unwrap()
        .unwrap()
        .lobby_id;
    assert!(observer.contains("enter_result:create:ok"));

    provider.emit(ProviderEvent::MemberJoined {
        lobby_id,
        member: bob(),
        member_data: Default::default(),
    });
    observer.wait_for("member_joined:bob").await;

    // The controller task survived both panics
    assert!(handle.set_lobby_data("map", "harbor").await.unwrap());
    assert_eq!(handle.session().members, vec![alice(), bob()]);
}

#[tokio::test]
async fn test_unregistered_observer_stops_receiving() {
    let provider = MockLobbyProvider::new(alice());
    let handle = attached(provider.clone()).await;
    let observer = RecordingObserver::new();
    let id = handle.register_observer(observer.clone()).await.unwrap();
    let lobby_id = handle
        .create(CreateLobbyRequest::new(4))
        .await
        .unwrap()
        .unwrap()
        .lobby_id;

    assert!(handle.unregister_observer(id).await.unwrap());
    assert!(!handle.unregister_observer(id).await.unwrap());
    observer.clear();

    provider.emit(ProviderEvent::MemberJoined {
        lobby_id,
        member: carol(),
        member_data: Default::default(),
    });
    let mut updates = handle.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        updates.wait_for(|s| s.members.contains(&carol())),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(observer.events().is_empty());
}

#[tokio::test]
async fn test_reset_carries_capability_set() {
    let (handle, _task) = SessionControllerBuilder::new(test_config()).spawn();
    let observer = RecordingObserver::new();
    handle.register_observer(observer.clone()).await.unwrap();

    handle
        .attach_provider(MockLobbyProvider::new(alice()))
        .await
        .unwrap();
    handle
        .attach_provider(
            MockLobbyProvider::builder(alice())
                .backend_type("mock-hb")
                .with_heartbeat()
                .build(),
        )
        .await
        .unwrap();
    handle.detach_provider().await.unwrap();

    let resets = observer.resets();
    assert_eq!(resets.len(), 3);

    assert_eq!(resets[0].backend_type.as_deref(), Some("mock"));
    assert!(!resets[0].heartbeat);

    assert_eq!(resets[1].backend_type.as_deref(), Some("mock-hb"));
    assert!(resets[1].heartbeat);

    assert_eq!(resets[2].backend_type, None);
    assert!(!resets[2].heartbeat);
}

#[tokio::test]
async fn test_enter_notifications_are_ordered() {
    let (handle, _task) = SessionControllerBuilder::new(test_config()).spawn();
    let observer = RecordingObserver::new();
    handle.register_observer(observer.clone()).await.unwrap();
    handle
        .attach_provider(MockLobbyProvider::builder(bob()).join_owner(alice()).build())
        .await
        .unwrap();
    observer.clear();

    handle
        .join(JoinLobbyRequest::new("lobby-1"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        observer.events(),
        vec![
            "enter_requested:join".to_string(),
            "enter_result:join:ok".to_string(),
        ]
    );
}
