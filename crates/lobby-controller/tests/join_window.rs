//! Backend events that race a create/join completion.
//!
//! The mock backend is held mid-enter, emits lobby events, then lets the
//! enter finish. Events for the lobby being entered must land in the cache
//! no matter which of the two reaches the controller first.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use lobby_controller::models::{
    CreateLobbyRequest, EnterResult, JoinLobbyRequest, LobbyId, Member,
};
use lobby_controller::provider::ProviderEvent;
use lobby_controller::{
    EnterFailure, LobbyError, LobbyState, SessionControllerBuilder, SessionControllerHandle,
    SessionSnapshot,
};
use lobby_test_utils::{
    alice, bob, carol, entered_lobby, test_config, MockLobbyProvider, RecordingObserver,
};
use tokio::task::JoinHandle;

async fn attached(provider: Arc<MockLobbyProvider>) -> SessionControllerHandle {
    let (handle, _task) = SessionControllerBuilder::new(test_config()).spawn();
    handle.attach_provider(provider).await.unwrap();
    handle
}

fn start_create(handle: &SessionControllerHandle) -> JoinHandle<Result<EnterResult, LobbyError>> {
    let handle = handle.clone();
    tokio::spawn(async move { handle.create(CreateLobbyRequest::new(4)).await })
}

async fn wait_until<F>(handle: &SessionControllerHandle, mut predicate: F)
where
    F: FnMut(&SessionSnapshot) -> bool,
{
    let mut updates = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(5), updates.wait_for(|s| predicate(&**s)))
        .await
        .expect("timed out waiting for snapshot")
        .expect("controller stopped");
}

fn member_joined(lobby_id: &str, member: Member) -> ProviderEvent {
    ProviderEvent::MemberJoined {
        lobby_id: LobbyId::new(lobby_id),
        member,
        member_data: Default::default(),
    }
}

#[tokio::test]
async fn test_member_joined_during_create_is_applied() {
    let provider = MockLobbyProvider::builder(alice())
        .hold_enters()
        .create_outcome(Ok(entered_lobby("lobby-1", &alice(), &alice(), &[])))
        .build();
    let (handle, _task) = SessionControllerBuilder::new(test_config()).spawn();
    let observer = RecordingObserver::new();
    handle.register_observer(observer.clone()).await.unwrap();
    handle.attach_provider(provider.clone()).await.unwrap();

    let creating = start_create(&handle);
    provider.wait_for_enters_started(1).await;

    // Carol joined after the backend took its snapshot
    assert!(provider.emit(member_joined("lobby-1", carol())));
    provider.release_enters();
    creating.await.unwrap().unwrap().unwrap();

    wait_until(&handle, |s| s.members.contains(&carol())).await;
    assert_eq!(handle.session().members, vec![alice(), carol()]);
    assert_eq!(handle.state(), LobbyState::InLobby);

    observer.wait_for("member_joined:carol").await;
    let events = observer.events();
    let entered = events
        .iter()
        .position(|e| e == "enter_result:create:ok")
        .unwrap();
    let joined = events
        .iter()
        .position(|e| e == "member_joined:carol")
        .unwrap();
    assert!(entered < joined);
}

#[tokio::test]
async fn test_owner_and_data_updates_during_join_are_applied() {
    let provider = MockLobbyProvider::builder(bob())
        .hold_enters()
        .join_owner(alice())
        .build();
    let handle = attached(provider.clone()).await;

    let joining = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.join(JoinLobbyRequest::new("lobby-1")).await })
    };
    provider.wait_for_enters_started(1).await;

    assert!(provider.emit(ProviderEvent::OwnerUpdated {
        lobby_id: LobbyId::new("lobby-1"),
        owner: bob(),
    }));
    assert!(provider.emit(ProviderEvent::LobbyDataUpdated {
        lobby_id: LobbyId::new("lobby-1"),
        key: "map".to_string(),
        value: "harbor".to_string(),
    }));
    provider.release_enters();
    joining.await.unwrap().unwrap().unwrap();

    wait_until(&handle, |s| {
        s.owner == bob() && s.lobby_data_or_default("map", "") == "harbor"
    })
    .await;
    assert!(handle.is_owner());
    assert!(handle.kick_member(alice()).await.unwrap());
    assert_eq!(provider.kicks(), vec![alice()]);
}

#[tokio::test]
async fn test_events_for_another_lobby_during_create_are_dropped() {
    let provider = MockLobbyProvider::builder(alice())
        .hold_enters()
        .create_outcome(Ok(entered_lobby("lobby-1", &alice(), &alice(), &[])))
        .build();
    let handle = attached(provider.clone()).await;

    let creating = start_create(&handle);
    provider.wait_for_enters_started(1).await;
    assert!(provider.emit(member_joined("elsewhere", carol())));
    provider.release_enters();
    creating.await.unwrap().unwrap().unwrap();

    // Events are handled in order, so bob landing means carol's was handled
    assert!(provider.emit(member_joined("lobby-1", bob())));
    wait_until(&handle, |s| s.members.contains(&bob())).await;

    assert_eq!(handle.session().members, vec![alice(), bob()]);
}

#[tokio::test]
async fn test_events_held_by_failed_create_are_discarded() {
    let provider = MockLobbyProvider::builder(alice())
        .hold_enters()
        .create_outcome(Err(EnterFailure::General))
        .build();
    let handle = attached(provider.clone()).await;

    let creating = start_create(&handle);
    provider.wait_for_enters_started(1).await;
    assert!(provider.emit(member_joined("lobby-1", carol())));
    provider.release_enters();
    assert_eq!(
        creating.await.unwrap().unwrap(),
        Err(EnterFailure::General)
    );

    // A later enter into a different lobby must not inherit carol
    provider.set_create_outcome(Ok(entered_lobby("lobby-2", &alice(), &alice(), &[])));
    let entered = handle
        .create(CreateLobbyRequest::new(4))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entered.lobby_id, LobbyId::new("lobby-2"));

    assert!(provider.emit(member_joined("lobby-2", bob())));
    wait_until(&handle, |s| s.members.contains(&bob())).await;
    assert_eq!(handle.session().members, vec![alice(), bob()]);
}
