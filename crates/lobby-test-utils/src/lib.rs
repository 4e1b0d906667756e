//! # Lobby Test Utilities
//!
//! Shared test utilities for the lobby session controller.
//!
//! ## Modules
//!
//! - `mock_provider` - Scriptable backend with gated create/join and call recording
//! - `recording_observer` - Recording observer plus panicking observer and policy doubles
//! - `fixtures` - Members, configs and canned lobbies
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lobby_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let provider = MockLobbyProvider::builder(alice())
//!         .hold_enters()
//!         .build();
//!     let observer = RecordingObserver::new();
//!
//!     let (handle, _task) = SessionControllerBuilder::new(test_config()).spawn();
//!     handle.register_observer(observer.clone()).await.unwrap();
//!     handle.attach_provider(provider.clone()).await.unwrap();
//!
//!     // Start a create, then release the backend when ready
//!     provider.wait_for_enters_started(1).await;
//!     provider.release_enters();
//! }
//! ```

pub mod fixtures;
pub mod mock_provider;
pub mod recording_observer;

pub use fixtures::*;
pub use mock_provider::{MockHeartbeat, MockLobbyProvider, MockLobbyProviderBuilder};
pub use recording_observer::{
    PanickingObserver, PanickingPolicy, RecordingFailurePolicy, RecordingObserver,
};
