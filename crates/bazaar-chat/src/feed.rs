//! Chat data source: pumps the realtime room feed into the [`RoomStore`].

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bazaar_shared::{ChatError, RoomId, UserId};

use crate::backend::RoomFeed;
use crate::store::{FeedState, RoomStore};

/// Deterministic, order-independent room key. No server round-trip needed.
pub fn room_id(a: UserId, b: UserId) -> RoomId {
    RoomId::for_pair(a, b)
}

pub struct ChatDataSource {
    feed: Arc<dyn RoomFeed>,
    store: RoomStore,
}

impl ChatDataSource {
    pub fn new(feed: Arc<dyn RoomFeed>, store: RoomStore) -> Self {
        Self { feed, store }
    }

    pub fn store(&self) -> &RoomStore {
        &self.store
    }

    /// Connect the feed for the store's user and stream `Loading`, `Error`
    /// or `Data` states. Rooms the user does not take part in are dropped.
    ///
    /// Dropping the subscription disconnects the feed; subscribing again
    /// starts over from `Loading`.
    pub fn subscribe_rooms(&self) -> RoomsSubscription {
        let rx = self.store.subscribe();
        self.store.set_loading();

        let feed = self.feed.clone();
        let store = self.store.clone();
        let task = tokio::spawn(async move {
            pump(feed, store).await;
        });

        RoomsSubscription { rx, task }
    }
}

async fn pump(feed: Arc<dyn RoomFeed>, store: RoomStore) {
    let user = store.current_user();
    let mut events = match feed.connect(user).await {
        Ok(events) => events,
        Err(e) => {
            warn!(user = %user, error = %e, "room feed connection failed");
            store.set_error(e.to_string());
            return;
        }
    };

    info!(user = %user, "room feed connected");
    while let Some(event) = events.recv().await {
        debug!(?event, "room feed event");
        store.apply_feed(event);
    }

    warn!(user = %user, "room feed closed");
    store.set_error(ChatError::FeedConnectionLost("room feed closed".to_string()).to_string());
}

/// Live stream of [`FeedState`]. Disconnects the feed on drop.
pub struct RoomsSubscription {
    rx: watch::Receiver<FeedState>,
    task: JoinHandle<()>,
}

impl RoomsSubscription {
    pub fn current(&self) -> FeedState {
        self.rx.borrow().clone()
    }

    /// Wait for the next state. `None` once the store is gone.
    pub async fn next(&mut self) -> Option<FeedState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// A further receiver over the same stream, e.g. for the projection.
    pub fn receiver(&self) -> watch::Receiver<FeedState> {
        self.rx.clone()
    }
}

impl Drop for RoomsSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FeedEvent;
    use crate::memory::MemoryBackend;
    use bazaar_shared::Room;

    #[test]
    fn test_room_id_symmetry() {
        for a in 0..20u64 {
            for b in 0..20u64 {
                assert_eq!(room_id(UserId(a), UserId(b)), room_id(UserId(b), UserId(a)));
            }
        }
    }

    #[tokio::test]
    async fn test_subscription_goes_from_loading_to_data() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert_room(Room::new(UserId(5), UserId(9)));
        backend.insert_room(Room::new(UserId(7), UserId(9)));

        let source = ChatDataSource::new(backend.clone(), RoomStore::new(UserId(5)));
        let mut rooms = source.subscribe_rooms();
        assert!(rooms.current().is_loading());

        let state = loop {
            match rooms.next().await {
                Some(FeedState::Data(map)) => break map,
                Some(_) => continue,
                None => panic!("stream ended"),
            }
        };
        assert_eq!(state.len(), 1);
        assert!(state.contains_key(&room_id(UserId(9), UserId(5))));
    }

    #[tokio::test]
    async fn test_feed_loss_surfaces_as_error_state() {
        let backend = Arc::new(MemoryBackend::new());
        let source = ChatDataSource::new(backend.clone(), RoomStore::new(UserId(5)));
        let mut rooms = source.subscribe_rooms();

        while !matches!(rooms.next().await, Some(FeedState::Data(_))) {}
        backend.broadcast(FeedEvent::Disconnected("network down".into()));

        loop {
            match rooms.next().await {
                Some(FeedState::Error(reason)) => {
                    assert!(reason.contains("network down"));
                    break;
                }
                Some(_) => continue,
                None => panic!("stream ended"),
            }
        }
    }
}
