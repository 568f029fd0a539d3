//! Room/message state: authoritative feed plus optimistic overlay.
//!
//! [`RoomStore`] is the single piece of shared mutable chat state. It keeps
//! what the feed delivered apart from what this client did optimistically
//! (pending sends, seen flags, retractions) and publishes the merged view on
//! a `watch` channel. Every mutation rebuilds and publishes the view inside
//! the same critical section, so observers only ever see complete updates.
//!
//! Only the feed pump ([`crate::feed`]) and the mutation layer
//! ([`crate::messages`]) write to it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, info};

use bazaar_shared::{ChatError, Delivery, Message, MessageId, Result, Room, RoomId, UserId};

use crate::backend::FeedEvent;
use crate::debounce::lock;

/// Rooms keyed by id, as published to consumers.
pub type RoomMap = Arc<BTreeMap<RoomId, Room>>;

/// What a rooms subscriber sees at any moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedState {
    Loading,
    Error(String),
    Data(RoomMap),
}

impl FeedState {
    pub fn rooms(&self) -> Option<&RoomMap> {
        match self {
            FeedState::Data(rooms) => Some(rooms),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, FeedState::Loading)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FeedStatus {
    Loading,
    Live,
    Error(String),
}

struct StoreInner {
    me: UserId,
    status: FeedStatus,
    /// Exactly what the feed delivered.
    rooms: BTreeMap<RoomId, Room>,
    /// Sends not yet reflected by the feed, in send order.
    pending: BTreeMap<RoomId, Vec<Message>>,
    /// Ids flipped to seen locally, awaiting the feed.
    seen: HashMap<RoomId, HashSet<MessageId>>,
    /// Ids retracted locally, awaiting the feed.
    retracted: HashMap<RoomId, HashSet<MessageId>>,
}

/// Shared handle to the chat state of one signed-in user.
#[derive(Clone)]
pub struct RoomStore {
    inner: Arc<Mutex<StoreInner>>,
    tx: Arc<watch::Sender<FeedState>>,
}

impl RoomStore {
    pub fn new(me: UserId) -> Self {
        let (tx, _) = watch::channel(FeedState::Loading);
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                me,
                status: FeedStatus::Loading,
                rooms: BTreeMap::new(),
                pending: BTreeMap::new(),
                seen: HashMap::new(),
                retracted: HashMap::new(),
            })),
            tx: Arc::new(tx),
        }
    }

    pub fn current_user(&self) -> UserId {
        lock(&self.inner).me
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedState> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> FeedState {
        self.tx.borrow().clone()
    }

    /// Merged view of one room, whatever the feed status.
    pub fn room(&self, room_id: &RoomId) -> Option<Room> {
        let inner = lock(&self.inner);
        inner.merged_room(room_id)
    }

    // -- feed side ----------------------------------------------------------

    pub(crate) fn set_loading(&self) {
        let mut inner = lock(&self.inner);
        inner.status = FeedStatus::Loading;
        self.publish(&inner);
    }

    pub(crate) fn set_error(&self, reason: String) {
        let mut inner = lock(&self.inner);
        inner.status = FeedStatus::Error(reason);
        self.publish(&inner);
    }

    pub(crate) fn apply_feed(&self, event: FeedEvent) {
        let mut inner = lock(&self.inner);
        match event {
            FeedEvent::Snapshot(rooms) => {
                let me = inner.me;
                inner.rooms = rooms
                    .into_iter()
                    .filter(|room| room.includes(me))
                    .map(|room| (room.room_id.clone(), room))
                    .collect();
                inner.status = FeedStatus::Live;
                let ids: Vec<RoomId> = inner.rooms.keys().cloned().collect();
                for id in &ids {
                    inner.reconcile(id);
                }
                debug!(rooms = inner.rooms.len(), "applied room snapshot");
            }
            FeedEvent::RoomChanged(room) => {
                if !room.includes(inner.me) {
                    return;
                }
                let id = room.room_id.clone();
                inner.rooms.insert(id.clone(), room);
                inner.reconcile(&id);
                if inner.status != FeedStatus::Live {
                    debug!(room = %id, "room feed live again");
                    inner.status = FeedStatus::Live;
                }
            }
            FeedEvent::Disconnected(reason) => {
                info!(%reason, "room feed disconnected");
                inner.status = FeedStatus::Error(ChatError::FeedConnectionLost(reason).to_string());
            }
        }
        self.publish(&inner);
    }

    // -- optimistic sends ---------------------------------------------------

    pub(crate) fn push_pending(&self, room_id: &RoomId, message: Message) {
        let mut inner = lock(&self.inner);
        inner.pending.entry(room_id.clone()).or_default().push(message);
        self.publish(&inner);
    }

    /// The send endpoint returned the stored copy of `provisional`.
    pub(crate) fn confirm_pending(&self, room_id: &RoomId, provisional: &MessageId, persisted: Message) {
        let mut inner = lock(&self.inner);
        if let Some(entry) = inner
            .pending
            .get_mut(room_id)
            .and_then(|list| list.iter_mut().find(|m| &m.id == provisional))
        {
            *entry = Message {
                delivery: Delivery::Sent,
                ..persisted
            };
        }
        inner.reconcile(room_id);
        self.publish(&inner);
    }

    pub(crate) fn fail_pending(&self, room_id: &RoomId, id: &MessageId) {
        let mut inner = lock(&self.inner);
        if let Some(entry) = inner.pending_mut(room_id, id) {
            entry.delivery = Delivery::Failed;
        }
        self.publish(&inner);
    }

    /// Move a failed send back to pending and hand out a copy to re-send.
    pub(crate) fn take_failed(&self, room_id: &RoomId, id: &MessageId) -> Result<Message> {
        let mut inner = lock(&self.inner);
        let entry = inner
            .pending_mut(room_id, id)
            .filter(|m| m.delivery == Delivery::Failed)
            .ok_or_else(|| ChatError::MessageNotFound(id.clone()))?;
        entry.delivery = Delivery::Pending;
        let copy = entry.clone();
        self.publish(&inner);
        Ok(copy)
    }

    // -- seen ----------------------------------------------------------------

    /// Flip every message `viewer` has not seen yet. Returns the flipped ids.
    pub(crate) fn mark_seen_local(&self, room_id: &RoomId, viewer: UserId) -> Vec<MessageId> {
        let mut inner = lock(&self.inner);
        let Some(room) = inner.merged_room(room_id) else {
            return Vec::new();
        };
        let flipped: Vec<MessageId> = room
            .messages
            .iter()
            .filter(|m| m.is_unread_for(viewer))
            .map(|m| m.id.clone())
            .collect();
        if flipped.is_empty() {
            return flipped;
        }
        inner
            .seen
            .entry(room_id.clone())
            .or_default()
            .extend(flipped.iter().cloned());
        self.publish(&inner);
        flipped
    }

    pub(crate) fn rollback_seen(&self, room_id: &RoomId, ids: &[MessageId]) {
        let mut inner = lock(&self.inner);
        if let Some(set) = inner.seen.get_mut(room_id) {
            for id in ids {
                set.remove(id);
            }
        }
        self.publish(&inner);
    }

    // -- retraction ----------------------------------------------------------

    /// Retract locally. `Ok(false)` when the message already was retracted.
    pub(crate) fn retract_local(&self, room_id: &RoomId, id: &MessageId, caller: UserId) -> Result<bool> {
        let mut inner = lock(&self.inner);
        let room = inner
            .merged_room(room_id)
            .ok_or_else(|| ChatError::RoomNotFound(room_id.clone()))?;
        let message = room
            .find(id)
            .ok_or_else(|| ChatError::MessageNotFound(id.clone()))?;

        if message.author != caller {
            return Err(ChatError::NotAuthorized {
                caller,
                message_id: id.clone(),
            });
        }
        if message.delivery != Delivery::Sent {
            return Err(ChatError::Validation(
                "message has not been delivered yet".to_string(),
            ));
        }
        if message.retracted {
            return Ok(false);
        }

        inner
            .retracted
            .entry(room_id.clone())
            .or_default()
            .insert(id.clone());
        self.publish(&inner);
        Ok(true)
    }

    pub(crate) fn rollback_retract(&self, room_id: &RoomId, id: &MessageId) {
        let mut inner = lock(&self.inner);
        if let Some(set) = inner.retracted.get_mut(room_id) {
            set.remove(id);
        }
        self.publish(&inner);
    }

    fn publish(&self, inner: &StoreInner) {
        let state = match &inner.status {
            FeedStatus::Loading => FeedState::Loading,
            FeedStatus::Error(reason) => FeedState::Error(reason.clone()),
            FeedStatus::Live => FeedState::Data(Arc::new(inner.merged_rooms())),
        };
        self.tx.send_replace(state);
    }
}

impl StoreInner {
    fn pending_mut(&mut self, room_id: &RoomId, id: &MessageId) -> Option<&mut Message> {
        self.pending
            .get_mut(room_id)?
            .iter_mut()
            .find(|m| &m.id == id)
    }

    /// Drop overlay entries the authoritative copy of `room_id` already covers.
    fn reconcile(&mut self, room_id: &RoomId) {
        let Some(room) = self.rooms.get(room_id) else {
            return;
        };

        if let Some(list) = self.pending.get_mut(room_id) {
            let before = list.len();
            list.retain(|p| {
                !room.messages.iter().any(|m| {
                    m.id == p.id
                        || (m.author == p.author && m.body == p.body && m.timestamp == p.timestamp)
                })
            });
            if list.len() != before {
                debug!(room = %room_id, settled = before - list.len(), "pending sends reconciled");
            }
            if list.is_empty() {
                self.pending.remove(room_id);
            }
        }

        if let Some(set) = self.seen.get_mut(room_id) {
            set.retain(|id| room.find(id).map_or(true, |m| !m.seen));
            if set.is_empty() {
                self.seen.remove(room_id);
            }
        }

        if let Some(set) = self.retracted.get_mut(room_id) {
            set.retain(|id| room.find(id).map_or(true, |m| !m.retracted));
            if set.is_empty() {
                self.retracted.remove(room_id);
            }
        }
    }

    fn merged_room(&self, room_id: &RoomId) -> Option<Room> {
        let pending = self.pending.get(room_id);
        let mut room = match self.rooms.get(room_id) {
            Some(room) => room.clone(),
            None => {
                // A first send into a conversation the feed has not created yet.
                let [a, b] = room_id.participants()?;
                pending?;
                Room::new(a, b)
            }
        };

        let seen = self.seen.get(room_id);
        let retracted = self.retracted.get(room_id);
        let mut touched = false;

        if let Some(list) = pending {
            room.messages.extend(list.iter().cloned());
            // Stable, so feed order wins on equal timestamps. A failed send
            // must not stay pinned below newer incoming messages.
            room.messages.sort_by_key(|m| m.timestamp);
            touched = true;
        }
        for message in &mut room.messages {
            if seen.is_some_and(|s| s.contains(&message.id)) {
                message.seen = true;
            }
            if retracted.is_some_and(|s| s.contains(&message.id)) {
                message.retract();
                touched = true;
            }
        }
        if touched {
            room.touch_last_message();
        }
        Some(room)
    }

    fn merged_rooms(&self) -> BTreeMap<RoomId, Room> {
        let ids: HashSet<&RoomId> = self.rooms.keys().chain(self.pending.keys()).collect();
        ids.into_iter()
            .filter_map(|id| self.merged_room(id).map(|room| (id.clone(), room)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bazaar_shared::MessageKind;
    use chrono::{Duration, Utc};

    fn incoming(id: &str, author: u64, body: &str, secs: i64) -> Message {
        Message {
            id: MessageId::from(id),
            author: UserId(author),
            body: body.to_string(),
            timestamp: Utc::now() - Duration::seconds(secs),
            seen: false,
            retracted: false,
            kind: MessageKind::Text,
            delivery: Delivery::Sent,
        }
    }

    fn room_with(messages: Vec<Message>) -> Room {
        let mut room = Room::new(UserId(5), UserId(9));
        room.messages = messages;
        room.touch_last_message();
        room
    }

    fn data(store: &RoomStore) -> RoomMap {
        store.state().rooms().cloned().expect("store should be live")
    }

    #[test]
    fn test_starts_loading_and_filters_foreign_rooms() {
        let store = RoomStore::new(UserId(5));
        assert!(store.state().is_loading());

        let foreign = Room::new(UserId(7), UserId(8));
        store.apply_feed(FeedEvent::Snapshot(vec![room_with(vec![]), foreign]));

        let rooms = data(&store);
        assert_eq!(rooms.len(), 1);
        assert!(rooms.contains_key(&RoomId::for_pair(UserId(5), UserId(9))));
    }

    #[test]
    fn test_disconnect_is_not_empty_data() {
        let store = RoomStore::new(UserId(5));
        store.apply_feed(FeedEvent::Snapshot(vec![room_with(vec![])]));
        store.apply_feed(FeedEvent::Disconnected("socket closed".into()));

        match store.state() {
            FeedState::Error(reason) => assert!(reason.contains("socket closed")),
            other => panic!("expected error state, got {other:?}"),
        }
    }

    #[test]
    fn test_pending_send_settles_without_duplicate() {
        let store = RoomStore::new(UserId(5));
        let room_id = RoomId::for_pair(UserId(5), UserId(9));
        store.apply_feed(FeedEvent::Snapshot(vec![room_with(vec![incoming("a", 9, "hi", 60)])]));

        let local = Message::new(UserId(5), "hello", MessageKind::Text);
        let provisional = local.id.clone();
        store.push_pending(&room_id, local.clone());
        assert_eq!(data(&store)[&room_id].messages.len(), 2);

        let persisted = Message {
            id: MessageId::from("srv-1"),
            delivery: Delivery::Sent,
            ..local
        };
        store.confirm_pending(&room_id, &provisional, persisted.clone());
        assert_eq!(data(&store)[&room_id].messages.len(), 2);

        // The feed now delivers the same message.
        let mut authoritative = room_with(vec![incoming("a", 9, "hi", 60), persisted]);
        authoritative.touch_last_message();
        store.apply_feed(FeedEvent::RoomChanged(authoritative));

        let room = &data(&store)[&room_id];
        assert_eq!(room.messages.len(), 2);
        assert_eq!(room.last_message, "hello");
    }

    #[test]
    fn test_feed_copy_arriving_first_is_matched_by_content() {
        let store = RoomStore::new(UserId(5));
        let room_id = RoomId::for_pair(UserId(5), UserId(9));
        store.apply_feed(FeedEvent::Snapshot(vec![]));

        let local = Message::new(UserId(5), "hello", MessageKind::Text);
        store.push_pending(&room_id, local.clone());

        let server_copy = Message {
            id: MessageId::from("srv-9"),
            delivery: Delivery::Sent,
            ..local
        };
        store.apply_feed(FeedEvent::RoomChanged(room_with(vec![server_copy])));

        assert_eq!(data(&store)[&room_id].messages.len(), 1);
        assert_eq!(data(&store)[&room_id].messages[0].id.as_str(), "srv-9");
    }

    #[test]
    fn test_first_send_creates_room_view() {
        let store = RoomStore::new(UserId(5));
        store.apply_feed(FeedEvent::Snapshot(vec![]));
        let room_id = RoomId::for_pair(UserId(5), UserId(9));

        store.push_pending(&room_id, Message::new(UserId(5), "first!", MessageKind::Text));

        let room = &data(&store)[&room_id];
        assert_eq!(room.participant_ids, [UserId(5), UserId(9)]);
        assert_eq!(room.last_message, "first!");
    }

    #[test]
    fn test_seen_overlay_and_rollback() {
        let store = RoomStore::new(UserId(5));
        let room_id = RoomId::for_pair(UserId(5), UserId(9));
        store.apply_feed(FeedEvent::Snapshot(vec![room_with(vec![
            incoming("a", 9, "one", 30),
            incoming("b", 9, "two", 20),
            incoming("c", 5, "mine", 10),
        ])]));

        let flipped = store.mark_seen_local(&room_id, UserId(5));
        assert_eq!(flipped.len(), 2);
        assert_eq!(data(&store)[&room_id].unread_for(UserId(5)), 0);
        assert!(store.mark_seen_local(&room_id, UserId(5)).is_empty());

        store.rollback_seen(&room_id, &flipped);
        assert_eq!(data(&store)[&room_id].unread_for(UserId(5)), 2);
    }

    #[test]
    fn test_retract_requires_author() {
        let store = RoomStore::new(UserId(5));
        let room_id = RoomId::for_pair(UserId(5), UserId(9));
        store.apply_feed(FeedEvent::Snapshot(vec![room_with(vec![incoming("a", 9, "theirs", 10)])]));

        let err = store
            .retract_local(&room_id, &MessageId::from("a"), UserId(5))
            .unwrap_err();
        assert!(matches!(err, ChatError::NotAuthorized { .. }));
        assert!(!data(&store)[&room_id].messages[0].retracted);
    }

    #[test]
    fn test_retract_overlay_hides_content_until_rollback() {
        let store = RoomStore::new(UserId(5));
        let room_id = RoomId::for_pair(UserId(5), UserId(9));
        store.apply_feed(FeedEvent::Snapshot(vec![room_with(vec![incoming("a", 5, "oops", 10)])]));
        let id = MessageId::from("a");

        assert_eq!(store.retract_local(&room_id, &id, UserId(5)), Ok(true));
        assert_eq!(store.retract_local(&room_id, &id, UserId(5)), Ok(false));
        let room = &data(&store)[&room_id];
        assert_ne!(room.messages[0].display_body(), "oops");
        assert_ne!(room.last_message, "oops");

        store.rollback_retract(&room_id, &id);
        assert_eq!(data(&store)[&room_id].messages[0].display_body(), "oops");
    }

    #[test]
    fn test_pending_message_cannot_be_retracted() {
        let store = RoomStore::new(UserId(5));
        store.apply_feed(FeedEvent::Snapshot(vec![]));
        let room_id = RoomId::for_pair(UserId(5), UserId(9));
        let local = Message::new(UserId(5), "wait", MessageKind::Text);
        store.push_pending(&room_id, local.clone());

        let err = store.retract_local(&room_id, &local.id, UserId(5)).unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[test]
    fn test_room_change_after_disconnect_is_live_again() {
        let store = RoomStore::new(UserId(5));
        let room_id = RoomId::for_pair(UserId(5), UserId(9));
        store.apply_feed(FeedEvent::Snapshot(vec![room_with(vec![])]));
        store.apply_feed(FeedEvent::Disconnected("socket closed".into()));
        assert!(matches!(store.state(), FeedState::Error(_)));

        store.apply_feed(FeedEvent::RoomChanged(room_with(vec![incoming("a", 9, "back", 1)])));
        assert_eq!(data(&store)[&room_id].messages[0].body, "back");
    }

    #[test]
    fn test_incoming_after_failed_send_is_last() {
        let store = RoomStore::new(UserId(5));
        let room_id = RoomId::for_pair(UserId(5), UserId(9));
        store.apply_feed(FeedEvent::Snapshot(vec![room_with(vec![incoming("m1", 9, "hi", 60)])]));

        let mut local = Message::new(UserId(5), "lost", MessageKind::Text);
        local.timestamp = Utc::now() - Duration::seconds(30);
        store.push_pending(&room_id, local.clone());
        store.fail_pending(&room_id, &local.id);

        store.apply_feed(FeedEvent::RoomChanged(room_with(vec![
            incoming("m1", 9, "hi", 60),
            incoming("m2", 9, "still there?", 10),
        ])));

        let room = &data(&store)[&room_id];
        let ids: Vec<&str> = room.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", local.id.as_str(), "m2"]);
        assert_eq!(room.messages[1].delivery, Delivery::Failed);
        assert_eq!(room.last_message, "still there?");
    }
}
