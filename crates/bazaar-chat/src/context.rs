//! Injectable chat context.
//!
//! [`ChatContext`] owns every piece of chat state for one signed-in user and
//! wires the components to the injected collaborators. Cloning it is cheap;
//! all clones share the same state.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use bazaar_shared::{ConversationSummary, Message, Profile, Result, RoomId, SendRequest, UserId};

use crate::backend::{ChatBackend, MediaUploader, PresenceChannel, ProfileResolver, RoomFeed};
use crate::config::ChatConfig;
use crate::epoch::{ConversationEpoch, EpochGuard};
use crate::feed::{ChatDataSource, RoomsSubscription};
use crate::memory::{MemoryBackend, MemoryPresence};
use crate::messages::MessageService;
use crate::presence::{PresenceSubscription, PresenceTracker, PresenceView};
use crate::profiles::ProfileDirectory;
use crate::projection::{summarize, ConversationProjection, ConversationSearch};
use crate::scroll::{ScrollAction, ScrollController, ScrollEvent, ScrollState};
use crate::store::RoomStore;

/// The external services the chat core talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn ChatBackend>,
    pub uploader: Arc<dyn MediaUploader>,
    pub profiles: Arc<dyn ProfileResolver>,
    pub feed: Arc<dyn RoomFeed>,
    pub presence: Arc<dyn PresenceChannel>,
}

impl Collaborators {
    /// Everything served by the in-memory loopback.
    pub fn memory(backend: Arc<MemoryBackend>, presence: Arc<MemoryPresence>) -> Self {
        Self {
            backend: backend.clone(),
            uploader: backend.clone(),
            profiles: backend.clone(),
            feed: backend,
            presence,
        }
    }
}

struct ContextInner {
    me: UserId,
    config: ChatConfig,
    data_source: ChatDataSource,
    presence: PresenceTracker,
    profiles: ProfileDirectory,
    messages: MessageService,
    epoch: ConversationEpoch,
}

#[derive(Clone)]
pub struct ChatContext {
    inner: Arc<ContextInner>,
}

impl ChatContext {
    pub fn new(me: UserId, config: ChatConfig, collaborators: Collaborators) -> Self {
        let store = RoomStore::new(me);
        let data_source = ChatDataSource::new(collaborators.feed, store.clone());
        let presence = PresenceTracker::new(collaborators.presence, config.presence_debounce);
        let profiles = ProfileDirectory::new(collaborators.profiles, config.profile_retry());
        let messages = MessageService::new(
            store,
            collaborators.backend,
            collaborators.uploader,
            &config,
        );

        info!(user = %me, "chat context created");
        Self {
            inner: Arc::new(ContextInner {
                me,
                config,
                data_source,
                presence,
                profiles,
                messages,
                epoch: ConversationEpoch::new(),
            }),
        }
    }

    pub fn current_user(&self) -> UserId {
        self.inner.me
    }

    pub fn config(&self) -> &ChatConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &RoomStore {
        self.inner.data_source.store()
    }

    pub fn messages(&self) -> &MessageService {
        &self.inner.messages
    }

    pub fn profiles(&self) -> &ProfileDirectory {
        &self.inner.profiles
    }

    pub fn subscribe_rooms(&self) -> RoomsSubscription {
        self.inner.data_source.subscribe_rooms()
    }

    pub fn subscribe_presence(&self) -> PresenceSubscription {
        self.inner.presence.subscribe()
    }

    /// Publish the signed-in user's presence (debounced).
    pub fn set_online(&self, online: bool) {
        self.inner.presence.set_online(self.inner.me, online);
    }

    /// Conversation list derived from live rooms and presence.
    pub fn conversations(
        &self,
        rooms: &RoomsSubscription,
        presence: &PresenceSubscription,
    ) -> ConversationProjection {
        ConversationProjection::spawn(
            self.inner.me,
            rooms.receiver(),
            presence.receiver(),
            self.inner.profiles.clone(),
        )
    }

    /// Debounced search box for the conversation list.
    pub fn search(&self) -> ConversationSearch {
        ConversationSearch::from_config(&self.inner.config)
    }

    /// Make the conversation with `other` the active one.
    ///
    /// Any previously opened conversation goes stale: its pending seen call
    /// and header lookup are dropped.
    pub fn open_conversation(&self, other: UserId) -> ActiveConversation {
        let me = self.inner.me;
        let guard = self.inner.epoch.advance();
        let room_id = RoomId::for_pair(me, other);

        let (scroll, scroll_actions) = ScrollController::from_config(&self.inner.config);
        scroll.handle(ScrollEvent::ConversationChanged(room_id.clone()));

        self.inner.profiles.ensure(other);
        self.inner
            .messages
            .mark_seen_debounced(&room_id, me, Some(guard.clone()));

        info!(room = %room_id, epoch = guard.captured(), "conversation opened");
        ActiveConversation {
            ctx: self.clone(),
            room_id,
            other,
            guard,
            scroll,
            scroll_actions,
        }
    }
}

/// The conversation currently shown on the chat screen.
pub struct ActiveConversation {
    ctx: ChatContext,
    room_id: RoomId,
    other: UserId,
    guard: EpochGuard,
    scroll: ScrollController,
    scroll_actions: mpsc::UnboundedReceiver<ScrollAction>,
}

impl ActiveConversation {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn other_user(&self) -> UserId {
        self.other
    }

    /// False once another conversation was opened.
    pub fn is_active(&self) -> bool {
        self.guard.is_current()
    }

    /// Current summary, or the bootstrap one if the room does not exist yet.
    pub fn summary(&self, presence: &PresenceView) -> ConversationSummary {
        let me = self.ctx.inner.me;
        let profile = self.ctx.inner.profiles.display(self.other);
        let online = presence.is_online(self.other).unwrap_or(false);

        self.ctx
            .store()
            .room(&self.room_id)
            .and_then(|room| summarize(&room, me, online, &profile, Utc::now()))
            .unwrap_or_else(|| ConversationSummary {
                is_online: online,
                ..ConversationSummary::bootstrap(me, self.other, &profile)
            })
    }

    /// Header profile. `None` when the conversation went stale meanwhile.
    pub async fn header(&self) -> Option<Profile> {
        let profile = self.ctx.inner.profiles.resolve(self.other).await;
        if !self.guard.is_current() {
            debug!(room = %self.room_id, "stale header dropped");
            return None;
        }
        Some(profile)
    }

    /// Mark the room seen once focus settles.
    pub fn refresh_seen(&self) {
        self.ctx
            .inner
            .messages
            .mark_seen_debounced(&self.room_id, self.ctx.inner.me, Some(self.guard.clone()));
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<Message> {
        let request = SendRequest::text(self.ctx.inner.me, self.other, text);
        self.ctx.inner.messages.send(request).await
    }

    pub fn scroll(&self) -> &ScrollController {
        &self.scroll
    }

    /// Feed the current message list into the scroll state machine.
    pub fn sync_scroll(&self) -> ScrollState {
        let room = self.ctx.store().room(&self.room_id);
        let (count, last_id) = room
            .map(|r| (r.messages.len(), r.last().map(|m| m.id.clone())))
            .unwrap_or((0, None));
        self.scroll
            .handle(ScrollEvent::MessagesChanged { count, last_id })
    }

    pub async fn next_scroll_action(&mut self) -> Option<ScrollAction> {
        self.scroll_actions.recv().await
    }

    pub fn try_scroll_action(&mut self) -> Option<ScrollAction> {
        self.scroll_actions.try_recv().ok()
    }
}

impl Drop for ActiveConversation {
    fn drop(&mut self) {
        // Leaving the screen must not mark it seen afterwards.
        if self.guard.is_current() {
            self.ctx.inner.messages.cancel_pending_seen(&self.room_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bazaar_shared::{Delivery, MessageId, MessageKind, Room};
    use std::time::Duration;

    fn room_with_greeting() -> Room {
        let mut room = Room::new(UserId(5), UserId(9));
        let mut incoming = Message::new(UserId(9), "hello", MessageKind::Text);
        incoming.delivery = Delivery::Sent;
        room.messages.push(incoming);
        room
    }

    fn context() -> (Arc<MemoryBackend>, ChatContext) {
        let backend = Arc::new(MemoryBackend::new());
        let presence = Arc::new(MemoryPresence::new());
        let ctx = ChatContext::new(
            UserId(5),
            ChatConfig::default(),
            Collaborators::memory(backend.clone(), presence),
        );
        (backend, ctx)
    }

    #[tokio::test]
    async fn test_opening_unknown_conversation_bootstraps() {
        let (_backend, ctx) = context();
        let conversation = ctx.open_conversation(UserId(9));

        assert_eq!(conversation.room_id().as_str(), "room-5-9");
        let summary = conversation.summary(&PresenceView::Unknown { reason: None });
        assert_eq!(summary.unread, 0);
        assert_eq!(summary.last_message, "");
        assert_eq!(summary.other_user_id, UserId(9));
        assert!(!summary.is_online);
    }

    #[tokio::test]
    async fn test_stale_header_is_dropped() {
        let (backend, ctx) = context();
        backend.set_profile(Profile {
            id: UserId(9),
            name: "Linh".into(),
            image: None,
        });

        let first = ctx.open_conversation(UserId(9));
        let second = ctx.open_conversation(UserId(7));

        assert!(!first.is_active());
        assert!(second.is_active());
        assert_eq!(first.header().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_marks_seen_after_focus_settles() {
        let (backend, ctx) = context();
        backend.insert_room(room_with_greeting());

        let mut rooms = ctx.subscribe_rooms();
        while rooms.current().rooms().is_none() {
            rooms.next().await;
        }

        let conversation = ctx.open_conversation(UserId(9));
        assert_eq!(backend.seen_calls(), 0);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(backend.seen_calls(), 1);
        assert_eq!(conversation.summary(&PresenceView::Unknown { reason: None }).unread, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_conversations_drops_pending_seen() {
        let (backend, ctx) = context();
        backend.insert_room(room_with_greeting());
        let mut rooms = ctx.subscribe_rooms();
        while rooms.current().rooms().is_none() {
            rooms.next().await;
        }

        let first = ctx.open_conversation(UserId(9));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _second = ctx.open_conversation(UserId(7));
        drop(first);
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(backend.seen_calls(), 0);
    }

    #[tokio::test]
    async fn test_first_render_then_send_scrolls() {
        let (_backend, ctx) = context();
        let mut rooms = ctx.subscribe_rooms();
        while rooms.current().rooms().is_none() {
            rooms.next().await;
        }
        let mut conversation = ctx.open_conversation(UserId(9));
        assert!(conversation.sync_scroll().is_first_load);

        conversation.send_text("hi there").await.unwrap();
        assert!(!conversation.sync_scroll().is_first_load);
        assert_eq!(
            conversation.try_scroll_action(),
            Some(ScrollAction::JumpToBottom { animated: false })
        );

        conversation.send_text("second").await.unwrap();
        conversation.sync_scroll();
        assert_eq!(
            conversation.try_scroll_action(),
            Some(ScrollAction::JumpToBottom { animated: true })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_uses_configured_debounce() {
        let backend = Arc::new(MemoryBackend::new());
        let config = ChatConfig {
            search_debounce: Duration::from_millis(50),
            ..ChatConfig::default()
        };
        let ctx = ChatContext::new(
            UserId(5),
            config,
            Collaborators::memory(backend, Arc::new(MemoryPresence::new())),
        );

        let search = ctx.search();
        search.set_query("linh");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(search.query(), "");
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(search.query(), "linh");
    }

    /// Open room 5-9 on a greeting and fail one send, draining the scroll
    /// actions emitted so far.
    async fn conversation_after_failed_send(
        backend: &MemoryBackend,
        ctx: &ChatContext,
        rooms: &mut RoomsSubscription,
    ) -> ActiveConversation {
        backend.insert_room(room_with_greeting());
        let room_id = RoomId::for_pair(UserId(5), UserId(9));
        while ctx.store().room(&room_id).is_none() {
            rooms.next().await;
        }

        let mut conversation = ctx.open_conversation(UserId(9));
        conversation.sync_scroll();
        backend.fail_sends(true);
        assert!(conversation.send_text("are you there?").await.is_err());
        conversation.sync_scroll();
        while conversation.try_scroll_action().is_some() {}
        conversation
    }

    /// The other side answers after our failed send.
    async fn deliver_reply(
        backend: &MemoryBackend,
        ctx: &ChatContext,
        rooms: &mut RoomsSubscription,
        room_id: &RoomId,
    ) {
        let mut room = backend.room(room_id).unwrap();
        let mut reply = Message::new(UserId(9), "still there?", MessageKind::Text);
        reply.id = MessageId::from("m2");
        reply.delivery = Delivery::Sent;
        reply.timestamp = Utc::now() + chrono::Duration::seconds(1);
        room.messages.push(reply);
        backend.insert_room(room);

        let arrived = |ctx: &ChatContext| {
            ctx.store()
                .room(room_id)
                .is_some_and(|r| r.messages.iter().any(|m| m.id.as_str() == "m2"))
        };
        while !arrived(ctx) {
            rooms.next().await;
        }
    }

    #[tokio::test]
    async fn test_reply_after_failed_send_scrolls_when_idle() {
        let (backend, ctx) = context();
        let mut rooms = ctx.subscribe_rooms();
        let mut conversation = conversation_after_failed_send(&backend, &ctx, &mut rooms).await;
        let room_id = conversation.room_id().clone();

        deliver_reply(&backend, &ctx, &mut rooms, &room_id).await;
        let room = ctx.store().room(&room_id).unwrap();
        assert_eq!(room.last().map(|m| m.id.as_str()), Some("m2"));

        conversation.sync_scroll();
        assert_eq!(
            conversation.try_scroll_action(),
            Some(ScrollAction::JumpToBottom { animated: true })
        );
    }

    #[tokio::test]
    async fn test_reply_after_failed_send_raises_affordance_when_scrolled_away() {
        let (backend, ctx) = context();
        let mut rooms = ctx.subscribe_rooms();
        let conversation = conversation_after_failed_send(&backend, &ctx, &mut rooms).await;
        let room_id = conversation.room_id().clone();

        let state = conversation.scroll().handle(ScrollEvent::UserScrolled {
            distance_from_bottom: 300.0,
        });
        assert!(state.user_scrolled);

        deliver_reply(&backend, &ctx, &mut rooms, &room_id).await;
        let state = conversation.sync_scroll();
        assert!(state.show_scroll_to_bottom);
    }
}
