//! In-memory loopback collaborators.
//!
//! [`MemoryBackend`] plays every server role at once (REST endpoints, media
//! upload, profile lookup and the room feed) and [`MemoryPresence`] plays the
//! presence channel. Both keep their data behind a mutex and push feed events
//! to connected receivers, so the engine can run end to end without a
//! network. Failure switches and call counters make them usable as test
//! doubles.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use bazaar_shared::{
    BlockRequest, ChatError, Delivery, Message, MessageId, MessageReport, Profile, Result,
    RetractRequest, Room, RoomId, SeenRequest, SendRequest, UserId, UserReport,
};

use crate::backend::{
    ChatBackend, FeedEvent, LocalAsset, MediaUploader, PresenceChannel, PresenceEvent,
    ProfileResolver, RoomFeed,
};
use crate::debounce::lock;

const FEED_BUFFER: usize = 256;

#[derive(Default)]
struct Failures {
    send: bool,
    seen: bool,
    retract: bool,
    moderation: bool,
    profiles: bool,
    upload: Option<ChatError>,
}

#[derive(Default)]
struct BackendState {
    rooms: BTreeMap<RoomId, Room>,
    profiles: HashMap<UserId, Profile>,
    next_id: u64,
    failures: Failures,
    latency: Duration,
    feeds: Vec<(UserId, mpsc::Sender<FeedEvent>)>,

    send_calls: usize,
    seen_calls: usize,
    retract_calls: usize,
    upload_calls: usize,
    profile_lookups: HashMap<UserId, u32>,
    message_reports: Vec<MessageReport>,
    user_reports: Vec<UserReport>,
    blocks: Vec<BlockRequest>,
}

impl BackendState {
    fn notify(&mut self, room_id: &RoomId) {
        let Some(room) = self.rooms.get(room_id) else {
            return;
        };
        let room = room.clone();
        self.feeds.retain(|(user, tx)| {
            if room.includes(*user) {
                let _ = tx.try_send(FeedEvent::RoomChanged(room.clone()));
            }
            !tx.is_closed()
        });
    }
}

/// Loopback server: REST endpoints, uploads, profiles and the room feed.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<BackendState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a room and push it to connected participants.
    pub fn insert_room(&self, mut room: Room) {
        room.touch_last_message();
        let mut state = lock(&self.state);
        let id = room.room_id.clone();
        state.rooms.insert(id.clone(), room);
        state.notify(&id);
    }

    pub fn room(&self, room_id: &RoomId) -> Option<Room> {
        lock(&self.state).rooms.get(room_id).cloned()
    }

    /// Push `event` to every open feed connection.
    pub fn broadcast(&self, event: FeedEvent) {
        let mut state = lock(&self.state);
        state.feeds.retain(|(_, tx)| {
            let _ = tx.try_send(event.clone());
            !tx.is_closed()
        });
    }

    pub fn set_profile(&self, profile: Profile) {
        lock(&self.state).profiles.insert(profile.id, profile);
    }

    /// Delay applied to every mutating endpoint before it runs.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = latency;
    }

    pub fn fail_sends(&self, fail: bool) {
        lock(&self.state).failures.send = fail;
    }

    pub fn fail_seen(&self, fail: bool) {
        lock(&self.state).failures.seen = fail;
    }

    pub fn fail_retracts(&self, fail: bool) {
        lock(&self.state).failures.retract = fail;
    }

    pub fn fail_moderation(&self, fail: bool) {
        lock(&self.state).failures.moderation = fail;
    }

    pub fn fail_profiles(&self, fail: bool) {
        lock(&self.state).failures.profiles = fail;
    }

    /// Error returned by the next uploads, or `None` to let them succeed.
    pub fn fail_uploads(&self, error: Option<ChatError>) {
        lock(&self.state).failures.upload = error;
    }

    pub fn profile_lookups(&self, user: UserId) -> u32 {
        lock(&self.state)
            .profile_lookups
            .get(&user)
            .copied()
            .unwrap_or(0)
    }

    pub fn send_calls(&self) -> usize {
        lock(&self.state).send_calls
    }

    pub fn seen_calls(&self) -> usize {
        lock(&self.state).seen_calls
    }

    pub fn retract_calls(&self) -> usize {
        lock(&self.state).retract_calls
    }

    pub fn upload_calls(&self) -> usize {
        lock(&self.state).upload_calls
    }

    pub fn blocks(&self) -> Vec<BlockRequest> {
        lock(&self.state).blocks.clone()
    }

    pub fn message_reports(&self) -> Vec<MessageReport> {
        lock(&self.state).message_reports.clone()
    }

    pub fn user_reports(&self) -> Vec<UserReport> {
        lock(&self.state).user_reports.clone()
    }

    async fn simulate_latency(&self) {
        let latency = lock(&self.state).latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ChatBackend for MemoryBackend {
    async fn send(&self, request: &SendRequest) -> Result<Message> {
        self.simulate_latency().await;
        let mut state = lock(&self.state);
        state.send_calls += 1;
        if state.failures.send {
            return Err(ChatError::Network("send endpoint unavailable".to_string()));
        }

        state.next_id += 1;
        let message = Message {
            id: MessageId(format!("msg-{}", state.next_id)),
            author: request.sender_id,
            body: request.message.clone(),
            timestamp: request.timestamp,
            seen: false,
            retracted: false,
            kind: request.kind.clone(),
            delivery: Delivery::Sent,
        };

        let room_id = request.room_id();
        let room = state
            .rooms
            .entry(room_id.clone())
            .or_insert_with(|| Room::new(request.sender_id, request.receiver_id));
        room.messages.push(message.clone());
        room.touch_last_message();
        debug!(room = %room_id, id = %message.id, "memory backend stored message");
        state.notify(&room_id);
        Ok(message)
    }

    async fn mark_seen(&self, request: &SeenRequest) -> Result<()> {
        self.simulate_latency().await;
        let mut state = lock(&self.state);
        state.seen_calls += 1;
        if state.failures.seen {
            return Err(ChatError::Network("seen endpoint unavailable".to_string()));
        }
        let Some(room) = state.rooms.get_mut(&request.room_id) else {
            return Ok(());
        };
        let mut changed = false;
        for message in room.messages.iter_mut() {
            if message.is_unread_for(request.user_id) {
                message.seen = true;
                changed = true;
            }
        }
        if changed {
            state.notify(&request.room_id);
        }
        Ok(())
    }

    async fn retract(&self, request: &RetractRequest) -> Result<()> {
        self.simulate_latency().await;
        let mut state = lock(&self.state);
        state.retract_calls += 1;
        if state.failures.retract {
            return Err(ChatError::Network("retract endpoint unavailable".to_string()));
        }
        let room = state
            .rooms
            .get_mut(&request.room_id)
            .ok_or_else(|| ChatError::RoomNotFound(request.room_id.clone()))?;
        let message = room
            .messages
            .iter_mut()
            .find(|m| m.id == request.message_id)
            .ok_or_else(|| ChatError::MessageNotFound(request.message_id.clone()))?;
        if message.author != request.user_id {
            return Err(ChatError::NotAuthorized {
                caller: request.user_id,
                message_id: request.message_id.clone(),
            });
        }
        message.retract();
        room.touch_last_message();
        state.notify(&request.room_id);
        Ok(())
    }

    async fn report_message(&self, report: &MessageReport) -> Result<()> {
        let mut state = lock(&self.state);
        if state.failures.moderation {
            return Err(ChatError::Network("report endpoint unavailable".to_string()));
        }
        state.message_reports.push(report.clone());
        Ok(())
    }

    async fn report_user(&self, report: &UserReport) -> Result<()> {
        let mut state = lock(&self.state);
        if state.failures.moderation {
            return Err(ChatError::Network("report endpoint unavailable".to_string()));
        }
        state.user_reports.push(report.clone());
        Ok(())
    }

    async fn block_user(&self, request: &BlockRequest) -> Result<()> {
        let mut state = lock(&self.state);
        if state.failures.moderation {
            return Err(ChatError::Network("block endpoint unavailable".to_string()));
        }
        state.blocks.push(request.clone());
        Ok(())
    }
}

#[async_trait]
impl MediaUploader for MemoryBackend {
    async fn upload(&self, asset: &LocalAsset) -> Result<String> {
        self.simulate_latency().await;
        let mut state = lock(&self.state);
        state.upload_calls += 1;
        if let Some(error) = state.failures.upload.clone() {
            return Err(error);
        }
        let name = asset.uri.rsplit('/').next().unwrap_or("image");
        Ok(format!("uploads/{}-{name}", state.upload_calls))
    }
}

#[async_trait]
impl ProfileResolver for MemoryBackend {
    async fn resolve(&self, user: UserId) -> Result<Profile> {
        let mut state = lock(&self.state);
        *state.profile_lookups.entry(user).or_insert(0) += 1;
        if state.failures.profiles {
            return Err(ChatError::Network("profile service unavailable".to_string()));
        }
        state
            .profiles
            .get(&user)
            .cloned()
            .ok_or_else(|| ChatError::Network(format!("user {user} not found")))
    }
}

#[async_trait]
impl RoomFeed for MemoryBackend {
    async fn connect(&self, user: UserId) -> Result<mpsc::Receiver<FeedEvent>> {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let mut state = lock(&self.state);
        let visible: Vec<Room> = state
            .rooms
            .values()
            .filter(|room| room.includes(user))
            .cloned()
            .collect();
        let _ = tx.try_send(FeedEvent::Snapshot(visible));
        state.feeds.push((user, tx));
        Ok(rx)
    }
}

#[derive(Default)]
struct PresenceState {
    flags: HashMap<UserId, bool>,
    publishes: usize,
    subscribers: Vec<mpsc::Sender<PresenceEvent>>,
}

impl PresenceState {
    fn broadcast(&mut self, event: PresenceEvent) {
        self.subscribers.retain(|tx| {
            let _ = tx.try_send(event.clone());
            !tx.is_closed()
        });
    }
}

/// Loopback presence channel.
#[derive(Default)]
pub struct MemoryPresence {
    state: Mutex<PresenceState>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of publish calls received.
    pub fn publish_count(&self) -> usize {
        lock(&self.state).publishes
    }

    /// Last published flag for `user`.
    pub fn flag(&self, user: UserId) -> Option<bool> {
        lock(&self.state).flags.get(&user).copied()
    }

    /// Simulate a dropped connection on every subscriber.
    pub fn disconnect_all(&self, reason: &str) {
        lock(&self.state).broadcast(PresenceEvent::Disconnected(reason.to_string()));
    }

    /// Open connections whose receiver is still alive.
    pub fn connection_count(&self) -> usize {
        let mut state = lock(&self.state);
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }
}

#[async_trait]
impl PresenceChannel for MemoryPresence {
    async fn publish(&self, user: UserId, online: bool) -> Result<()> {
        let mut state = lock(&self.state);
        state.publishes += 1;
        state.flags.insert(user, online);
        state.broadcast(PresenceEvent::Changed { user, online });
        Ok(())
    }

    async fn connect(&self) -> Result<mpsc::Receiver<PresenceEvent>> {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let mut state = lock(&self.state);
        let _ = tx.try_send(PresenceEvent::Snapshot(state.flags.clone()));
        state.subscribers.push(tx);
        Ok(rx)
    }
}
