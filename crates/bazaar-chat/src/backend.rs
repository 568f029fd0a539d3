//! Collaborator interfaces consumed by the chat core.
//!
//! The core never talks to the network directly. REST endpoints, the
//! realtime room feed, the presence channel and the media uploader are all
//! injected as trait objects, so the same engine runs against the HTTP client
//! in `bazaar-client` or against the in-memory loopback in [`crate::memory`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use bazaar_shared::{
    BlockRequest, Message, MessageReport, Profile, RetractRequest, Result, Room, SeenRequest,
    SendRequest, UserId, UserReport,
};

/// Mutating chat endpoints.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Persist a message and return the stored copy (server id, timestamp).
    async fn send(&self, request: &SendRequest) -> Result<Message>;

    /// Mark every message in the room not authored by `user_id` as seen.
    async fn mark_seen(&self, request: &SeenRequest) -> Result<()>;

    async fn retract(&self, request: &RetractRequest) -> Result<()>;

    async fn report_message(&self, report: &MessageReport) -> Result<()>;

    async fn report_user(&self, report: &UserReport) -> Result<()>;

    async fn block_user(&self, request: &BlockRequest) -> Result<()>;
}

/// A picture picked on the device, not yet uploaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalAsset {
    /// Local file path or platform asset URI.
    pub uri: String,
    pub size_bytes: u64,
    pub width: u32,
    pub height: u32,
}

/// Opaque image upload capability.
#[async_trait]
pub trait MediaUploader: Send + Sync {
    /// Returns the stored path. Fails with `PayloadTooLarge` or `UploadFailed`.
    async fn upload(&self, asset: &LocalAsset) -> Result<String>;
}

/// `GET /users/{id}`.
#[async_trait]
pub trait ProfileResolver: Send + Sync {
    async fn resolve(&self, user: UserId) -> Result<Profile>;
}

/// Events delivered by a room feed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// Full set of rooms visible to the connected user.
    Snapshot(Vec<Room>),
    /// One room was created or changed.
    RoomChanged(Room),
    /// The connection dropped. The feed may recover with a new `Snapshot`.
    Disconnected(String),
}

/// Realtime source of rooms and their messages.
#[async_trait]
pub trait RoomFeed: Send + Sync {
    /// Open a connection for `user`. Dropping the receiver tears it down.
    async fn connect(&self, user: UserId) -> Result<mpsc::Receiver<FeedEvent>>;
}

/// Events delivered by a presence channel connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Snapshot(HashMap<UserId, bool>),
    Changed { user: UserId, online: bool },
    Disconnected(String),
}

/// Realtime key-value channel of `user id -> online`.
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    async fn publish(&self, user: UserId, online: bool) -> Result<()>;

    /// Open a connection. Dropping the receiver tears it down.
    async fn connect(&self) -> Result<mpsc::Receiver<PresenceEvent>>;
}
