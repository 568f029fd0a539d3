//! Domain models exchanged between the chat core, the REST API and the UI.
//!
//! Every struct derives `Serialize` and `Deserialize` with camelCase field
//! names so it can be sent to the backend or handed to the UI layer as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{IMAGE_PREVIEW_LABEL, RETRACTED_PLACEHOLDER};
use crate::types::{MessageId, RoomId, UserId};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Stored image attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    /// Path returned by the upload endpoint.
    pub path: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub retracted: bool,
}

/// What a message carries. Retraction is tracked separately on [`Message`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MessageKind {
    #[default]
    Text,
    Image(ImageAttachment),
    System,
}

/// Client-side delivery marker for messages that only exist in the local
/// optimistic overlay. Everything delivered by the feed is `Sent`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum Delivery {
    #[default]
    Sent,
    Pending,
    Failed,
}

impl Delivery {
    pub fn is_sent(&self) -> bool {
        matches!(self, Delivery::Sent)
    }
}

/// A single chat message.
///
/// Immutable once delivered, apart from `seen` (false -> true only) and
/// `retracted` (soft state, the record is never removed).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub author: UserId,
    /// Text body. May be empty for image-only messages.
    #[serde(rename = "message", default)]
    pub body: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub seen: bool,
    #[serde(default)]
    pub retracted: bool,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Delivery::is_sent")]
    pub delivery: Delivery,
}

impl Message {
    /// A new, unsent message with a provisional id.
    pub fn new(author: UserId, body: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            id: MessageId::provisional(),
            author,
            body: body.into(),
            timestamp: Utc::now(),
            seen: false,
            retracted: false,
            kind,
            delivery: Delivery::Pending,
        }
    }

    pub fn image(&self) -> Option<&ImageAttachment> {
        match &self.kind {
            MessageKind::Image(image) => Some(image),
            _ => None,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self.kind, MessageKind::System)
    }

    /// Body as any consumer must render it.
    pub fn display_body(&self) -> &str {
        if self.retracted {
            RETRACTED_PLACEHOLDER
        } else {
            &self.body
        }
    }

    /// Image as any consumer must render it; `None` once retracted.
    pub fn display_image(&self) -> Option<&ImageAttachment> {
        if self.retracted {
            return None;
        }
        self.image().filter(|image| !image.retracted)
    }

    /// One-line preview for conversation lists.
    pub fn preview(&self) -> String {
        if self.retracted {
            return RETRACTED_PLACEHOLDER.to_string();
        }
        if self.body.is_empty() && self.image().is_some() {
            return IMAGE_PREVIEW_LABEL.to_string();
        }
        self.body.clone()
    }

    /// Soft-delete: flags the message and its image. Content stays in place.
    pub fn retract(&mut self) {
        self.retracted = true;
        if let MessageKind::Image(image) = &mut self.kind {
            image.retracted = true;
        }
    }

    pub fn is_unread_for(&self, viewer: UserId) -> bool {
        self.author != viewer && !self.seen
    }
}

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

/// A two-party conversation container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_id: RoomId,
    /// Always ascending.
    pub participant_ids: [UserId; 2],
    /// Insertion order is chronological.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Denormalized body of the most recent message.
    #[serde(default)]
    pub last_message: String,
}

impl Room {
    pub fn new(a: UserId, b: UserId) -> Self {
        let participant_ids = if a <= b { [a, b] } else { [b, a] };
        Self {
            room_id: RoomId::for_pair(a, b),
            participant_ids,
            messages: Vec::new(),
            last_message: String::new(),
        }
    }

    pub fn includes(&self, user: UserId) -> bool {
        self.participant_ids.contains(&user)
    }

    /// The participant that is not `me`, if `me` takes part in this room.
    pub fn other_participant(&self, me: UserId) -> Option<UserId> {
        match self.participant_ids {
            [a, b] if a == me => Some(b),
            [a, b] if b == me => Some(a),
            _ => None,
        }
    }

    /// Recomputed from the message list every time.
    pub fn unread_for(&self, viewer: UserId) -> usize {
        self.messages
            .iter()
            .filter(|m| m.is_unread_for(viewer))
            .count()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn find(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    /// Refresh the denormalized `last_message` cache.
    pub fn touch_last_message(&mut self) {
        self.last_message = self.last().map(Message::preview).unwrap_or_default();
    }
}

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// Subset of `GET /users/{id}` the chat core needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
}

impl Profile {
    /// Stand-in used while a lookup is pending or after it gave up.
    pub fn placeholder(id: UserId) -> Self {
        Self {
            id,
            name: format!("User {id}"),
            image: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation summary
// ---------------------------------------------------------------------------

/// UI-facing projection of a room. Derived, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: RoomId,
    pub name: String,
    pub last_message: String,
    /// Formatted timestamp of the last message, empty when there is none.
    pub time: String,
    pub last_activity: Option<DateTime<Utc>>,
    pub unread: usize,
    pub avatar: Option<String>,
    pub is_online: bool,
    pub other_user_id: UserId,
}

impl ConversationSummary {
    /// Summary for a conversation whose room does not exist yet.
    pub fn bootstrap(me: UserId, other: UserId, profile: &Profile) -> Self {
        Self {
            id: RoomId::for_pair(me, other),
            name: profile.name.clone(),
            last_message: String::new(),
            time: String::new(),
            last_activity: None,
            unread: 0,
            avatar: profile.image.clone(),
            is_online: false,
            other_user_id: other,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Payload of the send endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub message: String,
    #[serde(default)]
    pub kind: MessageKind,
    /// Client creation time. The backend keeps it, which lets the feed copy
    /// be matched against the optimistic one before the send call returns.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl SendRequest {
    pub fn text(sender_id: UserId, receiver_id: UserId, message: impl Into<String>) -> Self {
        Self {
            sender_id,
            receiver_id,
            message: message.into(),
            kind: MessageKind::Text,
            timestamp: Utc::now(),
        }
    }

    pub fn system(sender_id: UserId, receiver_id: UserId, message: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::System,
            ..Self::text(sender_id, receiver_id, message)
        }
    }

    pub fn with_image(mut self, image: ImageAttachment) -> Self {
        self.kind = MessageKind::Image(image);
        self
    }

    pub fn room_id(&self) -> RoomId {
        RoomId::for_pair(self.sender_id, self.receiver_id)
    }
}

/// Payload of the seen endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SeenRequest {
    pub room_id: RoomId,
    pub user_id: UserId,
}

/// Payload of the retract endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetractRequest {
    pub room_id: RoomId,
    pub message_id: MessageId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageReport {
    pub message_id: MessageId,
    pub reporter_id: UserId,
    pub reason: String,
    pub reported_user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserReport {
    pub reporter_id: UserId,
    pub reason: String,
    pub reported_user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockRequest {
    pub blocker_id: UserId,
    pub blocked_user_id: UserId,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> ImageAttachment {
        ImageAttachment {
            path: "uploads/cat.jpg".into(),
            width: 640,
            height: 480,
            retracted: false,
        }
    }

    #[test]
    fn test_retracted_message_is_opaque() {
        let mut msg = Message::new(UserId(1), "secret", MessageKind::Image(image()));
        msg.retract();

        assert_eq!(msg.display_body(), RETRACTED_PLACEHOLDER);
        assert!(msg.display_image().is_none());
        assert_eq!(msg.preview(), RETRACTED_PLACEHOLDER);
        // Soft state only: the record keeps its content.
        assert_eq!(msg.body, "secret");
        assert!(msg.image().is_some_and(|i| i.retracted));
    }

    #[test]
    fn test_preview_of_image_only_message() {
        let msg = Message::new(UserId(1), "", MessageKind::Image(image()));
        assert_eq!(msg.preview(), IMAGE_PREVIEW_LABEL);
    }

    #[test]
    fn test_room_unread_and_other_participant() {
        let mut room = Room::new(UserId(9), UserId(5));
        assert_eq!(room.participant_ids, [UserId(5), UserId(9)]);
        assert_eq!(room.other_participant(UserId(5)), Some(UserId(9)));
        assert_eq!(room.other_participant(UserId(7)), None);

        for _ in 0..3 {
            room.messages.push(Message::new(UserId(9), "hi", MessageKind::Text));
        }
        room.messages.push(Message::new(UserId(5), "hello", MessageKind::Text));

        assert_eq!(room.unread_for(UserId(5)), 3);
        assert_eq!(room.unread_for(UserId(9)), 1);
    }

    #[test]
    fn test_message_wire_shape() {
        let json = serde_json::json!({
            "id": "m1",
            "author": 9,
            "message": "",
            "timestamp": "2024-05-01T10:00:00Z",
            "seen": false,
            "kind": { "type": "image", "path": "p.jpg", "width": 10, "height": 20 }
        });
        let msg: Message = serde_json::from_value(json).unwrap();
        assert_eq!(msg.author, UserId(9));
        assert!(!msg.retracted);
        assert_eq!(msg.delivery, Delivery::Sent);
        assert_eq!(msg.image().map(|i| i.width), Some(10));

        let back = serde_json::to_value(&msg).unwrap();
        assert!(back.get("delivery").is_none());
    }
}
