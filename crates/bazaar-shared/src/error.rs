use thiserror::Error;

use crate::types::{MessageId, RoomId, UserId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Malformed or empty send payload. Rejected before any network call.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Retract attempted by someone other than the author.
    #[error("User {caller} is not allowed to retract message {message_id}")]
    NotAuthorized { caller: UserId, message_id: MessageId },

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u64, max: u64 },

    /// Report/block call failed. Never fatal to the chat session.
    #[error("Moderation action failed: {0}")]
    ModerationActionFailed(String),

    #[error("Profile resolution for user {user} gave up after {attempts} attempts")]
    ProfileResolutionExhausted { user: UserId, attempts: u32 },

    #[error("Feed connection lost: {0}")]
    FeedConnectionLost(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ChatError {
    /// Text suitable for an alert shown to the end user.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Validation(_) => "Please enter a message or attach an image.".to_string(),
            ChatError::NotAuthorized { .. } => {
                "You can only retract your own messages.".to_string()
            }
            ChatError::PayloadTooLarge { .. } => "Please choose a smaller image.".to_string(),
            ChatError::UploadFailed(_) => "Upload failed, please try again.".to_string(),
            ChatError::ModerationActionFailed(_) => {
                "We could not submit your request, please try again later.".to_string()
            }
            ChatError::FeedConnectionLost(_) => "Connection lost, reconnecting...".to_string(),
            _ => "Something went wrong, please try again.".to_string(),
        }
    }

    /// Errors decided locally, without a network round-trip.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ChatError::Validation(_)
                | ChatError::NotAuthorized { .. }
                | ChatError::RoomNotFound(_)
                | ChatError::MessageNotFound(_)
        )
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Serialization(e.to_string())
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ChatError>;
