//! Real-time messaging and presence core of the Bazaar marketplace app.
//!
//! The crate merges an authoritative room feed with a live presence feed,
//! keeps per-conversation read state, sends optimistically (images
//! included), retracts messages and drives the chat screen's scroll
//! behavior. Network access goes through the collaborator traits in
//! [`backend`]; `bazaar-client` implements them over HTTP and [`memory`]
//! implements them in-process.

pub mod backend;
pub mod config;
pub mod context;
pub mod debounce;
pub mod epoch;
pub mod feed;
pub mod memory;
pub mod messages;
pub mod presence;
pub mod profiles;
pub mod projection;
pub mod retry;
pub mod scroll;
pub mod store;

pub use backend::{
    ChatBackend, FeedEvent, LocalAsset, MediaUploader, PresenceChannel, PresenceEvent,
    ProfileResolver, RoomFeed,
};
pub use config::ChatConfig;
pub use context::{ActiveConversation, ChatContext, Collaborators};
pub use debounce::Debouncer;
pub use feed::{room_id, ChatDataSource, RoomsSubscription};
pub use messages::{MessageService, SendImage};
pub use presence::{PresenceSubscription, PresenceTracker, PresenceView};
pub use profiles::ProfileDirectory;
pub use projection::{
    derive_conversations, filter_conversations, normalize_search, ConversationList,
    ConversationProjection, ConversationProjector, ConversationSearch,
};
pub use retry::{RetryExhausted, RetryPolicy};
pub use scroll::{ScrollAction, ScrollController, ScrollCoordinator, ScrollEvent, ScrollPhase, ScrollState};
pub use store::{FeedState, RoomStore};
