/// Application name
pub const APP_NAME: &str = "Bazaar";

/// Prefix of every two-party room key
pub const ROOM_ID_PREFIX: &str = "room-";

/// Prefix of client-assigned message ids awaiting server confirmation
pub const PROVISIONAL_ID_PREFIX: &str = "pending-";

/// Shown in place of a retracted message's body
pub const RETRACTED_PLACEHOLDER: &str = "This message was retracted";

/// Conversation preview for an image-only message
pub const IMAGE_PREVIEW_LABEL: &str = "[Image]";

/// Conversation preview for a room that exists but holds no messages
pub const NO_MESSAGES_SENTINEL: &str = "No messages yet";

/// Presence publish debounce window in milliseconds
pub const DEFAULT_PRESENCE_DEBOUNCE_MS: u64 = 1_000;

/// Focus/blur debounce for mark-as-seen, in milliseconds
pub const DEFAULT_MARK_SEEN_DEBOUNCE_MS: u64 = 300;

/// Delay before the "new message" affordance toggles, in milliseconds
pub const DEFAULT_AFFORDANCE_DEBOUNCE_MS: u64 = 150;

/// Conversation search input debounce, in milliseconds
pub const DEFAULT_SEARCH_DEBOUNCE_MS: u64 = 250;

/// Upper bound on profile lookups per user
pub const DEFAULT_PROFILE_MAX_ATTEMPTS: u32 = 10;

/// First backoff between profile lookups, in milliseconds
pub const DEFAULT_PROFILE_RETRY_BACKOFF_MS: u64 = 200;

/// Distance from bottom (px) beyond which the user counts as scrolled away
pub const DEFAULT_SCROLL_AWAY_THRESHOLD_PX: f64 = 20.0;

/// Distance from bottom (px) at or below which the list counts as at bottom
pub const DEFAULT_SCROLL_BOTTOM_THRESHOLD_PX: f64 = 5.0;

/// Maximum image upload size in bytes (10 MiB)
pub const MAX_IMAGE_SIZE: u64 = 10 * 1024 * 1024;
