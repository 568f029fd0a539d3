//! HTTP wiring for the Bazaar chat core.
//!
//! [`connect`] builds a [`ChatContext`] whose collaborators talk to the
//! marketplace REST API: [`http::HttpBackend`] for commands, uploads and
//! profiles, and the polling feeds in [`feed`] for rooms and presence.

pub mod config;
pub mod feed;
pub mod http;

use std::sync::Arc;

use tracing_subscriber::{fmt, EnvFilter};

use bazaar_chat::{ChatConfig, ChatContext, Collaborators};
use bazaar_shared::constants::APP_NAME;
use bazaar_shared::UserId;

pub use crate::config::ClientConfig;
use crate::feed::{PollingPresence, PollingRoomFeed};
use crate::http::HttpBackend;

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bazaar_chat=debug,bazaar_client=debug,warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

/// Open a chat session for `me` against the REST API. Must be called inside
/// a tokio runtime; the feeds connect in background tasks.
pub fn connect(me: UserId, client: &ClientConfig, chat: ChatConfig) -> anyhow::Result<ChatContext> {
    let http = HttpBackend::new(client)?.with_max_upload_bytes(chat.max_image_bytes);
    let backend = Arc::new(http.clone());

    let collaborators = Collaborators {
        backend: backend.clone(),
        uploader: backend.clone(),
        profiles: backend,
        feed: Arc::new(PollingRoomFeed::new(http.clone(), client.feed_poll_interval)),
        presence: Arc::new(PollingPresence::new(http, client.feed_poll_interval)),
    };

    tracing::info!(user = %me, api = %client.api_base_url, "Starting {APP_NAME} chat session");
    Ok(ChatContext::new(me, chat, collaborators))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_builds_context() {
        let ctx = connect(UserId(5), &ClientConfig::default(), ChatConfig::default()).unwrap();
        assert_eq!(ctx.current_user(), UserId(5));
    }
}
