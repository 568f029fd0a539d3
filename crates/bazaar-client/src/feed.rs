//! Polling implementations of the realtime room and presence feeds.
//!
//! Each connection is a task that fetches on an interval and pushes a
//! snapshot whenever the answer changes. A failed poll is reported once as
//! `Disconnected`; the next successful one brings a fresh snapshot. The task
//! ends when its receiver is dropped.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use bazaar_chat::{FeedEvent, PresenceChannel, PresenceEvent, RoomFeed};
use bazaar_shared::{ChatError, Result, Room, UserId};

use crate::http::HttpBackend;

const FEED_BUFFER: usize = 16;

/// Tracks the last delivered value and whether the source is reachable.
struct PollState<T> {
    last: Option<T>,
    connected: bool,
}

impl<T: PartialEq + Clone> PollState<T> {
    fn new(initial: T) -> Self {
        Self {
            last: Some(initial),
            connected: true,
        }
    }

    /// What to emit for one poll result, if anything.
    fn observe(&mut self, result: Result<T>) -> Option<std::result::Result<T, String>> {
        match result {
            Ok(value) => {
                let changed = !self.connected || self.last.as_ref() != Some(&value);
                self.connected = true;
                if changed {
                    self.last = Some(value.clone());
                    Some(Ok(value))
                } else {
                    None
                }
            }
            Err(e) if self.connected => {
                self.connected = false;
                Some(Err(e.to_string()))
            }
            Err(_) => None,
        }
    }
}

/// `GET /chat/rooms?userId=` on an interval.
pub struct PollingRoomFeed {
    http: HttpBackend,
    interval: Duration,
}

impl PollingRoomFeed {
    pub fn new(http: HttpBackend, interval: Duration) -> Self {
        Self { http, interval }
    }
}

async fn fetch_rooms(http: &HttpBackend, user: UserId) -> Result<Vec<Room>> {
    http.get_json(&format!("chat/rooms?userId={user}")).await
}

#[async_trait]
impl RoomFeed for PollingRoomFeed {
    async fn connect(&self, user: UserId) -> Result<mpsc::Receiver<FeedEvent>> {
        let initial = fetch_rooms(&self.http, user)
            .await
            .map_err(|e| ChatError::FeedConnectionLost(e.to_string()))?;

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let _ = tx.send(FeedEvent::Snapshot(initial.clone())).await;
        info!(user = %user, rooms = initial.len(), "room feed polling started");

        let http = self.http.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            let mut state = PollState::new(initial);
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let event = match state.observe(fetch_rooms(&http, user).await) {
                    Some(Ok(rooms)) => FeedEvent::Snapshot(rooms),
                    Some(Err(reason)) => {
                        warn!(user = %user, %reason, "room poll failed");
                        FeedEvent::Disconnected(reason)
                    }
                    None => continue,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            debug!(user = %user, "room feed polling stopped");
        });
        Ok(rx)
    }
}

/// `GET /presence` on an interval, `PUT /presence/{id}` to publish.
pub struct PollingPresence {
    http: HttpBackend,
    interval: Duration,
}

impl PollingPresence {
    pub fn new(http: HttpBackend, interval: Duration) -> Self {
        Self { http, interval }
    }
}

async fn fetch_presence(http: &HttpBackend) -> Result<HashMap<UserId, bool>> {
    http.get_json("presence").await
}

#[async_trait]
impl PresenceChannel for PollingPresence {
    async fn publish(&self, user: UserId, online: bool) -> Result<()> {
        self.http.put_presence(user, online).await
    }

    async fn connect(&self) -> Result<mpsc::Receiver<PresenceEvent>> {
        let initial = fetch_presence(&self.http)
            .await
            .map_err(|e| ChatError::FeedConnectionLost(e.to_string()))?;

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let _ = tx.send(PresenceEvent::Snapshot(initial.clone())).await;

        let http = self.http.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            let mut state = PollState::new(initial);
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let event = match state.observe(fetch_presence(&http).await) {
                    Some(Ok(flags)) => PresenceEvent::Snapshot(flags),
                    Some(Err(reason)) => {
                        warn!(%reason, "presence poll failed");
                        PresenceEvent::Disconnected(reason)
                    }
                    None => continue,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            debug!("presence polling stopped");
        });
        Ok(rx)
    }
}
