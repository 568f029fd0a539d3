//! Presence tracking.
//!
//! Publishing is debounced per user so focus/blur flapping collapses into a
//! single write of the final value. Subscribers receive full snapshots of the
//! online set on a `watch` channel, which keeps only the latest one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bazaar_shared::UserId;

use crate::backend::{PresenceChannel, PresenceEvent};
use crate::debounce::Debouncer;

pub type OnlineSet = Arc<HashSet<UserId>>;

/// What a presence subscriber knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceView {
    /// Not connected yet (`reason: None`) or connection lost. Not the same
    /// as "everyone is offline".
    Unknown { reason: Option<String> },
    Known(OnlineSet),
}

impl PresenceView {
    /// `None` while presence is unknown.
    pub fn is_online(&self, user: UserId) -> Option<bool> {
        match self {
            PresenceView::Unknown { .. } => None,
            PresenceView::Known(set) => Some(set.contains(&user)),
        }
    }

    /// Explicit degradation for consumers that treat unknown as offline.
    pub fn assume_offline(&self) -> OnlineSet {
        match self {
            PresenceView::Unknown { .. } => Arc::new(HashSet::new()),
            PresenceView::Known(set) => set.clone(),
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, PresenceView::Known(_))
    }
}

pub struct PresenceTracker {
    channel: Arc<dyn PresenceChannel>,
    publisher: Debouncer<UserId, bool>,
}

impl PresenceTracker {
    pub fn new(channel: Arc<dyn PresenceChannel>, window: Duration) -> Self {
        let publish_channel = channel.clone();
        let publisher = Debouncer::new(window, move |user: UserId, online: bool| {
            let channel = publish_channel.clone();
            async move {
                match channel.publish(user, online).await {
                    Ok(()) => debug!(user = %user, online, "presence published"),
                    Err(e) => warn!(user = %user, online, error = %e, "presence publish failed"),
                }
            }
        });
        Self { channel, publisher }
    }

    /// Publish `user`'s flag once it has been stable for the debounce window.
    pub fn set_online(&self, user: UserId, online: bool) {
        self.publisher.call(user, online);
    }

    /// Connect to the presence feed and stream full online-set snapshots.
    pub fn subscribe(&self) -> PresenceSubscription {
        let (tx, rx) = watch::channel(PresenceView::Unknown { reason: None });
        let channel = self.channel.clone();
        let task = tokio::spawn(async move {
            pump(channel, tx).await;
        });
        PresenceSubscription { rx, task }
    }
}

async fn pump(channel: Arc<dyn PresenceChannel>, tx: watch::Sender<PresenceView>) {
    let mut events = match channel.connect().await {
        Ok(events) => events,
        Err(e) => {
            warn!(error = %e, "presence connection failed");
            tx.send_replace(PresenceView::Unknown {
                reason: Some(e.to_string()),
            });
            return;
        }
    };

    info!("presence feed connected");
    let mut flags: HashMap<UserId, bool> = HashMap::new();
    while let Some(event) = events.recv().await {
        match event {
            PresenceEvent::Snapshot(snapshot) => flags = snapshot,
            PresenceEvent::Changed { user, online } => {
                flags.insert(user, online);
            }
            PresenceEvent::Disconnected(reason) => {
                warn!(%reason, "presence feed disconnected");
                flags.clear();
                tx.send_replace(PresenceView::Unknown {
                    reason: Some(reason),
                });
                continue;
            }
        }

        let online: HashSet<UserId> = flags
            .iter()
            .filter(|(_, online)| **online)
            .map(|(user, _)| *user)
            .collect();
        if tx.send(PresenceView::Known(Arc::new(online))).is_err() {
            // Every subscriber is gone.
            return;
        }
    }

    tx.send_replace(PresenceView::Unknown {
        reason: Some("presence feed closed".to_string()),
    });
}

/// Live presence stream. Tears the connection down on drop.
pub struct PresenceSubscription {
    rx: watch::Receiver<PresenceView>,
    task: JoinHandle<()>,
}

impl PresenceSubscription {
    pub fn current(&self) -> PresenceView {
        self.rx.borrow().clone()
    }

    pub async fn next(&mut self) -> Option<PresenceView> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub fn receiver(&self) -> watch::Receiver<PresenceView> {
        self.rx.clone()
    }
}

impl Drop for PresenceSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
