//! Conversation list projection.
//!
//! Turns the room map, the presence view and resolved profiles into the
//! [`ConversationSummary`] list a conversation screen renders. Summaries are
//! memoized per room, so a presence flip re-derives one entry and leaves the
//! rest (and their profile lookups) alone.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use bazaar_shared::constants::NO_MESSAGES_SENTINEL;
use bazaar_shared::{ConversationSummary, Delivery, Profile, Room, RoomId, UserId};

use crate::config::ChatConfig;
use crate::debounce::Debouncer;
use crate::presence::PresenceView;
use crate::profiles::ProfileDirectory;
use crate::store::FeedState;

/// Timestamp label for a conversation row.
///
/// `HH:MM` today, `DD/MM` earlier this year, `DD/MM/YYYY` before that.
pub fn format_time(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    if timestamp.date_naive() == now.date_naive() {
        timestamp.format("%H:%M").to_string()
    } else if timestamp.year() == now.year() {
        timestamp.format("%d/%m").to_string()
    } else {
        timestamp.format("%d/%m/%Y").to_string()
    }
}

/// Summary of one room as seen by `me`. `None` if `me` is not a participant.
pub fn summarize(
    room: &Room,
    me: UserId,
    online: bool,
    profile: &Profile,
    now: DateTime<Utc>,
) -> Option<ConversationSummary> {
    let other = room.other_participant(me)?;
    let last = room.last();
    Some(ConversationSummary {
        id: room.room_id.clone(),
        name: profile.name.clone(),
        last_message: last
            .map(|m| m.preview())
            .unwrap_or_else(|| NO_MESSAGES_SENTINEL.to_string()),
        time: last
            .map(|m| format_time(m.timestamp, now))
            .unwrap_or_default(),
        last_activity: last.map(|m| m.timestamp),
        unread: room.unread_for(me),
        avatar: profile.image.clone(),
        is_online: online,
        other_user_id: other,
    })
}

/// Most recent activity first. Rooms without messages go last.
fn sort_by_activity(list: &mut [ConversationSummary]) {
    list.sort_by(|a, b| {
        b.last_activity
            .cmp(&a.last_activity)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// One summary per room involving `me`, most recent first.
///
/// Unknown presence counts as offline here.
pub fn derive_conversations<P>(
    rooms: &BTreeMap<RoomId, Room>,
    me: UserId,
    presence: &PresenceView,
    profile_of: P,
    now: DateTime<Utc>,
) -> Vec<ConversationSummary>
where
    P: Fn(UserId) -> Profile,
{
    let mut list: Vec<ConversationSummary> = rooms
        .values()
        .filter_map(|room| {
            let other = room.other_participant(me)?;
            let online = presence.is_online(other).unwrap_or(false);
            summarize(room, me, online, &profile_of(other), now)
        })
        .collect();
    sort_by_activity(&mut list);
    list
}

/// Content hash of everything a summary reads from a room.
fn fingerprint(room: &Room) -> u64 {
    let mut hasher = DefaultHasher::new();
    room.participant_ids.hash(&mut hasher);
    room.messages.len().hash(&mut hasher);
    for message in &room.messages {
        message.id.hash(&mut hasher);
        message.author.hash(&mut hasher);
        message.seen.hash(&mut hasher);
        message.retracted.hash(&mut hasher);
        message.timestamp.hash(&mut hasher);
        matches!(message.delivery, Delivery::Sent).hash(&mut hasher);
    }
    if let Some(last) = room.last() {
        last.preview().hash(&mut hasher);
    }
    hasher.finish()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MemoKey {
    fingerprint: u64,
    online: bool,
    profile: Profile,
    day: NaiveDate,
}

/// Memoizing form of [`derive_conversations`].
#[derive(Debug, Default)]
pub struct ConversationProjector {
    memo: HashMap<RoomId, (MemoKey, ConversationSummary)>,
    recomputed: usize,
}

impl ConversationProjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of summaries derived from scratch so far.
    pub fn recomputed(&self) -> usize {
        self.recomputed
    }

    pub fn project<P>(
        &mut self,
        rooms: &BTreeMap<RoomId, Room>,
        me: UserId,
        presence: &PresenceView,
        profile_of: P,
        now: DateTime<Utc>,
    ) -> Vec<ConversationSummary>
    where
        P: Fn(UserId) -> Profile,
    {
        self.memo.retain(|id, _| rooms.contains_key(id));

        let mut list = Vec::with_capacity(rooms.len());
        for room in rooms.values() {
            let Some(other) = room.other_participant(me) else {
                continue;
            };
            let key = MemoKey {
                fingerprint: fingerprint(room),
                online: presence.is_online(other).unwrap_or(false),
                profile: profile_of(other),
                day: now.date_naive(),
            };

            if let Some((cached_key, summary)) = self.memo.get(&room.room_id) {
                if *cached_key == key {
                    list.push(summary.clone());
                    continue;
                }
            }

            let Some(summary) = summarize(room, me, key.online, &key.profile, now) else {
                continue;
            };
            trace!(room = %room.room_id, "summary recomputed");
            self.recomputed += 1;
            self.memo
                .insert(room.room_id.clone(), (key, summary.clone()));
            list.push(summary);
        }

        sort_by_activity(&mut list);
        list
    }
}

/// What a conversation list subscriber sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationList {
    Loading,
    Error(String),
    Ready(Arc<Vec<ConversationSummary>>),
}

impl ConversationList {
    pub fn summaries(&self) -> Option<&[ConversationSummary]> {
        match self {
            ConversationList::Ready(list) => Some(list.as_slice()),
            _ => None,
        }
    }
}

/// Live conversation list. Stops deriving on drop.
pub struct ConversationProjection {
    rx: watch::Receiver<ConversationList>,
    task: JoinHandle<()>,
}

impl ConversationProjection {
    /// Re-derive the list whenever rooms, presence or a profile change.
    pub fn spawn(
        me: UserId,
        rooms: watch::Receiver<FeedState>,
        presence: watch::Receiver<PresenceView>,
        profiles: ProfileDirectory,
    ) -> Self {
        let (tx, rx) = watch::channel(ConversationList::Loading);
        let task = tokio::spawn(async move {
            project_loop(me, rooms, presence, profiles, tx).await;
        });
        Self { rx, task }
    }

    pub fn current(&self) -> ConversationList {
        self.rx.borrow().clone()
    }

    pub async fn next(&mut self) -> Option<ConversationList> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub fn receiver(&self) -> watch::Receiver<ConversationList> {
        self.rx.clone()
    }
}

impl Drop for ConversationProjection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn project_loop(
    me: UserId,
    mut rooms: watch::Receiver<FeedState>,
    mut presence: watch::Receiver<PresenceView>,
    profiles: ProfileDirectory,
    tx: watch::Sender<ConversationList>,
) {
    let mut updates = profiles.updates();
    let mut projector = ConversationProjector::new();
    let mut presence_live = true;
    let mut profiles_live = true;

    loop {
        let state = rooms.borrow_and_update().clone();
        let view = presence.borrow_and_update().clone();
        let _ = updates.borrow_and_update();

        let list = match state {
            FeedState::Loading => ConversationList::Loading,
            FeedState::Error(reason) => ConversationList::Error(reason),
            FeedState::Data(map) => {
                let list = projector.project(
                    &map,
                    me,
                    &view,
                    |user| {
                        profiles.ensure(user);
                        profiles.display(user)
                    },
                    Utc::now(),
                );
                debug!(
                    conversations = list.len(),
                    recomputed = projector.recomputed(),
                    "conversation list derived"
                );
                ConversationList::Ready(Arc::new(list))
            }
        };
        tx.send_replace(list);

        tokio::select! {
            changed = rooms.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            changed = presence.changed(), if presence_live => {
                presence_live = changed.is_ok();
            }
            changed = updates.changed(), if profiles_live => {
                profiles_live = changed.is_ok();
            }
        }
    }
}

/// Fold text for diacritic-insensitive matching: decompose, drop combining
/// marks, map `đ` to `d`, lower-case.
pub fn normalize_search(text: &str) -> String {
    text.nfd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| match c {
            'đ' | 'Đ' => 'd',
            other => other,
        })
        .flat_map(char::to_lowercase)
        .collect()
}

/// Conversations whose name contains `query`, ignoring case and diacritics.
pub fn filter_conversations(list: &[ConversationSummary], query: &str) -> Vec<ConversationSummary> {
    let needle = normalize_search(query.trim());
    if needle.is_empty() {
        return list.to_vec();
    }
    list.iter()
        .filter(|summary| normalize_search(&summary.name).contains(&needle))
        .cloned()
        .collect()
}

/// Debounced search box state.
pub struct ConversationSearch {
    query: Arc<watch::Sender<String>>,
    input: Debouncer<(), String>,
}

impl ConversationSearch {
    pub fn new(window: std::time::Duration) -> Self {
        let query = Arc::new(watch::channel(String::new()).0);
        let sink = query.clone();
        let input = Debouncer::new(window, move |_: (), text: String| {
            let sink = sink.clone();
            async move {
                debug!(query = %text, "search query applied");
                sink.send_replace(text);
            }
        });
        Self { query, input }
    }

    pub fn from_config(config: &ChatConfig) -> Self {
        Self::new(config.search_debounce)
    }

    /// Record keystrokes. The query applies once typing pauses.
    pub fn set_query(&self, text: impl Into<String>) {
        self.input.call((), text.into());
    }

    /// Apply `text` immediately, dropping any pending input.
    pub fn set_query_now(&self, text: impl Into<String>) {
        self.input.cancel(&());
        self.query.send_replace(text.into());
    }

    pub fn query(&self) -> String {
        self.query.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.query.subscribe()
    }

    pub fn apply(&self, list: &[ConversationSummary]) -> Vec<ConversationSummary> {
        filter_conversations(list, &self.query())
    }
}
