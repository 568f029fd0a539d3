//! Message mutations: send, image send, mark-as-seen, retract, moderation.
//!
//! Every mutation that changes chat state is applied to the [`RoomStore`]
//! overlay first and then confirmed against the backend. Seen and retract are
//! rolled back when the call fails. A failed send stays visible, marked
//! [`Delivery::Failed`], until [`MessageService::retry_failed`] re-sends it.
//!
//! [`Delivery::Failed`]: bazaar_shared::Delivery::Failed

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use bazaar_shared::{
    BlockRequest, ChatError, ImageAttachment, Message, MessageId, MessageKind, MessageReport,
    Result, RetractRequest, RoomId, SeenRequest, SendRequest, UserId, UserReport,
};

use crate::backend::{ChatBackend, LocalAsset, MediaUploader};
use crate::config::ChatConfig;
use crate::debounce::{lock, Debouncer};
use crate::epoch::EpochGuard;
use crate::store::RoomStore;

/// An image message as picked on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendImage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    /// Optional text sent along with the image.
    pub caption: String,
    pub asset: LocalAsset,
}

struct ServiceInner {
    store: RoomStore,
    backend: Arc<dyn ChatBackend>,
    uploader: Arc<dyn MediaUploader>,
    max_image_bytes: u64,
    /// Rooms with a mark-seen call outstanding.
    seen_in_flight: Mutex<HashSet<RoomId>>,
}

#[derive(Clone)]
pub struct MessageService {
    inner: Arc<ServiceInner>,
    seen_debouncer: Arc<Debouncer<RoomId, (UserId, Option<EpochGuard>)>>,
}

impl MessageService {
    pub fn new(
        store: RoomStore,
        backend: Arc<dyn ChatBackend>,
        uploader: Arc<dyn MediaUploader>,
        config: &ChatConfig,
    ) -> Self {
        let inner = Arc::new(ServiceInner {
            store,
            backend,
            uploader,
            max_image_bytes: config.max_image_bytes,
            seen_in_flight: Mutex::new(HashSet::new()),
        });

        let debounced = inner.clone();
        let seen_debouncer = Debouncer::new(
            config.mark_seen_debounce,
            move |room_id: RoomId, (user, guard): (UserId, Option<EpochGuard>)| {
                let inner = debounced.clone();
                async move {
                    if guard.as_ref().is_some_and(|g| !g.is_current()) {
                        debug!(room = %room_id, "conversation changed, mark seen dropped");
                        return;
                    }
                    if let Err(e) = mark_seen(&inner, &room_id, user).await {
                        warn!(room = %room_id, user = %user, error = %e, "debounced mark seen failed");
                    }
                }
            },
        );

        Self {
            inner,
            seen_debouncer: Arc::new(seen_debouncer),
        }
    }

    pub fn store(&self) -> &RoomStore {
        &self.inner.store
    }

    /// Send a message optimistically.
    ///
    /// The message shows up in the room at once with a provisional id and is
    /// replaced by the stored copy when the backend answers. On failure it
    /// stays in place, marked failed, and the error is returned.
    pub async fn send(&self, request: SendRequest) -> Result<Message> {
        validate(&request)?;

        let room_id = request.room_id();
        let mut local = Message::new(request.sender_id, request.message.clone(), request.kind.clone());
        local.timestamp = request.timestamp;
        let provisional = local.id.clone();
        self.inner.store.push_pending(&room_id, local);
        debug!(room = %room_id, id = %provisional, "optimistic send");

        self.deliver(&room_id, &provisional, &request).await
    }

    /// Re-send a message whose earlier send failed.
    pub async fn retry_failed(&self, room_id: &RoomId, id: &MessageId) -> Result<Message> {
        let message = self.inner.store.take_failed(room_id, id)?;
        let receiver_id = room_id
            .participants()
            .and_then(|pair| pair.into_iter().find(|user| *user != message.author))
            .or_else(|| {
                // Self-chat: both participants are the author.
                room_id.participants().map(|[a, _]| a)
            })
            .ok_or_else(|| ChatError::RoomNotFound(room_id.clone()))?;

        let request = SendRequest {
            sender_id: message.author,
            receiver_id,
            message: message.body,
            kind: message.kind,
            timestamp: message.timestamp,
        };
        info!(room = %room_id, id = %id, "retrying failed send");
        self.deliver(room_id, id, &request).await
    }

    async fn deliver(&self, room_id: &RoomId, provisional: &MessageId, request: &SendRequest) -> Result<Message> {
        match self.inner.backend.send(request).await {
            Ok(persisted) => {
                info!(room = %room_id, id = %persisted.id, "message sent");
                self.inner
                    .store
                    .confirm_pending(room_id, provisional, persisted.clone());
                Ok(persisted)
            }
            Err(e) => {
                warn!(room = %room_id, id = %provisional, error = %e, "send failed");
                self.inner.store.fail_pending(room_id, provisional);
                Err(e)
            }
        }
    }

    /// Upload a picked image and send it as an image message.
    pub async fn send_image(&self, image: SendImage) -> Result<Message> {
        let SendImage {
            sender_id,
            receiver_id,
            caption,
            asset,
        } = image;

        if asset.size_bytes > self.inner.max_image_bytes {
            let err = ChatError::PayloadTooLarge {
                size: asset.size_bytes,
                max: self.inner.max_image_bytes,
            };
            warn!(uri = %asset.uri, error = %err, "image rejected before upload");
            return Err(err);
        }

        let path = match self.inner.uploader.upload(&asset).await {
            Ok(path) => path,
            Err(e @ ChatError::PayloadTooLarge { .. }) | Err(e @ ChatError::UploadFailed(_)) => {
                warn!(uri = %asset.uri, error = %e, "image upload failed");
                return Err(e);
            }
            Err(other) => {
                warn!(uri = %asset.uri, error = %other, "image upload failed");
                return Err(ChatError::UploadFailed(other.to_string()));
            }
        };
        debug!(%path, "image uploaded");

        let request = SendRequest::text(sender_id, receiver_id, caption).with_image(ImageAttachment {
            path,
            width: asset.width,
            height: asset.height,
            retracted: false,
        });
        self.send(request).await
    }

    /// Mark every message in the room not authored by `user` as seen.
    ///
    /// Returns how many messages flipped. A call made while another one for
    /// the same room is outstanding does nothing and returns 0.
    pub async fn mark_seen(&self, room_id: &RoomId, user: UserId) -> Result<usize> {
        mark_seen(&self.inner, room_id, user).await
    }

    /// Mark seen once focus has settled for the debounce window. A call
    /// carrying a guard is dropped when its conversation is no longer active.
    pub fn mark_seen_debounced(&self, room_id: &RoomId, user: UserId, guard: Option<EpochGuard>) {
        self.seen_debouncer.call(room_id.clone(), (user, guard));
    }

    pub fn cancel_pending_seen(&self, room_id: &RoomId) -> bool {
        self.seen_debouncer.cancel(room_id)
    }

    /// Retract one of `caller`'s own messages. Retracting twice is a no-op.
    pub async fn retract(&self, room_id: &RoomId, message_id: &MessageId, caller: UserId) -> Result<()> {
        if !self.inner.store.retract_local(room_id, message_id, caller)? {
            debug!(room = %room_id, id = %message_id, "already retracted");
            return Ok(());
        }

        let request = RetractRequest {
            room_id: room_id.clone(),
            message_id: message_id.clone(),
            user_id: caller,
        };
        match self.inner.backend.retract(&request).await {
            Ok(()) => {
                info!(room = %room_id, id = %message_id, "message retracted");
                Ok(())
            }
            Err(e) => {
                warn!(room = %room_id, id = %message_id, error = %e, "retract failed, rolling back");
                self.inner.store.rollback_retract(room_id, message_id);
                Err(e)
            }
        }
    }

    pub async fn report_message(&self, report: MessageReport) -> Result<()> {
        self.inner
            .backend
            .report_message(&report)
            .await
            .map_err(|e| moderation_failed("report message", e))?;
        info!(message = %report.message_id, reporter = %report.reporter_id, "message reported");
        Ok(())
    }

    pub async fn report_user(&self, report: UserReport) -> Result<()> {
        self.inner
            .backend
            .report_user(&report)
            .await
            .map_err(|e| moderation_failed("report user", e))?;
        info!(user = %report.reported_user_id, reporter = %report.reporter_id, "user reported");
        Ok(())
    }

    pub async fn block_user(&self, request: BlockRequest) -> Result<()> {
        self.inner
            .backend
            .block_user(&request)
            .await
            .map_err(|e| moderation_failed("block user", e))?;
        info!(blocker = %request.blocker_id, blocked = %request.blocked_user_id, "user blocked");
        Ok(())
    }
}

fn validate(request: &SendRequest) -> Result<()> {
    match request.kind {
        MessageKind::Text if request.message.trim().is_empty() => Err(ChatError::Validation(
            "message is empty and has no image".to_string(),
        )),
        _ => Ok(()),
    }
}

fn moderation_failed(action: &str, e: ChatError) -> ChatError {
    warn!(action, error = %e, "moderation call failed");
    ChatError::ModerationActionFailed(e.to_string())
}

/// Removes the room from the in-flight set when the call settles.
struct SeenFlight<'a> {
    rooms: &'a Mutex<HashSet<RoomId>>,
    room_id: RoomId,
}

impl<'a> SeenFlight<'a> {
    fn begin(rooms: &'a Mutex<HashSet<RoomId>>, room_id: &RoomId) -> Option<Self> {
        if !lock(rooms).insert(room_id.clone()) {
            return None;
        }
        Some(Self {
            rooms,
            room_id: room_id.clone(),
        })
    }
}

impl Drop for SeenFlight<'_> {
    fn drop(&mut self) {
        lock(self.rooms).remove(&self.room_id);
    }
}

async fn mark_seen(inner: &ServiceInner, room_id: &RoomId, user: UserId) -> Result<usize> {
    let Some(_flight) = SeenFlight::begin(&inner.seen_in_flight, room_id) else {
        debug!(room = %room_id, "mark seen already in flight");
        return Ok(0);
    };

    let flipped = inner.store.mark_seen_local(room_id, user);
    if flipped.is_empty() {
        return Ok(0);
    }

    let request = SeenRequest {
        room_id: room_id.clone(),
        user_id: user,
    };
    match inner.backend.mark_seen(&request).await {
        Ok(()) => {
            debug!(room = %room_id, count = flipped.len(), "messages marked seen");
            Ok(flipped.len())
        }
        Err(e) => {
            warn!(room = %room_id, error = %e, "mark seen failed, rolling back");
            inner.store.rollback_seen(room_id, &flipped);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FeedEvent;
    use crate::memory::MemoryBackend;
    use bazaar_shared::{Delivery, Room};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    fn incoming(id: &str, author: u64, secs_ago: i64) -> Message {
        Message {
            id: MessageId::from(id),
            author: UserId(author),
            body: format!("body of {id}"),
            timestamp: Utc::now() - ChronoDuration::seconds(secs_ago),
            seen: false,
            retracted: false,
            kind: MessageKind::Text,
            delivery: Delivery::Sent,
        }
    }

    fn fixture(messages: Vec<Message>) -> (Arc<MemoryBackend>, MessageService, RoomId) {
        let backend = Arc::new(MemoryBackend::new());
        let mut room = Room::new(UserId(5), UserId(9));
        room.messages = messages;
        room.touch_last_message();
        backend.insert_room(room.clone());

        let store = RoomStore::new(UserId(5));
        store.apply_feed(FeedEvent::Snapshot(vec![room.clone()]));
        let service = MessageService::new(store, backend.clone(), backend.clone(), &ChatConfig::default());
        (backend, service, room.room_id)
    }

    fn messages(service: &MessageService, room_id: &RoomId) -> Vec<Message> {
        service.store().room(room_id).map(|r| r.messages).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_empty_text_is_rejected_without_network_call() {
        let (backend, service, room_id) = fixture(vec![]);

        for body in ["", "   ", "\n\t"] {
            let err = service
                .send(SendRequest::text(UserId(5), UserId(9), body))
                .await
                .unwrap_err();
            assert!(matches!(err, ChatError::Validation(_)));
        }
        assert_eq!(backend.send_calls(), 0);
        assert!(messages(&service, &room_id).is_empty());
    }

    #[tokio::test]
    async fn test_system_message_may_be_empty() {
        let (_backend, service, _) = fixture(vec![]);
        let sent = service
            .send(SendRequest::system(UserId(5), UserId(9), ""))
            .await
            .unwrap();
        assert!(sent.is_system());
    }

    #[tokio::test]
    async fn test_send_adopts_server_copy() {
        let (backend, service, room_id) = fixture(vec![]);

        let sent = service
            .send(SendRequest::text(UserId(5), UserId(9), "hello"))
            .await
            .unwrap();

        assert!(!sent.id.is_provisional());
        let list = messages(&service, &room_id);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, sent.id);
        assert_eq!(list[0].delivery, Delivery::Sent);
        assert_eq!(backend.send_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_send_stays_visible_and_can_be_retried() {
        let (backend, service, room_id) = fixture(vec![]);
        backend.fail_sends(true);

        let err = service
            .send(SendRequest::text(UserId(5), UserId(9), "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Network(_)));

        let list = messages(&service, &room_id);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].delivery, Delivery::Failed);
        let failed_id = list[0].id.clone();

        backend.fail_sends(false);
        let sent = service.retry_failed(&room_id, &failed_id).await.unwrap();
        assert_eq!(sent.body, "hello");
        assert_eq!(sent.timestamp, list[0].timestamp);

        let list = messages(&service, &room_id);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, sent.id);

        // Nothing left to retry.
        assert!(service.retry_failed(&room_id, &failed_id).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_image_is_rejected_before_upload() {
        let (backend, service, _) = fixture(vec![]);
        let image = SendImage {
            sender_id: UserId(5),
            receiver_id: UserId(9),
            caption: String::new(),
            asset: LocalAsset {
                uri: "file:///photos/huge.jpg".into(),
                size_bytes: 11 * 1024 * 1024,
                width: 4000,
                height: 3000,
            },
        };

        let err = service.send_image(image).await.unwrap_err();
        assert!(matches!(err, ChatError::PayloadTooLarge { .. }));
        assert_eq!(backend.upload_calls(), 0);
        assert_eq!(backend.send_calls(), 0);
    }

    #[tokio::test]
    async fn test_upload_errors_are_distinguished() {
        let (backend, service, _) = fixture(vec![]);
        let image = SendImage {
            sender_id: UserId(5),
            receiver_id: UserId(9),
            caption: String::new(),
            asset: LocalAsset {
                uri: "file:///photos/cat.jpg".into(),
                size_bytes: 1_000,
                width: 10,
                height: 10,
            },
        };

        backend.fail_uploads(Some(ChatError::PayloadTooLarge { size: 1_000, max: 500 }));
        let err = service.send_image(image.clone()).await.unwrap_err();
        assert!(err.user_message().contains("smaller image"));

        backend.fail_uploads(Some(ChatError::Network("timeout".into())));
        let err = service.send_image(image.clone()).await.unwrap_err();
        assert!(matches!(err, ChatError::UploadFailed(_)));
        assert_eq!(backend.send_calls(), 0);

        backend.fail_uploads(None);
        let sent = service.send_image(image).await.unwrap();
        let attachment = sent.image().unwrap();
        assert_eq!(attachment.width, 10);
        assert!(attachment.path.ends_with("cat.jpg"));
        assert_eq!(sent.preview(), "[Image]");
    }

    #[tokio::test]
    async fn test_mark_seen_is_idempotent() {
        let (backend, service, room_id) = fixture(vec![
            incoming("a", 9, 30),
            incoming("b", 9, 20),
            incoming("c", 5, 10),
        ]);

        assert_eq!(service.mark_seen(&room_id, UserId(5)).await, Ok(2));
        assert_eq!(service.mark_seen(&room_id, UserId(5)).await, Ok(0));
        assert_eq!(backend.seen_calls(), 1);
        let room = service.store().room(&room_id).unwrap();
        assert_eq!(room.unread_for(UserId(5)), 0);
        // Our own message is left alone.
        assert!(!room.messages[2].seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_mark_seen_in_flight_per_room() {
        let (backend, service, room_id) = fixture(vec![incoming("a", 9, 30)]);
        backend.set_latency(Duration::from_millis(200));

        let (first, second) = tokio::join!(
            service.mark_seen(&room_id, UserId(5)),
            service.mark_seen(&room_id, UserId(5)),
        );
        assert_eq!(first, Ok(1));
        assert_eq!(second, Ok(0));
        assert_eq!(backend.seen_calls(), 1);
    }

    #[tokio::test]
    async fn test_mark_seen_rolls_back_on_failure() {
        let (backend, service, room_id) = fixture(vec![incoming("a", 9, 30), incoming("b", 9, 20)]);
        backend.fail_seen(true);

        assert!(service.mark_seen(&room_id, UserId(5)).await.is_err());
        let room = service.store().room(&room_id).unwrap();
        assert_eq!(room.unread_for(UserId(5)), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_mark_seen_collapses_focus_cycles() {
        let (backend, service, room_id) = fixture(vec![incoming("a", 9, 30)]);

        for _ in 0..4 {
            service.mark_seen_debounced(&room_id, UserId(5), None);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(backend.seen_calls(), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(backend.seen_calls(), 1);
        assert_eq!(service.store().room(&room_id).unwrap().unread_for(UserId(5)), 0);
    }

    #[tokio::test]
    async fn test_retract_by_non_author_makes_no_call() {
        let (backend, service, room_id) = fixture(vec![incoming("a", 9, 30)]);

        let err = service
            .retract(&room_id, &MessageId::from("a"), UserId(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotAuthorized { .. }));
        assert_eq!(backend.retract_calls(), 0);
    }

    #[tokio::test]
    async fn test_retract_hides_content_and_rolls_back_on_failure() {
        let (backend, service, room_id) = fixture(vec![incoming("mine", 5, 30)]);
        let id = MessageId::from("mine");

        backend.fail_retracts(true);
        assert!(service.retract(&room_id, &id, UserId(5)).await.is_err());
        assert_eq!(messages(&service, &room_id)[0].display_body(), "body of mine");

        backend.fail_retracts(false);
        service.retract(&room_id, &id, UserId(5)).await.unwrap();
        let room = service.store().room(&room_id).unwrap();
        assert!(room.messages[0].retracted);
        assert_ne!(room.messages[0].display_body(), "body of mine");
        assert_ne!(room.last_message, "body of mine");

        // Second retract is a local no-op.
        service.retract(&room_id, &id, UserId(5)).await.unwrap();
        assert_eq!(backend.retract_calls(), 2);
    }

    #[tokio::test]
    async fn test_moderation_failures_leave_chat_state_alone() {
        let (backend, service, room_id) = fixture(vec![incoming("a", 9, 30)]);
        let before = service.store().state();
        backend.fail_moderation(true);

        let err = service
            .block_user(BlockRequest {
                blocker_id: UserId(5),
                blocked_user_id: UserId(9),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::ModerationActionFailed(_)));

        let err = service
            .report_message(MessageReport {
                message_id: MessageId::from("a"),
                reporter_id: UserId(5),
                reason: "spam".into(),
                reported_user_id: UserId(9),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::ModerationActionFailed(_)));
        assert_eq!(service.store().state(), before);

        backend.fail_moderation(false);
        service
            .report_user(UserReport {
                reporter_id: UserId(5),
                reason: "rude".into(),
                reported_user_id: UserId(9),
            })
            .await
            .unwrap();
        assert_eq!(backend.user_reports().len(), 1);
        assert!(messages(&service, &room_id).len() == 1);
    }
}
