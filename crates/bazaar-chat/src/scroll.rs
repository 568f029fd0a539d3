//! Scroll/view coordination for the chat screen.
//!
//! [`ScrollCoordinator`] is a pure state machine: feed it list mutations and
//! scroll events, get back what the view should do. [`ScrollController`]
//! wraps it for async use, passing jumps through at once and debouncing the
//! "new message" affordance so a burst of messages toggles it only once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use bazaar_shared::{MessageId, RoomId};

use crate::config::ChatConfig;
use crate::debounce::{lock, Debouncer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollPhase {
    /// Waiting for the first non-empty render of the conversation.
    FirstLoad,
    /// At (or near) the bottom. New messages scroll into view.
    Idle,
    /// The user scrolled up. New messages raise the affordance instead.
    ScrolledAway,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScrollEvent {
    ConversationChanged(RoomId),
    /// The rendered list changed. `last_id` is the id of its newest message.
    MessagesChanged {
        count: usize,
        last_id: Option<MessageId>,
    },
    UserScrolled {
        distance_from_bottom: f64,
    },
    ScrollToBottomRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollAction {
    JumpToBottom { animated: bool },
    ShowNewMessageAffordance,
    HideNewMessageAffordance,
}

/// Transient per-conversation scroll flags, as exposed to the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollState {
    pub user_scrolled: bool,
    pub is_first_load: bool,
    pub show_scroll_to_bottom: bool,
}

#[derive(Debug, Clone)]
pub struct ScrollCoordinator {
    phase: ScrollPhase,
    conversation: Option<RoomId>,
    count: usize,
    last_id: Option<MessageId>,
    affordance: bool,
    away_threshold: f64,
    bottom_threshold: f64,
}

impl Default for ScrollCoordinator {
    fn default() -> Self {
        let config = ChatConfig::default();
        Self::new(config.scroll_away_threshold, config.scroll_bottom_threshold)
    }
}

impl ScrollCoordinator {
    pub fn new(away_threshold: f64, bottom_threshold: f64) -> Self {
        Self {
            phase: ScrollPhase::FirstLoad,
            conversation: None,
            count: 0,
            last_id: None,
            affordance: false,
            away_threshold,
            bottom_threshold,
        }
    }

    pub fn from_config(config: &ChatConfig) -> Self {
        Self::new(config.scroll_away_threshold, config.scroll_bottom_threshold)
    }

    pub fn phase(&self) -> ScrollPhase {
        self.phase
    }

    pub fn conversation(&self) -> Option<&RoomId> {
        self.conversation.as_ref()
    }

    pub fn state(&self) -> ScrollState {
        ScrollState {
            user_scrolled: self.phase == ScrollPhase::ScrolledAway,
            is_first_load: self.phase == ScrollPhase::FirstLoad,
            show_scroll_to_bottom: self.affordance,
        }
    }

    pub fn handle(&mut self, event: ScrollEvent) -> Vec<ScrollAction> {
        let mut actions = Vec::new();
        match event {
            ScrollEvent::ConversationChanged(room_id) => {
                if self.affordance {
                    actions.push(ScrollAction::HideNewMessageAffordance);
                }
                *self = Self {
                    conversation: Some(room_id),
                    ..Self::new(self.away_threshold, self.bottom_threshold)
                };
            }

            ScrollEvent::MessagesChanged { count, last_id } => {
                let appended = count > self.count && last_id != self.last_id;
                self.count = count;
                self.last_id = last_id;

                match self.phase {
                    ScrollPhase::FirstLoad if count > 0 => {
                        self.phase = ScrollPhase::Idle;
                        actions.push(ScrollAction::JumpToBottom { animated: false });
                    }
                    ScrollPhase::FirstLoad => {}
                    ScrollPhase::Idle if appended => {
                        actions.push(ScrollAction::JumpToBottom { animated: true });
                    }
                    ScrollPhase::ScrolledAway if appended && !self.affordance => {
                        self.affordance = true;
                        actions.push(ScrollAction::ShowNewMessageAffordance);
                    }
                    _ => {}
                }
            }

            ScrollEvent::UserScrolled {
                distance_from_bottom,
            } => {
                // Layout passes of the first render are not user intent.
                if self.phase == ScrollPhase::FirstLoad {
                    return actions;
                }
                if distance_from_bottom > self.away_threshold {
                    self.phase = ScrollPhase::ScrolledAway;
                } else if distance_from_bottom <= self.bottom_threshold {
                    self.phase = ScrollPhase::Idle;
                    self.clear_affordance(&mut actions);
                }
            }

            ScrollEvent::ScrollToBottomRequested => {
                self.phase = ScrollPhase::Idle;
                actions.push(ScrollAction::JumpToBottom { animated: true });
                self.clear_affordance(&mut actions);
            }
        }
        actions
    }

    fn clear_affordance(&mut self, actions: &mut Vec<ScrollAction>) {
        if self.affordance {
            self.affordance = false;
            actions.push(ScrollAction::HideNewMessageAffordance);
        }
    }
}

/// Async front of a [`ScrollCoordinator`].
///
/// Jumps and hides go to the action sink immediately. Shows wait for the
/// affordance window; a hide arriving first cancels the show.
pub struct ScrollController {
    coordinator: Mutex<ScrollCoordinator>,
    actions: mpsc::UnboundedSender<ScrollAction>,
    shown: Arc<AtomicBool>,
    affordance: Debouncer<(), ()>,
}

impl ScrollController {
    pub fn new(
        coordinator: ScrollCoordinator,
        affordance_window: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ScrollAction>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shown = Arc::new(AtomicBool::new(false));

        let sink = tx.clone();
        let flag = shown.clone();
        let affordance = Debouncer::new(affordance_window, move |_: (), _: ()| {
            let sink = sink.clone();
            let flag = flag.clone();
            async move {
                if !flag.swap(true, Ordering::AcqRel) {
                    debug!("showing new message affordance");
                    let _ = sink.send(ScrollAction::ShowNewMessageAffordance);
                }
            }
        });

        let controller = Self {
            coordinator: Mutex::new(coordinator),
            actions: tx,
            shown,
            affordance,
        };
        (controller, rx)
    }

    pub fn from_config(config: &ChatConfig) -> (Self, mpsc::UnboundedReceiver<ScrollAction>) {
        Self::new(ScrollCoordinator::from_config(config), config.affordance_debounce)
    }

    pub fn state(&self) -> ScrollState {
        lock(&self.coordinator).state()
    }

    pub fn phase(&self) -> ScrollPhase {
        lock(&self.coordinator).phase()
    }

    /// Feed one event through the state machine. Returns the new state.
    pub fn handle(&self, event: ScrollEvent) -> ScrollState {
        let (actions, state) = {
            let mut coordinator = lock(&self.coordinator);
            let actions = coordinator.handle(event);
            (actions, coordinator.state())
        };

        for action in actions {
            trace!(?action, "scroll action");
            match action {
                ScrollAction::ShowNewMessageAffordance => self.affordance.call((), ()),
                ScrollAction::HideNewMessageAffordance => {
                    self.affordance.cancel(&());
                    if self.shown.swap(false, Ordering::AcqRel) {
                        let _ = self.actions.send(action);
                    }
                }
                ScrollAction::JumpToBottom { .. } => {
                    let _ = self.actions.send(action);
                }
            }
        }
        state
    }
}
