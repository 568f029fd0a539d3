//! Active-conversation epoch used to drop stale async results.
//!
//! Opening a conversation advances the epoch. Work started for an earlier
//! conversation captures an [`EpochGuard`] and checks it before applying its
//! result, so a slow response never lands on the wrong screen.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct ConversationEpoch(Arc<AtomicU64>);

impl ConversationEpoch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new epoch. Every guard taken before this call becomes stale.
    pub fn advance(&self) -> EpochGuard {
        let captured = self.0.fetch_add(1, Ordering::AcqRel) + 1;
        EpochGuard {
            epoch: self.0.clone(),
            captured,
        }
    }

    /// Guard for the current epoch.
    pub fn guard(&self) -> EpochGuard {
        EpochGuard {
            epoch: self.0.clone(),
            captured: self.current(),
        }
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct EpochGuard {
    epoch: Arc<AtomicU64>,
    captured: u64,
}

impl EpochGuard {
    pub fn is_current(&self) -> bool {
        self.epoch.load(Ordering::Acquire) == self.captured
    }

    pub fn captured(&self) -> u64 {
        self.captured
    }
}
