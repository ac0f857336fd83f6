//! Per-sender gate for AI replies.

use crate::cache::CoalescingCache;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use svoi_channels::UserId;

/// A granted AI slot. Releasing it clears only this claim, never a newer one
/// taken after the original marker expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AiClaim {
    sender: UserId,
    token: u64,
}

#[derive(Clone)]
pub struct AiThrottle {
    markers: Arc<CoalescingCache<u64>>,
    next_token: Arc<AtomicU64>,
}

impl AiThrottle {
    pub fn new(markers: Arc<CoalescingCache<u64>>) -> Self {
        Self {
            markers,
            next_token: Arc::new(AtomicU64::new(1)),
        }
    }

    fn key(sender: UserId) -> String {
        format!("ai:reset_period:{sender}")
    }

    /// Cheap pre-check; `try_acquire` is the authoritative claim.
    pub fn is_throttled(&self, sender: UserId) -> bool {
        self.markers.get(&Self::key(sender)).is_some()
    }

    /// Claim the sender's AI slot for `period`. Only one concurrent caller
    /// per sender gets a claim until the marker expires or is released.
    pub fn try_acquire(&self, sender: UserId, period: Duration) -> Option<AiClaim> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.markers
            .add(&Self::key(sender), token, Some(period))
            .then_some(AiClaim { sender, token })
    }

    /// Give the slot back after a failed generation. Returns false when the
    /// marker already belongs to someone else.
    pub fn release(&self, claim: AiClaim) -> bool {
        self.markers
            .delete_if(&Self::key(claim.sender), |token| *token == claim.token)
    }
}
