//! Cross-region quorum.
//!
//! Each region's Raft cluster only guarantees uniqueness within the region.
//! Before an acquisition is reported to the client, the winning region
//! collects votes from a strict majority of all regions (itself included),
//! then tells every peer so they record a shadow copy of the lock.
//!
//! A region is addressed through one member. Members that do not lead hand
//! region traffic to their leader, and the leader replicates whatever the
//! traffic changes (shadow copies, observed tokens) through its Raft log.

mod manager;
pub mod messages;

pub use manager::QuorumManager;
pub use messages::{
    LockAcquiredNotification, LockReleasedNotification, LockVoteRequest, LockVoteResponse,
    NotificationAck, QuorumResult,
};

use crate::types::PeerRegion;

/// Transport for inter-region traffic. Notifications answer whether the
/// receiving region applied them.
#[async_trait::async_trait]
pub trait RegionRpc: Send + Sync {
    async fn request_vote(
        &self,
        target: &PeerRegion,
        request: LockVoteRequest,
    ) -> crate::Result<LockVoteResponse>;

    async fn notify_acquired(
        &self,
        target: &PeerRegion,
        notification: LockAcquiredNotification,
    ) -> crate::Result<bool>;

    async fn notify_released(
        &self,
        target: &PeerRegion,
        notification: LockReleasedNotification,
    ) -> crate::Result<bool>;
}
