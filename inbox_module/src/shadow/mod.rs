//! Shadow replies: automated reply suggestions drafted after a conversation
//! goes quiet. The scheduler owns when an attempt may run; the drafter that
//! writes the suggestion is an external collaborator.

mod drafter;
mod runner;
mod scheduler;
mod types;

use serde::{Deserialize, Serialize};

pub use drafter::{DraftError, DraftOutcome, DraftReply, HttpReplyDrafter, ReplyDrafter};
pub use runner::{ShadowReplyLoop, TickReport};
pub use scheduler::{ShadowError, ShadowScheduler};
pub use types::{NewShadowReply, ReplyStatus, ShadowReply, ShadowState, ShadowStatus};

use crate::retry::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowPolicy {
    pub debounce_seconds: u64,
    /// An attempt is postponed while the last inbound message is younger
    /// than this.
    pub typing_window_seconds: u64,
    /// Postponements allowed; the next soft failure exhausts the state.
    pub postpone_ceiling: u32,
    pub postpone_backoff: Backoff,
    pub batch_size: usize,
    /// A `running` claim older than this is treated as abandoned.
    pub running_lease_seconds: u64,
}

impl Default for ShadowPolicy {
    fn default() -> Self {
        Self {
            debounce_seconds: 30,
            typing_window_seconds: 30,
            postpone_ceiling: 3,
            postpone_backoff: Backoff::Fixed { seconds: 180 },
            batch_size: 20,
            running_lease_seconds: 900,
        }
    }
}
