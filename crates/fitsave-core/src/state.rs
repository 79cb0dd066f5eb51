//! Client-held sync state types.

/// Where a client is in the post-sign-in merge flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    /// Anonymous results exist locally; waiting for the user to decide.
    PendingConfirmation { pending: usize },
    Merging,
    Resolved(Resolution),
}

/// How a sign-in session's prompt was settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Merged,
    Dismissed,
}

impl SyncState {
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::PendingConfirmation { .. })
    }
}
