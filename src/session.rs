//! Caller context
//!
//! The credential and authorization layer is an external collaborator; the
//! core reads exactly one thing from it: who is asking. That gates lazy fork
//! creation when a fork is pinned to a user.

/// Request context handed to document operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Authenticated user, if any.
    pub user_id: Option<i64>,
}

impl Session {
    /// Session for an authenticated user.
    pub fn for_user(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
        }
    }

    /// Anonymous session.
    pub fn anonymous() -> Self {
        Self::default()
    }
}
