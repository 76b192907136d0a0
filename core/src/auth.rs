//! Authorization for user-scoped resources.
//!
//! Every operation that takes a `user_id` (or derives one from a
//! session record) runs through this check before touching the
//! resource. Admin identities are exempt. Denials are written to the
//! audit trail and map to REST 403.

use tracing::warn;

use crate::error::DataAgentErr;
use crate::error::Result;

/// Require `requester` to be `target_user` or an admin.
pub fn ensure_user_access(requester: &str, target_user: &str, is_admin: bool) -> Result<()> {
    if is_admin || requester == target_user {
        return Ok(());
    }
    warn!(
        audit = true,
        "authorization denied: '{requester}' attempted to access resources of '{target_user}'"
    );
    Err(DataAgentErr::Unauthorized {
        requester: requester.to_string(),
        target: target_user.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn owner_and_admin_pass_others_fail() {
        assert!(ensure_user_access("alice", "alice", false).is_ok());
        assert!(ensure_user_access("root", "alice", true).is_ok());
        let err = ensure_user_access("mallory", "alice", false).unwrap_err();
        assert!(matches!(err, DataAgentErr::Unauthorized { .. }));
    }
}
