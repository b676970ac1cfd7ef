//! Access decisions for room actions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

use crate::room::AccessLevel;

/// The policy-relevant view of a room.
#[derive(Debug, Clone, Copy)]
pub struct Policy<'a> {
    pub owner: Option<&'a str>,
    pub is_private: bool,
    pub password: Option<&'a str>,
    pub expires_at: Option<DateTime<Utc>>,
    pub access_level: AccessLevel,
    pub banned: &'a HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action<'a> {
    /// Entering the room; `secret` is checked when the room is private.
    Join { secret: Option<&'a str> },
    EditContent,
    ChangeLanguage,
    /// Kick, ban, destroy and settings changes.
    Moderate,
}

impl Action<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Join { .. } => "join",
            Action::EditContent => "edit-content",
            Action::ChangeLanguage => "change-language",
            Action::Moderate => "moderate",
        }
    }

    fn writes(&self) -> bool {
        matches!(self, Action::EditContent | Action::ChangeLanguage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DenyReason {
    Banned,
    BadSecret,
    Expired,
    NotOwner,
    ViewOnly,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DenyReason::Banned => "you are banned from this room",
            DenyReason::BadSecret => "incorrect room password",
            DenyReason::Expired => "this room has expired and is read-only",
            DenyReason::NotOwner => "only the room owner can do that",
            DenyReason::ViewOnly => "this room is view-only",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Decides whether `actor` may perform `action`. Rules apply in order: bans,
/// the private-room gate, expiry, owner-only moderation, view-only rooms.
pub fn evaluate(
    policy: &Policy<'_>,
    actor: Option<&str>,
    action: Action<'_>,
    now: DateTime<Utc>,
) -> Decision {
    if actor.is_some_and(|id| policy.banned.contains(id)) {
        return Decision::Deny(DenyReason::Banned);
    }

    let is_owner = matches!((policy.owner, actor), (Some(owner), Some(id)) if owner == id);

    if let Action::Join { secret } = action {
        if policy.is_private && !is_owner && (policy.password.is_none() || secret != policy.password) {
            return Decision::Deny(DenyReason::BadSecret);
        }
    }

    let expired = policy.expires_at.is_some_and(|at| at < now);
    if expired && action.writes() && !is_owner {
        return Decision::Deny(DenyReason::Expired);
    }

    if action == Action::Moderate && !is_owner {
        return Decision::Deny(DenyReason::NotOwner);
    }

    if policy.access_level == AccessLevel::View && action.writes() && !is_owner {
        return Decision::Deny(DenyReason::ViewOnly);
    }

    Decision::Allow
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    struct Fixture {
        banned: HashSet<String>,
        is_private: bool,
        password: Option<&'static str>,
        expires_at: Option<DateTime<Utc>>,
        access_level: AccessLevel,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                banned: HashSet::new(),
                is_private: false,
                password: None,
                expires_at: None,
                access_level: AccessLevel::Edit,
            }
        }

        fn check(&self, actor: Option<&str>, action: Action<'_>) -> Decision {
            let policy = Policy {
                owner: Some("owner"),
                is_private: self.is_private,
                password: self.password,
                expires_at: self.expires_at,
                access_level: self.access_level,
                banned: &self.banned,
            };
            evaluate(&policy, actor, action, Utc::now())
        }
    }

    #[test]
    fn open_room_allows_everyone_to_join_and_edit() {
        let f = Fixture::new();
        assert_eq!(f.check(None, Action::Join { secret: None }), Decision::Allow);
        assert_eq!(f.check(Some("guest"), Action::EditContent), Decision::Allow);
        assert_eq!(f.check(None, Action::ChangeLanguage), Decision::Allow);
    }

    #[test]
    fn ban_denies_every_action() {
        let mut f = Fixture::new();
        f.banned.insert("mallory".into());
        for action in [
            Action::Join { secret: None },
            Action::EditContent,
            Action::ChangeLanguage,
            Action::Moderate,
        ] {
            assert_eq!(f.check(Some("mallory"), action), Decision::Deny(DenyReason::Banned));
        }
    }

    #[test]
    fn private_room_requires_matching_secret() {
        let mut f = Fixture::new();
        f.is_private = true;
        f.password = Some("hunter2");
        assert_eq!(
            f.check(Some("guest"), Action::Join { secret: Some("nope") }),
            Decision::Deny(DenyReason::BadSecret)
        );
        assert_eq!(
            f.check(None, Action::Join { secret: None }),
            Decision::Deny(DenyReason::BadSecret)
        );
        assert_eq!(f.check(Some("guest"), Action::Join { secret: Some("hunter2") }), Decision::Allow);
        assert_eq!(f.check(Some("owner"), Action::Join { secret: None }), Decision::Allow);
    }

    #[test]
    fn private_room_without_secret_admits_only_owner() {
        let mut f = Fixture::new();
        f.is_private = true;
        assert_eq!(
            f.check(Some("guest"), Action::Join { secret: None }),
            Decision::Deny(DenyReason::BadSecret)
        );
    }

    #[test]
    fn expired_room_is_read_only_for_non_owners() {
        let mut f = Fixture::new();
        f.expires_at = Some(Utc::now() - Duration::hours(1));
        assert_eq!(f.check(Some("guest"), Action::EditContent), Decision::Deny(DenyReason::Expired));
        assert_eq!(f.check(None, Action::ChangeLanguage), Decision::Deny(DenyReason::Expired));
        assert_eq!(f.check(Some("guest"), Action::Join { secret: None }), Decision::Allow);
        assert_eq!(f.check(Some("owner"), Action::EditContent), Decision::Allow);
    }

    #[test]
    fn future_expiry_does_not_restrict() {
        let mut f = Fixture::new();
        f.expires_at = Some(Utc::now() + Duration::hours(1));
        assert_eq!(f.check(Some("guest"), Action::EditContent), Decision::Allow);
    }

    #[test]
    fn moderation_is_owner_only() {
        let f = Fixture::new();
        assert_eq!(f.check(Some("guest"), Action::Moderate), Decision::Deny(DenyReason::NotOwner));
        assert_eq!(f.check(None, Action::Moderate), Decision::Deny(DenyReason::NotOwner));
        assert_eq!(f.check(Some("owner"), Action::Moderate), Decision::Allow);
    }

    #[test]
    fn view_only_room_blocks_non_owner_writes() {
        let mut f = Fixture::new();
        f.access_level = AccessLevel::View;
        assert_eq!(f.check(Some("guest"), Action::EditContent), Decision::Deny(DenyReason::ViewOnly));
        assert_eq!(f.check(Some("owner"), Action::EditContent), Decision::Allow);
    }
}
