use std::collections::HashMap;

use crate::models::{StatusMap, UserId, UserStatus};

/// The most recently broadcast status per user id.
///
/// An explicit clear (`None`) is remembered, so a cleared status keeps
/// overriding any snapshot embedded in a message. Snapshots never enter the
/// registry; they only serve as the fallback for users no broadcast has
/// mentioned yet.
#[derive(Debug, Default)]
pub struct StatusRegistry {
    known: HashMap<UserId, Option<UserStatus>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a `user-status:changed` broadcast.
    pub fn apply(&mut self, changes: &StatusMap) {
        for (user_id, status) in changes {
            self.known.insert(*user_id, status.clone());
        }
    }

    /// The status a mention of `user_id` should display: the latest broadcast
    /// if one was ever received (including an explicit clear), otherwise the
    /// message-embedded snapshot.
    pub fn effective(
        &self,
        user_id: UserId,
        snapshot: Option<&UserStatus>,
    ) -> Option<UserStatus> {
        match self.known.get(&user_id) {
            Some(broadcast) => broadcast.clone(),
            None => snapshot.cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(description: &str, emoji: &str) -> UserStatus {
        UserStatus {
            description: description.to_string(),
            emoji: emoji.to_string(),
        }
    }

    #[test]
    fn falls_back_to_snapshot_when_no_broadcast_seen() {
        let registry = StatusRegistry::new();
        let snapshot = status("surfing", "surfing_man");
        assert_eq!(
            registry.effective(1000, Some(&snapshot)),
            Some(snapshot.clone())
        );
        assert_eq!(registry.effective(1000, None), None);
    }

    #[test]
    fn broadcast_overrides_snapshot() {
        let mut registry = StatusRegistry::new();
        registry.apply(&StatusMap::from([(
            1000,
            Some(status("off to dentist", "tooth")),
        )]));

        let snapshot = status("surfing", "surfing_man");
        assert_eq!(
            registry.effective(1000, Some(&snapshot)),
            Some(status("off to dentist", "tooth"))
        );
    }

    #[test]
    fn explicit_clear_overrides_snapshot() {
        let mut registry = StatusRegistry::new();
        registry.apply(&StatusMap::from([(1000, None)]));

        let snapshot = status("surfing", "surfing_man");
        assert_eq!(registry.effective(1000, Some(&snapshot)), None);
    }

    #[test]
    fn later_broadcasts_replace_earlier_ones() {
        let mut registry = StatusRegistry::new();
        registry.apply(&StatusMap::from([(1000, None)]));
        registry.apply(&StatusMap::from([(1000, Some(status("back", "wave")))]));

        assert_eq!(
            registry.effective(1000, None),
            Some(status("back", "wave"))
        );
    }

    #[test]
    fn only_listed_users_are_touched() {
        let mut registry = StatusRegistry::new();
        registry.apply(&StatusMap::from([(1000, Some(status("surfing", "surfing_man")))]));
        registry.apply(&StatusMap::from([(2000, None)]));

        assert_eq!(
            registry.effective(1000, None),
            Some(status("surfing", "surfing_man"))
        );
    }
}
