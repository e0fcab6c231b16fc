//! Ephemeral typing indicators keyed by (group, identity).

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use courier_shared::{GroupId, UserId};

#[derive(Debug, Default)]
pub struct TypingTracker {
    started: HashMap<(GroupId, UserId), Instant>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or refresh an indicator. Returns `true` if it is new.
    pub fn start(&mut self, group: GroupId, user: &UserId, now: Instant) -> bool {
        self.started.insert((group, user.clone()), now).is_none()
    }

    /// Returns `true` if an indicator existed.
    pub fn stop(&mut self, group: GroupId, user: &UserId) -> bool {
        self.started.remove(&(group, user.clone())).is_some()
    }

    /// Remove and return every indicator older than `stale`.
    pub fn expire(&mut self, now: Instant, stale: Duration) -> Vec<(GroupId, UserId)> {
        let expired: Vec<(GroupId, UserId)> = self
            .started
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) > stale)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.started.remove(key);
        }
        expired
    }

    /// Drop every indicator held by `user`, returning their groups.
    pub fn clear_user(&mut self, user: &UserId) -> Vec<GroupId> {
        let mut groups = Vec::new();
        self.started.retain(|(group, u), _| {
            if u == user {
                groups.push(*group);
                false
            } else {
                true
            }
        });
        groups
    }

    /// Drop every indicator in `group`.
    pub fn clear_group(&mut self, group: GroupId) {
        self.started.retain(|(g, _), _| *g != group);
    }

    pub fn is_typing(&self, group: GroupId, user: &UserId) -> bool {
        self.started.contains_key(&(group, user.clone()))
    }

    pub fn len(&self) -> usize {
        self.started.len()
    }

    pub fn is_empty(&self) -> bool {
        self.started.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_is_not_new() {
        let mut tracker = TypingTracker::new();
        let g = GroupId::new();
        let a = UserId::from("a");
        let now = Instant::now();
        assert!(tracker.start(g, &a, now));
        assert!(!tracker.start(g, &a, now + Duration::from_secs(3)));
        assert!(tracker.stop(g, &a));
        assert!(!tracker.stop(g, &a));
    }

    #[test]
    fn test_expire_exactly_once() {
        let mut tracker = TypingTracker::new();
        let g = GroupId::new();
        let (a, b) = (UserId::from("a"), UserId::from("b"));
        let t0 = Instant::now();
        let stale = Duration::from_secs(10);
        tracker.start(g, &a, t0);
        tracker.start(g, &b, t0 + Duration::from_secs(6));

        assert!(tracker.expire(t0 + Duration::from_secs(9), stale).is_empty());
        assert_eq!(tracker.expire(t0 + Duration::from_secs(11), stale), vec![(g, a)]);
        assert!(tracker.expire(t0 + Duration::from_secs(12), stale).is_empty());
        assert_eq!(tracker.expire(t0 + Duration::from_secs(17), stale), vec![(g, b)]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_indicator_at_exact_window_is_kept() {
        let mut tracker = TypingTracker::new();
        let g = GroupId::new();
        let a = UserId::from("a");
        let t0 = Instant::now();
        let stale = Duration::from_secs(10);
        tracker.start(g, &a, t0);

        assert!(tracker.expire(t0 + stale, stale).is_empty());
        assert!(tracker.is_typing(g, &a));
        assert_eq!(
            tracker.expire(t0 + stale + Duration::from_millis(1), stale),
            vec![(g, a)]
        );
    }

    #[test]
    fn test_clear_user() {
        let mut tracker = TypingTracker::new();
        let (g1, g2) = (GroupId::new(), GroupId::new());
        let a = UserId::from("a");
        let now = Instant::now();
        tracker.start(g1, &a, now);
        tracker.start(g2, &a, now);
        tracker.start(g2, &UserId::from("b"), now);

        let mut groups = tracker.clear_user(&a);
        groups.sort_by_key(|g| g.0);
        let mut expected = vec![g1, g2];
        expected.sort_by_key(|g| g.0);
        assert_eq!(groups, expected);
        assert_eq!(tracker.len(), 1);
    }
}
