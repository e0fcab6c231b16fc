//! Runtime index of which connected identities are subscribed to which
//! groups. Both directions are kept in insertion order and always mutated
//! together.

use std::collections::HashMap;

use courier_shared::{GroupId, UserId};

#[derive(Debug, Default)]
pub struct MembershipIndex {
    by_group: HashMap<GroupId, Vec<UserId>>,
    by_user: HashMap<UserId, Vec<GroupId>>,
}

impl MembershipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if `user` was already joined.
    pub fn join(&mut self, group: GroupId, user: &UserId) -> bool {
        let members = self.by_group.entry(group).or_default();
        if members.contains(user) {
            return false;
        }
        members.push(user.clone());
        self.by_user.entry(user.clone()).or_default().push(group);
        true
    }

    /// Returns `false` if `user` was not joined.
    pub fn leave(&mut self, group: GroupId, user: &UserId) -> bool {
        let Some(members) = self.by_group.get_mut(&group) else {
            return false;
        };
        let Some(pos) = members.iter().position(|u| u == user) else {
            return false;
        };
        members.remove(pos);
        if members.is_empty() {
            self.by_group.remove(&group);
        }
        if let Some(groups) = self.by_user.get_mut(user) {
            groups.retain(|g| *g != group);
            if groups.is_empty() {
                self.by_user.remove(user);
            }
        }
        true
    }

    /// Remove `user` from every group, returning the groups left.
    pub fn leave_all(&mut self, user: &UserId) -> Vec<GroupId> {
        let groups = self.by_user.remove(user).unwrap_or_default();
        for group in &groups {
            if let Some(members) = self.by_group.get_mut(group) {
                members.retain(|u| u != user);
                if members.is_empty() {
                    self.by_group.remove(group);
                }
            }
        }
        groups
    }

    /// Drop a whole group (e.g. after it was deleted), returning its members.
    pub fn remove_group(&mut self, group: GroupId) -> Vec<UserId> {
        let members = self.by_group.remove(&group).unwrap_or_default();
        for user in &members {
            if let Some(groups) = self.by_user.get_mut(user) {
                groups.retain(|g| *g != group);
                if groups.is_empty() {
                    self.by_user.remove(user);
                }
            }
        }
        members
    }

    /// Snapshot of a group's members in join order.
    pub fn members(&self, group: GroupId) -> Vec<UserId> {
        self.by_group.get(&group).cloned().unwrap_or_default()
    }

    pub fn groups_of(&self, user: &UserId) -> Vec<GroupId> {
        self.by_user.get(user).cloned().unwrap_or_default()
    }

    pub fn contains(&self, group: GroupId, user: &UserId) -> bool {
        self.by_group
            .get(&group)
            .is_some_and(|members| members.contains(user))
    }

    pub fn group_count(&self) -> usize {
        self.by_group.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u(s: &str) -> UserId {
        UserId::from(s)
    }

    #[test]
    fn test_join_is_idempotent_and_ordered() {
        let mut index = MembershipIndex::new();
        let g = GroupId::new();
        assert!(index.join(g, &u("b")));
        assert!(index.join(g, &u("a")));
        assert!(!index.join(g, &u("b")));
        assert_eq!(index.members(g), vec![u("b"), u("a")]);
        assert_eq!(index.groups_of(&u("a")), vec![g]);
    }

    #[test]
    fn test_leave_removes_empty_entries() {
        let mut index = MembershipIndex::new();
        let g = GroupId::new();
        index.join(g, &u("a"));
        assert!(index.leave(g, &u("a")));
        assert!(!index.leave(g, &u("a")));
        assert_eq!(index.group_count(), 0);
        assert!(index.groups_of(&u("a")).is_empty());
    }

    #[test]
    fn test_leave_all_keeps_maps_consistent() {
        let mut index = MembershipIndex::new();
        let (g1, g2) = (GroupId::new(), GroupId::new());
        index.join(g1, &u("a"));
        index.join(g2, &u("a"));
        index.join(g2, &u("b"));

        let left = index.leave_all(&u("a"));
        assert_eq!(left, vec![g1, g2]);
        assert!(!index.contains(g2, &u("a")));
        assert_eq!(index.members(g2), vec![u("b")]);
        assert_eq!(index.group_count(), 1);
    }

    #[test]
    fn test_remove_group() {
        let mut index = MembershipIndex::new();
        let g = GroupId::new();
        index.join(g, &u("a"));
        index.join(g, &u("b"));
        assert_eq!(index.remove_group(g), vec![u("a"), u("b")]);
        assert!(index.groups_of(&u("b")).is_empty());
    }
}
