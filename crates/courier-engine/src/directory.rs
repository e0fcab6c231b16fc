//! Identity lookup consulted before a connection is admitted.

use std::collections::HashSet;

use async_trait::async_trait;

use courier_shared::UserId;

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn exists(&self, user: &UserId) -> bool;
}

/// A fixed allow-list.
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    users: HashSet<UserId>,
}

impl StaticDirectory {
    pub fn new(users: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            users: users.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, user: UserId) {
        self.users.insert(user);
    }
}

#[async_trait]
impl IdentityDirectory for StaticDirectory {
    async fn exists(&self, user: &UserId) -> bool {
        self.users.contains(user)
    }
}

/// Accepts any well-formed identity. Development default.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenDirectory;

#[async_trait]
impl IdentityDirectory for OpenDirectory {
    async fn exists(&self, user: &UserId) -> bool {
        user.is_well_formed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directories() {
        let dir = StaticDirectory::new([UserId::from("alice@example.com")]);
        assert!(dir.exists(&UserId::from("alice@example.com")).await);
        assert!(!dir.exists(&UserId::from("mallory@example.com")).await);

        assert!(OpenDirectory.exists(&UserId::from("anyone@example.com")).await);
        assert!(!OpenDirectory.exists(&UserId::from("")).await);
        assert!(!OpenDirectory.exists(&UserId::from("two words")).await);
    }
}
