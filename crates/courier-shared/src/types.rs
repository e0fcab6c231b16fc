use serde::{Deserialize, Serialize};
use uuid::Uuid;

// User identity = opaque account handle (an email address in practice)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Cheap syntactic check: non-empty, no whitespace, bounded length.
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty() && self.0.len() <= 254 && !self.0.chars().any(char::is_whitespace)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct GroupId(pub Uuid);

impl GroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_well_formed() {
        assert!(UserId::from("alice@example.com").is_well_formed());
        assert!(!UserId::from("").is_well_formed());
        assert!(!UserId::from("al ice").is_well_formed());
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let gid = GroupId::new();
        let json = serde_json::to_string(&gid).unwrap();
        assert_eq!(json, format!("\"{}\"", gid.0));

        let uid = UserId::from("bob@example.com");
        assert_eq!(serde_json::to_string(&uid).unwrap(), "\"bob@example.com\"");
    }

    #[test]
    fn test_group_id_parse() {
        let gid = GroupId::new();
        assert_eq!(GroupId::parse(&gid.to_string()).unwrap(), gid);
        assert!(GroupId::parse("not-a-uuid").is_err());
    }
}
