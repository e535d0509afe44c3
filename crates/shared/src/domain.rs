use serde::{Deserialize, Serialize};

/// Reserved identity prefix the remote service uses for group accounts.
pub const GROUP_PREFIX: &str = "@@";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactKind {
    Official,
    Friend,
    Group,
    Member,
    FriendAndMember,
}

impl ContactKind {
    /// Classification rule shared by the full-sync and delta paths: the
    /// verification flag marks official accounts, the `@@` prefix marks
    /// groups, everything else is a direct friend.
    pub fn classify(verify_flag: i64, user_name: &str) -> Self {
        if verify_flag / 8 != 0 {
            ContactKind::Official
        } else if user_name.starts_with(GROUP_PREFIX) {
            ContactKind::Group
        } else {
            ContactKind::Friend
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Unknown,
}

impl Gender {
    pub fn from_wire(sex: i64) -> Self {
        match sex {
            1 => Gender::Male,
            2 => Gender::Female,
            _ => Gender::Unknown,
        }
    }
}

/// Kind of a contact delta pushed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    /// Stable opaque identity string, the primary key across all kinds.
    pub user_name: String,
    pub nick_name: String,
    pub remark_name: String,
    pub display_name: String,
    pub alias: String,
    pub avatar_url: String,
    pub gender: Gender,
    pub signature: String,
    pub province: String,
    pub city: String,
    /// Opaque verification bit flags from the remote service.
    pub verify_flag: i64,
    pub contact_flag: i64,
    pub kind: ContactKind,
    /// Ordered member roster; populated for groups only. Members are also
    /// independent cache entries addressable by their own identity.
    pub members: Vec<Contact>,
}

impl Contact {
    pub fn is_group(&self) -> bool {
        self.user_name.starts_with(GROUP_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_verify_flag_then_prefix() {
        assert_eq!(ContactKind::classify(8, "someone"), ContactKind::Official);
        assert_eq!(ContactKind::classify(24, "@@room"), ContactKind::Official);
        assert_eq!(ContactKind::classify(0, "@@room1"), ContactKind::Group);
        assert_eq!(ContactKind::classify(0, "friend1"), ContactKind::Friend);
        assert_eq!(ContactKind::classify(7, "friend1"), ContactKind::Friend);
    }

    #[test]
    fn gender_wire_mapping_defaults_to_unknown() {
        assert_eq!(Gender::from_wire(1), Gender::Male);
        assert_eq!(Gender::from_wire(2), Gender::Female);
        assert_eq!(Gender::from_wire(0), Gender::Unknown);
        assert_eq!(Gender::from_wire(42), Gender::Unknown);
    }
}
