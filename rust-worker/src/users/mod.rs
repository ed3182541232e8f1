//! User aggregate and social-group memberships.
//!
//! Memberships are owned by the user and only mutated by the
//! social-group verification workflow.

pub mod repository;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use repository::{RedisUserRepository, RepositoryError, UserRepository};

/// Social benefit eligibility groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    Pensioners,
    Disabled,
    YoungFamilies,
    LowIncome,
    Students,
    LargeFamilies,
    Children,
    Veterans,
}

impl GroupType {
    pub const ALL: [GroupType; 8] = [
        GroupType::Pensioners,
        GroupType::Disabled,
        GroupType::YoungFamilies,
        GroupType::LowIncome,
        GroupType::Students,
        GroupType::LargeFamilies,
        GroupType::Children,
        GroupType::Veterans,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GroupType::Pensioners => "pensioners",
            GroupType::Disabled => "disabled",
            GroupType::YoungFamilies => "young_families",
            GroupType::LowIncome => "low_income",
            GroupType::Students => "students",
            GroupType::LargeFamilies => "large_families",
            GroupType::Children => "children",
            GroupType::Veterans => "veterans",
        }
    }

    /// Parse the snake_case identifier used on the wire.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|group| group.as_str() == value)
    }
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verification status of a membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    #[default]
    Pending,
    Verified,
    Rejected,
}

/// A user's claim to belong to one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGroupMembership {
    #[serde(rename = "type")]
    pub group_type: GroupType,
    #[serde(default)]
    pub status: MembershipStatus,
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rejected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: String,
}

impl UserGroupMembership {
    /// A freshly claimed membership awaiting verification.
    pub fn pending(group_type: GroupType) -> Self {
        Self {
            group_type,
            status: MembershipStatus::Pending,
            verified_at: None,
            rejected_at: None,
            expires_at: None,
            error_message: String::new(),
        }
    }

    /// Whether a check run may still change this membership.
    ///
    /// Pending memberships are open, and so are rejections caused by a failed
    /// call to the verification service (they carry an error message). A
    /// determination made by the service itself is final.
    pub fn awaits_determination(&self) -> bool {
        match self.status {
            MembershipStatus::Pending => true,
            MembershipStatus::Rejected => !self.error_message.is_empty(),
            MembershipStatus::Verified => false,
        }
    }
}

/// A platform user as seen by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub snils: String,
    #[serde(default)]
    pub group_memberships: Vec<UserGroupMembership>,
}
