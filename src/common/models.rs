// Models shared by the services and the wire protocol
use crate::common::course::CourseCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type UserId = String;
pub type GroupId = String;
pub type RequestId = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub courses_seeking: Vec<CourseCode>,
    pub availability: Option<String>,
    pub year: Option<String>,
    pub bio: Option<String>,
    pub image_url: Option<String>,
    pub created_at: i64,
}

/// Payload of `/register`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub courses: Vec<String>,
    pub availability: Option<String>,
    pub year: Option<String>,
    pub bio: Option<String>,
}

/// Partial profile edit; absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub availability: Option<String>,
    pub year: Option<String>,
    pub bio: Option<String>,
    pub image_url: Option<String>,
    pub courses: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub token: String,
    pub expires_at: i64,
    pub user: User,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RankedPeer {
    #[serde(flatten)]
    pub user: User,
    pub match_score: usize,
    pub matched_courses: Vec<CourseCode>,
    pub total_courses: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StudyGroup {
    pub id: GroupId,
    pub name: String,
    pub creator_id: UserId,
    pub courses: Vec<CourseCode>,
    pub max_members: u32,
    /// Ordered roster; the first entry inherits ownership when the creator leaves.
    pub members: Vec<UserId>,
    pub is_public: bool,
    pub created_at: i64,
}

impl StudyGroup {
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m == user_id)
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.max_members as usize
    }
}

/// Payload of `/create_group`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewGroup {
    pub name: String,
    pub course: String,
    pub max_members: u32,
    #[serde(default = "default_public")]
    pub is_public: bool,
    #[serde(default)]
    pub invitees: Vec<UserId>,
}

fn default_public() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberSummary {
    pub id: UserId,
    pub name: String,
}

/// A group with its roster resolved against the user directory.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GroupView {
    #[serde(flatten)]
    pub group: StudyGroup,
    pub member_names: Vec<MemberSummary>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LeaveOutcome {
    Remaining { group: StudyGroup },
    Deleted { group_id: GroupId },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Accepted => "accepted",
            RequestStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "accepted" => Ok(RequestStatus::Accepted),
            "rejected" => Ok(RequestStatus::Rejected),
            other => Err(format!("unknown request status '{}'", other)),
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinRequest {
    pub id: RequestId,
    pub group_id: GroupId,
    pub user_id: UserId,
    pub user_name: String,
    pub user_email: String,
    pub message: Option<String>,
    pub status: RequestStatus,
    pub created_at: i64,
    pub responded_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MembershipChange {
    Joined,
    Left,
    OwnershipTransferred,
    Kicked,
    RequestAccepted,
    Renamed,
}

impl MembershipChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipChange::Joined => "joined",
            MembershipChange::Left => "left",
            MembershipChange::OwnershipTransferred => "ownership_transferred",
            MembershipChange::Kicked => "kicked",
            MembershipChange::RequestAccepted => "request_accepted",
            MembershipChange::Renamed => "renamed",
        }
    }

    /// System message shown in the group conversation.
    pub fn describe(&self, actor_name: &str) -> String {
        match self {
            MembershipChange::Joined => format!("{} joined the group", actor_name),
            MembershipChange::Left => format!("{} left the group", actor_name),
            MembershipChange::OwnershipTransferred => {
                format!("{} left the group. Ownership transferred to another member.", actor_name)
            }
            MembershipChange::Kicked => format!("{} was removed from the group", actor_name),
            MembershipChange::RequestAccepted => format!("{} joined the group", actor_name),
            MembershipChange::Renamed => format!("{} renamed the group", actor_name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MembershipEvent {
    pub group_id: GroupId,
    pub kind: MembershipChange,
    pub actor_name: String,
    pub text: String,
    pub timestamp: i64,
}

/// Payload of `/create_ai_group`.
#[derive(Debug, Clone, Deserialize)]
pub struct AiGroupRequest {
    pub course: String,
    pub max_members: u32,
    #[serde(default)]
    pub is_public: bool,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AiGroup {
    #[serde(flatten)]
    pub group: GroupView,
    pub rationale: String,
}
