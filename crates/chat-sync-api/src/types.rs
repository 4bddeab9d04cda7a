//! Request and response bodies.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub(crate) struct Credentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LoginResponse {
    pub token: String,
    pub username: String,
}

/// Body carrying a human-readable `message`, used by both success and
/// error responses.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct MessageBody {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct FriendRequestBody {
    pub friend_id: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct RespondBody {
    pub request_id: i64,
    pub response: FriendResponse,
}

#[derive(Debug, Serialize)]
pub(crate) struct PurchaseBody {
    pub level_id: i64,
}

/// Another user, as listed by friends and search.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserSummary {
    pub id: i64,
    pub username: String,
}

/// Status of a friend request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendRequestStatus {
    Pending,
    Accepted,
    Rejected,
    #[serde(other)]
    Unknown,
}

/// Incoming friend request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FriendRequest {
    pub id: i64,
    pub user_id: i64,
    pub username: String,
    pub status: FriendRequestStatus,
    /// Server-local time without an offset.
    pub created_at: NaiveDateTime,
}

/// Answer to a friend request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendResponse {
    Accept,
    Reject,
}

/// Purchasable VIP tier.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VipLevel {
    pub id: i64,
    pub name: String,
    pub level: i32,
    pub price: f64,
    pub max_private_circles: u32,
}

/// Current user's profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub username: Option<String>,
    /// Id of the active VIP level, if any.
    #[serde(default)]
    pub vip_level: Option<i64>,
    #[serde(default)]
    pub vip_expire_date: Option<NaiveDateTime>,
}
