//! REST API client for the chat backend.
//!
//! Provides:
//! - `ApiClient` - Login, registration, friends and VIP endpoints
//! - Typed request and response bodies

pub mod client;
pub mod types;

pub use client::{ApiClient, ApiError};
pub use types::{FriendRequest, FriendRequestStatus, FriendResponse, Profile, UserSummary, VipLevel};
